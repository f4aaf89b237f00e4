use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use pvmss_session::{SessionData, SESSION_COOKIE};

use crate::i18n::{Locale, LANG_COOKIE};
use crate::middleware::{is_secure_request, skips_session};
use crate::state::AppState;

/// Per-request session view placed in the extensions by [`session_layer`].
/// The data is a snapshot; handlers that mutate go through the store and
/// must not assume their writes are visible to requests already in flight.
#[derive(Clone)]
pub struct CurrentSession {
    pub token: String,
    pub data: SessionData,
    pub is_new: bool,
}

impl CurrentSession {
    pub fn username(&self) -> Option<&str> {
        self.data.username.as_deref()
    }
}

/// Outermost layer: resolves the locale, loads or creates the session, and
/// sets the session cookie on the way out unless a handler (login/logout
/// rotation) already did.
pub async fn session_layer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if skips_session(&path) {
        return next.run(req).await;
    }

    let cookie_header = req
        .headers()
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let accept_language = req
        .headers()
        .get("accept-language")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let query = req.uri().query().map(str::to_string);

    let locale = state.i18n.resolve(
        query.as_deref(),
        cookie_header.as_deref(),
        accept_language.as_deref(),
    );
    let lang_from_query = query
        .as_deref()
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "lang")
                .map(|(_, v)| v.into_owned())
        })
        .filter(|lang| state.i18n.supported(lang));
    req.extensions_mut().insert(Locale(locale));

    let known = cookie_header
        .as_deref()
        .and_then(|h| state.sessions.token_from_cookie_header(h))
        .and_then(|token| state.sessions.get(&token).map(|data| (token, data)));
    let (token, data, is_new) = match known {
        Some((token, data)) => (token, data, false),
        None => (state.sessions.create(), SessionData::default(), true),
    };

    let secure = is_secure_request(&req);
    req.extensions_mut().insert(CurrentSession {
        token: token.clone(),
        data,
        is_new,
    });

    let mut response = next.run(req).await;

    let handler_set_session = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.starts_with(SESSION_COOKIE));
    if is_new && !handler_set_session {
        let cookie = state.sessions.cookie_for(&token, secure);
        if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    if let Some(lang) = lang_from_query {
        let mut cookie = cookie::Cookie::new(LANG_COOKIE, lang);
        cookie.set_path("/");
        cookie.set_max_age(cookie::time::Duration::days(365));
        if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<CurrentSession>().cloned().ok_or_else(|| {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "session middleware missing",
            )
                .into_response()
        })
    }
}

/// Gate for routes any authenticated principal may use. Browsers get
/// bounced to the login page instead of a bare 401.
pub struct RequireAuth(pub CurrentSession);

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = CurrentSession::from_request_parts(parts, state).await?;
        if session.data.authenticated {
            Ok(RequireAuth(session))
        } else {
            Err(Redirect::to("/login").into_response())
        }
    }
}

/// Gate for admin-only routes.
pub struct RequireAdmin(pub CurrentSession);

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequireAdmin
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = CurrentSession::from_request_parts(parts, state).await?;
        if session.data.authenticated && session.data.is_admin {
            Ok(RequireAdmin(session))
        } else {
            Err(Redirect::to("/admin/login").into_response())
        }
    }
}
