use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Extension;
use pvmss_session::SessionData;
use tracing::{info, warn};

use crate::error::ApiResult;
use crate::forms::FormFields;
use crate::i18n::Locale;
use crate::middleware::{is_secure_headers, CsrfToken, CurrentSession, UpstreamStatusExt};
use crate::routes::{put_flash, Page};
use crate::state::AppState;

/// Realm users authenticate against; admin login is local-only.
const USER_REALM: &str = "pve";

pub async fn login_page(
    State(state): State<AppState>,
    locale: Locale,
    session: CurrentSession,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    Page::new(&state, &locale, Some(&session), csrf.as_deref(), status.as_deref())
        .render(&state, "login")
}

pub async fn login_submit(
    State(state): State<AppState>,
    locale: Locale,
    session: CurrentSession,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let form = FormFields::parse(&body);
    let (username, password) = match (form.first("username"), form.first("password")) {
        (Some(u), Some(p)) => (u.to_string(), p.to_string()),
        _ => {
            put_flash(&state, &session.token, "error", state.i18n.t(&locale.0, "login.failed"));
            return Redirect::to("/login").into_response();
        }
    };

    // The login call is itself the cookie-auth ticket acquisition; what it
    // captures is what the console path will later replay.
    let client = state.proxmox.detached();
    let ticket = match client.login(&username, &password, USER_REALM).await {
        Ok(ticket) => ticket,
        Err(e) => {
            info!(username, error = %e, "user login rejected");
            put_flash(&state, &session.token, "error", state.i18n.t(&locale.0, "login.failed"));
            put_flash(&state, &session.token, "username", username);
            return Redirect::to("/login").into_response();
        }
    };

    let console_ready = ticket.csrf_prevention_token.is_some();
    if !console_ready {
        warn!(username, "login succeeded but no CSRF prevention token was captured");
    }

    let data = SessionData {
        authenticated: true,
        is_admin: false,
        username: Some(username.clone()),
        pve_auth_cookie: ticket.ticket.clone(),
        csrf_prevention_token: ticket.csrf_prevention_token.clone(),
        ..SessionData::default()
    };
    let new_token = state.sessions.rotate(&session.token, data);
    if !console_ready {
        put_flash(
            &state,
            &new_token,
            "warning",
            state.i18n.t(&locale.0, "login.console_warning"),
        );
    }
    info!(username, "user logged in");
    redirect_with_session(&state, &new_token, &headers, "/search")
}

pub async fn admin_login_page(
    State(state): State<AppState>,
    locale: Locale,
    session: CurrentSession,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    Page::new(&state, &locale, Some(&session), csrf.as_deref(), status.as_deref())
        .render(&state, "admin_login")
}

pub async fn admin_login_submit(
    State(state): State<AppState>,
    locale: Locale,
    session: CurrentSession,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let form = FormFields::parse(&body);
    let password = form.first("password").unwrap_or_default().to_string();
    let hash = state.config.admin_password_hash.clone();

    // bcrypt verification is deliberately slow; keep it off the async
    // workers.
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(&password, &hash))
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or(false);

    if !verified {
        warn!("admin login rejected");
        put_flash(
            &state,
            &session.token,
            "error",
            state.i18n.t(&locale.0, "admin_login.failed"),
        );
        return Redirect::to("/admin/login").into_response();
    }

    let data = SessionData {
        authenticated: true,
        is_admin: true,
        ..SessionData::default()
    };
    let new_token = state.sessions.rotate(&session.token, data);
    info!("admin logged in");
    redirect_with_session(&state, &new_token, &headers, "/admin")
}

/// GET /logout renders an auto-submitting POST form rather than destroying
/// the session on a safe method.
pub async fn logout_page(
    State(state): State<AppState>,
    locale: Locale,
    session: CurrentSession,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    Page::new(&state, &locale, Some(&session), csrf.as_deref(), status.as_deref())
        .render(&state, "logout")
}

pub async fn logout_submit(
    State(state): State<AppState>,
    session: CurrentSession,
    headers: HeaderMap,
) -> Response {
    let new_token = state.sessions.rotate(&session.token, SessionData::default());
    info!("session logged out");
    redirect_with_session(&state, &new_token, &headers, "/login")
}

/// 303 redirect carrying the rotated session cookie.
fn redirect_with_session(
    state: &AppState,
    token: &str,
    headers: &HeaderMap,
    location: &str,
) -> Response {
    let cookie = state
        .sessions
        .cookie_for(token, is_secure_headers(headers));
    let mut response = Redirect::to(location).into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}
