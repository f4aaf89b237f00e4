use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::error::ApiError;
use crate::forms::FormFields;
use crate::middleware::{skips_session, CurrentSession};
use crate::state::AppState;

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_FIELD: &str = "csrf_token";
const MAX_FORM_BYTES: usize = 2 * 1024 * 1024;

/// Token handed to templates on safe requests.
#[derive(Clone)]
pub struct CsrfToken(pub String);

/// Double-submit CSRF. Safe methods mint (or refresh) the per-session
/// token so every rendered form carries it; unsafe methods must present it
/// back in the `X-CSRF-Token` header or the `csrf_token` form field.
pub async fn csrf_layer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if skips_session(&path) {
        return next.run(req).await;
    }

    let method = req.method();
    let safe = method == Method::GET || method == Method::HEAD || method == Method::OPTIONS;
    if safe {
        return issue_token(state, req, next).await;
    }

    let session = match req.extensions().get::<CurrentSession>().cloned() {
        Some(session) => session,
        None => return forbidden(&path),
    };
    // Validate against the store, not the request snapshot, so a token
    // minted earlier in this session is honoured even if the snapshot
    // predates it.
    let data = state
        .sessions
        .get(&session.token)
        .unwrap_or(session.data.clone());

    let header_token = req
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (req, presented) = match header_token {
        Some(token) => (req, Some(token)),
        None => match token_from_body(req).await {
            Ok(pair) => pair,
            Err(response) => return response,
        },
    };

    match presented {
        Some(token) if pvmss_session::verify_token(&data, &token) => next.run(req).await,
        _ => forbidden(&path),
    }
}

async fn issue_token(state: AppState, mut req: Request, next: Next) -> Response {
    if let Some(session) = req.extensions().get::<CurrentSession>().cloned() {
        let mut data = state
            .sessions
            .get(&session.token)
            .unwrap_or(session.data.clone());
        let token = pvmss_session::ensure_token(&mut data);
        state.sessions.set(&session.token, data.clone());
        req.extensions_mut().insert(CurrentSession {
            token: session.token,
            data,
            is_new: session.is_new,
        });
        req.extensions_mut().insert(CsrfToken(token));
    }
    next.run(req).await
}

/// Buffers the form body to read `csrf_token`, then reassembles the
/// request so the handler can still consume it.
async fn token_from_body(req: Request) -> Result<(Request, Option<String>), Response> {
    let is_form = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if !is_form {
        return Ok((req, None));
    }
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_FORM_BYTES)
        .await
        .map_err(|_| ApiError::BadRequest("request body too large".into()).into_response())?;
    let token = FormFields::parse(&bytes)
        .first(CSRF_FIELD)
        .map(str::to_string);
    let req = Request::from_parts(parts, Body::from(bytes));
    Ok((req, token))
}

fn forbidden(path: &str) -> Response {
    warn!(path, "rejected request with missing or invalid CSRF token");
    ApiError::Forbidden("the request could not be validated".into()).into_response()
}
