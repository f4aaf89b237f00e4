use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, Response as HttpResponse, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ErrorDetail;
use crate::i18n::{Locale, DEFAULT_LOCALE};
use crate::middleware::{skips_session, CurrentSession, UpstreamStatusExt};
use crate::routes::Page;
use crate::state::AppState;

/// Re-renders error responses on browser routes through the shared error
/// template, localized for the request. JSON API routes (`/api/...`), the
/// asset proxy and static mounts pass through untouched, as does anything
/// short-circuited by an outer layer.
pub async fn error_page_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let wants_html =
        !(path.starts_with("/api/") || path.starts_with("/pve2/") || skips_session(&path));
    let locale = req
        .extensions()
        .get::<Locale>()
        .cloned()
        .unwrap_or_else(|| Locale(DEFAULT_LOCALE.to_string()));
    let session = req.extensions().get::<CurrentSession>().cloned();
    let status_ext = req.extensions().get::<UpstreamStatusExt>().cloned();

    let response = next.run(req).await;
    if !wants_html {
        return response;
    }
    let Some(detail) = response.extensions().get::<ErrorDetail>().cloned() else {
        return response;
    };

    let mut page = Page::new(&state, &locale, session.as_ref(), None, status_ext.as_ref());
    page.insert("code", detail.status.as_u16())
        .insert("message", localized_message(&state, &locale, &detail));
    let html = match page.render(&state, "error") {
        Ok(html) => html.0,
        Err(_) => return response,
    };

    // Swap only the body; status and headers (security set, Retry-After)
    // survive as-is.
    let (mut parts, _) = response.into_parts();
    parts.headers.remove(CONTENT_LENGTH);
    parts.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    HttpResponse::from_parts(parts, Body::from(html))
}

/// Handler-built 400 messages are already localized; everything else maps
/// to a catalogue entry by status.
fn localized_message(state: &AppState, locale: &Locale, detail: &ErrorDetail) -> String {
    let key = match detail.status {
        StatusCode::BAD_REQUEST => return detail.message.clone(),
        StatusCode::UNAUTHORIZED => "error.401",
        StatusCode::FORBIDDEN => "error.403",
        StatusCode::NOT_FOUND => "error.404",
        StatusCode::TOO_MANY_REQUESTS => "error.429",
        StatusCode::SERVICE_UNAVAILABLE => "banner.readonly",
        StatusCode::BAD_GATEWAY => "error.502",
        _ => "error.500",
    };
    state.i18n.t(&locale.0, key)
}
