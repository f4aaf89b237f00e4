use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::middleware::CurrentSession;
use crate::state::AppState;

/// Reverse proxy for the noVNC payload served by the upstream under
/// `/pve2/...`. The session's captured ticket rides along so PVE serves
/// the authenticated variants; nothing is cached on our side.
pub async fn novnc_proxy(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    session: CurrentSession,
) -> Result<Response, ApiError> {
    if !session.data.authenticated {
        return Err(ApiError::Unauthorized);
    }
    let asset = state
        .proxmox
        .fetch_asset(
            &format!("/pve2/{}", rest),
            session.data.pve_auth_cookie.as_deref(),
        )
        .await?;

    let status = StatusCode::from_u16(asset.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, asset.body).into_response();
    if let Some(content_type) = asset
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    Ok(response)
}
