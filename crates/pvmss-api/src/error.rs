use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use pvmss_proxmox::ProxmoxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found")]
    NotFound,

    #[error("too many requests")]
    RateLimited,

    #[error("upstream error: {0}")]
    Upstream(#[from] ProxmoxError),

    #[error("the portal is in read-only mode while Proxmox is unreachable")]
    ReadOnly,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ReadOnly => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(e) => upstream_status(e),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a non-admin browser. Upstream details are
    /// collapsed; admin pages format the raw error themselves.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Upstream(e) => match upstream_status(e) {
                s if s.is_client_error() => format!("Proxmox rejected the request ({})", s.as_u16()),
                _ => "Proxmox is currently unavailable".to_string(),
            },
            ApiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

fn upstream_status(e: &ProxmoxError) -> StatusCode {
    match e.upstream_status() {
        // 401/403 from upstream means our credentials were refused, which
        // the browser experiences as its own auth failure.
        Some(401) => StatusCode::UNAUTHORIZED,
        Some(403) => StatusCode::FORBIDDEN,
        Some(code) if (400..500).contains(&code) => {
            StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        // Transport trouble and upstream 5xx both surface as a bad
        // gateway after the client's own retries ran out.
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Attached to every error response so the page layer further out can
/// re-render it as a localized HTML page for browser routes. API routes
/// keep the JSON body untouched.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.public_message();
        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        });
        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("10"));
        }
        response
            .extensions_mut()
            .insert(ErrorDetail { status, message });
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_4xx_propagates_status() {
        let err = ApiError::Upstream(ProxmoxError::Status {
            status: 404,
            message: "no such vm".into(),
        });
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        // The raw upstream text stays out of the public message.
        assert!(!err.public_message().contains("no such vm"));
    }

    #[test]
    fn transport_maps_to_bad_gateway() {
        let err = ApiError::Upstream(ProxmoxError::Transport("connect timeout".into()));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = ApiError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "10");
    }
}
