pub mod csrf;
pub mod error_page;
pub mod headers;
pub mod rate_limit;
pub mod session;
pub mod slash;
pub mod status;

pub use csrf::*;
pub use error_page::*;
pub use headers::*;
pub use rate_limit::*;
pub use session::*;
pub use slash::*;
pub use status::*;

use axum::extract::ConnectInfo;
use axum::extract::Request;
use std::net::SocketAddr;

/// Static mounts bypass sessions, CSRF and the trailing-slash rewrite.
pub fn is_static_path(path: &str) -> bool {
    path == "/favicon.ico"
        || path.starts_with("/css/")
        || path.starts_with("/js/")
        || path.starts_with("/webfonts/")
}

/// Paths that never touch the session store.
pub fn skips_session(path: &str) -> bool {
    path == "/health" || is_static_path(path)
}

/// Best client address we can attribute a request to: first token of
/// `X-Forwarded-For`, then `X-Real-IP`, then the peer address.
pub fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// TLS detection for cookie attributes: terminated here or at a proxy
/// announcing `X-Forwarded-Proto: https`.
pub fn is_secure_request(req: &Request) -> bool {
    is_secure_headers(req.headers())
}

pub fn is_secure_headers(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}
