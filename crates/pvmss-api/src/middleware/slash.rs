use axum::extract::Request;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};

use crate::middleware::is_static_path;

/// Canonicalizes `/x/` to `/x` with a 303 for GET/HEAD, leaving static
/// mounts and the upstream asset proxy alone.
pub async fn trailing_slash_layer(req: Request, next: Next) -> Response {
    let path = req.uri().path();
    let redirectable = (req.method() == Method::GET || req.method() == Method::HEAD)
        && path.len() > 1
        && path.ends_with('/')
        && !is_static_path(path)
        && !path.starts_with("/pve2/");
    if redirectable {
        let trimmed = path.trim_end_matches('/');
        let location = match req.uri().query() {
            Some(query) => format!("{}?{}", trimmed, query),
            None => trimmed.to_string(),
        };
        return Redirect::to(&location).into_response();
    }
    next.run(req).await
}
