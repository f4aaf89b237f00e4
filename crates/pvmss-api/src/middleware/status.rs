use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use pvmss_proxmox::UpstreamStatus;

use crate::state::AppState;

/// Snapshot of upstream reachability taken once per request, consumed by
/// templates for the banner and by handlers for read-only gating.
#[derive(Clone)]
pub struct UpstreamStatusExt(pub UpstreamStatus);

pub async fn status_layer(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    req.extensions_mut()
        .insert(UpstreamStatusExt(state.status.snapshot()));
    next.run(req).await
}
