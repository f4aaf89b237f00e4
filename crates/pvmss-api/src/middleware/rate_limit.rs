use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::sync::watch;
use tracing::warn;

use crate::error::ApiError;
use crate::middleware::client_ip;
use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Keyed token buckets. The login rule admits a burst of 5 and refills one
/// token every 12 seconds, per `(method, path, client-ip)` key.
pub struct RateLimits {
    login: DefaultKeyedRateLimiter<String>,
}

impl RateLimits {
    pub fn new() -> Self {
        let quota = Quota::with_period(Duration::from_secs(12))
            .expect("nonzero refill period")
            .allow_burst(NonZeroU32::new(5).expect("nonzero burst"));
        Self {
            login: RateLimiter::keyed(quota),
        }
    }

    pub fn check_login(&self, key: String) -> bool {
        self.login.check_key(&key).is_ok()
    }

    /// Drops buckets that have fully refilled, so one-off clients do not
    /// accumulate forever.
    pub fn sweep(&self) {
        self.login.retain_recent();
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new()
    }
}

fn limited(method: &Method, path: &str) -> bool {
    method == Method::POST && matches!(path, "/login" | "/admin/login")
}

pub async fn rate_limit_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if limited(req.method(), path) {
        let key = format!("{} {} {}", req.method(), path, client_ip(&req));
        if !state.limits.check_login(key.clone()) {
            warn!(%key, "login rate limit exceeded");
            return ApiError::RateLimited.into_response();
        }
    }
    next.run(req).await
}

/// Reaps idle buckets at a coarse cadence until shutdown.
pub fn spawn_rate_limit_sweeper(limits: Arc<RateLimits>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => limits.sweep(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
