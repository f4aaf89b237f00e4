use std::sync::Arc;

use pvmss_core::{Config, SettingsStore};
use pvmss_proxmox::{ProxmoxClient, StatusHandle};
use pvmss_session::SessionStore;

use crate::i18n::I18n;
use crate::middleware::rate_limit::RateLimits;
use crate::render::Renderer;

/// Everything a handler can reach, constructed once at init and passed
/// explicitly. There is no other process-wide state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub settings: Arc<SettingsStore>,
    pub proxmox: Arc<ProxmoxClient>,
    pub sessions: Arc<SessionStore>,
    pub status: StatusHandle,
    pub limits: Arc<RateLimits>,
    pub i18n: Arc<I18n>,
    pub renderer: Arc<Renderer>,
}

impl AppState {
    pub fn new(
        config: Config,
        settings: SettingsStore,
        proxmox: Arc<ProxmoxClient>,
        sessions: Arc<SessionStore>,
        status: StatusHandle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            settings: Arc::new(settings),
            proxmox,
            sessions,
            status,
            limits: Arc::new(RateLimits::new()),
            i18n: Arc::new(I18n::new()),
            renderer: Arc::new(Renderer::new()),
        }
    }

    /// Pool a username maps to; each user owns exactly one.
    pub fn pool_for(username: &str) -> String {
        format!("pvmss_{}", username)
    }
}
