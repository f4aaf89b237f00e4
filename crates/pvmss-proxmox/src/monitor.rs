use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::client::ProxmoxClient;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const READ_ONLY_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct StatusInner {
    connected: bool,
    last_error: Option<String>,
    offline_since: Option<Instant>,
}

/// Point-in-time view of upstream reachability, rendered as a banner by
/// the templates.
#[derive(Debug, Clone)]
pub struct UpstreamStatus {
    pub connected: bool,
    pub last_error: Option<String>,
    /// True once the upstream has been unreachable long enough that
    /// handlers must stop attempting upstream calls.
    pub read_only: bool,
}

/// Many-reader handle onto the liveness state. Reads never block; the
/// monitor task is the only writer.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<ArcSwap<StatusInner>>,
}

impl StatusHandle {
    /// Handle with no probe task behind it; stays optimistic until
    /// something publishes. Useful where the monitor is not running.
    pub fn detached() -> Self {
        Self::new()
    }

    fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(StatusInner {
                // Optimistic until the first probe lands, so startup does
                // not flash the offline banner.
                connected: true,
                last_error: None,
                offline_since: None,
            })),
        }
    }

    pub fn snapshot(&self) -> UpstreamStatus {
        let inner = self.inner.load();
        UpstreamStatus {
            connected: inner.connected,
            last_error: inner.last_error.clone(),
            read_only: inner
                .offline_since
                .map(|t| t.elapsed() >= READ_ONLY_AFTER)
                .unwrap_or(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.load().connected
    }

    fn publish(&self, connected: bool, last_error: Option<String>) {
        let previous = self.inner.load_full();
        let offline_since = if connected {
            None
        } else {
            previous.offline_since.or_else(|| Some(Instant::now()))
        };
        if previous.connected != connected {
            if connected {
                info!("proxmox upstream reachable again");
            } else {
                warn!(error = ?last_error, "proxmox upstream unreachable");
            }
        }
        self.inner.store(Arc::new(StatusInner {
            connected,
            last_error,
            offline_since,
        }));
    }

    /// Test seam: force a status without running the monitor.
    pub fn set_for_test(&self, connected: bool, last_error: Option<String>) {
        self.publish(connected, last_error);
    }
}

/// Spawns the background probe loop. The returned handle stays valid after
/// shutdown; the task exits when `shutdown` flips to true.
pub fn spawn_monitor(
    client: Arc<ProxmoxClient>,
    mut shutdown: watch::Receiver<bool>,
) -> StatusHandle {
    let handle = StatusHandle::new();
    let published = handle.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match client.check_connection().await {
                        Ok(()) => published.publish(true, None),
                        Err(e) => published.publish(false, Some(e.to_string())),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("liveness monitor stopping");
                        break;
                    }
                }
            }
        }
    });
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_track_offline_window() {
        let handle = StatusHandle::new();
        assert!(handle.is_connected());

        handle.publish(false, Some("connect timeout".into()));
        let status = handle.snapshot();
        assert!(!status.connected);
        assert_eq!(status.last_error.as_deref(), Some("connect timeout"));
        // Freshly offline: still read-write until the threshold elapses.
        assert!(!status.read_only);

        // Repeated failures keep the original offline mark.
        let first = handle.inner.load().offline_since;
        handle.publish(false, Some("still down".into()));
        assert_eq!(handle.inner.load().offline_since, first);

        handle.publish(true, None);
        assert!(handle.snapshot().connected);
        assert!(handle.inner.load().offline_since.is_none());
    }

    #[tokio::test]
    async fn monitor_probes_and_shuts_down() {
        // Unroutable address: the probe fails fast with a transport error.
        let client = Arc::new(ProxmoxClient::new("https://127.0.0.1:1", true).unwrap());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_monitor(client, rx);

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_connected());

        tx.send(true).unwrap();
    }
}
