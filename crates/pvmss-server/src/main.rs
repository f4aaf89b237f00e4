use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pvmss_api::{build_router, AppState};
use pvmss_api::middleware::rate_limit::spawn_rate_limit_sweeper;
use pvmss_core::{Config, SettingsStore};
use pvmss_proxmox::{spawn_monitor, ProxmoxClient};
use pvmss_session::{spawn_session_sweeper, SessionStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be up yet when init fails.
        eprintln!("pvmss: fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("reading configuration")?;

    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (settings, was_normalized) = SettingsStore::load(&config.settings_path)
        .context("loading settings document")?;
    if was_normalized {
        info!(path = %config.settings_path.display(), "settings were normalized on load");
    }

    let mut proxmox =
        ProxmoxClient::new(&config.proxmox_url, config.verify_ssl).context("proxmox client")?;
    if let (Some(id), Some(secret)) = (&config.api_token_name, &config.api_token_value) {
        proxmox = proxmox.with_api_token(id, secret);
    } else {
        warn!("no API token configured; only per-user ticket operations will work");
    }
    let proxmox = Arc::new(proxmox);

    let sessions = Arc::new(SessionStore::new(config.session_secret.as_bytes()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status = spawn_monitor(proxmox.clone(), shutdown_rx.clone());
    spawn_session_sweeper(sessions.clone(), shutdown_rx.clone());

    let port = config.port;
    let state = AppState::new(config, settings, proxmox, sessions, status);
    spawn_rate_limit_sweeper(state.limits.clone(), shutdown_rx);

    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "pvmss listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("serving")?;

    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. Flips the shutdown channel for the
/// background tasks and arms a watchdog so drain never exceeds the grace
/// period.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        warn!("drain grace period elapsed, exiting");
        std::process::exit(0);
    });
}
