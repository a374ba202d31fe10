//! Wires configuration, singletons, and listeners into a running process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, IDENTITY_CLEANUP_INTERVAL_SECS};
use crate::control::{self, AppState};
use crate::forwarder::{tcp, udp, ForwarderContext};
use crate::identity::{IdentityMap, IdentityPersistence, PendingBuffer};
use crate::notify::Aggregator;

/// Loads configuration, brings up every listener and the control endpoint
/// (if enabled), and blocks until a shutdown signal arrives. No in-flight
/// work is awaited on shutdown.
pub async fn run(working_dir: &Path) -> anyhow::Result<()> {
    let config = Config::load(working_dir)?;

    let identity_map = Arc::new(IdentityMap::new());
    let pending = PendingBuffer::new();
    let persistence = Arc::new(IdentityPersistence::load(working_dir, config.save_player_ip));
    let http_client = reqwest::Client::new();
    let aggregator = Aggregator::new(http_client.clone());

    let forwarder_ctx = Arc::new(ForwarderContext {
        correlation_mode: config.use_rest_api,
        pending: pending.clone(),
        aggregator: aggregator.clone(),
    });

    if config.use_rest_api {
        start_control_endpoint(&config, &identity_map, &pending, &persistence, &http_client);
    }

    for listener in &config.listeners {
        if listener.tcp_active() {
            let listener = Arc::new(listener.clone());
            let ctx = forwarder_ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = tcp::serve(listener, ctx).await {
                    tracing::error!(error = %e, "tcp: forwarder terminated");
                }
            });
        }
        if listener.udp_active() {
            let listener = Arc::new(listener.clone());
            let ctx = forwarder_ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = udp::serve(listener, ctx).await {
                    tracing::error!(error = %e, "udp: forwarder terminated");
                }
            });
        }
        if !listener.tcp_active() && !listener.udp_active() {
            tracing::warn!(bind = %listener.bind, "listener has no active tcp or udp half, ignoring");
        }
    }

    spawn_identity_cleanup(identity_map);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, exiting");
    Ok(())
}

fn start_control_endpoint(
    config: &Config,
    identity_map: &Arc<IdentityMap>,
    pending: &Arc<PendingBuffer>,
    persistence: &Arc<IdentityPersistence>,
    http_client: &reqwest::Client,
) {
    let webhook_urls: Vec<String> = config
        .listeners
        .iter()
        .filter_map(|l| l.webhook_url().map(str::to_string))
        .collect();

    let state = Arc::new(AppState {
        identity_map: identity_map.clone(),
        pending: pending.clone(),
        persistence: persistence.clone(),
        http_client: http_client.clone(),
        webhook_urls,
    });

    let port = config.endpoint;
    tokio::spawn(async move {
        if let Err(e) = control::serve(port, state).await {
            tracing::error!(error = %e, "control: endpoint terminated");
        }
    });
}

fn spawn_identity_cleanup(identity_map: Arc<IdentityMap>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(IDENTITY_CLEANUP_INTERVAL_SECS));
        loop {
            tick.tick().await;
            identity_map.cleanup(chrono::Utc::now().timestamp_millis());
        }
    });
}
