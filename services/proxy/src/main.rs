//! Shield proxy
//!
//! This service:
//! - Loads protected servers and bans from the management database
//! - Binds one listener per protected proxy port
//! - Drops connections from banned addresses
//! - Relays everything else to the real server
//! - Answers with an offline status when the real server is down

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shield_proxy::{
    sync, Config, ConnectionHandler, ListenerSet, OfflineResponder, ProxyStats, Registry,
    SqliteSource,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SHIELD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting shield proxy");
    info!(
        database_path = %config.database_path.display(),
        bind_ip = %config.bind_ip,
        refresh_interval_secs = config.refresh_interval.as_secs(),
        connect_timeout_ms = config.proxy.connect_timeout.as_millis() as u64,
        handshake_timeout_ms = config.proxy.handshake_timeout.as_millis() as u64,
        max_handshake_bytes = config.proxy.max_handshake_bytes,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let source = SqliteSource::open(&config.database_path).with_context(|| {
        format!(
            "failed to open database at {}",
            config.database_path.display()
        )
    })?;
    let registry = Arc::new(Registry::new(Arc::new(source)));

    let offline = OfflineResponder::new(&config.offline)
        .context("failed to encode offline status reply")?;
    let stats = Arc::new(ProxyStats::default());

    let handler = ConnectionHandler::new(
        Arc::clone(&registry),
        config.proxy.clone(),
        Arc::new(offline),
        Arc::clone(&stats),
    );
    let listeners = Arc::new(ListenerSet::new(
        config.bind_ip,
        config.max_connections,
        handler,
    ));

    let report = sync::refresh_once(&registry, &listeners).await;
    let snapshot = registry.snapshot();
    info!(
        server_count = snapshot.server_count(),
        ban_count = snapshot.ban_count(),
        listening = ?report.opened,
        failed = ?report.failed,
        "Initial registry load complete"
    );

    let refresh = tokio::spawn(sync::run_refresh_loop(
        Arc::clone(&registry),
        Arc::clone(&listeners),
        config.refresh_interval,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    refresh.abort();
    listeners.shutdown().await;

    let totals = stats.snapshot();
    info!(
        connections_accepted = totals.connections_accepted,
        connections_active = totals.connections_active,
        banned = totals.banned,
        backend_failed = totals.backend_failed,
        offline_replies = totals.offline_replies,
        bytes_to_backend = totals.bytes_to_backend,
        bytes_from_backend = totals.bytes_from_backend,
        "Shutdown complete"
    );

    Ok(())
}
