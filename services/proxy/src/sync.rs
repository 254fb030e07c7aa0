//! Registry refresh loop.
//!
//! The registry is reloaded from the management store on a fixed period and
//! the bound listeners follow its port set. A failed reload leaves the
//! previous snapshot in force and is retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::proxy::{ListenerSet, ReconcileReport};
use crate::registry::SharedRegistry;

/// Refresh once and reconcile listeners.
///
/// Listeners are reconciled even when the refresh fails, so ports that failed
/// to bind earlier are retried against the snapshot still in force.
pub async fn refresh_once(registry: &SharedRegistry, listeners: &ListenerSet) -> ReconcileReport {
    if let Err(e) = registry.refresh().await {
        warn!(error = %e, "Registry refresh failed; keeping previous snapshot");
    }

    listeners.reconcile(&registry.ports()).await
}

/// Refresh every `interval` until the task is aborted.
///
/// The first refresh happens one full interval after the call; callers do the
/// startup refresh themselves.
pub async fn run_refresh_loop(
    registry: SharedRegistry,
    listeners: Arc<ListenerSet>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        refresh_once(&registry, &listeners).await;
    }
}
