//! L4 proxy for protected game servers.
//!
//! This module provides:
//! - One TCP listener per protected proxy port, reconciled with the registry
//! - Ban enforcement at accept time
//! - Handshake inspection before forwarding
//! - An offline status reply when the backend cannot be reached
//! - Transparent bidirectional relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> ban check -> backend connect -> handshake -> relay -> Backend
//!                                          |
//!                                   offline status reply (on failure)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let handler = ConnectionHandler::new(registry, ProxySettings::default(), offline, stats);
//! let listeners = ListenerSet::new("0.0.0.0".parse()?, DEFAULT_MAX_CONNECTIONS, handler);
//! listeners.reconcile(&registry.ports()).await;
//! ```

mod connection;
mod listener;
mod offline;
mod relay;

use std::time::Duration;

pub use connection::{
    CloseReason, ClosedConnection, Connection, ConnectionError, ConnectionHandler, Phase,
    PhaseError,
};
pub use listener::{
    Listener, ListenerConfig, ListenerSet, ProxyStats, ReconcileReport, StatsSnapshot,
    DEFAULT_MAX_CONNECTIONS,
};
pub use offline::{OfflineConfig, OfflineResponder};

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a client gets to deliver its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection handling parameters.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Maximum time to establish the backend connection.
    pub connect_timeout: Duration,
    /// Maximum time between backend connect and a parsed handshake.
    pub handshake_timeout: Duration,
    /// Maximum bytes buffered while the handshake is incomplete.
    pub max_handshake_bytes: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_handshake_bytes: shield_wire::DEFAULT_MAX_HANDSHAKE_BYTES,
        }
    }
}
