//! Shield proxy
//!
//! Protective TCP proxy for game servers: one listener per protected port,
//! ban enforcement at accept, handshake inspection, transparent relay and an
//! offline status reply when a backend is down.

pub mod config;
pub mod proxy;
pub mod registry;
pub mod sync;

pub use config::Config;
pub use proxy::{
    CloseReason, Connection, ConnectionError, ConnectionHandler, Listener, ListenerConfig,
    ListenerSet, OfflineConfig, OfflineResponder, Phase, ProxySettings, ProxyStats,
    StatsSnapshot,
};
pub use registry::{
    BanEntry, ProtectedServer, Registry, RegistrySnapshot, RegistrySource, ServerStatus,
    SharedRegistry, SqliteSource,
};
