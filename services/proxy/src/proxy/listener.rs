//! TCP listeners and connection accounting.
//!
//! One [`Listener`] is bound per protected proxy port. [`ListenerSet`] keeps
//! the bound ports in line with the registry: ports that appear are bound,
//! ports that disappear stop accepting. Connections already accepted on a
//! removed port run to completion.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{CloseReason, ConnectionHandler};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to. Its port is the proxy port looked up in the
    /// registry.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }
}

/// Process-wide proxy counters.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections from banned addresses.
    pub banned: AtomicU64,
    /// Connections on a port with no protected server.
    pub unknown_port: AtomicU64,
    /// Malformed handshakes.
    pub malformed: AtomicU64,
    /// Clients that did not send a handshake in time.
    pub handshake_timeouts: AtomicU64,
    /// Backend connections attempted.
    pub backend_connect_attempts: AtomicU64,
    /// Backends unreachable or failed before relaying.
    pub backend_failed: AtomicU64,
    /// Offline status replies sent.
    pub offline_replies: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub banned: u64,
    pub unknown_port: u64,
    pub malformed: u64,
    pub handshake_timeouts: u64,
    pub backend_connect_attempts: u64,
    pub backend_failed: u64,
    pub offline_replies: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

impl ProxyStats {
    /// Count the outcome of a finished connection.
    pub fn record_close(&self, reason: CloseReason) {
        let counter = match reason {
            CloseReason::Banned => &self.banned,
            CloseReason::UnknownPort => &self.unknown_port,
            CloseReason::Malformed => &self.malformed,
            CloseReason::HandshakeTimeout => &self.handshake_timeouts,
            CloseReason::BackendUnreachable => &self.backend_failed,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_active: load(&self.connections_active),
            connections_closed: load(&self.connections_closed),
            connections_rejected: load(&self.connections_rejected),
            banned: load(&self.banned),
            unknown_port: load(&self.unknown_port),
            malformed: load(&self.malformed),
            handshake_timeouts: load(&self.handshake_timeouts),
            backend_connect_attempts: load(&self.backend_connect_attempts),
            backend_failed: load(&self.backend_failed),
            offline_replies: load(&self.offline_replies),
            bytes_to_backend: load(&self.bytes_to_backend),
            bytes_from_backend: load(&self.bytes_from_backend),
        }
    }
}

/// A TCP listener for one proxy port.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Per-connection driver.
    handler: ConnectionHandler,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, handler: ConnectionHandler) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            handler,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        let proxy_port = local_addr.port();
        let stats = Arc::clone(self.handler.stats());
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                peer_addr = %peer_addr,
                                max_connections = self.config.max_connections,
                                "Connection rejected: max connections reached"
                            );
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    let handler = self.handler.clone();
                    let stats = Arc::clone(&stats);

                    tokio::spawn(async move {
                        handler.handle(stream, peer_addr, proxy_port).await;

                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Ports changed by a [`ListenerSet::reconcile`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<u16>,
    pub closed: Vec<u16>,
    /// Ports that could not be bound; retried on the next call.
    pub failed: Vec<u16>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty() && self.failed.is_empty()
    }
}

struct RunningListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// The set of bound proxy listeners.
pub struct ListenerSet {
    bind_ip: IpAddr,
    max_connections: usize,
    handler: ConnectionHandler,
    running: Mutex<HashMap<u16, RunningListener>>,
}

impl ListenerSet {
    pub fn new(bind_ip: IpAddr, max_connections: usize, handler: ConnectionHandler) -> Self {
        Self {
            bind_ip,
            max_connections,
            handler,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Bind listeners for `ports` not yet bound and stop the ones not listed.
    pub async fn reconcile(&self, ports: &[u16]) -> ReconcileReport {
        let wanted: BTreeSet<u16> = ports.iter().copied().collect();
        let mut running = self.running.lock().await;
        let mut report = ReconcileReport::default();

        running.retain(|port, listener| {
            let keep = wanted.contains(port);
            if keep && !listener.task.is_finished() {
                return true;
            }

            listener.task.abort();
            if !keep {
                info!(port, bind_addr = %listener.local_addr, "Listener stopped");
                report.closed.push(*port);
            }
            false
        });

        for port in wanted {
            if running.contains_key(&port) {
                continue;
            }

            let config = ListenerConfig::new(SocketAddr::new(self.bind_ip, port))
                .with_max_connections(self.max_connections);

            let listener = match Listener::bind(config, self.handler.clone()).await {
                Ok(listener) => Arc::new(listener),
                Err(e) => {
                    warn!(port, error = %e, "Failed to bind listener, retrying on next refresh");
                    report.failed.push(port);
                    continue;
                }
            };

            let local_addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(port, error = %e, "Bound listener has no local address");
                    report.failed.push(port);
                    continue;
                }
            };

            let task = tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    error!(port, error = %e, "Listener failed");
                }
            });

            running.insert(port, RunningListener { local_addr, task });
            report.opened.push(port);
        }

        report.closed.sort_unstable();
        report
    }

    /// Currently bound proxy ports, ascending.
    pub async fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.running.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Stop every listener.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (port, listener) in running.drain() {
            listener.task.abort();
            debug!(port, "Listener stopped");
        }
    }
}
