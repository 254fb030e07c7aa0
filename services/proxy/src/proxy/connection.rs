//! Per-connection state machine and orchestration.
//!
//! Every accepted socket gets a [`Connection`] owned by one task. The phase
//! only moves forward:
//!
//! ```text
//! Connecting -> AwaitingHandshake -> Relaying
//!      |               |                |
//!      +---------------+----------------+--> Closed
//! ```
//!
//! [`ConnectionHandler`] drives a connection through those phases: ban check,
//! backend connect, handshake buffering, then the raw relay.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use shield_wire::{Decoded, Handshake, HandshakeParser, WireError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, field, info, info_span, trace, warn, Instrument, Span};
use uuid::Uuid;

use super::listener::ProxyStats;
use super::offline::OfflineResponder;
use super::relay::{relay, FirstFrameProbe};
use super::ProxySettings;
use crate::registry::{ProtectedServer, SharedRegistry};

/// Initial capacity of the handshake buffer. Handshakes are usually well
/// under this.
const HANDSHAKE_READ_CAPACITY: usize = 512;

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Connecting,
    AwaitingHandshake,
    Relaying,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::AwaitingHandshake => "awaiting_handshake",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        }
    }

    /// The phase reachable by [`Connection::advance`]. `Closed` is only
    /// reachable through [`Connection::close`].
    fn successor(self) -> Option<Phase> {
        match self {
            Self::Connecting => Some(Self::AwaitingHandshake),
            Self::AwaitingHandshake => Some(Self::Relaying),
            Self::Relaying | Self::Closed => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal phase transition {from} -> {to}")]
pub struct PhaseError {
    pub from: Phase,
    pub to: Phase,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Relay finished with both legs closed cleanly.
    Completed,
    /// Client went away before sending a full handshake.
    ClientClosed,
    Banned,
    /// No protected server behind the listening port.
    UnknownPort,
    BackendUnreachable,
    Malformed,
    HandshakeTimeout,
    Transport,
    /// A phase transition was refused.
    Internal,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ClientClosed => "client_closed",
            Self::Banned => "banned",
            Self::UnknownPort => "unknown_port",
            Self::BackendUnreachable => "backend_unreachable",
            Self::Malformed => "malformed",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::Transport => "transport",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("source address {0} is banned")]
    Banned(IpAddr),

    #[error("backend {backend} unreachable: {source}")]
    BackendUnreachable {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed handshake: {0}")]
    Malformed(#[from] WireError),

    #[error("no handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("client closed before completing the handshake")]
    ClientClosed,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

impl ConnectionError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Banned(_) => CloseReason::Banned,
            Self::BackendUnreachable { .. } => CloseReason::BackendUnreachable,
            Self::Malformed(_) => CloseReason::Malformed,
            Self::HandshakeTimeout(_) => CloseReason::HandshakeTimeout,
            Self::ClientClosed => CloseReason::ClientClosed,
            Self::Transport(_) => CloseReason::Transport,
            Self::Phase(_) => CloseReason::Internal,
        }
    }
}

/// Close record, produced once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConnection {
    pub id: Uuid,
    pub reason: CloseReason,
    /// Phase the connection was in when it closed.
    pub last_phase: Phase,
    pub duration: Duration,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// One accepted client connection.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    client_addr: SocketAddr,
    server: ProtectedServer,
    started_at: Instant,
    phase: Phase,
    bytes_to_backend: u64,
    bytes_from_backend: u64,
}

impl Connection {
    pub fn new(client_addr: SocketAddr, server: ProtectedServer) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_addr,
            server,
            started_at: Instant::now(),
            phase: Phase::Connecting,
            bytes_to_backend: 0,
            bytes_from_backend: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn server(&self) -> &ProtectedServer {
        &self.server
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to the next phase. Only the immediate successor is accepted.
    pub fn advance(&mut self, next: Phase) -> Result<(), PhaseError> {
        if self.phase.successor() != Some(next) {
            return Err(PhaseError {
                from: self.phase,
                to: next,
            });
        }

        trace!(from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
        Ok(())
    }

    /// Returns true while the client has not seen any backend bytes, so an
    /// offline status reply cannot interleave with real traffic.
    pub fn may_send_offline_status(&self) -> bool {
        self.phase < Phase::Relaying && self.bytes_from_backend == 0
    }

    pub fn record_to_backend(&mut self, bytes: u64) {
        self.bytes_to_backend += bytes;
    }

    pub fn record_from_backend(&mut self, bytes: u64) {
        self.bytes_from_backend += bytes;
    }

    /// Close the connection. Only the first call yields a record; later
    /// calls return `None`.
    pub fn close(&mut self, reason: CloseReason) -> Option<ClosedConnection> {
        if self.phase == Phase::Closed {
            return None;
        }

        let last_phase = self.phase;
        self.phase = Phase::Closed;

        Some(ClosedConnection {
            id: self.id,
            reason,
            last_phase,
            duration: self.started_at.elapsed(),
            bytes_to_backend: self.bytes_to_backend,
            bytes_from_backend: self.bytes_from_backend,
        })
    }
}

/// Result of the handshake phase.
struct HandshakeOutcome {
    handshake: Handshake,
    /// Raw handshake frame, exactly as received.
    frame: Bytes,
    /// Client bytes received after the frame.
    leftover: BytesMut,
    /// Backend bytes not yet passed to the client.
    backend_pending: BytesMut,
    /// Set while the backend's first frame is unclassified.
    probe: Option<FirstFrameProbe>,
}

/// Drives accepted connections. Cheap to clone; one instance is shared by
/// all listeners.
#[derive(Clone)]
pub struct ConnectionHandler {
    registry: SharedRegistry,
    settings: ProxySettings,
    offline: Arc<OfflineResponder>,
    stats: Arc<ProxyStats>,
}

impl ConnectionHandler {
    pub fn new(
        registry: SharedRegistry,
        settings: ProxySettings,
        offline: Arc<OfflineResponder>,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            registry,
            settings,
            offline,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Handle one accepted client socket until it is closed.
    pub async fn handle(&self, client: TcpStream, peer: SocketAddr, proxy_port: u16) {
        let span = info_span!("connection", id = field::Empty, peer = %peer, proxy_port);
        self.handle_inner(client, peer, proxy_port)
            .instrument(span)
            .await
    }

    async fn handle_inner(&self, client: TcpStream, peer: SocketAddr, proxy_port: u16) {
        let Some(server) = self.registry.lookup_server(proxy_port) else {
            self.stats.record_close(CloseReason::UnknownPort);
            debug!(reason = %CloseReason::UnknownPort, "No protected server on port, closing");
            return;
        };

        let mut conn = Connection::new(peer, server);
        Span::current().record("id", field::display(conn.id()));
        debug!(backend = %conn.server(), "Connection accepted");

        let result = self.drive(&mut conn, client).await;

        let reason = match &result {
            Ok(()) => CloseReason::Completed,
            Err(e) => {
                match e {
                    ConnectionError::Banned(ip) => {
                        info!(ip = %ip, "Rejected connection from banned address")
                    }
                    ConnectionError::BackendUnreachable { .. } => {
                        warn!(error = %e, "Backend unreachable")
                    }
                    ConnectionError::Phase(_) => warn!(error = %e, "Connection state error"),
                    _ => debug!(error = %e, "Connection ended with error"),
                }
                e.close_reason()
            }
        };

        if let Some(closed) = conn.close(reason) {
            self.stats.record_close(closed.reason);
            self.stats
                .bytes_to_backend
                .fetch_add(closed.bytes_to_backend, Ordering::Relaxed);
            self.stats
                .bytes_from_backend
                .fetch_add(closed.bytes_from_backend, Ordering::Relaxed);

            info!(
                reason = %closed.reason,
                last_phase = %closed.last_phase,
                duration_ms = closed.duration.as_millis() as u64,
                bytes_to_backend = closed.bytes_to_backend,
                bytes_from_backend = closed.bytes_from_backend,
                "Connection closed"
            );
        }
    }

    /// Run the phases in order. Sockets are dropped when this returns.
    async fn drive(
        &self,
        conn: &mut Connection,
        mut client: TcpStream,
    ) -> Result<(), ConnectionError> {
        let client_ip = conn.client_addr().ip();
        if self.registry.is_banned(client_ip) {
            return Err(ConnectionError::Banned(client_ip));
        }

        let mut backend = match self.connect_backend(conn.server()).await {
            Ok(backend) => backend,
            Err(source) => return Err(self.backend_failed(conn, &mut client, source).await),
        };
        conn.advance(Phase::AwaitingHandshake)?;
        debug!(backend = %conn.server(), "Connected to backend");

        let limit = self.settings.handshake_timeout;
        let outcome = match timeout(limit, self.await_handshake(conn, &mut client, &mut backend))
            .await
        {
            Ok(outcome) => outcome?,
            Err(_) => return Err(ConnectionError::HandshakeTimeout(limit)),
        };

        let handshake = &outcome.handshake;
        info!(
            protocol_version = handshake.protocol_version,
            hostname = %handshake.hostname,
            port = handshake.port,
            next_state = %handshake.next_state,
            "Handshake received"
        );

        let forwarded = async {
            backend.write_all(&outcome.frame).await?;
            if !outcome.leftover.is_empty() {
                backend.write_all(&outcome.leftover).await?;
            }
            Ok::<_, io::Error>(())
        };
        if let Err(source) = forwarded.await {
            return Err(self.backend_failed(conn, &mut client, source).await);
        }
        conn.record_to_backend((outcome.frame.len() + outcome.leftover.len()) as u64);
        conn.advance(Phase::Relaying)?;

        if !outcome.backend_pending.is_empty() {
            client.write_all(&outcome.backend_pending).await?;
            conn.record_from_backend(outcome.backend_pending.len() as u64);
        }

        let totals = relay(&mut client, &mut backend, outcome.probe).await;
        conn.record_to_backend(totals.to_backend);
        conn.record_from_backend(totals.from_backend);

        totals.result.map_err(ConnectionError::Transport)
    }

    async fn connect_backend(&self, server: &ProtectedServer) -> io::Result<TcpStream> {
        self.stats
            .backend_connect_attempts
            .fetch_add(1, Ordering::Relaxed);

        let connect = TcpStream::connect((server.backend_host.as_str(), server.backend_port));
        let stream = timeout(self.settings.connect_timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend connect timed out"))??;

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Buffer client bytes until a full handshake frame has arrived.
    ///
    /// Backend bytes arriving meanwhile are held until the backend's first
    /// frame is classified, then passed through.
    async fn await_handshake(
        &self,
        conn: &mut Connection,
        client: &mut TcpStream,
        backend: &mut TcpStream,
    ) -> Result<HandshakeOutcome, ConnectionError> {
        let parser = HandshakeParser::with_limit(self.settings.max_handshake_bytes);
        let mut buffer = BytesMut::with_capacity(HANDSHAKE_READ_CAPACITY);
        let mut backend_pending = BytesMut::new();
        let mut probe = Some(FirstFrameProbe::new(self.settings.max_handshake_bytes));

        loop {
            let seen = backend_pending.len();

            tokio::select! {
                read = client.read_buf(&mut buffer) => {
                    if read? == 0 {
                        return Err(ConnectionError::ClientClosed);
                    }

                    match parser.parse(&buffer)? {
                        Decoded::Complete { value, next_offset } => {
                            let frame = buffer.split_to(next_offset).freeze();
                            return Ok(HandshakeOutcome {
                                handshake: value,
                                frame,
                                leftover: buffer,
                                backend_pending,
                                probe,
                            });
                        }
                        Decoded::Incomplete => {
                            trace!(buffered = buffer.len(), "Handshake incomplete");
                        }
                    }
                }
                read = backend.read_buf(&mut backend_pending) => {
                    let source = match read {
                        Ok(0) => io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "backend closed before the handshake",
                        ),
                        Err(e) => e,
                        Ok(_) => {
                            let done = probe
                                .as_mut()
                                .map_or(true, |p| p.observe(&backend_pending[seen..]));
                            if done {
                                probe = None;
                                client.write_all(&backend_pending).await?;
                                conn.record_from_backend(backend_pending.len() as u64);
                                backend_pending.clear();
                            }
                            continue;
                        }
                    };
                    return Err(self.backend_failed(conn, client, source).await);
                }
            }
        }
    }

    /// Reply with the offline status if the client has not seen backend
    /// traffic yet, and build the error.
    async fn backend_failed(
        &self,
        conn: &Connection,
        client: &mut TcpStream,
        source: io::Error,
    ) -> ConnectionError {
        if conn.may_send_offline_status() {
            match self.offline.send(client).await {
                Ok(()) => {
                    self.stats.offline_replies.fetch_add(1, Ordering::Relaxed);
                    debug!("Sent offline status reply");
                }
                Err(e) => debug!(error = %e, "Failed to send offline status reply"),
            }
        }

        ConnectionError::BackendUnreachable {
            backend: conn.server().to_string(),
            source,
        }
    }
}
