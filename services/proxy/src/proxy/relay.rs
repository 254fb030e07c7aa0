//! Bidirectional byte relay.
//!
//! Once the handshake has been forwarded the connection is an opaque pipe.
//! A clean EOF on one leg is passed on as a write shutdown to the other; an
//! error on either leg ends both directions.

use std::io;

use bytes::BytesMut;
use shield_wire::{classify_response, Decoded};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Size of the per-direction relay buffer.
pub(crate) const RELAY_BUFFER_SIZE: usize = 8192;

/// Watches the start of the backend stream until its first frame can be
/// classified. Never delays or alters the bytes it sees.
#[derive(Debug)]
pub(crate) struct FirstFrameProbe {
    seen: BytesMut,
    limit: usize,
}

impl FirstFrameProbe {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            seen: BytesMut::new(),
            limit,
        }
    }

    /// Feed the next chunk. Returns true once the probe is done, whether or
    /// not classification succeeded.
    pub(crate) fn observe(&mut self, chunk: &[u8]) -> bool {
        self.seen.extend_from_slice(chunk);

        match classify_response(&self.seen) {
            Ok(Decoded::Complete { value, .. }) => {
                debug!(
                    kind = %value.kind,
                    packet_id = value.packet_id,
                    frame_len = value.frame_len,
                    "Backend first frame classified"
                );
                true
            }
            Ok(Decoded::Incomplete) if self.seen.len() < self.limit => false,
            Ok(Decoded::Incomplete) => {
                debug!(buffered = self.seen.len(), "Backend first frame not classified");
                true
            }
            Err(e) => {
                debug!(error = %e, "Backend first frame unclassifiable");
                true
            }
        }
    }
}

/// Bytes moved by [`relay`] and how it ended.
#[derive(Debug)]
pub(crate) struct RelayTotals {
    pub to_backend: u64,
    pub from_backend: u64,
    pub result: io::Result<()>,
}

/// Relay between `client` and `backend` until both directions finish or
/// either fails. Byte counts are reported even when the relay fails.
pub(crate) async fn relay(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    probe: Option<FirstFrameProbe>,
) -> RelayTotals {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let mut to_backend = 0u64;
    let mut from_backend = 0u64;

    let result = tokio::try_join!(
        pump(&mut client_read, &mut backend_write, &mut to_backend, None),
        pump(&mut backend_read, &mut client_write, &mut from_backend, probe),
    )
    .map(|_| ());

    RelayTotals {
        to_backend,
        from_backend,
        result,
    }
}

/// Copy `reader` into `writer` until EOF, then shut `writer` down.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: &mut u64,
    mut probe: Option<FirstFrameProbe>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        if probe.as_mut().is_some_and(|p| p.observe(&buf[..n])) {
            probe = None;
        }

        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }

    match writer.shutdown().await {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}
