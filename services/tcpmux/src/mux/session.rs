//! Per-client relay loop.
//!
//! A session moves through `Registered -> Relaying -> Terminated`. It
//! registers its write half with the [`ClientRegistry`](super::ClientRegistry)
//! so broadcasts can reach it, then reads from the client and forwards every
//! chunk upstream until the client goes away, an error ends the loop, or the
//! registry force-closes it.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{info, trace, warn};

use super::registry::ClientId;
use super::{read_chunk_from, wait_closed, BoxedReader, RelayContext};
use crate::error::{is_transient_io, MuxError};

/// Why a session terminated.
#[derive(Debug)]
pub enum SessionEnd {
    /// The client closed its side of the connection.
    PeerClosed,
    /// Reading from the client failed.
    ReadFailed(MuxError),
    /// Forwarding to upstream failed.
    UpstreamFailed(MuxError),
    /// The registry closed the client (shutdown drain).
    ForcedClose,
}

impl SessionEnd {
    fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::PeerClosed => "peer_closed",
            SessionEnd::ReadFailed(_) => "read_failed",
            SessionEnd::UpstreamFailed(_) => "upstream_failed",
            SessionEnd::ForcedClose => "forced_close",
        }
    }
}

/// One accepted client connection.
pub struct ClientSession {
    id: ClientId,
    peer_addr: SocketAddr,
    reader: BoxedReader,
    closed: watch::Receiver<bool>,
    ctx: RelayContext,
}

impl ClientSession {
    /// Register a freshly accepted connection.
    pub async fn register<S>(stream: S, peer_addr: SocketAddr, ctx: RelayContext) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let registration = ctx.registry.add(peer_addr, Box::new(writer)).await;

        info!(client = %registration.id, peer_addr = %peer_addr, "New client connected");

        Self {
            id: registration.id,
            peer_addr,
            reader: Box::new(reader),
            closed: registration.closed,
            ctx,
        }
    }

    /// Relay client bytes upstream until the session terminates.
    pub async fn run(mut self) -> SessionEnd {
        let mut buf = vec![0u8; self.ctx.chunk_size];

        let end = loop {
            let read = tokio::select! {
                result = read_chunk_from(&mut self.reader, &mut buf, self.ctx.read_timeout) => Some(result),
                _ = wait_closed(&mut self.closed) => None,
            };

            let n = match read {
                None => break SessionEnd::ForcedClose,
                Some(Ok(0)) => break SessionEnd::PeerClosed,
                Some(Ok(n)) => n,
                Some(Err(e)) if is_transient_io(&e) => {
                    trace!(error = %e, "Transient client read error");
                    continue;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Error reading from client");
                    break SessionEnd::ReadFailed(MuxError::Read(e));
                }
            };

            let chunk = &buf[..n];
            info!(client = %self.id, bytes = n, "Client -> upstream");
            trace!(payload = %String::from_utf8_lossy(chunk), "Client -> upstream payload");

            if let Err(e) = self.ctx.upstream.write(chunk).await {
                warn!(error = %e, "Error sending to upstream");
                break SessionEnd::UpstreamFailed(e);
            }
            self.ctx
                .stats
                .bytes_to_upstream
                .fetch_add(n as u64, Ordering::Relaxed);
        };

        self.terminate(&end).await;
        end
    }

    async fn terminate(self, end: &SessionEnd) {
        // Removal closes the write half; the read half drops with `self`.
        self.ctx.registry.remove(self.id).await;
        info!(
            client = %self.id,
            peer_addr = %self.peer_addr,
            reason = end.as_str(),
            "Client disconnected"
        );
    }
}
