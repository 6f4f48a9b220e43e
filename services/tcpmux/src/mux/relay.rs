//! Upstream-to-clients fan-out loop.

use std::sync::atomic::Ordering;

use tracing::{debug, error, info, trace, warn};

use super::RelayContext;
use crate::error::MuxError;

/// Why the broadcast relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The upstream server closed the connection.
    UpstreamEof,
    /// The upstream link was closed locally.
    LinkClosed,
    /// A non-transient read error.
    ReadFailed(MuxError),
}

/// Single reader of the upstream link.
///
/// Once the loop ends nothing is relayed to clients anymore. Connected
/// sessions are left open and new clients are still accepted.
pub struct BroadcastRelay {
    ctx: RelayContext,
}

impl BroadcastRelay {
    pub fn new(ctx: RelayContext) -> Self {
        Self { ctx }
    }

    /// Read upstream chunks and broadcast each one until the link dies.
    pub async fn run(self) -> RelayEnd {
        let mut buf = vec![0u8; self.ctx.chunk_size];
        info!(upstream = %self.ctx.upstream.addr(), "Broadcast relay started");

        let end = loop {
            let n = match self.ctx.upstream.read_chunk(&mut buf).await {
                Ok(0) => break RelayEnd::UpstreamEof,
                Ok(n) => n,
                Err(e) if e.is_transient() => {
                    trace!(error = %e, "Transient upstream read error");
                    continue;
                }
                Err(MuxError::LinkClosed) => break RelayEnd::LinkClosed,
                Err(e) => break RelayEnd::ReadFailed(e),
            };

            let chunk = &buf[..n];
            self.ctx
                .stats
                .bytes_from_upstream
                .fetch_add(n as u64, Ordering::Relaxed);

            info!(bytes = n, "Upstream -> clients");
            trace!(payload = %String::from_utf8_lossy(chunk), "Upstream -> clients payload");

            let report = self.ctx.registry.broadcast(chunk).await;
            if report.failed > 0 {
                debug!(
                    delivered = report.delivered,
                    failed = report.failed,
                    "Broadcast partially failed"
                );
            }
        };

        self.ctx.stats.relay_ended.store(true, Ordering::Relaxed);
        match &end {
            RelayEnd::UpstreamEof => {
                warn!("Upstream closed the connection; relaying stopped")
            }
            RelayEnd::LinkClosed => info!("Broadcast relay stopped"),
            RelayEnd::ReadFailed(e) => {
                error!(error = %e, "Error reading from upstream; relaying stopped")
            }
        }
        end
    }
}
