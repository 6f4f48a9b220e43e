//! Connection multiplexing engine.
//!
//! This module provides:
//! - A registry of connected clients with lock-held broadcast
//! - The single upstream link
//! - Per-client sessions forwarding client bytes upstream
//! - The broadcast relay fanning upstream bytes out to every client
//! - The supervisor tying startup, accept loop and shutdown together
//!
//! ## Architecture
//!
//! ```text
//!                    +--> ClientSession A --+
//! Listener --accept--+--> ClientSession B --+--write--> UpstreamLink --> server
//!                    +--> ClientSession C --+                |
//!                                                            | read_chunk
//!          ClientRegistry <--broadcast-- BroadcastRelay <----+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tcpmux::mux::Supervisor;
//!
//! let supervisor = Supervisor::start(MuxConfig::new("mud.example.com:4000")).await?;
//! supervisor.run(tokio::signal::ctrl_c().map(|_| ())).await?;
//! ```

mod registry;
mod relay;
mod session;
mod stats;
mod supervisor;
mod upstream;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;

pub use registry::{BroadcastReport, ClientId, ClientRegistry, Registration};
pub use relay::{BroadcastRelay, RelayEnd};
pub use session::{ClientSession, SessionEnd};
pub use stats::{MuxStats, StatsSnapshot};
pub use supervisor::{install_shutdown_signal, Supervisor};
pub use upstream::{UpstreamLink, DEFAULT_CONNECT_TIMEOUT};

/// Read half of any transport the multiplexer relays.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of any transport the multiplexer relays.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default chunk size for a single read.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Handles shared by the relay loops.
#[derive(Clone)]
pub struct RelayContext {
    /// The upstream connection.
    pub upstream: Arc<UpstreamLink>,
    /// Connected clients.
    pub registry: Arc<ClientRegistry>,
    /// Counters.
    pub stats: Arc<MuxStats>,
    /// Maximum bytes per read.
    pub chunk_size: usize,
    /// Per-read timeout for client reads. `None` waits forever.
    pub read_timeout: Option<Duration>,
}

impl RelayContext {
    /// Build a context around an upstream link, with a fresh registry and counters.
    pub fn new(upstream: Arc<UpstreamLink>) -> Self {
        let stats = Arc::new(MuxStats::default());
        Self {
            registry: Arc::new(ClientRegistry::with_stats(Arc::clone(&stats))),
            upstream,
            stats,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_timeout: None,
        }
    }
}

/// Read one chunk, mapping an elapsed timeout to `ErrorKind::TimedOut`.
pub(crate) async fn read_chunk_from<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, reader.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout")),
        },
        None => reader.read(buf).await,
    }
}

/// Resolve once a close flag flips to `true` (or its sender is gone).
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}
