//! Registry of connected clients.
//!
//! Every mutation and every broadcast goes through one async mutex. The lock
//! is held for a whole broadcast cycle, so membership cannot change while a
//! chunk is being delivered and a slow client delays the others for that
//! cycle. No per-client write timeout is applied, but a drain interrupts a
//! pending write so a client that stops reading cannot hold the lock forever.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::stats::MuxStats;
use super::{wait_closed, BoxedWriter};

/// Identity of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Returned by [`ClientRegistry::add`].
#[derive(Debug)]
pub struct Registration {
    /// The identity assigned to the client.
    pub id: ClientId,
    /// Flips to `true` when the registry closes this client's transport.
    pub closed: watch::Receiver<bool>,
}

/// Outcome of one broadcast cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members the chunk was written to.
    pub delivered: usize,
    /// Members whose write failed.
    pub failed: usize,
    /// The cycle was cut short by a drain.
    pub interrupted: bool,
}

struct ClientEntry {
    id: ClientId,
    peer_addr: SocketAddr,
    writer: BoxedWriter,
    closed: watch::Sender<bool>,
}

impl ClientEntry {
    async fn close(mut self) {
        self.closed.send_replace(true);
        if let Err(e) = self.writer.shutdown().await {
            debug!(client = %self.id, error = %e, "Client transport shutdown failed");
        }
    }
}

#[derive(Default)]
struct RegistryState {
    clients: Vec<ClientEntry>,
    drained: bool,
}

/// Thread-safe ordered set of client transports.
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
    stats: Arc<MuxStats>,
    // Set before a drain takes the lock.
    draining: watch::Sender<bool>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Create an empty registry with its own counters.
    pub fn new() -> Self {
        Self::with_stats(Arc::new(MuxStats::default()))
    }

    /// Create an empty registry reporting into shared counters.
    pub fn with_stats(stats: Arc<MuxStats>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
            stats,
            draining: watch::channel(false).0,
        }
    }

    /// Register a client's write half.
    ///
    /// After [`drain_all`](Self::drain_all) the registry no longer accepts
    /// members: the writer is closed immediately and the returned
    /// registration is already marked closed.
    pub async fn add(&self, peer_addr: SocketAddr, writer: BoxedWriter) -> Registration {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (closed_tx, closed_rx) = watch::channel(false);
        let entry = ClientEntry {
            id,
            peer_addr,
            writer,
            closed: closed_tx,
        };

        let mut state = self.state.lock().await;
        if state.drained {
            drop(state);
            debug!(client = %id, peer_addr = %peer_addr, "Registry drained, closing late client");
            entry.close().await;
        } else {
            state.clients.push(entry);
            self.stats.clients_active.fetch_add(1, Ordering::Relaxed);
        }

        Registration {
            id,
            closed: closed_rx,
        }
    }

    /// Remove a client and close its transport.
    ///
    /// Returns `false` if the client was not registered (already removed or
    /// drained).
    pub async fn remove(&self, id: ClientId) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.clients.iter().position(|c| c.id == id) else {
            return false;
        };
        let entry = state.clients.remove(index);
        self.stats.clients_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.clients_closed.fetch_add(1, Ordering::Relaxed);
        entry.close().await;
        true
    }

    /// Write `bytes` to every current member, in registration order.
    ///
    /// A failed write is logged and counted; delivery to the remaining
    /// members continues. A [`drain_all`](Self::drain_all) abandons the
    /// pending write and ends the cycle.
    pub async fn broadcast(&self, bytes: &[u8]) -> BroadcastReport {
        let mut draining = self.draining.subscribe();
        let mut state = self.state.lock().await;
        let mut report = BroadcastReport::default();

        for client in state.clients.iter_mut() {
            let write = async {
                client.writer.write_all(bytes).await?;
                client.writer.flush().await
            };
            let result = tokio::select! {
                biased;
                _ = wait_closed(&mut draining) => None,
                result = write => Some(result),
            };

            let Some(result) = result else {
                debug!(
                    client = %client.id,
                    delivered = report.delivered,
                    "Broadcast interrupted by drain"
                );
                report.interrupted = true;
                break;
            };

            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        client = %client.id,
                        peer_addr = %client.peer_addr,
                        error = %e,
                        "Broadcast to client failed"
                    );
                }
            }
        }

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .broadcast_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    /// Close every member and empty the set. Later adds are refused.
    ///
    /// Returns the number of clients closed.
    pub async fn drain_all(&self) -> usize {
        self.draining.send_replace(true);
        let mut state = self.state.lock().await;
        state.drained = true;
        let clients = std::mem::take(&mut state.clients);
        let count = clients.len();

        for entry in clients {
            entry.close().await;
        }

        self.stats
            .clients_active
            .fetch_sub(count as u64, Ordering::Relaxed);
        self.stats
            .clients_closed
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Identities of the current members, in registration order.
    pub async fn ids(&self) -> Vec<ClientId> {
        self.state.lock().await.clients.iter().map(|c| c.id).collect()
    }

    /// Number of current members.
    pub async fn len(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.clients.is_empty()
    }
}
