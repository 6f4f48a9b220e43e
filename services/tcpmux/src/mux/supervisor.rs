//! Startup, accept loop and shutdown.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

use super::relay::BroadcastRelay;
use super::session::ClientSession;
use super::stats::{MuxStats, StatsSnapshot};
use super::{wait_closed, ClientRegistry, RelayContext, UpstreamLink};
use crate::config::MuxConfig;
use crate::error::MuxError;

/// Top-level orchestrator.
pub struct Supervisor {
    config: MuxConfig,
    listener: TcpListener,
    ctx: RelayContext,
    shutdown_tx: watch::Sender<bool>,
    shutdown_started: AtomicBool,
}

impl Supervisor {
    /// Connect upstream, start the broadcast relay and bind the listener.
    ///
    /// Fails if the upstream cannot be reached or the listener cannot bind;
    /// no client traffic is accepted in either case.
    pub async fn start(config: MuxConfig) -> Result<Self, MuxError> {
        config.validate()?;

        let upstream = UpstreamLink::connect(&config.upstream_addr, config.connect_timeout)
            .await?
            .with_read_timeout(config.read_timeout);

        let mut ctx = RelayContext::new(Arc::new(upstream));
        ctx.chunk_size = config.chunk_size;
        ctx.read_timeout = config.read_timeout;

        tokio::spawn(
            BroadcastRelay::new(ctx.clone())
                .run()
                .instrument(tracing::info_span!("relay", upstream = %config.upstream_addr)),
        );

        let listener = match TcpListener::bind(&config.listen_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                ctx.upstream.close().await;
                return Err(MuxError::Bind {
                    addr: config.listen_addr.clone(),
                    source,
                });
            }
        };

        info!(
            listen_addr = %listener.local_addr()?,
            upstream = %config.upstream_addr,
            "Multiplexer listening"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            listener,
            ctx,
            shutdown_tx,
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Get the local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.ctx.registry
    }

    pub fn upstream(&self) -> &Arc<UpstreamLink> {
        &self.ctx.upstream
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Accept clients until `signal` resolves or [`shutdown`](Self::shutdown)
    /// is called, then run the shutdown sequence.
    pub async fn run<F>(&self, signal: F) -> Result<(), MuxError>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = wait_closed(&mut shutdown_rx) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_session(stream, peer_addr),
                    Err(e) => {
                        back_off_after_accept_error(
                            &self.ctx.stats,
                            &e,
                            self.config.accept_retry_delay,
                        )
                        .await
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer_addr: SocketAddr) {
        self.ctx
            .stats
            .clients_accepted
            .fetch_add(1, Ordering::Relaxed);

        let ctx = self.ctx.clone();
        tokio::spawn(
            async move {
                let session = ClientSession::register(stream, peer_addr, ctx).await;
                let end = session.run().await;
                debug!(end = ?end, "Session finished");
            }
            .instrument(tracing::info_span!("client", peer = %peer_addr)),
        );
    }

    /// Close every client, then the upstream link.
    ///
    /// Runs once; later calls return `false` without doing anything.
    /// In-flight relay operations are not awaited: they fail with
    /// closed-resource errors.
    pub async fn shutdown(&self) -> bool {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already performed");
            return false;
        }

        info!("Shutting down multiplexer");
        self.shutdown_tx.send_replace(true);

        let drained = self.ctx.registry.drain_all().await;
        self.ctx.upstream.close().await;

        let stats = self.stats();
        info!(
            clients_drained = drained,
            clients_accepted = stats.clients_accepted,
            bytes_to_upstream = stats.bytes_to_upstream,
            bytes_from_upstream = stats.bytes_from_upstream,
            broadcast_failures = stats.broadcast_failures,
            accept_errors = stats.accept_errors,
            "Shutdown complete"
        );
        true
    }
}

/// Count and log a failed accept, then wait before the next attempt.
async fn back_off_after_accept_error(stats: &MuxStats, err: &io::Error, delay: Duration) {
    stats.accept_errors.fetch_add(1, Ordering::Relaxed);
    error!(error = %err, retry_in = ?delay, "Accept error");
    tokio::time::sleep(delay).await;
}

/// Install SIGINT/SIGTERM handlers and return a future resolving on the first
/// signal.
#[cfg(unix)]
pub fn install_shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!(signal = "SIGTERM", "Termination requested"),
            _ = sigint.recv() => info!(signal = "SIGINT", "Termination requested"),
        }
    })
}

/// Install a Ctrl-C handler and return a future resolving on the first press.
#[cfg(not(unix))]
pub fn install_shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!(signal = "ctrl_c", "Termination requested");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_fails_when_upstream_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let config = MuxConfig::new(dead.to_string()).with_listen_addr("127.0.0.1:0");
        let err = Supervisor::start(config).await.err().unwrap();
        assert_eq!(err.reason_code(), "connect_failed");
    }

    #[tokio::test]
    async fn test_start_fails_when_listen_addr_taken() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_addr = taken.local_addr().unwrap();

        let config = MuxConfig::new(upstream_addr.to_string())
            .with_listen_addr(&taken_addr.to_string());
        let err = Supervisor::start(config).await.err().unwrap();
        assert_eq!(err.reason_code(), "bind_failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_is_counted_and_delays_retry() {
        let stats = MuxStats::default();
        let err = io::Error::from(io::ErrorKind::ConnectionAborted);
        let delay = Duration::from_millis(250);

        let started = tokio::time::Instant::now();
        back_off_after_accept_error(&stats, &err, delay).await;
        back_off_after_accept_error(&stats, &err, delay).await;

        assert!(started.elapsed() >= delay * 2);
        assert_eq!(stats.snapshot().accept_errors, 2);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_connecting() {
        let mut config = MuxConfig::new("127.0.0.1:1");
        config.chunk_size = 0;
        let err = Supervisor::start(config).await.err().unwrap();
        assert_eq!(err.reason_code(), "config_invalid");
    }
}
