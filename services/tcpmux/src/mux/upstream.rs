//! The single connection to the upstream server.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info};

use super::{read_chunk_from, wait_closed, BoxedReader, BoxedWriter};
use crate::error::MuxError;

/// Default timeout for dialing the upstream server.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the upstream transport.
///
/// One task reads (the broadcast relay) while any number of client sessions
/// write. Writers are serialized, so each [`write`](Self::write) reaches the
/// server contiguously. [`close`](Self::close) wakes every blocked reader and
/// writer with [`MuxError::LinkClosed`].
pub struct UpstreamLink {
    addr: String,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
    read_timeout: Option<Duration>,
}

impl UpstreamLink {
    /// Dial the upstream server.
    pub async fn connect(addr: &str, connect_timeout: Option<Duration>) -> Result<Self, MuxError> {
        let dial = TcpStream::connect(addr);
        let result = match connect_timeout {
            Some(limit) => match timeout(limit, dial).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timeout",
                )),
            },
            None => dial.await,
        };

        let stream = result.map_err(|source| MuxError::Connect {
            addr: addr.to_string(),
            source,
        })?;

        info!(
            upstream = %addr,
            remote_addr = ?stream.peer_addr().ok(),
            "Connected to upstream"
        );

        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(addr, Box::new(reader), Box::new(writer)))
    }

    /// Wrap an already-established transport.
    pub fn from_stream<S>(addr: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(addr, Box::new(reader), Box::new(writer))
    }

    fn from_parts(addr: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            addr: addr.into(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
            read_timeout: None,
        }
    }

    /// Set a per-read timeout. An elapsed timeout surfaces as a transient
    /// [`MuxError::Read`].
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// The configured upstream address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Read the next chunk into `buf`. `Ok(0)` means the server closed the
    /// connection.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(MuxError::LinkClosed);
        }

        let read = async {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(MuxError::LinkClosed)?;
            read_chunk_from(reader, buf, self.read_timeout)
                .await
                .map_err(MuxError::Read)
        };

        tokio::select! {
            result = read => result,
            _ = wait_closed(&mut closed) => Err(MuxError::LinkClosed),
        }
    }

    /// Write all of `bytes` upstream.
    ///
    /// Concurrent callers are serialized; a failure is returned to the caller
    /// and leaves the link open.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), MuxError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(MuxError::LinkClosed);
        }

        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(MuxError::LinkClosed)?;
            writer.write_all(bytes).await.map_err(MuxError::Write)?;
            writer.flush().await.map_err(MuxError::Write)
        };

        tokio::select! {
            result = write => result,
            _ = wait_closed(&mut closed) => Err(MuxError::LinkClosed),
        }
    }

    /// Close the link. Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        let already_closed = self.closed.send_replace(true);

        // In-flight operations observe the flag and release their locks.
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(upstream = %self.addr, error = %e, "Upstream shutdown failed");
            }
        }
        drop(self.reader.lock().await.take());

        if !already_closed {
            info!(upstream = %self.addr, "Upstream link closed");
        }
        !already_closed
    }
}
