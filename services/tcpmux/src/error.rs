//! Error types for the multiplexer.

use std::io;

use thiserror::Error;

/// Multiplexer errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Could not reach the upstream server.
    #[error("connect_failed: {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Could not bind the local listener.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A read on a transport failed.
    #[error("read_failed: {0}")]
    Read(#[source] io::Error),

    /// A write on a transport failed.
    #[error("write_failed: {0}")]
    Write(#[source] io::Error),

    /// The upstream link was closed (shutdown or earlier close).
    #[error("link_closed")]
    LinkClosed,

    /// Invalid configuration.
    #[error("config_invalid: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl MuxError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            MuxError::Connect { .. } => "connect_failed",
            MuxError::Bind { .. } => "bind_failed",
            MuxError::Read(_) => "read_failed",
            MuxError::Write(_) => "write_failed",
            MuxError::LinkClosed => "link_closed",
            MuxError::Config(_) => "config_invalid",
            MuxError::Io(_) => "io_error",
        }
    }

    /// Whether this is a timeout-class read error that should be retried in place.
    pub fn is_transient(&self) -> bool {
        match self {
            MuxError::Read(e) => is_transient_io(e),
            _ => false,
        }
    }
}

/// Timeout-class I/O errors.
pub(crate) fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
