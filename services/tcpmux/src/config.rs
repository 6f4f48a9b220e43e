//! Multiplexer configuration.
//!
//! Options come from command-line flags with environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::MuxError;
use crate::logging::LogConfig;
use crate::mux::{DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT};

/// Default local listen address.
pub const DEFAULT_LISTEN_ADDR: &str = ":8888";

/// Default delay before retrying after an accept error.
pub const DEFAULT_ACCEPT_RETRY: Duration = Duration::from_secs(1);

/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// tcpmux - share one upstream TCP session between many local clients.
#[derive(Debug, Clone, Parser)]
#[command(name = "tcpmux")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Upstream server address (host:port).
    #[arg(long, visible_alias = "mud", env = "MUX_UPSTREAM")]
    pub upstream: String,

    /// Local listening address (host:port or :port).
    ///
    /// `:port` listens on every IPv4 interface only; use `[::]:port` for IPv6.
    #[arg(long, visible_alias = "local", env = "MUX_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Log file path. Logs always go to stdout; this adds a rotating file.
    #[arg(long, visible_alias = "log", env = "MUX_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Rotate the log file once it reaches this size.
    #[arg(long, default_value_t = 500)]
    pub log_max_size_mb: u64,

    /// Rotated log files to keep.
    #[arg(long, default_value_t = 3)]
    pub log_max_backups: usize,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "MUX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit JSON log lines on stdout.
    #[arg(long)]
    pub log_json: bool,

    /// Maximum bytes per read.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Per-read timeout in milliseconds; an elapsed timeout is retried.
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Upstream connect timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Delay after a failed accept before trying again, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    pub accept_retry_ms: u64,
}

/// Runtime configuration of the multiplexing engine.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Upstream server address (host:port).
    pub upstream_addr: String,
    /// Address the local listener binds to.
    pub listen_addr: String,
    /// Maximum bytes per read.
    pub chunk_size: usize,
    /// Per-read timeout. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Upstream connect timeout. `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
    /// Delay after a failed accept.
    pub accept_retry_delay: Duration,
}

impl MuxConfig {
    /// Configuration with defaults for everything but the upstream address.
    pub fn new(upstream_addr: impl Into<String>) -> Self {
        Self {
            upstream_addr: upstream_addr.into(),
            listen_addr: normalize_listen_addr(DEFAULT_LISTEN_ADDR),
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_timeout: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            accept_retry_delay: DEFAULT_ACCEPT_RETRY,
        }
    }

    /// Override the listen address. A bare `:port` binds all interfaces.
    pub fn with_listen_addr(mut self, listen_addr: &str) -> Self {
        self.listen_addr = normalize_listen_addr(listen_addr);
        self
    }

    /// Check addresses and sizes.
    pub fn validate(&self) -> Result<(), MuxError> {
        validate_host_port("upstream", &self.upstream_addr, false)?;
        validate_host_port("listen", &self.listen_addr, true)?;

        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(MuxError::Config(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.read_timeout == Some(Duration::ZERO) {
            return Err(MuxError::Config("read timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Cli {
    /// Split parsed flags into engine and logging configuration.
    pub fn into_configs(self) -> Result<(MuxConfig, LogConfig), MuxError> {
        let mux = MuxConfig {
            upstream_addr: self.upstream.trim().to_string(),
            listen_addr: normalize_listen_addr(&self.listen),
            chunk_size: self.chunk_size,
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
            connect_timeout: match self.connect_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            accept_retry_delay: Duration::from_millis(self.accept_retry_ms),
        };
        mux.validate()?;

        if self.log_max_size_mb == 0 {
            return Err(MuxError::Config(
                "log max size must be at least 1 MB".to_string(),
            ));
        }

        let max_bytes = self
            .log_max_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| {
                MuxError::Config(format!(
                    "log max size of {} MB is too large",
                    self.log_max_size_mb
                ))
            })?;

        let log = LogConfig {
            level: self.log_level,
            json: self.log_json,
            file: self.log_file,
            max_bytes,
            max_backups: self.log_max_backups,
        };

        Ok((mux, log))
    }
}

/// Expand `:port` to `0.0.0.0:port`; anything else is returned trimmed.
///
/// The expansion binds IPv4 only. Pass `[::]:port` to listen on IPv6.
pub fn normalize_listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

fn validate_host_port(what: &str, addr: &str, allow_empty_host: bool) -> Result<(), MuxError> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(MuxError::Config(format!(
            "{what} address must be host:port, got {addr:?}"
        )));
    };
    if host.is_empty() && !allow_empty_host {
        return Err(MuxError::Config(format!(
            "{what} address is missing a host: {addr:?}"
        )));
    }
    match port.parse::<u16>() {
        Ok(0) if !allow_empty_host => Err(MuxError::Config(format!(
            "{what} port must be non-zero: {addr:?}"
        ))),
        Ok(_) => Ok(()),
        Err(_) => Err(MuxError::Config(format!(
            "{what} port is not a number: {addr:?}"
        ))),
    }
}
