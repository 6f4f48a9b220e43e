//! tcpmux
//!
//! Shares a single upstream TCP session between many local clients.
//!
//! This binary:
//! - Dials the upstream server once at startup
//! - Broadcasts everything the server sends to every connected client
//! - Forwards every client's input to the server
//! - Closes all clients and the upstream link on SIGINT/SIGTERM

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use tcpmux::config::{Cli, MuxConfig};
use tcpmux::logging;
use tcpmux::mux::{install_shutdown_signal, Supervisor};

/// Version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (mux_config, log_config) = match cli.into_configs() {
        Ok(configs) => configs,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = logging::init(&log_config) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::from(1);
    }

    info!(
        version = VERSION,
        upstream = %mux_config.upstream_addr,
        listen_addr = %mux_config.listen_addr,
        log_file = ?log_config.file,
        "Starting tcpmux"
    );

    match run(mux_config).await {
        Ok(()) => {
            info!("tcpmux exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "tcpmux failed");
            // Log the error chain
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            ExitCode::from(1)
        }
    }
}

async fn run(config: MuxConfig) -> Result<()> {
    let supervisor = Supervisor::start(config)
        .await
        .context("Failed to start multiplexer")?;

    let signal = install_shutdown_signal().context("Failed to install signal handlers")?;

    supervisor.run(signal).await?;
    Ok(())
}
