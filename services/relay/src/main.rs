//! tlsfrag
//!
//! Local TCP relay that fragments the first client segment.
//!
//! This binary:
//! - Loads settings from profile defaults, an optional INI file, the
//!   environment and flags
//! - Accepts TCP connections on the listen address
//! - Relays each connection to a backend, static or round-robin
//! - Splits the first client segment into delayed chunks

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use tlsfrag_relay::cli::Cli;
use tlsfrag_relay::{logging, Config, Listener};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log_level, cli.log_format) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(()) => {
            info!("tlsfrag exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "tlsfrag failed");
            // Log the error chain
            let mut source = e.source();
            while let Some(cause) = source {
                error!(cause = %cause, "caused by");
                source = cause.source();
            }
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli).context("invalid configuration")?;
    let selector = Arc::new(config.selector().context("invalid backend pool")?);

    let backends = config
        .backends
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    info!(
        profile = ?cli.profile,
        listen_addr = %config.listen_addr,
        backends = %backends,
        rotating = selector.is_rotating(),
        fragment_size = config.fragment.size.get(),
        fragment_delay = ?config.fragment.delay,
        socket_timeout = ?config.socket_timeout,
        "Now listening at {}, forwarding to {}",
        config.listen_addr,
        backends
    );

    let listener = Listener::bind(config.listener_config(), selector)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let listener = Arc::new(listener);

    listener
        .run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                    std::future::pending::<()>().await
                }
            }
        })
        .await
        .context("accept loop failed")?;

    Ok(())
}
