//! spyglass demo binary.
//!
//! A thin wrapper around the library: parses flags, initializes tracing,
//! registers a request-logging addon, and runs the proxy until Ctrl-C. The
//! root CA certificate path is printed at startup so it can be installed
//! into a client trust store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use spyglass::cli::Cli;
use spyglass::{Addon, Flow, Proxy};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let options = cli.to_options();
    let ca_dir = options.ca_root_path.clone();

    let mut proxy = Proxy::new(options).context("failed to initialize proxy")?;
    proxy.add_addon(Arc::new(LogAddon));

    info!("root CA certificate: {:?}", ca_dir.join("spyglass-ca.crt"));

    let handle = proxy.start().await.context("failed to start proxy")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    handle.shutdown_graceful(Duration::from_secs(5)).await;
    Ok(())
}

/// Logs one line per flow at the response-headers hook.
struct LogAddon;

impl Addon for LogAddon {
    fn response_headers(&self, flow: &mut Flow) {
        if let Some(response) = &flow.response {
            info!(
                "{} {} -> {}",
                flow.request.method,
                flow.request.url,
                response.status.as_u16()
            );
        }
    }
}

/// Verbosity: 0 warn, 1 info, 2 debug, 3+ trace.
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}
