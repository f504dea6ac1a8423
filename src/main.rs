//! TCP Messaging and File-Transfer Relay - Entry Point
//!
//! Parses configuration and runs the listener until the process exits.

use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use tcp_relay::{run, Config, TracingActivityLog};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=tcp_relay=trace,activity=info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tcp_relay=info,activity=info")),
        )
        .init();

    let config = Config::parse();

    if let Err(e) = run(config, Arc::new(TracingActivityLog)).await {
        error!("Relay stopped: {}", e);
        return Err(e.into());
    }

    Ok(())
}
