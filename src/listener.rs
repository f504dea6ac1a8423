//! Server listener
//!
//! Binds the TCP listener, starts the RelayServer actor and spawns one
//! handler task per accepted connection.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::activity::ActivityLog;
use crate::config::Config;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::server::RelayServer;

/// Bind `config.addr` and serve until the process exits
///
/// Fails only when the configuration is invalid or the address cannot be
/// bound; per-connection failures are logged and never end the loop.
pub async fn run(config: Config, log: Arc<dyn ActivityLog>) -> Result<(), AppError> {
    config.validate()?;

    let listener = TcpListener::bind(&config.addr).await?;
    info!("Relay listening on {}", config.addr);

    serve(listener, config, log).await
}

/// Serve connections on an already bound listener
pub async fn serve(
    listener: TcpListener,
    config: Config,
    log: Arc<dyn ActivityLog>,
) -> Result<(), AppError> {
    let config = Arc::new(config);

    // Create RelayServer actor channel and start
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
    let server = RelayServer::new(cmd_rx, &config, log);
    tokio::spawn(server.run());

    info!(
        "RelayServer actor started (chunk size {}, max frame {} bytes)",
        config.chunk_size, config.max_frame_bytes
    );

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New connection from {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                }

                let cmd_tx = cmd_tx.clone();
                let config = config.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, cmd_tx, config).await {
                        error!("Connection handler error for {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
