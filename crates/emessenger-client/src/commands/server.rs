//! Server command: runs the relay in the foreground.
//!
//! Wires the relay components together:
//! - Signal handler (SIGTERM/SIGINT close every connection with 1001)
//! - Shared relay state (sessions and mailboxes)
//! - WebSocket server

use std::time::Duration;

use tracing::{info, warn};

use emessenger_server::{
    ServerConfig, ShutdownHandle, SignalHandler, SocketServer, make_connection_handler,
    new_shared_relay,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// How long open connections get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts the relay and blocks until a shutdown signal is received.
pub async fn run(config: &ClientConfig) -> ClientResult<()> {
    let server_config = config.server_config()?;

    let signal_handler = SignalHandler::new();
    signal_handler.spawn_listener()?;

    let server = bind(server_config).await?;
    serve(server, signal_handler.shutdown_handle()).await
}

/// Binds the listening socket.
pub async fn bind(server_config: ServerConfig) -> ClientResult<SocketServer> {
    SocketServer::new(server_config)
        .await
        .map_err(|e| ClientError::Relay(format!("failed to start: {}", e)))
}

/// Serves `server` until `shutdown` is triggered, then drains connections.
pub async fn serve(server: SocketServer, shutdown: ShutdownHandle) -> ClientResult<()> {
    let config = server.config().clone();
    let relay = new_shared_relay(config.mailbox_capacity);

    if let Ok(addr) = server.local_addr() {
        info!(
            addr = %addr,
            mailbox_capacity = config.mailbox_capacity,
            max_connections = config.max_connections,
            "Relay listening"
        );
    }

    let handler = make_connection_handler(relay, config.limits(), shutdown.clone());
    server
        .run_until_shutdown(handler, shutdown.wait().wait())
        .await
        .map_err(|e| ClientError::Relay(e.to_string()))?;

    info!("Shutting down...");
    if !server.drain(DRAIN_TIMEOUT).await {
        warn!("Some connections did not close in time");
    }

    info!("Relay stopped");
    Ok(())
}
