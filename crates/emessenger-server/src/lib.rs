//! Relay: WebSocket listener, sessions, mailboxes.
//!
//! The relay binds client IDs to connections, stores pushed text in
//! per-recipient mailboxes and hands it out again one `Get` at a time.
//!
//! # Example
//!
//! ```rust,no_run
//! use emessenger_server::{
//!     ServerConfig, SignalHandler, SocketServer, make_connection_handler, new_shared_relay,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let relay = new_shared_relay(config.mailbox_capacity);
//!     let signals = SignalHandler::new();
//!     signals.spawn_listener()?;
//!
//!     let server = SocketServer::new(config.clone()).await?;
//!     let handler = make_connection_handler(relay, config.limits(), signals.shutdown_handle());
//!     server
//!         .run_until_shutdown(handler, signals.shutdown().wait())
//!         .await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod handler;
mod relay;
mod signals;
mod socket;

pub use config::{DEFAULT_PORT, RelayLimits, ServerConfig, default_bind_addr};
pub use error::{ServerError, ServerResult};
pub use handler::{RequestHandler, make_connection_handler};
pub use relay::{
    AssociateResult, ConnectionId, PushResult, RelayState, SharedRelay, StoredMessage,
    new_shared_relay,
};
pub use signals::{ShutdownHandle, ShutdownSignal, SignalHandler};
pub use socket::{Connection, Frame, SocketServer};
