//! Relay client: connection manager, request correlation, mailbox polling
//!
//! This crate also provides the `emessenger` command-line interface.

pub mod cli;
pub mod commands;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
mod poll;
pub mod transport;

pub use cli::Cli;
pub use connection::{ClientHandle, ConnectionManager, ConnectionState, SessionConfig};
pub use correlator::{FrameOutcome, RequestCorrelator, ResponseFuture};
pub use error::{AssociationError, ClientError, ClientResult};
pub use events::{ClientEvent, DeliveredMessage, PushOutcome};
pub use poll::{DrainEnd, DrainSummary};
pub use transport::{Connector, TransportEvent, TransportHandle, TransportLink, WebSocketConnector};
