//! Core types: connection settings, tracing setup

pub mod settings;
pub mod tracing;

pub use settings::{
    DEFAULT_CLIENT_ID, DEFAULT_SERVER_URL, Settings, SettingsError, parse_client_id,
    parse_server_url,
};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
