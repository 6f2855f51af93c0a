//! Connection settings: which relay to talk to and who we are on it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Relay address used when nothing else is configured.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:12345";

/// Client ID used when nothing else is configured.
pub const DEFAULT_CLIENT_ID: u8 = 1;

/// Errors produced while validating settings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// The server URL did not parse.
    #[error("invalid server URL {url:?}: {message}")]
    InvalidUrl { url: String, message: String },

    /// The server URL is not a WebSocket URL.
    #[error("unsupported URL scheme {scheme:?} (expected ws)")]
    UnsupportedScheme { scheme: String },

    /// The server URL asks for TLS, which the transport does not carry.
    #[error("wss URLs are not supported (no TLS): {url}")]
    TlsUnsupported { url: String },

    /// The client ID does not fit in one byte.
    #[error("client ID {value:?} is not a number between 0 and 255")]
    InvalidClientId { value: String },
}

/// Identity and relay address for one logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Our ID on the relay.
    pub client_id: u8,
    /// WebSocket URL of the relay.
    pub server_url: Url,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            server_url: Url::parse(DEFAULT_SERVER_URL).expect("default server URL is valid"),
        }
    }
}

impl Settings {
    /// Builds settings from an already-parsed URL.
    pub fn new(client_id: u8, server_url: Url) -> Result<Self, SettingsError> {
        check_scheme(&server_url)?;
        Ok(Self {
            client_id,
            server_url,
        })
    }

    /// Parses and validates a server URL string.
    pub fn parse(client_id: u8, server_url: &str) -> Result<Self, SettingsError> {
        Self::new(client_id, parse_server_url(server_url)?)
    }

}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client #{:03} @ {}", self.client_id, self.server_url)
    }
}

/// Parses a relay URL, accepting only `ws`.
pub fn parse_server_url(raw: &str) -> Result<Url, SettingsError> {
    let url = Url::parse(raw.trim()).map_err(|e| SettingsError::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })?;
    check_scheme(&url)?;
    Ok(url)
}

/// Parses a client ID from user input.
pub fn parse_client_id(raw: &str) -> Result<u8, SettingsError> {
    u8::from_str(raw.trim()).map_err(|_| SettingsError::InvalidClientId {
        value: raw.to_string(),
    })
}

fn check_scheme(url: &Url) -> Result<(), SettingsError> {
    match url.scheme() {
        "ws" => Ok(()),
        "wss" => Err(SettingsError::TlsUnsupported {
            url: url.to_string(),
        }),
        other => Err(SettingsError::UnsupportedScheme {
            scheme: other.to_string(),
        }),
    }
}
