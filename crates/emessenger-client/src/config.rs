//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/emessenger/config.toml` by default. Every section is optional;
//! missing values fall back to the built-in defaults.
//!
//! ```toml
//! [server]
//! url = "ws://localhost:12345"
//! client_id = 1
//!
//! [session]
//! poll_interval_ms = 1000
//! request_timeout_ms = 5000
//!
//! [reconnect]
//! initial_backoff_ms = 500
//! max_attempts = 10
//!
//! [relay]
//! bind = "0.0.0.0:12345"
//! mailbox_capacity = 100
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use emessenger_core::{DEFAULT_CLIENT_ID, DEFAULT_SERVER_URL, Settings};
use emessenger_server::{ServerConfig, default_bind_addr};

use crate::connection::SessionConfig;
use crate::error::{ClientError, ClientResult};

// ---------------------------------------------------------------------------
// ClientConfig (config.toml)
// ---------------------------------------------------------------------------

/// Configuration for the emessenger client and relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Which relay to use and who we are on it.
    pub server: ServerSettings,

    /// Timing of one connection.
    pub session: SessionSettings,

    /// Reconnect behaviour of `listen`.
    pub reconnect: ReconnectSettings,

    /// Relay settings used by the `server` command.
    pub relay: RelaySettings,
}

/// Relay address and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// WebSocket URL of the relay.
    pub url: String,

    /// Our client ID (0-255).
    pub client_id: u8,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID,
        }
    }
}

/// Connection timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Milliseconds between mailbox polls.
    pub poll_interval_ms: u64,

    /// How long a push waits for its reply. Unset waits indefinitely.
    pub request_timeout_ms: Option<u64>,

    /// How long a close waits for the relay to confirm.
    pub close_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            request_timeout_ms: None,
            close_timeout_ms: 5000,
        }
    }
}

/// Reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,

    /// Upper bound on the delay.
    pub max_backoff_ms: u64,

    /// Growth factor per consecutive failure.
    pub multiplier: f64,

    /// Give up after this many consecutive failures. Unset retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectSettings {
    /// Delay before retry number `consecutive_failures` (1-based).
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff_ms as f64;
        let multiplier = self.multiplier.powi(consecutive_failures as i32 - 1);
        let delay = base * multiplier;
        let max = self.max_backoff_ms as f64;

        Duration::from_millis(delay.min(max) as u64)
    }

    /// Whether another attempt is allowed after `consecutive_failures`.
    pub fn should_retry(&self, consecutive_failures: u32) -> bool {
        self.max_attempts
            .is_none_or(|max| consecutive_failures < max)
    }
}

/// Relay settings for `emessenger server`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Address to listen on.
    pub bind: String,

    /// Messages a mailbox holds before pushes get `BufferFull`.
    pub mailbox_capacity: usize,

    /// Declared payload lengths at or above this are refused.
    pub max_payload_len: usize,

    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind: default_bind_addr().to_string(),
            mailbox_capacity: defaults.mailbox_capacity,
            max_payload_len: defaults.max_payload_len,
            max_connections: defaults.max_connections,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the default path, or defaults if it is absent.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("emessenger")
    }

    /// Validated connection settings.
    pub fn settings(&self) -> ClientResult<Settings> {
        Ok(Settings::parse(self.server.client_id, &self.server.url)?)
    }

    /// Session timing.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_poll_interval(Duration::from_millis(self.session.poll_interval_ms))
            .with_request_timeout(self.session.request_timeout_ms.map(Duration::from_millis))
            .with_close_timeout(Duration::from_millis(self.session.close_timeout_ms))
    }

    /// Relay configuration.
    pub fn server_config(&self) -> ClientResult<ServerConfig> {
        let bind: SocketAddr = self.relay.bind.parse().map_err(|e| {
            ClientError::Config(format!("invalid relay bind address {:?}: {}", self.relay.bind, e))
        })?;
        Ok(ServerConfig::new(bind)
            .with_mailbox_capacity(self.relay.mailbox_capacity)
            .with_max_payload_len(self.relay.max_payload_len)
            .with_max_connections(self.relay.max_connections))
    }

    /// Checks every section.
    pub fn validate(&self) -> ClientResult<()> {
        self.settings()?;
        self.server_config()?;

        if self.session.poll_interval_ms == 0 {
            return Err(ClientError::Config(
                "session.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ClientError::Config(
                "reconnect.multiplier must be at least 1.0".into(),
            ));
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(ClientError::Config(
                "reconnect.initial_backoff_ms exceeds reconnect.max_backoff_ms".into(),
            ));
        }
        if self.relay.mailbox_capacity == 0 {
            return Err(ClientError::Config(
                "relay.mailbox_capacity must be greater than zero".into(),
            ));
        }
        if self.relay.max_payload_len == 0 || self.relay.max_payload_len > 256 {
            return Err(ClientError::Config(
                "relay.max_payload_len must be between 1 and 256".into(),
            ));
        }
        Ok(())
    }
}
