//! Subcommand implementations.

pub mod chat;
pub mod config;
pub mod decode;
pub mod listen;
pub mod send;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::{ClientHandle, ConnectionManager, ConnectionState, SessionConfig};
use crate::error::{ClientError, ClientResult};
use crate::events::ClientEvent;
use crate::transport::{Connector, WebSocketConnector};

/// A connected, associated session.
pub struct Session {
    pub handle: ClientHandle,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Session {
    /// Disconnects and waits (bounded) for the transport to close.
    pub async fn close(self, timeout: Duration) -> ClientResult<()> {
        self.handle.disconnect().await?;
        let mut state = self.handle.state_changes();
        let closed = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .is_ok_and(|changed| changed.is_ok());
        if !closed {
            debug!("Session did not close in time");
        }
        self.handle.stop().await
    }
}

/// Connects to the configured relay and waits for the handshake.
pub async fn open_session(config: &ClientConfig) -> ClientResult<Session> {
    let connector = WebSocketConnector::new(Duration::from_millis(config.session.close_timeout_ms));
    open_session_with(config, Arc::new(connector)).await
}

/// Like [`open_session`], with an explicit connector.
pub async fn open_session_with(
    config: &ClientConfig,
    connector: Arc<dyn Connector>,
) -> ClientResult<Session> {
    open_configured(config, config.session_config(), connector).await
}

/// Opens a session with timing that differs from the file configuration.
pub(crate) async fn open_configured(
    config: &ClientConfig,
    session: SessionConfig,
    connector: Arc<dyn Connector>,
) -> ClientResult<Session> {
    let settings = config.settings()?;
    let (handle, mut events) = ConnectionManager::spawn(session, connector);

    debug!(settings = %settings, "Opening session");
    handle.connect(settings).await?;
    wait_for_association(&mut events).await?;

    Ok(Session { handle, events })
}

/// Consumes events until the handshake settles.
pub(crate) async fn wait_for_association(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> ClientResult<()> {
    loop {
        match events.recv().await {
            Some(ClientEvent::Associated { client_id }) => {
                debug!(client_id, "Associated");
                return Ok(());
            }
            Some(ClientEvent::AssociationFailed { error }) => return Err(error.into()),
            Some(ClientEvent::ConnectFailed { reason }) => {
                return Err(ClientError::Transport(reason));
            }
            Some(ClientEvent::ConnectionLost { reason }) => {
                return Err(ClientError::Transport(reason));
            }
            Some(ClientEvent::ServerShutdown) => return Err(ClientError::ConnectionReset),
            Some(other) => debug!(event = ?other, "Ignoring event before association"),
            None => return Err(ClientError::ManagerStopped),
        }
    }
}

/// Formats one delivered message for the terminal.
pub(crate) fn render_message(peer_id: u8, text: &str) -> String {
    format!(
        "[{}] #{:03}: {}",
        chrono::Local::now().format("%H:%M:%S"),
        peer_id,
        text
    )
}
