//! Listen command: print deliveries, reconnecting after lost connections.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::{Session, render_message};
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, DeliveredMessage};
use crate::transport::{Connector, WebSocketConnector};

/// Runs until Ctrl-C, the relay shuts down, or reconnects are exhausted.
pub async fn run(config: &ClientConfig, json: bool) -> ClientResult<()> {
    let connector = WebSocketConnector::new(Duration::from_millis(config.session.close_timeout_ms));
    let interrupted = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let mut stdout = std::io::stdout();
    listen_with(config, Arc::new(connector), json, interrupted, &mut stdout).await
}

/// The listen loop over an explicit connector, output and stop condition.
pub async fn listen_with<W, S>(
    config: &ClientConfig,
    connector: Arc<dyn Connector>,
    json: bool,
    stop: S,
    out: &mut W,
) -> ClientResult<()>
where
    W: Write,
    S: Future<Output = ()>,
{
    let settings = config.settings()?;
    let (handle, events) = ConnectionManager::spawn(config.session_config(), connector);
    let mut session = Session { handle, events };
    session.handle.connect(settings.clone()).await?;

    let mut failures: u32 = 0;
    let mut retry_at: Option<Instant> = None;
    tokio::pin!(stop);

    let result = loop {
        let event = tokio::select! {
            _ = &mut stop => {
                info!("Interrupted");
                break Ok(());
            }
            _ = retry(retry_at) => {
                retry_at = None;
                session.handle.connect(settings.clone()).await?;
                continue;
            }
            event = session.events.recv() => event,
        };

        match event {
            Some(ClientEvent::Associated { client_id }) => {
                failures = 0;
                info!(client_id, "Listening");
            }
            Some(ClientEvent::MessageReceived { peer_id, text }) => {
                let line = if json {
                    serde_json::to_string(&DeliveredMessage::now(peer_id, text))
                        .map_err(|e| ClientError::Io(e.to_string()))?
                } else {
                    render_message(peer_id, &text)
                };
                writeln!(out, "{}", line)?;
                out.flush()?;
            }
            Some(ClientEvent::ServerShutdown) => {
                warn!("Relay shut down");
                break Ok(());
            }
            Some(ClientEvent::AssociationFailed { error }) => break Err(error.into()),
            Some(ClientEvent::ConnectionLost { reason })
            | Some(ClientEvent::ConnectFailed { reason }) => {
                failures += 1;
                if !config.reconnect.should_retry(failures) {
                    break Err(ClientError::Transport(reason));
                }
                let delay = config.reconnect.backoff_delay(failures);
                warn!(
                    reason = %reason,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "Connection lost, retrying"
                );
                retry_at = Some(Instant::now() + delay);
            }
            Some(ClientEvent::ProtocolViolation { packet }) => {
                warn!(packet = %packet, "Relay answered a poll unexpectedly");
            }
            None => break Err(ClientError::ManagerStopped),
        }
    };

    session
        .close(Duration::from_millis(config.session.close_timeout_ms))
        .await?;
    result
}

async fn retry(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emessenger_protocol::Packet;
    use tokio::sync::oneshot;

    use crate::transport::mock::{MockConnector, MockPeer, MockRelay};

    async fn handshake(relay: &mut MockRelay, client_id: u8) -> MockPeer {
        let mut peer = relay.next_peer().await;
        assert_eq!(peer.recv_packet().await, Packet::associate(client_id));
        peer.reply(&Packet::association_success(client_id));
        peer
    }

    fn stop_signal() -> (oneshot::Sender<()>, impl Future<Output = ()>) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, async move {
            let _ = rx.await;
        })
    }

    #[tokio::test(start_paused = true)]
    async fn prints_deliveries_and_reconnects() {
        let (connector, mut relay) = MockConnector::new();
        let config = ClientConfig::default();
        let (stop_tx, stop) = stop_signal();

        let relay_task = tokio::spawn(async move {
            let mut peer = handshake(&mut relay, 1).await;
            assert_eq!(peer.recv_packet().await, Packet::get(1));
            peer.reply(&Packet::get_response(1, 2, "first"));
            assert_eq!(peer.recv_packet().await, Packet::get(1));
            peer.reply(&Packet::buffer_empty(1));
            peer.fail("reset by peer");

            // Backoff, then a fresh connection.
            let mut peer = handshake(&mut relay, 1).await;
            assert_eq!(peer.recv_packet().await, Packet::get(1));
            peer.reply(&Packet::get_response(1, 3, "second"));
            assert_eq!(peer.recv_packet().await, Packet::get(1));
            peer.reply(&Packet::buffer_empty(1));
            peer
        });

        let mut out = Vec::new();
        let listen = listen_with(&config, Arc::new(connector), true, stop, &mut out);
        let stopper = async {
            // Holding the peer keeps the second link open until the stop.
            let peer = relay_task.await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = stop_tx.send(());
            peer
        };
        let (result, _peer) = tokio::join!(listen, stopper);
        result.unwrap();

        let output = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["from"], 2);
        assert_eq!(lines[0]["text"], "first");
        assert_eq!(lines[1]["from"], 3);
        assert_eq!(lines[1]["text"], "second");
    }

    #[tokio::test(start_paused = true)]
    async fn server_shutdown_ends_listening() {
        let (connector, mut relay) = MockConnector::new();
        let config = ClientConfig::default();

        let relay_task = tokio::spawn(async move {
            let peer = handshake(&mut relay, 1).await;
            peer.close(1001, "going away");
            relay
        });

        let mut out = Vec::new();
        let result = listen_with(
            &config,
            Arc::new(connector),
            false,
            std::future::pending(),
            &mut out,
        )
        .await;
        assert!(result.is_ok());
        assert!(out.is_empty());

        // The manager is gone without having opened a second link.
        let mut relay = relay_task.await.unwrap();
        assert!(relay.try_next_peer().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (connector, _relay) = MockConnector::new();
        let connector = connector.refusing();
        let mut config = ClientConfig::default();
        config.reconnect.max_attempts = Some(3);

        let mut out = Vec::new();
        let result = listen_with(
            &config,
            Arc::new(connector),
            false,
            std::future::pending(),
            &mut out,
        )
        .await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn association_failure_is_not_retried() {
        let (connector, mut relay) = MockConnector::new();
        let config = ClientConfig::default();

        tokio::spawn(async move {
            let mut peer = relay.next_peer().await;
            peer.recv_packet().await;
            peer.reply(&Packet::association_failed(1));
            // Keep the link open until the client gives up on it.
            while peer.recv().await.is_some() {}
        });

        let mut out = Vec::new();
        let result = listen_with(
            &config,
            Arc::new(connector),
            false,
            std::future::pending(),
            &mut out,
        )
        .await;
        assert!(matches!(result, Err(ClientError::Association(_))));
    }
}
