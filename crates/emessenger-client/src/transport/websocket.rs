//! WebSocket transport.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use super::{BoxFuture, Connector, Outbound, TransportEvent, TransportHandle, TransportLink};
use crate::error::{ClientError, ClientResult};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections and pumps them on a background task.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    close_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl WebSocketConnector {
    /// `close_timeout` bounds how long a requested close waits for the
    /// relay to acknowledge it.
    pub fn new(close_timeout: Duration) -> Self {
        Self { close_timeout }
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'_, ClientResult<TransportLink>> {
        let url = url.clone();
        Box::pin(async move {
            debug!(url = %url, "Opening WebSocket");
            let (stream, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| ClientError::Transport(format!("failed to connect to {}: {}", url, e)))?;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(stream, outbound_rx, events_tx, self.close_timeout));

            Ok(TransportLink {
                handle: TransportHandle::new(outbound_tx),
                events: events_rx,
            })
        })
    }
}

enum Step {
    Inbound(Option<Result<Message, WsError>>),
    Outbound(Option<Outbound>),
}

/// Moves frames between the socket and the channels until either side ends.
async fn pump(
    mut stream: Stream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    close_timeout: Duration,
) {
    let mut close_code = None;
    let mut close_reason = String::new();

    loop {
        let step = tokio::select! {
            message = stream.next() => Step::Inbound(message),
            command = outbound.recv() => Step::Outbound(command),
        };

        match step {
            Step::Inbound(Some(Ok(Message::Binary(data)))) => {
                trace!(len = data.len(), "Frame received");
                let _ = events.send(TransportEvent::Frame(data));
            }
            Step::Inbound(Some(Ok(Message::Text(text)))) => {
                debug!(len = text.len(), "Dropping text message from relay");
            }
            Step::Inbound(Some(Ok(Message::Close(frame)))) => {
                // The library answers the close; the stream ends right after.
                if let Some(frame) = frame {
                    close_code = Some(u16::from(frame.code));
                    close_reason = frame.reason.into_owned();
                }
                debug!(code = ?close_code, reason = %close_reason, "Relay closed the connection");
            }
            Step::Inbound(Some(Ok(_))) => {}
            Step::Inbound(None | Some(Err(WsError::ConnectionClosed))) => {
                let _ = events.send(TransportEvent::Closed {
                    code: close_code,
                    reason: close_reason,
                });
                return;
            }
            Step::Inbound(Some(Err(e))) => {
                warn!(error = %e, "WebSocket error");
                let _ = events.send(TransportEvent::Error(e.to_string()));
                return;
            }
            Step::Outbound(Some(Outbound::Frame(data))) => {
                trace!(len = data.len(), "Frame sent");
                if let Err(e) = stream.send(Message::Binary(data)).await {
                    warn!(error = %e, "Failed to send frame");
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    return;
                }
            }
            Step::Outbound(Some(Outbound::Close) | None) => {
                let (code, reason) = close_gracefully(&mut stream, close_timeout).await;
                let _ = events.send(TransportEvent::Closed { code, reason });
                return;
            }
        }
    }
}

/// Sends a close frame and waits for the relay's answer.
async fn close_gracefully(stream: &mut Stream, timeout: Duration) -> (Option<u16>, String) {
    if let Err(e) = stream.close(None).await {
        debug!(error = %e, "Close frame not sent");
        return (None, "closed locally".to_string());
    }

    let drain = async {
        while let Some(message) = stream.next().await {
            if let Ok(Message::Close(Some(frame))) = message {
                return (Some(u16::from(frame.code)), frame.reason.into_owned());
            }
        }
        (None, "closed locally".to_string())
    };

    match tokio::time::timeout(timeout, drain).await {
        Ok(result) => result,
        Err(_) => {
            debug!("Relay did not acknowledge close in time");
            (None, "close timed out".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emessenger_protocol::Packet;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    async fn listener() -> (TcpListener, Url) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();
        (listener, url)
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (listener, url) = listener().await;
        let relay = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let frame = match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => data,
                other => panic!("unexpected {:?}", other),
            };
            assert_eq!(Packet::decode(&frame).unwrap(), Packet::associate(4));
            ws.send(Message::Binary(
                Packet::association_success(4).encode().unwrap(),
            ))
            .await
            .unwrap();
            ws
        });

        let mut link = WebSocketConnector::default().connect(&url).await.unwrap();
        link.handle
            .send_frame(Packet::associate(4).encode().unwrap())
            .unwrap();

        let reply = link.events.recv().await.unwrap();
        assert_eq!(
            reply,
            TransportEvent::Frame(Packet::association_success(4).encode().unwrap())
        );
        drop(relay.await.unwrap());
    }

    #[tokio::test]
    async fn text_messages_are_not_frames() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text("\u{1}\u{1}\u{4}".into()))
                .await
                .unwrap();
            ws.send(Message::Binary(Packet::buffer_empty(4).encode().unwrap()))
                .await
                .unwrap();
            while ws.next().await.is_some() {}
        });

        let mut link = WebSocketConnector::default().connect(&url).await.unwrap();
        assert_eq!(
            link.events.recv().await.unwrap(),
            TransportEvent::Frame(Packet::buffer_empty(4).encode().unwrap())
        );
        link.handle.close();
    }

    #[tokio::test]
    async fn going_away_close_code_is_reported() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "going away".into(),
            }))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let mut link = WebSocketConnector::default().connect(&url).await.unwrap();
        let event = link.events.recv().await.unwrap();
        assert!(event.is_going_away(), "got {:?}", event);
    }

    #[tokio::test]
    async fn requested_close_emits_closed() {
        let (listener, url) = listener().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let mut link = WebSocketConnector::default().connect(&url).await.unwrap();
        link.handle.close();

        let event = link.events.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Closed { .. }), "got {:?}", event);
        assert!(link.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let (listener, url) = listener().await;
        drop(listener);

        let result = WebSocketConnector::default().connect(&url).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }
}
