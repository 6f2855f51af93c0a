//! WebSocket listener.
//!
//! Each accepted TCP stream is upgraded to a WebSocket and handed to the
//! connection handler. One binary message carries one packet in each
//! direction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

use emessenger_protocol::Packet;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Relay listener.
pub struct SocketServer {
    config: ServerConfig,
    listener: TcpListener,
    connection_semaphore: Arc<Semaphore>,
}

impl SocketServer {
    /// Binds the listening socket.
    pub async fn new(config: ServerConfig) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| ServerError::bind(config.bind_addr, e))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Relay listening");

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config,
            listener,
            connection_semaphore,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn acquire_permit(&self) -> ServerResult<OwnedSemaphorePermit> {
        self.connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Shutdown)
    }

    /// Runs the accept loop, calling `handler` for each upgraded connection.
    ///
    /// Upgrades happen on the spawned task so a slow client cannot stall
    /// the loop.
    pub async fn run<F, Fut>(&self, handler: F) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let permit = self.acquire_permit().await?;
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let handler = handler.clone();
            let timeout = self.config.handshake_timeout;
            tokio::spawn(async move {
                match Connection::upgrade(stream, peer, timeout, permit).await {
                    Ok(connection) => handler(connection).await,
                    Err(e) => warn!(peer = %peer, error = %e, "WebSocket upgrade failed"),
                }
            });
        }
    }

    /// Runs the accept loop until `shutdown` completes.
    pub async fn run_until_shutdown<F, Fut, S>(&self, handler: F, shutdown: S) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
        S: std::future::Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(handler) => result,
            _ = shutdown => {
                info!("Shutdown signal received, no longer accepting");
                Ok(())
            }
        }
    }

    /// Waits until every connection has finished, or `timeout` elapses.
    ///
    /// Returns true if all connections finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.config.max_connections).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(timeout, self.connection_semaphore.acquire_many(all))
            .await
            .is_ok();
        if !drained {
            warn!(
                open = self.config.max_connections - self.connection_semaphore.available_permits(),
                "Connections still open after drain timeout"
            );
        }
        drained
    }
}

/// One inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A binary message, expected to hold one packet.
    Binary(Vec<u8>),
    /// A text message. Packets never travel as text.
    Text(String),
}

/// An upgraded client connection.
pub struct Connection {
    stream: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    async fn upgrade(
        stream: TcpStream,
        peer: SocketAddr,
        timeout: Duration,
        permit: OwnedSemaphorePermit,
    ) -> ServerResult<Self> {
        let stream = tokio::time::timeout(timeout, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| ServerError::HandshakeTimeout { peer })??;
        debug!(peer = %peer, "Accepted WebSocket connection");

        Ok(Self {
            stream,
            peer,
            _permit: permit,
        })
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` once the peer has closed or vanished.
    pub async fn read_frame(&mut self) -> ServerResult<Option<Frame>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Binary(data)) => return Ok(Some(Frame::Binary(data))),
                Ok(Message::Text(text)) => return Ok(Some(Frame::Text(text))),
                Ok(Message::Close(frame)) => {
                    debug!(peer = %self.peer, ?frame, "Peer closed connection");
                    return Ok(None);
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(None),
                Err(WsError::Protocol(e)) => {
                    debug!(peer = %self.peer, error = %e, "Connection dropped without close");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Writes one packet.
    pub async fn write_packet(&mut self, packet: &Packet) -> ServerResult<()> {
        let data = packet.encode()?;
        self.stream.send(Message::Binary(data)).await?;
        Ok(())
    }

    /// Closes with 1001 "going away".
    pub async fn close_going_away(&mut self) -> ServerResult<()> {
        self.close(CloseCode::Away, "going away").await
    }

    /// Closes with the given code.
    pub async fn close(&mut self, code: CloseCode, reason: &'static str) -> ServerResult<()> {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
