use futures_util::{stream::StreamExt, SinkExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite, tungstenite::Message, MaybeTlsStream,
    WebSocketStream as TungsteniteWebSocketStream,
};
use tracing::{debug, error};

use crate::error::AppError;
use crate::models::ConnectionStatus;

type WsStream = TungsteniteWebSocketStream<MaybeTlsStream<TcpStream>>;

enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(WsStream),
    Closing,
}

/// Owns the socket and the connection state machine. Reconnect policy lives
/// in the feed client; this type only performs single attempts.
pub struct WsConnectionManager {
    ws_url: String,
    state: ConnectionState,
}

impl WsConnectionManager {
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.state {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected(_) => ConnectionStatus::Connected,
            ConnectionState::Closing => ConnectionStatus::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }

    pub async fn connect(&mut self) -> Result<(), AppError> {
        self.state = ConnectionState::Connecting;
        match connect_async(&self.ws_url).await {
            Ok((stream, _)) => {
                debug!("established WebSocket connection to {}", self.ws_url);
                self.state = ConnectionState::Connected(stream);
                Ok(())
            }
            Err(e) => {
                error!("failed to establish WebSocket connection: {}", e);
                self.state = ConnectionState::Disconnected;
                Err(AppError::WebSocketConnectionError(format!(
                    "failed to connect to {}: {}",
                    self.ws_url, e
                )))
            }
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<(), AppError> {
        match &mut self.state {
            ConnectionState::Connected(stream) => stream
                .send(message)
                .await
                .map_err(|e| AppError::WebSocketSendError(e.to_string())),
            _ => Err(AppError::WebSocketSendError(
                "not connected".to_string(),
            )),
        }
    }

    /// Next inbound frame. Pends forever while disconnected so callers can
    /// keep this in a `select!` arm unconditionally.
    pub async fn next_message(&mut self) -> Option<Result<Message, tungstenite::Error>> {
        match &mut self.state {
            ConnectionState::Connected(stream) => stream.next().await,
            _ => std::future::pending().await,
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    pub async fn close(&mut self) {
        if let ConnectionState::Connected(mut stream) =
            std::mem::replace(&mut self.state, ConnectionState::Closing)
        {
            let _ = stream.close(None).await;
        }
        self.state = ConnectionState::Disconnected;
    }
}
