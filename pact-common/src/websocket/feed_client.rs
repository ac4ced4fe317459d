use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::models::{ConnectionStatus, TradeEvent};
use crate::websocket::connection_manager::WsConnectionManager;
use crate::websocket::{FeedMessage, FeedStatus, TradeFeed};

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const COMMAND_QUEUE_CAPACITY: usize = 32;

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: RECONNECT_BASE_DELAY,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

enum FeedCommand {
    Subscribe {
        mint: String,
        reply: oneshot::Sender<Result<broadcast::Receiver<FeedMessage>, AppError>>,
    },
    Unsubscribe {
        mint: String,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<FeedStatus>,
    },
    Shutdown,
}

/// Handle to the single process-wide feed client task. All subscription
/// state lives inside the task; this handle only passes messages.
pub struct FeedClient {
    commands: mpsc::Sender<FeedCommand>,
    health_rx: watch::Receiver<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
}

impl FeedClient {
    pub fn spawn(ws_url: String, channel_capacity: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (health_tx, health_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = FeedClientTask {
            manager: WsConnectionManager::new(ws_url),
            subscriptions: HashMap::new(),
            commands: cmd_rx,
            health: health_tx,
            shutdown: shutdown_rx,
            channel_capacity,
            dropped_frames: 0,
        };
        tokio::spawn(task.run());

        Self {
            commands: cmd_tx,
            health_rx,
            shutdown_tx,
        }
    }

    async fn send_command(&self, command: FeedCommand) -> Result<(), AppError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AppError::FeedUnavailable("feed client task is gone".to_string()))
    }
}

#[async_trait]
impl TradeFeed for FeedClient {
    async fn subscribe(&self, mint: &str) -> Result<broadcast::Receiver<FeedMessage>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(FeedCommand::Subscribe {
            mint: mint.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| AppError::FeedUnavailable("feed client task is gone".to_string()))?
    }

    async fn unsubscribe(&self, mint: &str) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(FeedCommand::Unsubscribe {
            mint: mint.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| AppError::FeedUnavailable("feed client task is gone".to_string()))
    }

    async fn status(&self) -> Result<FeedStatus, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(FeedCommand::Status { reply }).await?;
        rx.await
            .map_err(|_| AppError::FeedUnavailable("feed client task is gone".to_string()))
    }

    fn health(&self) -> watch::Receiver<ConnectionStatus> {
        self.health_rx.clone()
    }

    async fn shutdown(&self) -> Result<(), AppError> {
        let _ = self.shutdown_tx.send(true);
        let _ = self.commands.send(FeedCommand::Shutdown).await;
        Ok(())
    }
}

struct FeedClientTask {
    manager: WsConnectionManager,
    subscriptions: HashMap<String, broadcast::Sender<FeedMessage>>,
    commands: mpsc::Receiver<FeedCommand>,
    health: watch::Sender<ConnectionStatus>,
    shutdown: watch::Receiver<bool>,
    channel_capacity: usize,
    dropped_frames: u64,
}

impl FeedClientTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(FeedCommand::Shutdown) => {
                        self.manager.close().await;
                        let _ = self.health.send(ConnectionStatus::Disconnected);
                        break;
                    }
                    Some(FeedCommand::Subscribe { mint, reply }) => {
                        let result = self.handle_subscribe(mint).await;
                        let _ = reply.send(result);
                    }
                    Some(FeedCommand::Unsubscribe { mint, reply }) => {
                        self.handle_unsubscribe(&mint).await;
                        let _ = reply.send(());
                    }
                    Some(FeedCommand::Status { reply }) => {
                        let _ = reply.send(self.current_status());
                    }
                },
                frame = self.manager.next_message() => match frame {
                    Some(Ok(message)) => self.handle_frame(message).await,
                    Some(Err(e)) => {
                        warn!("websocket receive error: {}", e);
                        self.handle_disconnect().await;
                    }
                    None => {
                        warn!("websocket stream ended by remote");
                        self.handle_disconnect().await;
                    }
                },
            }
        }
        debug!("feed client task shut down");
    }

    async fn handle_subscribe(
        &mut self,
        mint: String,
    ) -> Result<broadcast::Receiver<FeedMessage>, AppError> {
        // Repeated subscribes share the existing channel; the upstream
        // frame is never duplicated.
        if let Some(tx) = self.subscriptions.get(&mint) {
            return Ok(tx.subscribe());
        }

        self.ensure_connected().await?;
        self.send_control("subscribeTokenTrade", std::slice::from_ref(&mint))
            .await?;

        let (tx, rx) = broadcast::channel(self.channel_capacity);
        self.subscriptions.insert(mint, tx);
        Ok(rx)
    }

    async fn handle_unsubscribe(&mut self, mint: &str) {
        if self.subscriptions.remove(mint).is_none() {
            return;
        }
        if self.manager.is_connected() {
            if let Err(e) = self
                .send_control("unsubscribeTokenTrade", &[mint.to_string()])
                .await
            {
                warn!("unsubscribe frame failed for {}: {}", mint, e);
            }
        }
    }

    async fn handle_frame(&mut self, message: Message) {
        match message {
            Message::Text(text) => self.route_trade(text.as_str()),
            Message::Close(frame) => {
                debug!("received close frame: {:?}", frame);
                self.handle_disconnect().await;
            }
            _ => {}
        }
    }

    fn route_trade(&mut self, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.dropped_frames += 1;
                warn!("dropping undecodable frame: {}", e);
                return;
            }
        };

        // Frames without a mint are control-plane acknowledgements.
        if value.get("mint").is_none() {
            debug!("ignoring control-plane frame");
            return;
        }

        let event: TradeEvent = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                self.dropped_frames += 1;
                warn!("dropping malformed trade frame: {}", e);
                return;
            }
        };

        if let Some(tx) = self.subscriptions.get(&event.mint) {
            // Send errors mean the stream is mid-teardown; nothing to do.
            let _ = tx.send(FeedMessage::Trade(event));
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), AppError> {
        if self.manager.is_connected() {
            return Ok(());
        }

        let _ = self.health.send(ConnectionStatus::Connecting);
        let mut delays = reconnect_backoff();
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match self.manager.connect().await {
                Ok(()) => {
                    let _ = self.health.send(ConnectionStatus::Connected);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "connect attempt {}/{} failed: {}",
                        attempt, MAX_CONNECT_ATTEMPTS, e
                    );
                    if attempt == MAX_CONNECT_ATTEMPTS {
                        break;
                    }
                    let delay = delays.next_backoff().unwrap_or(RECONNECT_BASE_DELAY);
                    if !self.wait_or_shutdown(delay).await {
                        return Err(AppError::FeedUnavailable("shutting down".to_string()));
                    }
                }
            }
        }

        let _ = self.health.send(ConnectionStatus::Disconnected);
        Err(AppError::WebSocketConnectionError(format!(
            "upstream unreachable after {} attempts",
            MAX_CONNECT_ATTEMPTS
        )))
    }

    /// Reconnect path after an established connection dropped. Subscribers
    /// are re-issued before any queued command is processed; on exhaustion
    /// every subscriber is told the feed is gone for good.
    async fn handle_disconnect(&mut self) {
        self.manager.mark_disconnected();
        if self.subscriptions.is_empty() {
            let _ = self.health.send(ConnectionStatus::Disconnected);
            return;
        }

        let _ = self.health.send(ConnectionStatus::Connecting);
        let mut delays = reconnect_backoff();
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            let delay = delays.next_backoff().unwrap_or(RECONNECT_BASE_DELAY);
            info!(
                "reconnecting to trade feed in {:?} (attempt {}/{})",
                delay, attempt, MAX_CONNECT_ATTEMPTS
            );
            if !self.wait_or_shutdown(delay).await {
                return;
            }
            match self.manager.connect().await {
                Ok(()) => match self.resubscribe_all().await {
                    Ok(()) => {
                        let _ = self.health.send(ConnectionStatus::Connected);
                        info!(
                            "reconnected; {} subscriptions re-issued",
                            self.subscriptions.len()
                        );
                        return;
                    }
                    Err(e) => {
                        warn!("resubscription after reconnect failed: {}", e);
                        self.manager.mark_disconnected();
                    }
                },
                Err(e) => warn!("reconnect attempt {} failed: {}", attempt, e),
            }
        }

        error!(
            "trade feed unreachable after {} attempts; dropping {} subscriptions",
            MAX_CONNECT_ATTEMPTS,
            self.subscriptions.len()
        );
        for (_, tx) in self.subscriptions.drain() {
            let _ = tx.send(FeedMessage::Fatal);
        }
        let _ = self.health.send(ConnectionStatus::Failed);
    }

    async fn resubscribe_all(&mut self) -> Result<(), AppError> {
        let keys: Vec<String> = self.subscriptions.keys().cloned().collect();
        if keys.is_empty() {
            return Ok(());
        }
        self.send_control("subscribeTokenTrade", &keys).await
    }

    async fn send_control(&mut self, method: &str, keys: &[String]) -> Result<(), AppError> {
        let frame = json!({ "method": method, "keys": keys });
        self.manager
            .send(Message::Text(frame.to_string().into()))
            .await
    }

    /// Returns `true` after the delay, `false` when shutdown was signalled.
    async fn wait_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn current_status(&self) -> FeedStatus {
        FeedStatus {
            connection: *self.health.borrow(),
            subscriptions: self.subscriptions.keys().cloned().collect(),
            dropped_frames: self.dropped_frames,
        }
    }
}
