mod connection_manager;
mod feed_client;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

pub use connection_manager::WsConnectionManager;
pub use feed_client::FeedClient;

use crate::error::AppError;
use crate::models::{ConnectionStatus, TradeEvent};

/// What a per-mint subscriber receives from the feed client.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Trade(TradeEvent),
    /// The upstream connection is gone for good; the subscription was
    /// dropped and will not recover.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct FeedStatus {
    pub connection: ConnectionStatus,
    pub subscriptions: Vec<String>,
    pub dropped_frames: u64,
}

/// Capability interface over the multiplexed trade feed, so the supervisor
/// can run against a scripted fake in tests.
#[async_trait]
pub trait TradeFeed: Send + Sync {
    /// Idempotent: a repeated subscribe hands out another receiver on the
    /// same per-mint channel without re-issuing the upstream frame.
    async fn subscribe(&self, mint: &str) -> Result<broadcast::Receiver<FeedMessage>, AppError>;

    /// Idempotent: unsubscribing an unknown mint is a no-op.
    async fn unsubscribe(&self, mint: &str) -> Result<(), AppError>;

    async fn status(&self) -> Result<FeedStatus, AppError>;

    fn health(&self) -> watch::Receiver<ConnectionStatus>;

    async fn shutdown(&self) -> Result<(), AppError>;
}
