use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Generic(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Postgrest error: {0}")]
    PostgrestError(String),

    #[error("Json parse error: {0}")]
    JsonParseError(String),

    #[error("Request error: {0}")]
    RequestError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Solana RPC error: {source}")]
    SolanaRpcError {
        #[from]
        source: solana_client::client_error::ClientError,
    },

    #[error("Pubkey parse error: {source}")]
    PubkeyParseError {
        #[from]
        source: solana_sdk::pubkey::ParsePubkeyError,
    },

    #[error("Program error: {source}")]
    ProgramError {
        #[from]
        source: solana_sdk::program_error::ProgramError,
    },

    #[error("Token account error: {0}")]
    TokenAccountError(String),

    #[error("Price not available: {0}")]
    PriceNotAvailable(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("WebSocket connection error: {0}")]
    WebSocketConnectionError(String),

    #[error("WebSocket send error: {0}")]
    WebSocketSendError(String),

    #[error("WebSocket receive error: {0}")]
    WebSocketReceiveError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Subscription failed: {0}")]
    SubscriptionError(String),

    #[error("Upstream feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Channel send error: {0}")]
    ChannelSendError(String),

    #[error("Channel receive error: {0}")]
    ChannelReceiveError(String),

    #[error("Failed to initialize: {0}")]
    InitializationError(String),

    #[error("Task error: {0}")]
    TaskError(String),
}

/// Coarse classification used for retry policy and operator-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    Unauthorized,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Transient => "transient_failure",
            ErrorKind::Fatal => "internal_error",
        }
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::InvalidInput(_)
            | AppError::JsonParseError(_)
            | AppError::ConfigError(_)
            | AppError::PubkeyParseError { .. } => ErrorKind::InvalidInput,
            AppError::Unauthorized(_) => ErrorKind::Unauthorized,
            AppError::DatabaseError(_)
            | AppError::PostgrestError(_)
            | AppError::RequestError(_)
            | AppError::SolanaRpcError { .. }
            | AppError::TokenAccountError(_)
            | AppError::PriceNotAvailable(_)
            | AppError::InvalidPrice(_)
            | AppError::WebSocketConnectionError(_)
            | AppError::WebSocketSendError(_)
            | AppError::WebSocketReceiveError(_)
            | AppError::WebSocketError(_)
            | AppError::SubscriptionError(_)
            | AppError::TimeoutError(_) => ErrorKind::Transient,
            AppError::Generic(_)
            | AppError::ProgramError { .. }
            | AppError::FeedUnavailable(_)
            | AppError::ChannelSendError(_)
            | AppError::ChannelReceiveError(_)
            | AppError::InitializationError(_)
            | AppError::TaskError(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Operator-facing description. Derived from the error kind only so
    /// infrastructure detail never leaks out of the engine.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "resource not found",
            ErrorKind::Conflict => "already exists",
            ErrorKind::InvalidInput => "invalid request",
            ErrorKind::Unauthorized => "not authorised",
            ErrorKind::Transient => "temporarily unavailable, retry later",
            ErrorKind::Fatal => "internal error",
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::JsonParseError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::WebSocketError(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        AppError::TimeoutError(err.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for AppError {
    fn from(err: mpsc::error::SendError<T>) -> Self {
        AppError::ChannelSendError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::RequestError(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Generic(err.to_string())
    }
}
