pub mod config;
pub mod error;
pub mod event_system;
pub mod models;
pub mod oracle;
pub mod store;
pub mod websocket;

pub use config::Config;
pub use error::{AppError, ErrorKind};
pub use event_system::{Event, EventSystem};
pub use models::{
    CompletionReason, ConnectionStatus, Contract, HealthReport, StreamSnapshot, TradeEvent,
    TxType, User, UserContract, UserContractStatus,
};
pub use oracle::{BalanceCheck, BalanceOracle, PriceOracle, RpcBalanceOracle, SolPriceClient};
pub use store::{ContractStore, MemoryStore, SupabaseStore};
pub use websocket::{FeedClient, FeedMessage, FeedStatus, TradeFeed};
