//! Persistence port for contracts, user contracts and user scores.
//!
//! The engine only depends on the `ContractStore` trait; the Supabase
//! implementation is the production backend and `MemoryStore` backs tests
//! and local development.

mod memory;
mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use crate::error::AppError;
use crate::models::{CompletionReason, Contract, User, UserContract, UserContractStatus};

#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn get_contract(&self, id: i64) -> Result<Contract, AppError>;

    async fn list_pending_contracts(&self) -> Result<Vec<Contract>, AppError>;

    /// Guarded completion write. Returns `true` when this call performed the
    /// transition and `false` when the contract was already completed; the
    /// two never both succeed for the same contract.
    async fn mark_contract_completed(
        &self,
        id: i64,
        reason: CompletionReason,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn get_user_contract(
        &self,
        contract_id: i64,
        user_address: &str,
    ) -> Result<UserContract, AppError>;

    async fn list_user_contracts(&self, contract_id: i64) -> Result<Vec<UserContract>, AppError>;

    /// Fails with `Conflict` when the `(contract_id, user_address)` pair
    /// already exists.
    async fn create_user_contract(&self, row: UserContract) -> Result<UserContract, AppError>;

    /// Guarded status write: only rows still `InProgress` transition.
    /// Returns `true` when the row moved.
    async fn update_user_contract_status(
        &self,
        contract_id: i64,
        user_address: &str,
        status: UserContractStatus,
    ) -> Result<bool, AppError>;

    /// Moves every row of the contract currently in `from` to `to`,
    /// returning the number of rows moved.
    async fn bulk_update_status(
        &self,
        contract_id: i64,
        from: UserContractStatus,
        to: UserContractStatus,
    ) -> Result<u64, AppError>;

    async fn get_user(&self, wallet_address: &str) -> Result<User, AppError>;

    async fn upsert_user(&self, wallet_address: &str) -> Result<User, AppError>;

    /// Atomic read-modify-write of the raw score. Returns the new value.
    async fn update_user_score(&self, wallet_address: &str, delta: f64) -> Result<f64, AppError>;
}
