use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::AppError;
use crate::models::{CompletionReason, Contract, User, UserContract, UserContractStatus};
use crate::store::ContractStore;

#[derive(Default)]
struct Inner {
    contracts: HashMap<i64, Contract>,
    user_contracts: BTreeMap<(i64, String), UserContract>,
    users: HashMap<String, User>,
}

/// In-process store with the same guarded-write semantics as the Supabase
/// backend. Used by tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_contract(&self, contract: Contract) {
        self.inner.lock().contracts.insert(contract.id, contract);
    }
}

#[async_trait]
impl ContractStore for MemoryStore {
    async fn get_contract(&self, id: i64) -> Result<Contract, AppError> {
        self.inner
            .lock()
            .contracts
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("contract {}", id)))
    }

    async fn list_pending_contracts(&self) -> Result<Vec<Contract>, AppError> {
        let mut pending: Vec<Contract> = self
            .inner
            .lock()
            .contracts
            .values()
            .filter(|c| !c.is_completed)
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.id);
        Ok(pending)
    }

    async fn mark_contract_completed(
        &self,
        id: i64,
        reason: CompletionReason,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.lock();
        let contract = inner
            .contracts
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("contract {}", id)))?;
        if contract.is_completed {
            return Ok(false);
        }
        contract.is_completed = true;
        contract.completion_reason = Some(reason);
        contract.completed_at = Some(at);
        Ok(true)
    }

    async fn get_user_contract(
        &self,
        contract_id: i64,
        user_address: &str,
    ) -> Result<UserContract, AppError> {
        self.inner
            .lock()
            .user_contracts
            .get(&(contract_id, user_address.to_string()))
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("user contract {}/{}", contract_id, user_address))
            })
    }

    async fn list_user_contracts(&self, contract_id: i64) -> Result<Vec<UserContract>, AppError> {
        Ok(self
            .inner
            .lock()
            .user_contracts
            .range((contract_id, String::new())..(contract_id + 1, String::new()))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn create_user_contract(&self, row: UserContract) -> Result<UserContract, AppError> {
        let mut inner = self.inner.lock();
        let key = (row.contract_id, row.user_address.clone());
        if inner.user_contracts.contains_key(&key) {
            return Err(AppError::Conflict(format!(
                "user contract {}/{}",
                row.contract_id, row.user_address
            )));
        }
        inner.user_contracts.insert(key, row.clone());
        Ok(row)
    }

    async fn update_user_contract_status(
        &self,
        contract_id: i64,
        user_address: &str,
        status: UserContractStatus,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.lock();
        let row = inner
            .user_contracts
            .get_mut(&(contract_id, user_address.to_string()))
            .ok_or_else(|| {
                AppError::NotFound(format!("user contract {}/{}", contract_id, user_address))
            })?;
        if row.status != UserContractStatus::InProgress {
            return Ok(false);
        }
        row.status = status;
        Ok(true)
    }

    async fn bulk_update_status(
        &self,
        contract_id: i64,
        from: UserContractStatus,
        to: UserContractStatus,
    ) -> Result<u64, AppError> {
        let mut inner = self.inner.lock();
        let mut moved = 0;
        for (_, row) in inner
            .user_contracts
            .range_mut((contract_id, String::new())..(contract_id + 1, String::new()))
        {
            if row.status == from {
                row.status = to;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn get_user(&self, wallet_address: &str) -> Result<User, AppError> {
        self.inner
            .lock()
            .users
            .get(wallet_address)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("user {}", wallet_address)))
    }

    async fn upsert_user(&self, wallet_address: &str) -> Result<User, AppError> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .entry(wallet_address.to_string())
            .or_insert_with(|| User {
                wallet_address: wallet_address.to_string(),
                score: 0.0,
            });
        Ok(user.clone())
    }

    async fn update_user_score(&self, wallet_address: &str, delta: f64) -> Result<f64, AppError> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .get_mut(wallet_address)
            .ok_or_else(|| AppError::NotFound(format!("user {}", wallet_address)))?;
        user.score += delta;
        Ok(user.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(id: i64) -> Contract {
        Contract {
            id,
            mint: format!("mint-{}", id),
            condition1: 1_000_000.0,
            condition2: Utc::now() + chrono::Duration::hours(1),
            is_completed: false,
            completion_reason: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    fn user_contract(contract_id: i64, addr: &str) -> UserContract {
        UserContract {
            contract_id,
            user_address: addr.to_string(),
            supply: 100.0,
            status: UserContractStatus::InProgress,
            signed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn completion_write_happens_exactly_once() {
        let store = MemoryStore::new();
        store.insert_contract(contract(1));

        let first = store
            .mark_contract_completed(1, CompletionReason::MarketCap, Utc::now())
            .await
            .unwrap();
        let second = store
            .mark_contract_completed(1, CompletionReason::TimeExpired, Utc::now())
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let row = store.get_contract(1).await.unwrap();
        assert_eq!(row.completion_reason, Some(CompletionReason::MarketCap));
    }

    #[tokio::test]
    async fn duplicate_signature_is_a_conflict() {
        let store = MemoryStore::new();
        store.insert_contract(contract(1));
        store
            .create_user_contract(user_contract(1, "alice"))
            .await
            .unwrap();

        let err = store
            .create_user_contract(user_contract(1, "alice"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert_eq!(store.list_user_contracts(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_exits_in_progress_at_most_once() {
        let store = MemoryStore::new();
        store.insert_contract(contract(1));
        store
            .create_user_contract(user_contract(1, "alice"))
            .await
            .unwrap();

        let moved = store
            .update_user_contract_status(1, "alice", UserContractStatus::Broken)
            .await
            .unwrap();
        let moved_again = store
            .update_user_contract_status(1, "alice", UserContractStatus::CompletedCondition1)
            .await
            .unwrap();

        assert!(moved);
        assert!(!moved_again);
        let row = store.get_user_contract(1, "alice").await.unwrap();
        assert_eq!(row.status, UserContractStatus::Broken);
    }

    #[tokio::test]
    async fn bulk_update_only_touches_matching_rows() {
        let store = MemoryStore::new();
        store.insert_contract(contract(1));
        store
            .create_user_contract(user_contract(1, "alice"))
            .await
            .unwrap();
        store
            .create_user_contract(user_contract(1, "bob"))
            .await
            .unwrap();
        store
            .update_user_contract_status(1, "bob", UserContractStatus::Broken)
            .await
            .unwrap();

        let moved = store
            .bulk_update_status(
                1,
                UserContractStatus::InProgress,
                UserContractStatus::CompletedCondition1,
            )
            .await
            .unwrap();

        assert_eq!(moved, 1);
        let rows = store.list_user_contracts(1).await.unwrap();
        let alice = rows.iter().find(|r| r.user_address == "alice").unwrap();
        let bob = rows.iter().find(|r| r.user_address == "bob").unwrap();
        assert_eq!(alice.status, UserContractStatus::CompletedCondition1);
        assert_eq!(bob.status, UserContractStatus::Broken);
    }
}
