use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postgrest::Postgrest;
use serde_json::json;

use crate::error::AppError;
use crate::models::{CompletionReason, Contract, User, UserContract, UserContractStatus};
use crate::store::ContractStore;

const CONTRACT_TABLE: &str = "contract";
const USER_CONTRACT_TABLE: &str = "user_contract";
const USER_TABLE: &str = "user";

/// Postgrest-backed store against Supabase. Every call carries the shared
/// operation deadline; writes that must be one-way are guarded with column
/// filters so concurrent writers cannot both win.
pub struct SupabaseStore {
    client: Postgrest,
    op_timeout: Duration,
}

impl SupabaseStore {
    pub fn new(url: &str, service_role_key: &str, op_timeout: Duration) -> Self {
        let client = Postgrest::new(url)
            .insert_header("apikey", service_role_key)
            .insert_header("Authorization", format!("Bearer {}", service_role_key));

        Self { client, op_timeout }
    }

    async fn with_deadline<T, F>(&self, op: &str, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| AppError::TimeoutError(format!("{} exceeded deadline", op)))?
    }

    async fn rows<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<Vec<T>, AppError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AppError::RequestError(e.to_string()))?;
        if status.as_u16() == 409 {
            return Err(AppError::Conflict(body));
        }
        if !status.is_success() {
            return Err(AppError::PostgrestError(format!(
                "status {}: {}",
                status, body
            )));
        }
        serde_json::from_str(&body)
            .map_err(|e| AppError::JsonParseError(format!("failed to parse rows: {}", e)))
    }
}

#[async_trait]
impl ContractStore for SupabaseStore {
    async fn get_contract(&self, id: i64) -> Result<Contract, AppError> {
        self.with_deadline("get_contract", async {
            let resp = self
                .client
                .from(CONTRACT_TABLE)
                .select("*")
                .eq("id", id.to_string())
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            let rows: Vec<Contract> = Self::rows(resp).await?;
            rows.into_iter()
                .next()
                .ok_or_else(|| AppError::NotFound(format!("contract {}", id)))
        })
        .await
    }

    async fn list_pending_contracts(&self) -> Result<Vec<Contract>, AppError> {
        self.with_deadline("list_pending_contracts", async {
            let resp = self
                .client
                .from(CONTRACT_TABLE)
                .select("*")
                .eq("is_completed", "false")
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            Self::rows(resp).await
        })
        .await
    }

    async fn mark_contract_completed(
        &self,
        id: i64,
        reason: CompletionReason,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.with_deadline("mark_contract_completed", async {
            let body = json!({
                "is_completed": true,
                "completion_reason": reason,
                "completed_at": at,
            });

            // The is_completed filter is the fence: only one writer ever
            // sees a row to update.
            let resp = self
                .client
                .from(CONTRACT_TABLE)
                .update(body.to_string())
                .eq("id", id.to_string())
                .eq("is_completed", "false")
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            let rows: Vec<Contract> = Self::rows(resp).await?;
            Ok(!rows.is_empty())
        })
        .await
    }

    async fn get_user_contract(
        &self,
        contract_id: i64,
        user_address: &str,
    ) -> Result<UserContract, AppError> {
        self.with_deadline("get_user_contract", async {
            let resp = self
                .client
                .from(USER_CONTRACT_TABLE)
                .select("*")
                .eq("contract_id", contract_id.to_string())
                .eq("user_address", user_address)
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            let rows: Vec<UserContract> = Self::rows(resp).await?;
            rows.into_iter().next().ok_or_else(|| {
                AppError::NotFound(format!("user contract {}/{}", contract_id, user_address))
            })
        })
        .await
    }

    async fn list_user_contracts(&self, contract_id: i64) -> Result<Vec<UserContract>, AppError> {
        self.with_deadline("list_user_contracts", async {
            let resp = self
                .client
                .from(USER_CONTRACT_TABLE)
                .select("*")
                .eq("contract_id", contract_id.to_string())
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            Self::rows(resp).await
        })
        .await
    }

    async fn create_user_contract(&self, row: UserContract) -> Result<UserContract, AppError> {
        self.with_deadline("create_user_contract", async {
            let resp = self
                .client
                .from(USER_CONTRACT_TABLE)
                .insert(serde_json::to_string(&row)?)
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            let rows: Vec<UserContract> = Self::rows(resp).await?;
            rows.into_iter()
                .next()
                .ok_or_else(|| AppError::DatabaseError("no user contract inserted".to_string()))
        })
        .await
    }

    async fn update_user_contract_status(
        &self,
        contract_id: i64,
        user_address: &str,
        status: UserContractStatus,
    ) -> Result<bool, AppError> {
        self.with_deadline("update_user_contract_status", async {
            let resp = self
                .client
                .from(USER_CONTRACT_TABLE)
                .update(json!({ "status": status }).to_string())
                .eq("contract_id", contract_id.to_string())
                .eq("user_address", user_address)
                .eq(
                    "status",
                    UserContractStatus::InProgress.code().to_string(),
                )
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            let rows: Vec<UserContract> = Self::rows(resp).await?;
            Ok(!rows.is_empty())
        })
        .await
    }

    async fn bulk_update_status(
        &self,
        contract_id: i64,
        from: UserContractStatus,
        to: UserContractStatus,
    ) -> Result<u64, AppError> {
        self.with_deadline("bulk_update_status", async {
            let resp = self
                .client
                .from(USER_CONTRACT_TABLE)
                .update(json!({ "status": to }).to_string())
                .eq("contract_id", contract_id.to_string())
                .eq("status", from.code().to_string())
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            let rows: Vec<UserContract> = Self::rows(resp).await?;
            Ok(rows.len() as u64)
        })
        .await
    }

    async fn get_user(&self, wallet_address: &str) -> Result<User, AppError> {
        self.with_deadline("get_user", async {
            let resp = self
                .client
                .from(USER_TABLE)
                .select("*")
                .eq("wallet_address", wallet_address)
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            let rows: Vec<User> = Self::rows(resp).await?;
            rows.into_iter()
                .next()
                .ok_or_else(|| AppError::NotFound(format!("user {}", wallet_address)))
        })
        .await
    }

    async fn upsert_user(&self, wallet_address: &str) -> Result<User, AppError> {
        match self.get_user(wallet_address).await {
            Ok(user) => Ok(user),
            Err(AppError::NotFound(_)) => {
                let insert = self
                    .with_deadline("upsert_user", async {
                        let resp = self
                            .client
                            .from(USER_TABLE)
                            .insert(
                                json!({ "wallet_address": wallet_address, "score": 0.0 })
                                    .to_string(),
                            )
                            .execute()
                            .await
                            .map_err(|e| AppError::PostgrestError(e.to_string()))?;

                        let rows: Vec<User> = Self::rows(resp).await?;
                        rows.into_iter().next().ok_or_else(|| {
                            AppError::DatabaseError("no user inserted".to_string())
                        })
                    })
                    .await;

                match insert {
                    Ok(user) => Ok(user),
                    // Lost a create race; the row exists now.
                    Err(AppError::Conflict(_)) => self.get_user(wallet_address).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn update_user_score(&self, wallet_address: &str, delta: f64) -> Result<f64, AppError> {
        self.with_deadline("update_user_score", async {
            // Read-modify-write over two requests cannot be atomic, so the
            // increment runs inside the database.
            let resp = self
                .client
                .rpc(
                    "apply_score_delta",
                    json!({ "wallet": wallet_address, "delta": delta }).to_string(),
                )
                .execute()
                .await
                .map_err(|e| AppError::PostgrestError(e.to_string()))?;

            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|e| AppError::RequestError(e.to_string()))?;
            if !status.is_success() {
                return Err(AppError::PostgrestError(format!(
                    "status {}: {}",
                    status, body
                )));
            }
            body.trim()
                .parse::<f64>()
                .map_err(|e| AppError::JsonParseError(format!("score response: {}", e)))
        })
        .await
    }
}
