//! The single path through which a contract completes.
//!
//! Every closer (market-cap hit, deadline, all signers broken, startup
//! reconciliation) funnels into `complete`, which takes the guarded
//! completion write as its fence: exactly one caller wins, everyone else
//! becomes a silent no-op and performs no further writes.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use pact_common::error::AppError;
use pact_common::models::{CompletionReason, UserContract, UserContractStatus};
use pact_common::store::ContractStore;

use crate::scoring::{ScoreBasis, ScoreEvent, ScoringEngine};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_STEP: Duration = Duration::from_millis(200);

/// Runs `op` up to three times, backing off linearly on transient errors.
pub(crate) async fn retried<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    op_name, attempt, RETRY_ATTEMPTS, e
                );
                tokio::time::sleep(RETRY_STEP * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn complete_market_cap(
    store: &dyn ContractStore,
    scoring: &ScoringEngine,
    contract_id: i64,
    condition1: f64,
    ath_usd: f64,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    complete(
        store,
        scoring,
        contract_id,
        condition1,
        Some(ath_usd),
        CompletionReason::MarketCap,
        UserContractStatus::CompletedCondition1,
        now,
    )
    .await
}

pub async fn complete_time_expired(
    store: &dyn ContractStore,
    scoring: &ScoringEngine,
    contract_id: i64,
    condition1: f64,
    ath_usd: Option<f64>,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    complete(
        store,
        scoring,
        contract_id,
        condition1,
        ath_usd,
        CompletionReason::TimeExpired,
        UserContractStatus::CompletedCondition2,
        now,
    )
    .await
}

pub async fn complete_all_broken(
    store: &dyn ContractStore,
    scoring: &ScoringEngine,
    contract_id: i64,
    condition1: f64,
    ath_usd: Option<f64>,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    complete(
        store,
        scoring,
        contract_id,
        condition1,
        ath_usd,
        CompletionReason::AllBroken,
        UserContractStatus::Broken,
        now,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn complete(
    store: &dyn ContractStore,
    scoring: &ScoringEngine,
    contract_id: i64,
    condition1: f64,
    ath_usd: Option<f64>,
    reason: CompletionReason,
    terminal: UserContractStatus,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    // Re-read before writing: an operator or a concurrent closer may have
    // completed the contract since this event was picked up.
    let contract = retried("reload contract", || store.get_contract(contract_id)).await?;
    if contract.is_completed {
        debug!(contract_id, "contract already completed; nothing to do");
        return Ok(false);
    }

    let won = retried("mark contract completed", || {
        store.mark_contract_completed(contract_id, reason, now)
    })
    .await?;
    if !won {
        debug!(contract_id, "lost the completion race; nothing to do");
        return Ok(false);
    }
    info!(contract_id, ?reason, "contract completed");

    let moved = retried("bulk status update", || {
        store.bulk_update_status(contract_id, UserContractStatus::InProgress, terminal)
    })
    .await?;
    debug!(contract_id, moved, "user contracts moved to terminal status");

    let rows = retried("list user contracts", || {
        store.list_user_contracts(contract_id)
    })
    .await?;
    for row in &rows {
        apply_score(store, scoring, row, condition1, ath_usd, now).await;
    }

    Ok(true)
}

async fn apply_score(
    store: &dyn ContractStore,
    scoring: &ScoringEngine,
    row: &UserContract,
    condition1: f64,
    ath_usd: Option<f64>,
    now: DateTime<Utc>,
) {
    let Some(event) = score_event(row, condition1, ath_usd, now) else {
        return;
    };

    let result = async {
        let user = retried("upsert user", || store.upsert_user(&row.user_address)).await?;
        let outcome = scoring.apply(&event, user.score);
        let new_raw = retried("update user score", || {
            store.update_user_score(&row.user_address, outcome.raw_delta)
        })
        .await?;
        Ok::<(f64, f64), AppError>((outcome.raw_delta, new_raw))
    }
    .await;

    match result {
        Ok((delta, new_raw)) => info!(
            user = %row.user_address,
            delta,
            new_raw,
            "score applied at contract close"
        ),
        // The completion fence is already taken; a lost score write must
        // not block the remaining users.
        Err(e) => warn!("score update failed for {}: {}", row.user_address, e),
    }
}

fn score_event(
    row: &UserContract,
    condition1: f64,
    ath_usd: Option<f64>,
    now: DateTime<Utc>,
) -> Option<ScoreEvent> {
    let diff = diff_with_condition(condition1, ath_usd);
    match row.status {
        UserContractStatus::CompletedCondition1 => Some(ScoreEvent {
            contract_respected: true,
            buy_amount: row.supply,
            diff_with_condition: diff,
            basis: ScoreBasis::MarketCap,
            signed_at: row.signed_at,
            closed_at: now,
        }),
        UserContractStatus::CompletedCondition2 => Some(ScoreEvent {
            contract_respected: true,
            buy_amount: row.supply,
            diff_with_condition: diff,
            basis: ScoreBasis::Deadline,
            signed_at: row.signed_at,
            closed_at: now,
        }),
        UserContractStatus::Broken => Some(ScoreEvent {
            contract_respected: false,
            buy_amount: row.supply,
            diff_with_condition: diff,
            basis: ScoreBasis::MarketCap,
            signed_at: row.signed_at,
            closed_at: now,
        }),
        UserContractStatus::InProgress => {
            warn!(
                user = %row.user_address,
                "user contract still in progress after completion; skipping score"
            );
            None
        }
    }
}

/// Signed percentage deviation of the observed peak versus the target.
/// Clamped at -100 so the penalty multiplier stays non-negative.
fn diff_with_condition(condition1: f64, ath_usd: Option<f64>) -> f64 {
    match ath_usd {
        Some(ath) if condition1 > 0.0 => (((ath / condition1) - 1.0) * 100.0).max(-100.0),
        _ => -100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pact_common::models::Contract;
    use pact_common::store::MemoryStore;

    fn seed_contract(store: &MemoryStore, id: i64, condition1: f64) {
        store.insert_contract(Contract {
            id,
            mint: format!("mint-{}", id),
            condition1,
            condition2: Utc::now() + chrono::Duration::hours(1),
            is_completed: false,
            completion_reason: None,
            completed_at: None,
            created_at: Utc::now(),
        });
    }

    async fn seed_signer(store: &MemoryStore, contract_id: i64, addr: &str, supply: f64) {
        store
            .create_user_contract(UserContract {
                contract_id,
                user_address: addr.to_string(),
                supply,
                status: UserContractStatus::InProgress,
                signed_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn market_cap_close_moves_holders_and_penalises_breakers() {
        let store = MemoryStore::new();
        let scoring = ScoringEngine::default();
        seed_contract(&store, 1, 1_000_000.0);
        seed_signer(&store, 1, "alice", 1000.0).await;
        seed_signer(&store, 1, "bob", 1000.0).await;
        store
            .update_user_contract_status(1, "bob", UserContractStatus::Broken)
            .await
            .unwrap();

        let won = complete_market_cap(&store, &scoring, 1, 1_000_000.0, 1_200_000.0, Utc::now())
            .await
            .unwrap();
        assert!(won);

        let contract = store.get_contract(1).await.unwrap();
        assert!(contract.is_completed);
        assert_eq!(contract.completion_reason, Some(CompletionReason::MarketCap));
        assert!(contract.completed_at.is_some());

        let alice = store.get_user_contract(1, "alice").await.unwrap();
        assert_eq!(alice.status, UserContractStatus::CompletedCondition1);

        // diff is +20%, so alice earns 1000 * 3e-6 * 1.2 and bob loses twice that.
        let alice_score = store.get_user("alice").await.unwrap().score;
        let bob_score = store.get_user("bob").await.unwrap().score;
        assert!((alice_score - 0.0036).abs() < 1e-12);
        assert!((bob_score + 0.0072).abs() < 1e-12);
    }

    #[tokio::test]
    async fn completion_is_sticky() {
        let store = MemoryStore::new();
        let scoring = ScoringEngine::default();
        seed_contract(&store, 1, 1_000_000.0);
        seed_signer(&store, 1, "alice", 1000.0).await;

        assert!(
            complete_market_cap(&store, &scoring, 1, 1_000_000.0, 1_500_000.0, Utc::now())
                .await
                .unwrap()
        );
        let score_after_close = store.get_user("alice").await.unwrap().score;
        let completed_at = store.get_contract(1).await.unwrap().completed_at;

        // A late deadline close is a no-op: no status change, no re-score.
        assert!(
            !complete_time_expired(&store, &scoring, 1, 1_000_000.0, None, Utc::now())
                .await
                .unwrap()
        );
        let contract = store.get_contract(1).await.unwrap();
        assert_eq!(contract.completion_reason, Some(CompletionReason::MarketCap));
        assert_eq!(contract.completed_at, completed_at);
        assert_eq!(store.get_user("alice").await.unwrap().score, score_after_close);
    }

    #[tokio::test]
    async fn deadline_close_pays_no_bonus_to_young_signatures() {
        let store = MemoryStore::new();
        let scoring = ScoringEngine::default();
        seed_contract(&store, 1, 1_000_000.0);
        seed_signer(&store, 1, "alice", 1000.0).await;

        assert!(
            complete_time_expired(&store, &scoring, 1, 1_000_000.0, None, Utc::now())
                .await
                .unwrap()
        );

        let alice = store.get_user_contract(1, "alice").await.unwrap();
        assert_eq!(alice.status, UserContractStatus::CompletedCondition2);
        assert_eq!(store.get_user("alice").await.unwrap().score, 0.0);
    }

    #[tokio::test]
    async fn all_broken_close_records_the_descriptive_reason() {
        let store = MemoryStore::new();
        let scoring = ScoringEngine::default();
        seed_contract(&store, 1, 1_000_000.0);
        seed_signer(&store, 1, "alice", 500.0).await;
        store
            .update_user_contract_status(1, "alice", UserContractStatus::Broken)
            .await
            .unwrap();

        assert!(
            complete_all_broken(&store, &scoring, 1, 1_000_000.0, Some(10.0), Utc::now())
                .await
                .unwrap()
        );

        let contract = store.get_contract(1).await.unwrap();
        assert_eq!(contract.completion_reason, Some(CompletionReason::AllBroken));
        assert!(store.get_user("alice").await.unwrap().score < 0.0);
    }

    #[test]
    fn diff_degrades_to_the_clamp_without_a_price() {
        assert_eq!(diff_with_condition(1_000_000.0, None), -100.0);
        assert_eq!(diff_with_condition(0.0, Some(10.0)), -100.0);
        let diff = diff_with_condition(1_000_000.0, Some(1_200_000.0));
        assert!((diff - 20.0).abs() < 1e-9);
    }
}
