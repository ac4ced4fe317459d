use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};

use pact_common::error::AppError;
use pact_common::event_system::EventSystem;
use pact_common::models::{
    CompletionReason, ConnectionStatus, Contract, TradeEvent, TxType, UserContract,
    UserContractStatus,
};
use pact_common::oracle::{BalanceCheck, BalanceOracle, PriceOracle};
use pact_common::store::{ContractStore, MemoryStore};
use pact_common::websocket::{FeedMessage, FeedStatus, TradeFeed};
use pact_engine::{
    CommandSurface, ScoringEngine, StartOutcome, StartRefusal, StreamSupervisor,
};

struct FakeFeed {
    subs: Mutex<HashMap<String, broadcast::Sender<FeedMessage>>>,
    health_tx: watch::Sender<ConnectionStatus>,
    health_rx: watch::Receiver<ConnectionStatus>,
}

impl FakeFeed {
    fn new() -> Self {
        let (health_tx, health_rx) = watch::channel(ConnectionStatus::Connected);
        Self {
            subs: Mutex::new(HashMap::new()),
            health_tx,
            health_rx,
        }
    }

    fn emit(&self, mint: &str, event: TradeEvent) {
        if let Some(tx) = self.subs.lock().get(mint) {
            let _ = tx.send(FeedMessage::Trade(event));
        }
    }

    #[allow(dead_code)]
    fn fail(&self) {
        let _ = self.health_tx.send(ConnectionStatus::Failed);
    }
}

#[async_trait]
impl TradeFeed for FakeFeed {
    async fn subscribe(&self, mint: &str) -> Result<broadcast::Receiver<FeedMessage>, AppError> {
        let mut subs = self.subs.lock();
        let tx = subs
            .entry(mint.to_string())
            .or_insert_with(|| broadcast::channel(64).0);
        Ok(tx.subscribe())
    }

    async fn unsubscribe(&self, mint: &str) -> Result<(), AppError> {
        self.subs.lock().remove(mint);
        Ok(())
    }

    async fn status(&self) -> Result<FeedStatus, AppError> {
        Ok(FeedStatus {
            connection: *self.health_rx.borrow(),
            subscriptions: self.subs.lock().keys().cloned().collect(),
            dropped_frames: 0,
        })
    }

    fn health(&self) -> watch::Receiver<ConnectionStatus> {
        self.health_rx.clone()
    }

    async fn shutdown(&self) -> Result<(), AppError> {
        Ok(())
    }
}

struct FakePriceOracle {
    price_usd: RwLock<f64>,
}

#[async_trait]
impl PriceOracle for FakePriceOracle {
    async fn sol_price_usd(&self) -> Result<f64, AppError> {
        Ok(*self.price_usd.read())
    }
}

struct FakeBalanceOracle {
    balances: RwLock<HashMap<String, f64>>,
}

#[async_trait]
impl BalanceOracle for FakeBalanceOracle {
    async fn check_balance(
        &self,
        _mint: &str,
        wallet: &str,
        required_amount: f64,
    ) -> Result<BalanceCheck, AppError> {
        let actual = self.balances.read().get(wallet).copied().unwrap_or(0.0);
        let decimals = 6u8;
        let scale = 10f64.powi(decimals as i32);
        let actual_raw = (actual * scale).round() as u64;
        let required_raw = (required_amount * scale).round() as u64;
        Ok(BalanceCheck {
            has_enough: actual_raw >= required_raw,
            actual_raw,
            required_raw,
            decimals,
        })
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    feed: Arc<FakeFeed>,
    balance: Arc<FakeBalanceOracle>,
    supervisor: Arc<StreamSupervisor>,
}

fn harness(sol_price_usd: f64) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(FakeFeed::new());
    let price = Arc::new(FakePriceOracle {
        price_usd: RwLock::new(sol_price_usd),
    });
    let balance = Arc::new(FakeBalanceOracle {
        balances: RwLock::new(HashMap::new()),
    });

    let store_port: Arc<dyn ContractStore> = store.clone();
    let feed_port: Arc<dyn TradeFeed> = feed.clone();
    let price_port: Arc<dyn PriceOracle> = price.clone();
    let balance_port: Arc<dyn BalanceOracle> = balance.clone();

    let supervisor = Arc::new(StreamSupervisor::new(
        store_port,
        feed_port,
        price_port,
        balance_port,
        Arc::new(ScoringEngine::default()),
        Arc::new(EventSystem::new()),
        3,
        Duration::from_millis(10),
    ));

    Harness {
        store,
        feed,
        balance,
        supervisor,
    }
}

fn seed_contract(store: &MemoryStore, id: i64, mint: &str, condition1: f64, ttl: ChronoDuration) {
    store.insert_contract(Contract {
        id,
        mint: mint.to_string(),
        condition1,
        condition2: Utc::now() + ttl,
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

fn trade(mint: &str, trader: &str, market_cap_sol: f64, new_token_balance: f64) -> TradeEvent {
    TradeEvent {
        signature: "sig".to_string(),
        mint: mint.to_string(),
        trader_public_key: trader.to_string(),
        tx_type: TxType::Sell,
        token_amount: 0.0,
        sol_amount: 0.0,
        new_token_balance,
        v_tokens_in_bonding_curve: 0.0,
        v_sol_in_bonding_curve: 0.0,
        market_cap_sol,
        pool: None,
    }
}

async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn market_cap_win_completes_contract_and_scores_holders() {
    let h = harness(100.0);
    seed_contract(&h.store, 1, "M", 1_000_000.0, ChronoDuration::hours(1));
    seed_signer(&h.store, 1, "A", 1000.0).await;
    seed_signer(&h.store, 1, "B", 2000.0).await;

    assert_eq!(h.supervisor.start(1).await.unwrap(), StartOutcome::Started);

    // A non-signer trade moves the ATH but never touches user accounting.
    h.feed.emit("M", trade("M", "C", 5000.0, 0.0));
    // A's balance equals the committed supply, which is not a break; the
    // market cap crosses the target in the same event.
    h.feed.emit("M", trade("M", "A", 12_000.0, 1000.0));

    wait_until("contract completion", || async {
        h.store.get_contract(1).await.unwrap().is_completed
    })
    .await;

    let contract = h.store.get_contract(1).await.unwrap();
    assert_eq!(contract.completion_reason, Some(CompletionReason::MarketCap));
    assert!(contract.completed_at.is_some());

    let a = h.store.get_user_contract(1, "A").await.unwrap();
    let b = h.store.get_user_contract(1, "B").await.unwrap();
    assert_eq!(a.status, UserContractStatus::CompletedCondition1);
    assert_eq!(b.status, UserContractStatus::CompletedCondition1);

    // ath_usd = 12000 * 100 = 1.2M against a 1M target: +20% diff.
    let a_score = h.store.get_user("A").await.unwrap().score;
    let b_score = h.store.get_user("B").await.unwrap().score;
    assert!((a_score - 0.0036).abs() < 1e-12);
    assert!((b_score - 0.0072).abs() < 1e-12);

    wait_until("stream teardown", || async {
        !h.supervisor.is_active(1).await
    })
    .await;
}

#[tokio::test]
async fn confirmed_break_cascades_to_all_broken() {
    let h = harness(1.0);
    seed_contract(&h.store, 2, "M2", 1_000_000.0, ChronoDuration::hours(1));
    seed_signer(&h.store, 2, "A", 500.0).await;
    h.balance.balances.write().insert("A".to_string(), 499.0);

    assert_eq!(h.supervisor.start(2).await.unwrap(), StartOutcome::Started);
    h.feed.emit("M2", trade("M2", "A", 10.0, 499.0));

    wait_until("all-broken completion", || async {
        h.store.get_contract(2).await.unwrap().is_completed
    })
    .await;

    let contract = h.store.get_contract(2).await.unwrap();
    assert_eq!(contract.completion_reason, Some(CompletionReason::AllBroken));
    let a = h.store.get_user_contract(2, "A").await.unwrap();
    assert_eq!(a.status, UserContractStatus::Broken);
    assert!(h.store.get_user("A").await.unwrap().score < 0.0);
}

#[tokio::test]
async fn stale_feed_balance_does_not_break_a_holder() {
    let h = harness(1.0);
    seed_contract(&h.store, 3, "M3", 1_000_000.0, ChronoDuration::hours(1));
    seed_signer(&h.store, 3, "A", 500.0).await;
    // The chain still shows the full supply even though the feed reported less.
    h.balance.balances.write().insert("A".to_string(), 500.0);

    assert_eq!(h.supervisor.start(3).await.unwrap(), StartOutcome::Started);
    h.feed.emit("M3", trade("M3", "A", 10.0, 450.0));
    h.feed.emit("M3", trade("M3", "A", 11.0, 450.0));

    wait_until("events drained", || async {
        h.supervisor
            .get(3)
            .await
            .map(|s| s.ath_market_cap_sol == 11.0)
            .unwrap_or(false)
    })
    .await;

    let a = h.store.get_user_contract(3, "A").await.unwrap();
    assert_eq!(a.status, UserContractStatus::InProgress);
    assert!(!h.store.get_contract(3).await.unwrap().is_completed);

    // A falling market cap never lowers the recorded high.
    h.feed.emit("M3", trade("M3", "A", 5.0, 500.0));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.supervisor.get(3).await.unwrap().ath_market_cap_sol,
        11.0
    );
}

#[tokio::test]
async fn deadline_closes_the_contract_without_events() {
    let h = harness(100.0);
    seed_contract(&h.store, 4, "M4", 1_000_000.0, ChronoDuration::milliseconds(300));
    seed_signer(&h.store, 4, "A", 1000.0).await;

    assert_eq!(h.supervisor.start(4).await.unwrap(), StartOutcome::Started);

    wait_until("deadline completion", || async {
        h.store.get_contract(4).await.unwrap().is_completed
    })
    .await;

    let contract = h.store.get_contract(4).await.unwrap();
    assert_eq!(
        contract.completion_reason,
        Some(CompletionReason::TimeExpired)
    );
    let a = h.store.get_user_contract(4, "A").await.unwrap();
    assert_eq!(a.status, UserContractStatus::CompletedCondition2);
    // Signed moments ago: the holding-age bonus is zero.
    assert_eq!(h.store.get_user("A").await.unwrap().score, 0.0);
}

#[tokio::test]
async fn restart_resets_the_all_time_high() {
    let h = harness(100.0);
    seed_contract(&h.store, 5, "M5", 100_000.0, ChronoDuration::hours(1));
    seed_signer(&h.store, 5, "A", 1000.0).await;

    assert_eq!(h.supervisor.start(5).await.unwrap(), StartOutcome::Started);
    h.feed.emit("M5", trade("M5", "B", 800.0, 0.0));
    wait_until("first ATH", || async {
        h.supervisor
            .get(5)
            .await
            .map(|s| s.ath_market_cap_sol == 800.0)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(
        h.supervisor.restart(5).await.unwrap(),
        StartOutcome::Started
    );

    // 700 after a restart must not inherit the cached 800 (800 + 700 would
    // stay under the target either way, but the ATH must read 700, not 800).
    h.feed.emit("M5", trade("M5", "B", 700.0, 0.0));
    wait_until("fresh ATH", || async {
        h.supervisor
            .get(5)
            .await
            .map(|s| s.ath_market_cap_sol == 700.0)
            .unwrap_or(false)
    })
    .await;

    assert!(!h.store.get_contract(5).await.unwrap().is_completed);
}

#[tokio::test]
async fn one_stream_per_contract_at_most() {
    let h = harness(100.0);
    seed_contract(&h.store, 6, "M6", 1_000_000.0, ChronoDuration::hours(1));
    seed_signer(&h.store, 6, "A", 1000.0).await;

    assert_eq!(h.supervisor.start(6).await.unwrap(), StartOutcome::Started);
    assert_eq!(
        h.supervisor.start(6).await.unwrap(),
        StartOutcome::AlreadyActive
    );
    assert_eq!(h.supervisor.list_active().await.len(), 1);
}

#[tokio::test]
async fn start_stop_start_round_trips_to_an_equivalent_stream() {
    let h = harness(100.0);
    seed_contract(&h.store, 7, "M7", 1_000_000.0, ChronoDuration::hours(1));
    seed_signer(&h.store, 7, "A", 1000.0).await;

    assert_eq!(h.supervisor.start(7).await.unwrap(), StartOutcome::Started);
    let first = h.supervisor.get(7).await.unwrap();

    assert!(h.supervisor.stop(7).await);
    assert!(!h.supervisor.is_active(7).await);
    // Stopping again is a no-op.
    assert!(!h.supervisor.stop(7).await);

    assert_eq!(h.supervisor.start(7).await.unwrap(), StartOutcome::Started);
    let second = h.supervisor.get(7).await.unwrap();

    assert_eq!(first.mint, second.mint);
    assert_eq!(first.signers, second.signers);
    assert_eq!(first.condition1, second.condition1);
    assert_eq!(first.condition2, second.condition2);
    assert_eq!(first.ath_market_cap_sol, second.ath_market_cap_sol);
}

#[tokio::test]
async fn start_refuses_completed_and_expired_contracts() {
    let h = harness(100.0);

    seed_contract(&h.store, 8, "M8", 1_000_000.0, ChronoDuration::hours(1));
    seed_signer(&h.store, 8, "A", 1000.0).await;
    h.store
        .mark_contract_completed(8, CompletionReason::Manual, Utc::now())
        .await
        .unwrap();
    assert_eq!(
        h.supervisor.start(8).await.unwrap(),
        StartOutcome::Refused(StartRefusal::AlreadyCompleted)
    );

    seed_contract(&h.store, 9, "M9", 1_000_000.0, ChronoDuration::milliseconds(-50));
    seed_signer(&h.store, 9, "A", 1000.0).await;
    assert_eq!(
        h.supervisor.start(9).await.unwrap(),
        StartOutcome::Refused(StartRefusal::DeadlinePassed)
    );

    seed_contract(&h.store, 10, "M10", 1_000_000.0, ChronoDuration::hours(1));
    assert_eq!(
        h.supervisor.start(10).await.unwrap(),
        StartOutcome::Refused(StartRefusal::NoSigners)
    );
}

#[tokio::test]
async fn command_surface_reports_machine_readable_codes() {
    let h = harness(100.0);
    let commands = CommandSurface::new(Arc::clone(&h.supervisor));

    let missing = commands.start(999).await;
    assert!(!missing.ok);
    assert_eq!(missing.reason, "not_found");

    let idle_stop = commands.stop(999).await;
    assert!(idle_stop.ok);
    assert_eq!(idle_stop.reason, "not_active");

    seed_contract(&h.store, 11, "M11", 1_000_000.0, ChronoDuration::hours(1));
    seed_signer(&h.store, 11, "A", 1000.0).await;
    let started = commands.start(11).await;
    assert!(started.ok);
    assert_eq!(started.reason, "started");
    assert_eq!(started.streams.len(), 1);
    assert_eq!(started.streams[0].contract_id, 11);

    let health = commands.health().await;
    assert!(health.ready);
    assert_eq!(health.active_streams, 1);
}

#[tokio::test]
async fn completed_contracts_never_change_again() {
    let h = harness(100.0);
    seed_contract(&h.store, 12, "M12", 1_000_000.0, ChronoDuration::hours(1));
    seed_signer(&h.store, 12, "A", 1000.0).await;

    assert_eq!(h.supervisor.start(12).await.unwrap(), StartOutcome::Started);
    h.feed.emit("M12", trade("M12", "A", 50_000.0, 1000.0));
    wait_until("completion", || async {
        h.store.get_contract(12).await.unwrap().is_completed
    })
    .await;

    let before = h.store.get_contract(12).await.unwrap();
    let score_before = h.store.get_user("A").await.unwrap().score;

    // The stream is gone; a fresh start is refused and nothing is rewritten.
    assert_eq!(
        h.supervisor.start(12).await.unwrap(),
        StartOutcome::Refused(StartRefusal::AlreadyCompleted)
    );

    let after = h.store.get_contract(12).await.unwrap();
    assert_eq!(after.completed_at, before.completed_at);
    assert_eq!(after.completion_reason, before.completion_reason);
    assert_eq!(h.store.get_user("A").await.unwrap().score, score_before);
}
