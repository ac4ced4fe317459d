use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pact_common::error::AppError;
use pact_common::event_system::{Event, EventSystem};
use pact_common::models::{ConnectionStatus, HealthReport, StreamSnapshot};
use pact_common::oracle::{BalanceOracle, PriceOracle};
use pact_common::store::ContractStore;
use pact_common::websocket::TradeFeed;

use crate::evaluator::{run_evaluator, EvaluatorContext};
use crate::resolution;
use crate::scoring::ScoringEngine;

const STOP_GRACE: Duration = Duration::from_secs(2);
const RESTART_GAP: Duration = Duration::from_secs(1);
const STAGGER_STEP: Duration = Duration::from_millis(100);
const STAGGER_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
    Refused(StartRefusal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRefusal {
    AlreadyCompleted,
    DeadlinePassed,
    NoSigners,
    MintInUse,
}

impl StartRefusal {
    pub fn code(self) -> &'static str {
        match self {
            StartRefusal::AlreadyCompleted => "contract_completed",
            StartRefusal::DeadlinePassed => "deadline_passed",
            StartRefusal::NoSigners => "no_signers",
            StartRefusal::MintInUse => "mint_in_use",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartAllReport {
    pub scheduled: usize,
    pub reconciled: usize,
}

struct StreamEntry {
    mint: String,
    started_at: DateTime<Utc>,
    condition1: f64,
    condition2: DateTime<Utc>,
    signers: Vec<String>,
    ath: Arc<parking_lot::RwLock<f64>>,
    stop_tx: watch::Sender<bool>,
    /// Taken by the `stop` call that drains the stream; `None` while a stop
    /// is in flight.
    task: Option<JoinHandle<()>>,
}

impl StreamEntry {
    fn snapshot(&self, contract_id: i64) -> StreamSnapshot {
        StreamSnapshot {
            contract_id,
            mint: self.mint.clone(),
            started_at: self.started_at,
            signers: self.signers.clone(),
            condition1: self.condition1,
            condition2: self.condition2,
            ath_market_cap_sol: *self.ath.read(),
        }
    }
}

/// Owns the authoritative `contract_id -> stream` registry. At most one
/// stream per contract and per mint exists at any instant.
pub struct StreamSupervisor {
    store: Arc<dyn ContractStore>,
    feed: Arc<dyn TradeFeed>,
    price_oracle: Arc<dyn PriceOracle>,
    balance_oracle: Arc<dyn BalanceOracle>,
    scoring: Arc<ScoringEngine>,
    event_system: Arc<EventSystem>,
    registry: Arc<RwLock<HashMap<i64, StreamEntry>>>,
    ready: AtomicBool,
    max_retries: u32,
    base_retry_delay: Duration,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamSupervisor {
    pub fn new(
        store: Arc<dyn ContractStore>,
        feed: Arc<dyn TradeFeed>,
        price_oracle: Arc<dyn PriceOracle>,
        balance_oracle: Arc<dyn BalanceOracle>,
        scoring: Arc<ScoringEngine>,
        event_system: Arc<EventSystem>,
        max_retries: u32,
        base_retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            feed,
            price_oracle,
            balance_oracle,
            scoring,
            event_system,
            registry: Arc::new(RwLock::new(HashMap::new())),
            ready: AtomicBool::new(true),
            max_retries,
            base_retry_delay,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Launches a stream for the contract. Refusals are immediate;
    /// transient infrastructure failures retry with exponential backoff,
    /// after which the failure is permanent for this invocation.
    pub async fn start(&self, contract_id: i64) -> Result<StartOutcome, AppError> {
        let mut delays = self.retry_backoff();
        let mut attempt = 1;
        loop {
            match self.try_start(contract_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = delays.next_backoff().unwrap_or(self.base_retry_delay);
                    warn!(
                        contract_id,
                        "start attempt {}/{} failed, retrying in {:?}: {}",
                        attempt,
                        self.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(contract_id, "start failed permanently: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn try_start(&self, contract_id: i64) -> Result<StartOutcome, AppError> {
        {
            let registry = self.registry.read().await;
            if registry.contains_key(&contract_id) {
                return Ok(StartOutcome::AlreadyActive);
            }
        }

        let contract = self.store.get_contract(contract_id).await?;
        if contract.is_completed {
            return Ok(StartOutcome::Refused(StartRefusal::AlreadyCompleted));
        }
        let now = Utc::now();
        if contract.condition2 <= now {
            return Ok(StartOutcome::Refused(StartRefusal::DeadlinePassed));
        }

        let rows = self.store.list_user_contracts(contract_id).await?;
        let signers: HashSet<String> = rows
            .iter()
            .filter(|row| row.status == pact_common::models::UserContractStatus::InProgress)
            .map(|row| row.user_address.clone())
            .collect();
        if signers.is_empty() {
            return Ok(StartOutcome::Refused(StartRefusal::NoSigners));
        }

        let mut registry = self.registry.write().await;
        if registry.contains_key(&contract_id) {
            return Ok(StartOutcome::AlreadyActive);
        }
        if registry.values().any(|entry| entry.mint == contract.mint) {
            return Ok(StartOutcome::Refused(StartRefusal::MintInUse));
        }

        let events = self.feed.subscribe(&contract.mint).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let ath = Arc::new(parking_lot::RwLock::new(0.0f64));
        let ctx = EvaluatorContext {
            contract_id,
            mint: contract.mint.clone(),
            condition1: contract.condition1,
            condition2: contract.condition2,
            signers: signers.clone(),
            ath_market_cap_sol: Arc::clone(&ath),
            store: Arc::clone(&self.store),
            price_oracle: Arc::clone(&self.price_oracle),
            balance_oracle: Arc::clone(&self.balance_oracle),
            scoring: Arc::clone(&self.scoring),
            events,
            stop_rx,
        };

        let registry_handle = Arc::clone(&self.registry);
        let feed = Arc::clone(&self.feed);
        let event_system = Arc::clone(&self.event_system);
        let mint = contract.mint.clone();
        let ath_tag = Arc::clone(&ath);
        let task = tokio::spawn(async move {
            let exit = run_evaluator(ctx).await;
            debug!(contract_id, exit = exit.describe(), "evaluator exited");
            // Deregister only the entry this task belongs to; after a
            // forcible stop the contract id may already carry a successor
            // stream that must not be torn down.
            let owned_entry = {
                let mut registry = registry_handle.write().await;
                let owns = registry
                    .get(&contract_id)
                    .map_or(false, |entry| Arc::ptr_eq(&entry.ath, &ath_tag));
                if owns {
                    registry.remove(&contract_id);
                }
                owns
            };
            if owned_entry {
                if let Err(e) = feed.unsubscribe(&mint).await {
                    warn!(contract_id, "unsubscribe after exit failed: {}", e);
                }
            }
            event_system.handle_stream_stopped(contract_id, exit.describe());
        });

        registry.insert(
            contract_id,
            StreamEntry {
                mint: contract.mint.clone(),
                started_at: now,
                condition1: contract.condition1,
                condition2: contract.condition2,
                signers: signers.into_iter().collect(),
                ath,
                stop_tx,
                task: Some(task),
            },
        );
        info!(contract_id, mint = %contract.mint, "stream started");
        Ok(StartOutcome::Started)
    }

    /// Signals the evaluator, waits up to the grace period, then forcibly
    /// deregisters while cancellation keeps propagating. Idempotent. The
    /// registry entry stays in place for the whole grace window, so a
    /// racing `start` for the same contract sees `AlreadyActive` instead
    /// of spawning a second stream.
    pub async fn stop(&self, contract_id: i64) -> bool {
        let (mint, task) = {
            let mut registry = self.registry.write().await;
            let Some(entry) = registry.get_mut(&contract_id) else {
                return false;
            };
            let _ = entry.stop_tx.send(true);
            match entry.task.take() {
                Some(task) => (entry.mint.clone(), task),
                // Another stop is already draining this stream.
                None => return true,
            }
        };

        match tokio::time::timeout(STOP_GRACE, task).await {
            Ok(_) => debug!(contract_id, "stream stopped"),
            Err(_) => warn!(
                contract_id,
                "evaluator did not stop within {:?}; deregistered", STOP_GRACE
            ),
        }

        // Only tear down the entry this call drained. The evaluator's own
        // exit path usually removed it already, and by now a fresh start
        // may have registered a new stream under the same contract id.
        let removed_stale = {
            let mut registry = self.registry.write().await;
            let stale = registry
                .get(&contract_id)
                .map_or(false, |entry| entry.task.is_none());
            if stale {
                registry.remove(&contract_id);
            }
            stale
        };
        if removed_stale {
            if let Err(e) = self.feed.unsubscribe(&mint).await {
                warn!(contract_id, "unsubscribe on stop failed: {}", e);
            }
        }
        true
    }

    /// Stop followed by a fresh start. The new stream starts over with a
    /// zero all-time-high.
    pub async fn restart(&self, contract_id: i64) -> Result<StartOutcome, AppError> {
        self.stop(contract_id).await;
        tokio::time::sleep(RESTART_GAP).await;
        self.start(contract_id).await
    }

    /// Enumerates pending contracts and starts each in the background with
    /// a capped stagger. Contracts whose deadline already passed are closed
    /// immediately by the reconciliation pass instead of being started.
    pub async fn start_all_pending(self: &Arc<Self>) -> Result<StartAllReport, AppError> {
        let pending = self.store.list_pending_contracts().await?;
        let now = Utc::now();
        let mut report = StartAllReport::default();

        for (index, contract) in pending.into_iter().enumerate() {
            if contract.condition2 <= now {
                match resolution::complete_time_expired(
                    self.store.as_ref(),
                    &self.scoring,
                    contract.id,
                    contract.condition1,
                    None,
                    Utc::now(),
                )
                .await
                {
                    Ok(true) => {
                        info!(contract_id = contract.id, "expired contract reconciled");
                        report.reconciled += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(
                        contract_id = contract.id,
                        "reconciliation failed: {}", e
                    ),
                }
                continue;
            }

            let delay = STAGGER_STEP
                .checked_mul(index as u32)
                .unwrap_or(STAGGER_CAP)
                .min(STAGGER_CAP);
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match supervisor.start(contract.id).await {
                    Ok(StartOutcome::Started) => {}
                    Ok(outcome) => debug!(
                        contract_id = contract.id,
                        ?outcome,
                        "bulk start skipped contract"
                    ),
                    Err(e) => warn!(contract_id = contract.id, "bulk start failed: {}", e),
                }
            });
            report.scheduled += 1;
        }

        info!(
            scheduled = report.scheduled,
            reconciled = report.reconciled,
            "bulk startup pass finished"
        );
        Ok(report)
    }

    pub async fn stop_all(&self) {
        let ids: Vec<i64> = self.registry.read().await.keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        info!("stopping {} active streams", ids.len());
        join_all(ids.into_iter().map(|id| self.stop(id))).await;
    }

    pub async fn list_active(&self) -> Vec<StreamSnapshot> {
        let registry = self.registry.read().await;
        let mut snapshots: Vec<StreamSnapshot> = registry
            .iter()
            .map(|(id, entry)| entry.snapshot(*id))
            .collect();
        snapshots.sort_by_key(|s| s.contract_id);
        snapshots
    }

    pub async fn get(&self, contract_id: i64) -> Option<StreamSnapshot> {
        self.registry
            .read()
            .await
            .get(&contract_id)
            .map(|entry| entry.snapshot(contract_id))
    }

    pub async fn is_active(&self, contract_id: i64) -> bool {
        self.registry.read().await.contains_key(&contract_id)
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            ready: self.ready.load(Ordering::SeqCst),
            active_streams: self.registry.read().await.len(),
            feed: *self.feed.health().borrow(),
        }
    }

    /// Consumes contract lifecycle notifications from the host: new
    /// contracts get a stream in the background, deleted ones are stopped.
    /// Launch failures never reach the originating operation.
    pub fn spawn_event_listener(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut receiver = self.event_system.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(Event::ContractCreated(notification)) => {
                        let Some(supervisor) = weak.upgrade() else { break };
                        let contract_id = notification.data.contract_id;
                        tokio::spawn(async move {
                            match supervisor.start(contract_id).await {
                                Ok(outcome) => {
                                    debug!(contract_id, ?outcome, "auto-start finished")
                                }
                                Err(e) => warn!(contract_id, "auto-start failed: {}", e),
                            }
                        });
                    }
                    Ok(Event::ContractDeleted(notification)) => {
                        let Some(supervisor) = weak.upgrade() else { break };
                        let contract_id = notification.data.contract_id;
                        tokio::spawn(async move {
                            supervisor.stop(contract_id).await;
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.background.lock().push(handle);
    }

    /// Watches the feed client's health channel. A permanent feed failure
    /// stops every stream and drops readiness; individual stream failures
    /// never get here.
    pub fn spawn_feed_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut health = self.feed.health();
        let handle = tokio::spawn(async move {
            while health.changed().await.is_ok() {
                if *health.borrow() != ConnectionStatus::Failed {
                    continue;
                }
                let Some(supervisor) = weak.upgrade() else { break };
                error!("upstream feed failed permanently; stopping all streams");
                supervisor.ready.store(false, Ordering::SeqCst);
                supervisor.stop_all().await;
            }
        });
        self.background.lock().push(handle);
    }

    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.ready.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        self.stop_all().await;
        if let Err(e) = self.feed.shutdown().await {
            warn!("feed shutdown failed: {}", e);
        }
    }

    fn retry_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.base_retry_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}
