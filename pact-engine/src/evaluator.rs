use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use pact_common::error::{AppError, ErrorKind};
use pact_common::models::{CompletionReason, TradeEvent, UserContractStatus};
use pact_common::oracle::{BalanceOracle, PriceOracle};
use pact_common::store::ContractStore;
use pact_common::websocket::FeedMessage;

use crate::resolution::{self, retried};
use crate::scoring::ScoringEngine;

/// Everything one stream's evaluator task owns.
pub struct EvaluatorContext {
    pub contract_id: i64,
    pub mint: String,
    pub condition1: f64,
    pub condition2: DateTime<Utc>,
    pub signers: HashSet<String>,
    pub ath_market_cap_sol: Arc<RwLock<f64>>,
    pub store: Arc<dyn ContractStore>,
    pub price_oracle: Arc<dyn PriceOracle>,
    pub balance_oracle: Arc<dyn BalanceOracle>,
    pub scoring: Arc<ScoringEngine>,
    pub events: broadcast::Receiver<FeedMessage>,
    pub stop_rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub enum EvalExit {
    Completed(CompletionReason),
    Stopped,
    FeedLost,
    Failed(AppError),
}

impl EvalExit {
    pub fn describe(&self) -> &'static str {
        match self {
            EvalExit::Completed(CompletionReason::MarketCap) => "completed_market_cap",
            EvalExit::Completed(CompletionReason::TimeExpired) => "completed_time_expired",
            EvalExit::Completed(CompletionReason::AllBroken) => "completed_all_broken",
            EvalExit::Completed(CompletionReason::Manual) => "completed_manual",
            EvalExit::Stopped => "stopped",
            EvalExit::FeedLost => "feed_lost",
            EvalExit::Failed(_) => "failed",
        }
    }
}

enum StepOutcome {
    Continue,
    Completed(CompletionReason),
}

pub async fn run_evaluator(ctx: EvaluatorContext) -> EvalExit {
    let EvaluatorContext {
        contract_id,
        mint,
        condition1,
        condition2,
        signers,
        ath_market_cap_sol,
        store,
        price_oracle,
        balance_oracle,
        scoring,
        mut events,
        mut stop_rx,
    } = ctx;

    let mut worker = StreamWorker {
        contract_id,
        mint,
        condition1,
        condition2,
        signers,
        ath: ath_market_cap_sol,
        store,
        price_oracle,
        balance_oracle,
        scoring,
        last_price_usd: None,
        lagged_events: 0,
    };

    let until_deadline = (worker.condition2 - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let deadline = tokio::time::sleep(until_deadline);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            // Stop wins over everything; the deadline arm only runs when no
            // event is ready, so a late surge of trades is still evaluated
            // (and a market-cap hit in the same tick beats the deadline).
            biased;

            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    debug!(contract_id = worker.contract_id, "evaluator received stop signal");
                    return EvalExit::Stopped;
                }
            }

            message = events.recv() => match message {
                Ok(FeedMessage::Trade(event)) => match worker.process_event(event).await {
                    Ok(StepOutcome::Continue) => {}
                    Ok(StepOutcome::Completed(reason)) => return EvalExit::Completed(reason),
                    Err(e) => {
                        error!(
                            contract_id = worker.contract_id,
                            "evaluator stopping on unrecoverable error: {}", e
                        );
                        return EvalExit::Failed(e);
                    }
                },
                Ok(FeedMessage::Fatal) => {
                    warn!(
                        contract_id = worker.contract_id,
                        "upstream feed lost for good; stopping stream"
                    );
                    return EvalExit::FeedLost;
                }
                Err(broadcast::error::RecvError::Lagged(lost)) => {
                    worker.lagged_events += lost;
                    warn!(
                        contract_id = worker.contract_id,
                        lost,
                        total_lost = worker.lagged_events,
                        "event buffer overflowed; oldest events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return EvalExit::FeedLost,
            },

            _ = &mut deadline => {
                info!(contract_id = worker.contract_id, "deadline reached with no event in flight");
                match worker.close_time_expired().await {
                    Ok(_) => return EvalExit::Completed(CompletionReason::TimeExpired),
                    Err(e) => return EvalExit::Failed(e),
                }
            }
        }
    }
}

struct StreamWorker {
    contract_id: i64,
    mint: String,
    condition1: f64,
    condition2: DateTime<Utc>,
    signers: HashSet<String>,
    ath: Arc<RwLock<f64>>,
    store: Arc<dyn ContractStore>,
    price_oracle: Arc<dyn PriceOracle>,
    balance_oracle: Arc<dyn BalanceOracle>,
    scoring: Arc<ScoringEngine>,
    last_price_usd: Option<f64>,
    lagged_events: u64,
}

impl StreamWorker {
    async fn process_event(&mut self, event: TradeEvent) -> Result<StepOutcome, AppError> {
        let now = Utc::now();

        // Deadline is evaluated on ingress only, before the ATH update; a
        // deadline that elapses mid-event loses to a market-cap completion
        // in the same tick.
        if now >= self.condition2 {
            self.close_time_expired().await?;
            return Ok(StepOutcome::Completed(CompletionReason::TimeExpired));
        }

        let ath = {
            let mut ath = self.ath.write();
            *ath = ath.max(event.market_cap_sol);
            *ath
        };

        let price = match retried("sol price", || self.price_oracle.sol_price_usd()).await {
            Ok(price) => price,
            Err(e) if e.is_transient() => {
                warn!(
                    contract_id = self.contract_id,
                    "price unavailable; dropping event: {}", e
                );
                return Ok(StepOutcome::Continue);
            }
            Err(e) => return Err(e),
        };
        self.last_price_usd = Some(price);

        let ath_usd = ath * price;
        if ath_usd >= self.condition1 {
            info!(
                contract_id = self.contract_id,
                ath_usd, target = self.condition1, "market-cap target reached"
            );
            resolution::complete_market_cap(
                self.store.as_ref(),
                &self.scoring,
                self.contract_id,
                self.condition1,
                ath_usd,
                now,
            )
            .await?;
            return Ok(StepOutcome::Completed(CompletionReason::MarketCap));
        }

        if !self.signers.contains(&event.trader_public_key) {
            return Ok(StepOutcome::Continue);
        }

        let row = match retried("load user contract", || {
            self.store
                .get_user_contract(self.contract_id, &event.trader_public_key)
        })
        .await
        {
            Ok(row) => row,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(
                    contract_id = self.contract_id,
                    trader = %event.trader_public_key,
                    "no user contract for signer; skipping"
                );
                return Ok(StepOutcome::Continue);
            }
            Err(e) if e.is_transient() => {
                warn!(
                    contract_id = self.contract_id,
                    "user contract unavailable; dropping event: {}", e
                );
                return Ok(StepOutcome::Continue);
            }
            Err(e) => return Err(e),
        };

        if row.status != UserContractStatus::InProgress {
            return Ok(StepOutcome::Continue);
        }

        // Holding exactly the committed supply is not a break.
        if event.new_token_balance >= row.supply {
            return Ok(StepOutcome::Continue);
        }

        // The feed balance is the trigger; the oracle confirms against the
        // chain before anything is written.
        let check = match retried("balance check", || {
            self.balance_oracle
                .check_balance(&self.mint, &event.trader_public_key, row.supply)
        })
        .await
        {
            Ok(check) => check,
            Err(e) if e.is_transient() => {
                warn!(
                    contract_id = self.contract_id,
                    "balance oracle unavailable; dropping event: {}", e
                );
                return Ok(StepOutcome::Continue);
            }
            Err(e) => return Err(e),
        };
        if check.has_enough {
            debug!(
                contract_id = self.contract_id,
                trader = %event.trader_public_key,
                "feed balance was stale; signer still holds the supply"
            );
            return Ok(StepOutcome::Continue);
        }

        let transitioned = match retried("mark signer broken", || {
            self.store.update_user_contract_status(
                self.contract_id,
                &event.trader_public_key,
                UserContractStatus::Broken,
            )
        })
        .await
        {
            Ok(transitioned) => transitioned,
            Err(e) if e.is_transient() || e.kind() == ErrorKind::NotFound => {
                warn!(
                    contract_id = self.contract_id,
                    "break write failed; dropping event: {}", e
                );
                return Ok(StepOutcome::Continue);
            }
            Err(e) => return Err(e),
        };
        if !transitioned {
            return Ok(StepOutcome::Continue);
        }
        info!(
            contract_id = self.contract_id,
            user = %event.trader_public_key,
            balance = event.new_token_balance,
            supply = row.supply,
            "signer broke the pact"
        );

        let rows = match retried("list user contracts", || {
            self.store.list_user_contracts(self.contract_id)
        })
        .await
        {
            Ok(rows) => rows,
            Err(e) if e.is_transient() => {
                // The all-broken check re-runs on the next signer event and
                // the deadline still closes the contract regardless.
                warn!(
                    contract_id = self.contract_id,
                    "could not check remaining signers: {}", e
                );
                return Ok(StepOutcome::Continue);
            }
            Err(e) => return Err(e),
        };
        if rows
            .iter()
            .any(|r| r.status == UserContractStatus::InProgress)
        {
            return Ok(StepOutcome::Continue);
        }

        info!(contract_id = self.contract_id, "every signer has broken");
        let ath_usd = self.last_price_usd.map(|price| ath * price);
        resolution::complete_all_broken(
            self.store.as_ref(),
            &self.scoring,
            self.contract_id,
            self.condition1,
            ath_usd,
            now,
        )
        .await?;
        Ok(StepOutcome::Completed(CompletionReason::AllBroken))
    }

    async fn close_time_expired(&mut self) -> Result<bool, AppError> {
        let ath_usd = {
            let ath = *self.ath.read();
            self.last_price_usd.map(|price| ath * price)
        };
        resolution::complete_time_expired(
            self.store.as_ref(),
            &self.scoring,
            self.contract_id,
            self.condition1,
            ath_usd,
            Utc::now(),
        )
        .await
    }
}
