//! Score deltas applied to users when a contract closes.
//!
//! The engine is pure: it never touches persistence and the same event
//! always produces the same raw delta. Raw scores are unbounded and are
//! what gets stored; display scores squash the raw value through tanh so
//! the user-facing number saturates near the asymptote limit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub max_buy_amount_for_bonus: f64,
    pub penalty_multiplier: f64,
    pub base_score_multiplier: f64,
    pub asymptote_limit: f64,
    pub asymptote_scaling_factor: f64,
    pub deadline_min_score: f64,
    pub deadline_week_score: f64,
    pub deadline_max_score: f64,
    pub deadline_week_threshold_days: f64,
    pub deadline_max_threshold_days: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_buy_amount_for_bonus: 30_000_000.0,
            penalty_multiplier: 2.0,
            base_score_multiplier: 0.000003,
            asymptote_limit: 1_000_000.0,
            asymptote_scaling_factor: 1_000_000.0,
            deadline_min_score: 0.0,
            deadline_week_score: 1.0,
            deadline_max_score: 25.0,
            deadline_week_threshold_days: 7.0,
            deadline_max_threshold_days: 180.0,
        }
    }
}

/// Which winning condition a user's terminal transition is scored against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBasis {
    /// The market-cap target: bonus for holders, penalty for breakers.
    MarketCap,
    /// The deadline: a holding-age bonus, everything else ignored.
    Deadline,
}

#[derive(Debug, Clone)]
pub struct ScoreEvent {
    pub contract_respected: bool,
    pub buy_amount: f64,
    pub diff_with_condition: f64,
    pub basis: ScoreBasis,
    pub signed_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreOutcome {
    pub raw_delta: f64,
    pub new_raw_score: f64,
    pub display_score: f64,
}

#[derive(Debug, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn apply(&self, event: &ScoreEvent, current_raw: f64) -> ScoreOutcome {
        let raw_delta = match event.basis {
            ScoreBasis::Deadline => self.holding_age_score(event.signed_at, event.closed_at),
            ScoreBasis::MarketCap => {
                let capped = event
                    .buy_amount
                    .clamp(0.0, self.config.max_buy_amount_for_bonus);
                let base = capped * self.config.base_score_multiplier;
                // diff is clamped at -100 upstream; the extra max keeps the
                // penalty from ever flipping sign.
                let multiplier = (1.0 + event.diff_with_condition / 100.0).max(0.0);
                let unsigned = base * multiplier;
                if event.contract_respected {
                    unsigned
                } else {
                    -self.config.penalty_multiplier * unsigned
                }
            }
        };

        let new_raw_score = current_raw + raw_delta;
        ScoreOutcome {
            raw_delta,
            new_raw_score,
            display_score: self.display_score(new_raw_score),
        }
    }

    pub fn display_score(&self, raw: f64) -> f64 {
        (raw / self.config.asymptote_scaling_factor).tanh() * self.config.asymptote_limit
    }

    fn holding_age_score(&self, signed_at: DateTime<Utc>, closed_at: DateTime<Utc>) -> f64 {
        let days = (closed_at - signed_at).num_milliseconds() as f64 / 86_400_000.0;
        let cfg = &self.config;
        if days < cfg.deadline_week_threshold_days {
            cfg.deadline_min_score
        } else if days >= cfg.deadline_max_threshold_days {
            cfg.deadline_max_score
        } else {
            cfg.deadline_week_score
                + (days - cfg.deadline_week_threshold_days)
                    * (cfg.deadline_max_score - cfg.deadline_week_score)
                    / (cfg.deadline_max_threshold_days - cfg.deadline_week_threshold_days)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn engine() -> ScoringEngine {
        ScoringEngine::default()
    }

    fn market_cap_event(respected: bool, buy_amount: f64, diff: f64) -> ScoreEvent {
        let now = Utc::now();
        ScoreEvent {
            contract_respected: respected,
            buy_amount,
            diff_with_condition: diff,
            basis: ScoreBasis::MarketCap,
            signed_at: now,
            closed_at: now,
        }
    }

    fn deadline_event(age_days: i64, extra_ms: i64) -> ScoreEvent {
        let closed_at = Utc::now();
        ScoreEvent {
            contract_respected: true,
            buy_amount: 0.0,
            diff_with_condition: 0.0,
            basis: ScoreBasis::Deadline,
            signed_at: closed_at - Duration::days(age_days) - Duration::milliseconds(extra_ms),
            closed_at,
        }
    }

    #[test]
    fn holding_bonus_is_zero_under_a_week() {
        let outcome = engine().apply(&deadline_event(6, 0), 0.0);
        assert_eq!(outcome.raw_delta, 0.0);
    }

    #[test]
    fn holding_bonus_at_exactly_a_week_is_one() {
        let outcome = engine().apply(&deadline_event(7, 0), 0.0);
        assert_eq!(outcome.raw_delta, 1.0);
    }

    #[test]
    fn holding_bonus_saturates_at_max_age() {
        assert_eq!(engine().apply(&deadline_event(180, 0), 0.0).raw_delta, 25.0);
        assert_eq!(engine().apply(&deadline_event(400, 0), 0.0).raw_delta, 25.0);
    }

    #[test]
    fn holding_bonus_interpolates_between_thresholds() {
        // 86.5 days past the week threshold is half the 173-day ramp.
        let outcome = engine().apply(&deadline_event(93, 43_200_000), 0.0);
        assert!((outcome.raw_delta - 13.0).abs() < 1e-9);
    }

    #[test]
    fn buy_amount_is_capped_at_the_bonus_ceiling() {
        let at_cap = engine().apply(&market_cap_event(true, 30_000_000.0, 0.0), 0.0);
        let over_cap = engine().apply(&market_cap_event(true, 45_000_000.0, 0.0), 0.0);
        assert!((at_cap.raw_delta - 90.0).abs() < 1e-9);
        assert_eq!(at_cap.raw_delta, over_cap.raw_delta);
    }

    #[test]
    fn negative_buy_amount_scores_nothing() {
        let outcome = engine().apply(&market_cap_event(true, -5.0, 40.0), 0.0);
        assert_eq!(outcome.raw_delta, 0.0);
    }

    #[test]
    fn breaking_doubles_the_loss() {
        let won = engine().apply(&market_cap_event(true, 1000.0, 20.0), 0.0);
        let broke = engine().apply(&market_cap_event(false, 1000.0, 20.0), 0.0);
        assert!(won.raw_delta > 0.0);
        assert!((broke.raw_delta + 2.0 * won.raw_delta).abs() < 1e-12);
    }

    #[test]
    fn deep_underwater_diff_cannot_flip_the_penalty_sign() {
        let outcome = engine().apply(&market_cap_event(false, 1000.0, -100.0), 0.0);
        assert_eq!(outcome.raw_delta, 0.0);
    }

    #[test]
    fn display_score_saturates_near_the_limit() {
        let e = engine();
        assert_eq!(e.display_score(0.0), 0.0);
        let display = e.display_score(10_000_000.0);
        assert!(display < 1_000_000.0);
        assert!(display > 999_999.0);
        let negative = e.display_score(-10_000_000.0);
        assert!(negative > -1_000_000.0);
        assert!(negative < -999_999.0);
    }

    #[test]
    fn display_is_monotone_in_raw() {
        let e = engine();
        let mut last = f64::NEG_INFINITY;
        for raw in [-2_000_000.0, -1.0, 0.0, 0.5, 250_000.0, 5_000_000.0] {
            let display = e.display_score(raw);
            assert!(display > last);
            last = display;
        }
    }

    #[test]
    fn replaying_the_same_event_yields_the_same_raw_delta() {
        let e = engine();
        let event = market_cap_event(true, 12_345.0, 17.5);
        let first = e.apply(&event, 0.0);
        let replay = e.apply(&event, first.new_raw_score);
        assert_eq!(first.raw_delta, replay.raw_delta);
    }
}
