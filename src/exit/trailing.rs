// =============================================================================
// Trailing / Exit Engine — R-based stop management per 15-minute slot
// =============================================================================
//
// Every closed 1m candle updates the position's maximum favourable excursion
// (MFE). A decision is taken at most once per 15-minute slot, in this order,
// first match wins (progress measured as MFE distance from entry in R):
//
//   1. Time-stop  : open for >= N bars of 15m and progress < min R  -> Close
//   2. Breakeven  : progress >= BE trigger     -> SL = entry +/- offset*R
//   3. Partial    : progress >= partial trigger -> close a fraction once
//   4. Lock profit: progress >= lock trigger   -> SL = entry +/- offset*R
//
// Stop moves only apply when they tighten the stop by at least 0.10R, so a
// candidate barely better than the current stop does not churn orders.
//
// A slot that produced no action is NOT recorded: later candles in the same
// slot are evaluated again until something fires.
//
// Trend flips on the higher timeframe are deliberately not an input here;
// an open position is managed on price and R alone.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::risk::{round_down_to_tick, round_up_to_tick};
use crate::settings::TrailingConfig;
use crate::types::{position_key, PosSide};

// =============================================================================
// Constants
// =============================================================================

/// Decision slot length.
pub const SLOT_SECS: i64 = 900;

/// Minimum stop improvement, in R, for a move to be worth an order.
pub const MIN_IMPROVE_R: f64 = 0.10;

/// Minimum gap between two executed trailing actions on one position.
pub const MIN_ACTION_GAP_SECS: i64 = 60;

/// Tolerance on R comparisons so an exact trigger is not lost to float noise.
const R_EPS: f64 = 1e-9;

/// Start of the 15-minute slot containing `t`.
pub fn trail_slot(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp().div_euclid(SLOT_SECS) * SLOT_SECS;
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(t)
}

// =============================================================================
// Decision
// =============================================================================

/// Which progress flag a stop move satisfies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopStage {
    Breakeven,
    LockProfit,
}

impl std::fmt::Display for StopStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Breakeven => write!(f, "BE"),
            Self::LockProfit => write!(f, "LOCK"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrailDecision {
    NoOp,
    MoveSl {
        new_sl: f64,
        stage: StopStage,
        reason: String,
    },
    PartialClose {
        size: f64,
        reason: String,
    },
    Close {
        reason: String,
    },
}

impl TrailDecision {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::NoOp => "",
            Self::MoveSl { reason, .. } | Self::PartialClose { reason, .. } | Self::Close { reason } => {
                reason
            }
        }
    }
}

// =============================================================================
// PositionTrailState — per-position trailing state
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionTrailState {
    pub inst_id: String,
    pub pos_side: PosSide,
    /// Average entry price (synced from the position cache).
    pub entry: f64,
    /// Current stop-loss trigger price.
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Initial |entry - SL|. Stays fixed as the stop moves.
    pub risk_distance: f64,
    pub tick_size: f64,
    /// Exchange id of the live stop order. Replaced only once a new stop is
    /// confirmed.
    pub sl_algo_id: String,
    /// The stop behind `sl_algo_id` was cancelled but its replacement has not
    /// been placed yet: the position is unprotected.
    #[serde(default)]
    pub stop_cancelled: bool,
    pub tp_algo_id: Option<String>,
    /// Remaining size in contracts.
    pub size: f64,
    /// Best price reached in the position's favour.
    pub mfe: f64,

    pub moved_to_be: bool,
    pub locked_profit: bool,
    pub took_partial: bool,

    pub opened_at: DateTime<Utc>,
    /// Candle end of the last executed action.
    pub last_trail_at: Option<DateTime<Utc>>,
    /// Slot of the last actionable decision.
    pub last_slot: Option<DateTime<Utc>>,
}

impl PositionTrailState {
    pub fn key(&self) -> String {
        position_key(&self.inst_id, self.pos_side)
    }

    /// Fold a candle's range into the MFE.
    pub fn update_mfe(&mut self, high: f64, low: f64) {
        match self.pos_side {
            PosSide::Long => {
                if high > 0.0 && high > self.mfe {
                    self.mfe = high;
                }
            }
            PosSide::Short => {
                if low > 0.0 && (self.mfe <= 0.0 || low < self.mfe) {
                    self.mfe = low;
                }
            }
        }
    }

    /// Favourable excursion in R units.
    pub fn mfe_r(&self) -> f64 {
        if self.risk_distance <= 0.0 {
            return 0.0;
        }
        (self.mfe - self.entry) * self.pos_side.sign() / self.risk_distance
    }

    /// Signed offset from entry in R units.
    fn at_r(&self, offset_r: f64) -> f64 {
        self.entry + self.pos_side.sign() * offset_r * self.risk_distance
    }

    /// Candidate tightens the stop by at least `MIN_IMPROVE_R`.
    fn improves_enough(&self, candidate: f64) -> bool {
        let gain = (candidate - self.stop_loss) * self.pos_side.sign();
        gain > 0.0 && gain + R_EPS >= MIN_IMPROVE_R * self.risk_distance
    }

    /// Round a new stop toward the market (up for longs, down for shorts).
    fn round_new_stop(&self, px: f64) -> f64 {
        match self.pos_side {
            PosSide::Long => round_up_to_tick(px, self.tick_size),
            PosSide::Short => round_down_to_tick(px, self.tick_size),
        }
    }

    /// An action was executed less than a minute before `candle_end`.
    pub fn rate_limited(&self, candle_end: DateTime<Utc>) -> bool {
        self.last_trail_at
            .is_some_and(|t| candle_end - t < Duration::seconds(MIN_ACTION_GAP_SECS))
    }

    /// Decide what to do for the slot containing `slot_end`. Does not mutate;
    /// see [`commit`](Self::commit).
    pub fn decide(&self, cfg: &TrailingConfig, slot_end: DateTime<Utc>) -> TrailDecision {
        let r = self.risk_distance;
        if r <= 0.0 || self.entry <= 0.0 || self.stop_loss <= 0.0 {
            return TrailDecision::NoOp;
        }

        let slot = trail_slot(slot_end);
        if self.last_slot == Some(slot) {
            return TrailDecision::NoOp;
        }

        let mfe_r = self.mfe_r();

        // ── 1. Time-stop ─────────────────────────────────────────────
        if cfg.time_stop_bars > 0 && cfg.time_stop_min_mfe_r > 0.0 {
            let max_age = Duration::seconds(cfg.time_stop_bars as i64 * SLOT_SECS);
            if slot_end - self.opened_at >= max_age && mfe_r < cfg.time_stop_min_mfe_r {
                return TrailDecision::Close {
                    reason: format!(
                        "TIME_STOP {} bars, mfe {:.2}R < {:.2}R",
                        cfg.time_stop_bars, mfe_r, cfg.time_stop_min_mfe_r
                    ),
                };
            }
        }

        // ── 2. Breakeven ─────────────────────────────────────────────
        if !self.moved_to_be && mfe_r + R_EPS >= cfg.be_trigger_r {
            let cand = self.at_r(cfg.be_offset_r);
            if self.improves_enough(cand) {
                return TrailDecision::MoveSl {
                    new_sl: self.round_new_stop(cand),
                    stage: StopStage::Breakeven,
                    reason: format!("BE@{:.2}R{:+.2}R", cfg.be_trigger_r, cfg.be_offset_r),
                };
            }
        }

        // ── 3. Partial take ──────────────────────────────────────────
        if cfg.partial_enabled
            && !self.took_partial
            && self.size > 0.0
            && mfe_r + R_EPS >= cfg.partial_trigger_r
        {
            let size = self.size * cfg.partial_close_frac;
            if size > 0.0 {
                return TrailDecision::PartialClose {
                    size,
                    reason: format!(
                        "PARTIAL@{:.2}R ({:.0}%)",
                        cfg.partial_trigger_r,
                        cfg.partial_close_frac * 100.0
                    ),
                };
            }
        }

        // ── 4. Lock profit ───────────────────────────────────────────
        if !self.locked_profit && mfe_r + R_EPS >= cfg.lock_trigger_r {
            let cand = self.at_r(cfg.lock_offset_r);
            if self.improves_enough(cand) {
                return TrailDecision::MoveSl {
                    new_sl: self.round_new_stop(cand),
                    stage: StopStage::LockProfit,
                    reason: format!("LOCK@{:.2}R->{:.2}R", cfg.lock_trigger_r, cfg.lock_offset_r),
                };
            }
        }

        TrailDecision::NoOp
    }

    /// Record an actionable decision: set its progress flag and mark the slot
    /// as evaluated. A NoOp records nothing.
    pub fn commit(&mut self, decision: &TrailDecision, slot_end: DateTime<Utc>) {
        match decision {
            TrailDecision::NoOp => return,
            TrailDecision::MoveSl { stage, .. } => match stage {
                StopStage::Breakeven => self.moved_to_be = true,
                StopStage::LockProfit => self.locked_profit = true,
            },
            TrailDecision::PartialClose { .. } => self.took_partial = true,
            TrailDecision::Close { .. } => {}
        }
        self.last_slot = Some(trail_slot(slot_end));
    }

    /// Decide and commit in one step.
    pub fn evaluate(&mut self, cfg: &TrailingConfig, slot_end: DateTime<Utc>) -> TrailDecision {
        let d = self.decide(cfg, slot_end);
        self.commit(&d, slot_end);
        d
    }
}
