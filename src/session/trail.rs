// =============================================================================
// Trailing executor — applies trailing decisions to live positions
// =============================================================================
//
// Fed with closed 1-minute candles. For each cached position with a trail
// state the executor syncs size/entry from the cache, folds the candle into
// the MFE, asks the trailing engine for a decision and executes it.
//
// A decision is committed (progress flag + slot) only after its orders went
// through. A failed attempt records `last_trail_at` so the 60 s spacing
// throttles retries.
//
// Stop replacement is cancel-then-place. Between the two the position has no
// stop; if placement fails the state keeps the old id with
// `stop_cancelled = true` and an unprotected-window event is raised.
// =============================================================================

use tracing::{debug, error, info, warn};

use super::{KeyGuard, Session, PARTIAL_NOTICE_EVERY, TRAIL_NOTICE_EVERY};
use crate::exit::{PositionTrailState, TrailDecision};
use crate::types::{normalize_timeframe, CandleTick, ExchangePosition, PosSide};

/// What one trailing pass did.
#[derive(Debug, Clone, PartialEq)]
pub enum TrailOutcome {
    /// No trail state, another pass in flight, or rate limited.
    Skipped,
    NoOp,
    Executed(TrailDecision),
    Failed(TrailDecision),
}

impl Session {
    /// Evaluate trailing for both sides of the candle's instrument. Only
    /// 1-minute candles are considered.
    pub async fn on_candle_close(&self, candle: &CandleTick) -> Vec<TrailOutcome> {
        if normalize_timeframe(&candle.timeframe) != "1m" || self.cancel.is_cancelled() {
            return Vec::new();
        }

        let cached: Vec<ExchangePosition> = {
            let positions = self.positions.read();
            [PosSide::Long, PosSide::Short]
                .iter()
                .filter_map(|side| {
                    positions
                        .get(&crate::types::position_key(&candle.inst_id, *side))
                        .cloned()
                })
                .collect()
        };

        let mut out = Vec::with_capacity(cached.len());
        for pos in cached {
            out.push(self.trail_one(candle, &pos).await);
        }
        out
    }

    /// One trailing pass for one position.
    pub async fn trail_one(&self, candle: &CandleTick, cached: &ExchangePosition) -> TrailOutcome {
        let key = cached.key();
        let Some(_busy) = KeyGuard::claim(&self.trail_busy, &key) else {
            return TrailOutcome::Skipped;
        };
        let cfg = self.settings.read().trailing.clone();

        // ── Sync, MFE, decide (under the lock, no awaits) ────────────────
        let (decision, snapshot) = {
            let mut trails = self.trails.lock();
            let Some(st) = trails.get_mut(&key) else {
                return TrailOutcome::Skipped;
            };
            if st.sl_algo_id.is_empty() || st.risk_distance <= 0.0 {
                return TrailOutcome::Skipped;
            }
            if cached.size > 0.0 {
                st.size = cached.size;
            }
            if cached.entry_price > 0.0 {
                st.entry = cached.entry_price;
            }
            st.update_mfe(candle.high, candle.low);

            let decision = st.decide(&cfg, candle.end);
            if decision.is_noop() {
                return TrailOutcome::NoOp;
            }
            if st.rate_limited(candle.end) {
                debug!(account = %self.account_id, key = %key, "trailing action rate limited");
                return TrailOutcome::Skipped;
            }
            (decision, st.clone())
        };

        info!(
            account = %self.account_id,
            inst = %snapshot.inst_id,
            pos_side = %snapshot.pos_side,
            mfe_r = snapshot.mfe_r(),
            reason = decision.reason(),
            "trailing decision"
        );

        match &decision {
            TrailDecision::PartialClose { size, reason } => {
                self.execute_partial(candle, &snapshot, &decision, *size, reason)
                    .await
            }
            TrailDecision::Close { reason } => {
                self.execute_close(candle, &snapshot, &decision, reason).await
            }
            TrailDecision::MoveSl { new_sl, reason, .. } => {
                self.execute_move_sl(candle, &snapshot, &decision, *new_sl, reason)
                    .await
            }
            TrailDecision::NoOp => TrailOutcome::NoOp,
        }
    }

    async fn execute_partial(
        &self,
        candle: &CandleTick,
        st: &PositionTrailState,
        decision: &TrailDecision,
        size: f64,
        reason: &str,
    ) -> TrailOutcome {
        let key = st.key();
        if let Err(e) = self.gateway.close_market(&st.inst_id, st.pos_side, size).await {
            error!(account = %self.account_id, key = %key, size, error = %e, "partial close failed");
            self.mark_attempt(&key, candle);
            self.notify(&format!("[{}] partial close failed: {e}", st.inst_id)).await;
            return TrailOutcome::Failed(decision.clone());
        }

        let exhausted = {
            let mut trails = self.trails.lock();
            let exhausted = match trails.get_mut(&key) {
                Some(live) => {
                    live.commit(decision, candle.end);
                    live.last_trail_at = Some(candle.end);
                    if live.size > size {
                        live.size -= size;
                        false
                    } else {
                        true
                    }
                }
                None => false,
            };
            if exhausted {
                trails.remove(&key);
            }
            exhausted
        };
        {
            let mut positions = self.positions.write();
            let emptied = match positions.get_mut(&key) {
                Some(p) => {
                    p.size = (p.size - size).max(0.0);
                    p.size <= 0.0
                }
                None => false,
            };
            if exhausted || emptied {
                positions.remove(&key);
            }
        }

        info!(account = %self.account_id, key = %key, closed = size, "partial close executed");
        if self.throttle.can_send(
            &self.account_id,
            &format!("partial:{}:{}", st.inst_id, st.pos_side),
            PARTIAL_NOTICE_EVERY,
        ) {
            self.notify(&format!(
                "[{}] partial take ({}) closed={size:.4} | {reason}",
                st.inst_id, st.pos_side
            ))
            .await;
        }
        TrailOutcome::Executed(decision.clone())
    }

    async fn execute_close(
        &self,
        candle: &CandleTick,
        st: &PositionTrailState,
        decision: &TrailDecision,
        reason: &str,
    ) -> TrailOutcome {
        let key = st.key();
        if let Err(e) = self.gateway.close_market(&st.inst_id, st.pos_side, st.size).await {
            error!(account = %self.account_id, key = %key, error = %e, "time-stop close failed");
            self.mark_attempt(&key, candle);
            self.notify(&format!("[{}] close failed: {e}", st.inst_id)).await;
            return TrailOutcome::Failed(decision.clone());
        }

        self.trails.lock().remove(&key);
        self.positions.write().remove(&key);

        info!(account = %self.account_id, key = %key, reason, "position closed by trailing");
        self.notify(&format!(
            "[{}] position closed ({}) | reason={reason}",
            st.inst_id, st.pos_side
        ))
        .await;
        TrailOutcome::Executed(decision.clone())
    }

    async fn execute_move_sl(
        &self,
        candle: &CandleTick,
        st: &PositionTrailState,
        decision: &TrailDecision,
        new_sl: f64,
        reason: &str,
    ) -> TrailOutcome {
        let key = st.key();

        // ── Cancel the live stop (skipped if a previous attempt already did) ─
        if !st.stop_cancelled {
            if let Err(e) = self
                .gateway
                .cancel_conditional_order(&st.inst_id, &st.sl_algo_id)
                .await
            {
                warn!(
                    account = %self.account_id,
                    key = %key,
                    algo_id = %st.sl_algo_id,
                    error = %e,
                    "stop cancel failed, keeping current stop"
                );
                self.mark_attempt(&key, candle);
                return TrailOutcome::Failed(decision.clone());
            }
            if let Some(live) = self.trails.lock().get_mut(&key) {
                live.stop_cancelled = true;
            }
        }

        // ── Place the replacement ────────────────────────────────────────
        match self
            .gateway
            .place_conditional_order(&st.inst_id, st.pos_side, st.size, new_sl, false)
            .await
        {
            Ok(algo_id) => {
                if let Some(live) = self.trails.lock().get_mut(&key) {
                    live.commit(decision, candle.end);
                    live.stop_loss = new_sl;
                    live.sl_algo_id = algo_id.clone();
                    live.stop_cancelled = false;
                    live.last_trail_at = Some(candle.end);
                }
                info!(account = %self.account_id, key = %key, new_sl, algo_id = %algo_id, "stop moved");
                if self.throttle.can_send(
                    &self.account_id,
                    &format!("trail:{}:{}", st.inst_id, st.pos_side),
                    TRAIL_NOTICE_EVERY,
                ) {
                    self.notify(&format!(
                        "[{}] SL updated ({}) -> {new_sl:.6} | {reason}",
                        st.inst_id, st.pos_side
                    ))
                    .await;
                }
                TrailOutcome::Executed(decision.clone())
            }
            Err(e) => {
                error!(
                    account = %self.account_id,
                    key = %key,
                    unprotected = true,
                    old_algo_id = %st.sl_algo_id,
                    new_sl,
                    error = %e,
                    "stop cancelled but replacement failed"
                );
                self.mark_attempt(&key, candle);
                self.notify(&format!(
                    "[{}] UNPROTECTED: stop cancelled but new stop at {new_sl:.6} failed: {e}",
                    st.inst_id
                ))
                .await;
                TrailOutcome::Failed(decision.clone())
            }
        }
    }

    fn mark_attempt(&self, key: &str, candle: &CandleTick) {
        if let Some(live) = self.trails.lock().get_mut(key) {
            live.last_trail_at = Some(candle.end);
        }
    }
}
