// =============================================================================
// Confirm worker — serialised signal -> entry workflow for one account
// =============================================================================
//
//   cooldown / dedup -> pending -> open-position limit -> confirmation
//     -> sizing -> market entry -> stop + target -> trail registration
//
// The pending claim is released on every exit path. Once the entry has been
// filled the protective orders are always attempted, even if the session is
// being disabled; failures there are reported, never rolled back.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{KeyGuard, Session, LIMIT_NOTICE_EVERY};
use crate::error::Result;
use crate::exit::PositionTrailState;
use crate::notifier::ConfirmOutcome;
use crate::risk::size_for_signal;
use crate::settings::TradingSettings;
use crate::types::{position_key, ExchangePosition, PosSide, Signal, TradeParams};

/// Why a signal did not lead to an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    NoSide,
    Cooldown,
    /// Another workflow or a tracked position already covers the instrument.
    Duplicate,
    MaxOpenPositions,
    Declined,
    TimedOut,
    Sizing(String),
    Entry(String),
}

/// Result of one pass through the workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Dropped(DropReason),
    Opened {
        params: TradeParams,
        order_id: String,
        sl_algo_id: Option<String>,
        tp_algo_id: Option<String>,
    },
    /// The session was disabled before the entry was placed.
    Cancelled,
}

impl Session {
    /// Drain the queue until it is closed or the session is cancelled.
    pub(crate) async fn run_confirm_worker(self: Arc<Self>) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                s = self.queue.recv() => s,
            };
            let Some(signal) = next else { break };

            debug!(
                account = %self.account_id,
                inst = %signal.inst_id,
                side = %signal.side,
                tf = %signal.timeframe,
                "signal dequeued"
            );
            let outcome = self.handle_signal(signal).await;
            debug!(account = %self.account_id, ?outcome, "signal workflow finished");
        }
        debug!(account = %self.account_id, "confirm worker exited");
    }

    /// Run the full workflow for one signal.
    pub async fn handle_signal(&self, signal: Signal) -> SignalOutcome {
        let inst = signal.inst_id.clone();
        let Some(pos_side) = PosSide::from_entry(signal.side) else {
            return SignalOutcome::Dropped(DropReason::NoSide);
        };

        // ── 0. Cooldown, dedup, pending ──────────────────────────────────
        if self.in_cooldown(&inst) {
            info!(account = %self.account_id, inst = %inst, "signal skipped: cooldown");
            return SignalOutcome::Dropped(DropReason::Cooldown);
        }
        if self.is_tracked(&inst) {
            debug!(account = %self.account_id, inst = %inst, "signal skipped: position already tracked");
            return SignalOutcome::Dropped(DropReason::Duplicate);
        }
        let Some(_pending) = KeyGuard::claim(&self.pending, &inst) else {
            debug!(account = %self.account_id, inst = %inst, "signal skipped: workflow pending");
            return SignalOutcome::Dropped(DropReason::Duplicate);
        };

        let settings = self.settings();
        let ts = &settings.trading;

        // ── 1. Open-position limit ───────────────────────────────────────
        if ts.max_open_positions > 0 {
            match self.gateway.open_positions().await {
                Ok(open) if open.len() >= ts.max_open_positions as usize => {
                    info!(
                        account = %self.account_id,
                        inst = %inst,
                        open = open.len(),
                        limit = ts.max_open_positions,
                        "signal skipped: open-position limit"
                    );
                    if self
                        .throttle
                        .can_send(&self.account_id, "limit_open_positions", LIMIT_NOTICE_EVERY)
                    {
                        self.notify(&format!(
                            "[{inst}] open-position limit ({}) reached, signal skipped",
                            ts.max_open_positions
                        ))
                        .await;
                    }
                    return SignalOutcome::Dropped(DropReason::MaxOpenPositions);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(account = %self.account_id, inst = %inst, error = %e, "open-position check failed, continuing");
                }
            }
        }
        if self.cancel.is_cancelled() {
            return SignalOutcome::Cancelled;
        }

        // ── 2. Confirmation ──────────────────────────────────────────────
        if ts.confirm_required {
            let prompt = format!(
                "[{inst}] {} {} @ {:.4}\n{}\nSL/TP are placed after entry. Enter?",
                signal.strategy, signal.side, signal.price, signal.reason
            );
            let timeout = Duration::from_secs(ts.confirm_timeout_secs);
            info!(account = %self.account_id, inst = %inst, timeout_secs = ts.confirm_timeout_secs, "awaiting confirmation");

            let answer = tokio::select! {
                _ = self.cancel.cancelled() => return SignalOutcome::Cancelled,
                r = tokio::time::timeout(timeout, self.notifier.confirm(&self.account_id, &prompt, timeout)) => {
                    r.unwrap_or(ConfirmOutcome::TimedOut)
                }
            };

            if answer != ConfirmOutcome::Approved {
                let until = Utc::now() + chrono::Duration::seconds(ts.cooldown_secs as i64);
                self.set_cooldown(&inst, until);
                info!(account = %self.account_id, inst = %inst, ?answer, cooldown_until = %until, "entry not confirmed");
                self.notify(&format!("[{inst}] entry cancelled ({})", match answer {
                    ConfirmOutcome::Declined => "declined",
                    _ => "timed out",
                }))
                .await;
                return SignalOutcome::Dropped(match answer {
                    ConfirmOutcome::Declined => DropReason::Declined,
                    _ => DropReason::TimedOut,
                });
            }
        }
        if self.cancel.is_cancelled() {
            return SignalOutcome::Cancelled;
        }

        // ── 3. Sizing ────────────────────────────────────────────────────
        let params = match self.trade_params(&signal, ts).await {
            Ok(p) => p,
            Err(e) => {
                warn!(account = %self.account_id, inst = %inst, error = %e, "trade parameters failed");
                self.notify(&format!("[{inst}] trade parameters failed: {e}")).await;
                return SignalOutcome::Dropped(DropReason::Sizing(e.to_string()));
            }
        };
        if self.cancel.is_cancelled() {
            return SignalOutcome::Cancelled;
        }

        // ── 4. Market entry ──────────────────────────────────────────────
        let order_id = match self
            .gateway
            .place_market_order(&inst, params.size, signal.side, params.leverage)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(account = %self.account_id, inst = %inst, error = %e, "market entry failed");
                self.notify(&format!("[{inst}] entry order failed: {e}")).await;
                return SignalOutcome::Dropped(DropReason::Entry(e.to_string()));
            }
        };
        info!(
            account = %self.account_id,
            inst = %inst,
            side = %signal.side,
            size = params.size,
            entry = params.entry,
            order_id = %order_id,
            "market entry placed"
        );

        // ── 5. Stop and target ───────────────────────────────────────────
        let sl_algo_id = self.place_protective(&inst, pos_side, &params, false).await;
        let tp_algo_id = self.place_protective(&inst, pos_side, &params, true).await;

        self.notify(&format!(
            "[{inst}] entry confirmed | OPEN {} @ {:.4} | SL={:.4} TP={:.4} lev={}x size={:.4} | strategy={} (order {order_id})",
            signal.side, params.entry, params.stop_loss, params.take_profit, params.leverage, params.size, signal.strategy
        ))
        .await;

        // ── 6. Cache + trail registration ────────────────────────────────
        let key = position_key(&inst, pos_side);
        self.positions
            .write()
            .entry(key.clone())
            .or_insert_with(|| ExchangePosition {
                inst_id: inst.clone(),
                pos_side,
                size: params.size,
                entry_price: params.entry,
                mark_price: params.entry,
                leverage: params.leverage,
            });

        match &sl_algo_id {
            Some(sl_id) => {
                let state = PositionTrailState {
                    inst_id: inst.clone(),
                    pos_side,
                    entry: params.entry,
                    stop_loss: params.stop_loss,
                    take_profit: params.take_profit,
                    risk_distance: params.risk_distance,
                    tick_size: params.tick_size,
                    sl_algo_id: sl_id.clone(),
                    stop_cancelled: false,
                    tp_algo_id: tp_algo_id.clone(),
                    size: params.size,
                    mfe: params.entry,
                    moved_to_be: false,
                    locked_profit: false,
                    took_partial: false,
                    opened_at: Utc::now(),
                    last_trail_at: None,
                    last_slot: None,
                };
                self.trails.lock().insert(key, state);
                info!(account = %self.account_id, inst = %inst, %pos_side, "trailing registered");
            }
            None => {
                warn!(account = %self.account_id, inst = %inst, %pos_side, "no stop order id, position is not trailed");
            }
        }

        SignalOutcome::Opened {
            params,
            order_id,
            sl_algo_id,
            tp_algo_id,
        }
    }

    async fn trade_params(&self, signal: &Signal, ts: &TradingSettings) -> Result<TradeParams> {
        let meta = self.gateway.instrument_meta(&signal.inst_id).await?;
        size_for_signal(self.gateway.as_ref(), signal.side, signal.price, ts, &meta).await
    }

    /// Place the stop (or target) for a fresh entry. `None` on failure, which
    /// is reported to the operator.
    async fn place_protective(
        &self,
        inst: &str,
        pos_side: PosSide,
        params: &TradeParams,
        is_take_profit: bool,
    ) -> Option<String> {
        let (label, px) = if is_take_profit {
            ("take-profit", params.take_profit)
        } else {
            ("stop-loss", params.stop_loss)
        };
        match self
            .gateway
            .place_conditional_order(inst, pos_side, params.size, px, is_take_profit)
            .await
        {
            Ok(id) if !id.is_empty() => Some(id),
            Ok(_) => {
                error!(account = %self.account_id, inst, label, "exchange returned no algo id");
                self.notify(&format!("[{inst}] {label} not confirmed by the exchange")).await;
                None
            }
            Err(e) => {
                error!(account = %self.account_id, inst, label, error = %e, "protective order failed");
                self.notify(&format!("[{inst}] {label} not placed: {e}")).await;
                None
            }
        }
    }

    /// True while a cooldown is active; expired entries are dropped.
    fn in_cooldown(&self, inst: &str) -> bool {
        let mut cooldowns = self.cooldowns.lock();
        match cooldowns.get(inst) {
            Some(until) if Utc::now() < *until => true,
            Some(_) => {
                cooldowns.remove(inst);
                false
            }
            None => false,
        }
    }

    fn is_tracked(&self, inst: &str) -> bool {
        let trails = self.trails.lock();
        [PosSide::Long, PosSide::Short]
            .iter()
            .any(|side| trails.contains_key(&position_key(inst, *side)))
    }

    pub(crate) async fn notify(&self, text: &str) {
        self.notifier.send(&self.account_id, text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::paper_session;
    use super::*;
    use crate::exchange::paper::PaperCall;
    use crate::notifier::testing::RecordingNotifier;
    use crate::queue::QueuePolicy;
    use crate::settings::AccountSettings;
    use crate::types::Side;

    fn signal(side: Side) -> Signal {
        Signal {
            inst_id: "BTC-USDT-SWAP".into(),
            timeframe: "15m".into(),
            side,
            price: 100.0,
            strategy: "donchian_htf".into(),
            reason: "test breakout".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn approved_signal_opens_and_registers_trail() {
        let (s, ex, notifier) = paper_session(AccountSettings::new("acct"));
        let out = s.handle_signal(signal(Side::Buy)).await;

        let SignalOutcome::Opened { params, sl_algo_id, tp_algo_id, .. } = out else {
            panic!("expected Opened, got {out:?}");
        };
        assert!((params.stop_loss - 99.5).abs() < 1e-9);
        assert!((params.take_profit - 101.0).abs() < 1e-9);
        assert!((params.size - 2_000.0).abs() < 1e-6);
        assert!(sl_algo_id.is_some() && tp_algo_id.is_some());
        assert_eq!(ex.algo_orders().len(), 2);

        let trail = s.trail_state("BTC-USDT-SWAP", PosSide::Long).unwrap();
        assert!((trail.mfe - 100.0).abs() < 1e-12);
        assert_eq!(Some(trail.sl_algo_id), sl_algo_id);
        assert_eq!(notifier.prompts.lock().len(), 1);
        assert_eq!(notifier.count_containing("entry confirmed"), 1);
        assert!(s.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn tracked_instrument_is_not_entered_twice() {
        let (s, ex, _) = paper_session(AccountSettings::new("acct"));
        assert!(matches!(s.handle_signal(signal(Side::Buy)).await, SignalOutcome::Opened { .. }));
        assert_eq!(
            s.handle_signal(signal(Side::Sell)).await,
            SignalOutcome::Dropped(DropReason::Duplicate)
        );
        assert_eq!(ex.fills().len(), 1);
    }

    #[tokio::test]
    async fn pending_instrument_is_dropped() {
        let (s, _, _) = paper_session(AccountSettings::new("acct"));
        s.pending.lock().insert("BTC-USDT-SWAP".into());
        assert_eq!(
            s.handle_signal(signal(Side::Buy)).await,
            SignalOutcome::Dropped(DropReason::Duplicate)
        );
    }

    #[tokio::test]
    async fn decline_sets_cooldown() {
        let ex = Arc::new(crate::exchange::paper::PaperExchange::new(1_000.0));
        ex.add_instrument(crate::exchange::paper::tests::btc_meta());
        let notifier = Arc::new(RecordingNotifier::with_default(ConfirmOutcome::Declined));
        let s = Session::new(
            AccountSettings::new("acct"),
            ex.clone(),
            notifier.clone(),
            8,
            QueuePolicy::DropNewest,
        );

        assert_eq!(
            s.handle_signal(signal(Side::Buy)).await,
            SignalOutcome::Dropped(DropReason::Declined)
        );
        let until = s.cooldown_until("BTC-USDT-SWAP").unwrap();
        assert!(until > Utc::now() + chrono::Duration::hours(5));
        assert_eq!(notifier.count_containing("entry cancelled (declined)"), 1);

        // Approval would now be given, but the cooldown wins.
        notifier.push_answer(ConfirmOutcome::Approved);
        assert_eq!(
            s.handle_signal(signal(Side::Buy)).await,
            SignalOutcome::Dropped(DropReason::Cooldown)
        );
        assert!(ex.fills().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_timeout_sets_cooldown() {
        let ex = Arc::new(crate::exchange::paper::PaperExchange::new(1_000.0));
        ex.add_instrument(crate::exchange::paper::tests::btc_meta());
        let notifier = Arc::new(RecordingNotifier::with_default(ConfirmOutcome::TimedOut));
        let s = Session::new(
            AccountSettings::new("acct"),
            ex,
            notifier.clone(),
            8,
            QueuePolicy::DropNewest,
        );
        assert_eq!(
            s.handle_signal(signal(Side::Sell)).await,
            SignalOutcome::Dropped(DropReason::TimedOut)
        );
        assert!(s.cooldown_until("BTC-USDT-SWAP").is_some());
        assert_eq!(notifier.count_containing("timed out"), 1);
    }

    #[tokio::test]
    async fn expired_cooldown_is_cleared() {
        let (s, _, _) = paper_session(AccountSettings::new("acct"));
        s.set_cooldown("BTC-USDT-SWAP", Utc::now() - chrono::Duration::seconds(1));
        assert!(matches!(s.handle_signal(signal(Side::Buy)).await, SignalOutcome::Opened { .. }));
        assert!(s.cooldown_until("BTC-USDT-SWAP").is_none());
    }

    #[tokio::test]
    async fn open_position_limit_notifies_once() {
        let mut settings = AccountSettings::new("acct");
        settings.trading.max_open_positions = 1;
        let (s, ex, notifier) = paper_session(settings);
        ex.seed_position(ExchangePosition {
            inst_id: "ETH-USDT-SWAP".into(),
            pos_side: PosSide::Long,
            size: 1.0,
            entry_price: 3_000.0,
            mark_price: 3_000.0,
            leverage: 5,
        });

        for _ in 0..2 {
            assert_eq!(
                s.handle_signal(signal(Side::Buy)).await,
                SignalOutcome::Dropped(DropReason::MaxOpenPositions)
            );
        }
        assert_eq!(notifier.count_containing("open-position limit"), 1);
        assert!(notifier.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_stop_id_means_no_trail() {
        let (s, ex, notifier) = paper_session(AccountSettings::new("acct"));
        ex.fail_next(PaperCall::Conditional);

        let out = s.handle_signal(signal(Side::Buy)).await;
        let SignalOutcome::Opened { sl_algo_id, tp_algo_id, .. } = out else {
            panic!("expected Opened, got {out:?}");
        };
        assert!(sl_algo_id.is_none());
        assert!(tp_algo_id.is_some());
        assert_eq!(s.trail_count(), 0);
        assert_eq!(notifier.count_containing("stop-loss not placed"), 1);
        // The entry is not rolled back.
        assert_eq!(ex.positions_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn sizing_error_drops_signal() {
        let mut settings = AccountSettings::new("acct");
        settings.trading.stop_pct = 25.0;
        settings.trading.confirm_required = false;
        let (s, ex, notifier) = paper_session(settings);
        let out = s.handle_signal(signal(Side::Buy)).await;
        assert!(matches!(out, SignalOutcome::Dropped(DropReason::Sizing(_))), "{out:?}");
        assert!(ex.fills().is_empty());
        assert_eq!(notifier.count_containing("trade parameters failed"), 1);
        assert!(s.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn rejected_entry_releases_pending() {
        let (s, ex, _) = paper_session(AccountSettings::new("acct"));
        ex.fail_next(PaperCall::MarketOrder);
        let out = s.handle_signal(signal(Side::Buy)).await;
        assert!(matches!(out, SignalOutcome::Dropped(DropReason::Entry(_))), "{out:?}");
        assert!(s.pending.lock().is_empty());
        assert!(ex.algo_orders().is_empty());

        // Next signal goes through.
        assert!(matches!(s.handle_signal(signal(Side::Buy)).await, SignalOutcome::Opened { .. }));
    }

    #[tokio::test]
    async fn disable_during_confirmation_abandons_workflow() {
        let ex = Arc::new(crate::exchange::paper::PaperExchange::new(1_000.0));
        ex.add_instrument(crate::exchange::paper::tests::btc_meta());
        let notifier = Arc::new(RecordingNotifier::with_default(ConfirmOutcome::TimedOut));
        let s = Session::new(
            AccountSettings::new("acct"),
            ex.clone(),
            notifier,
            8,
            QueuePolicy::DropNewest,
        );

        let task = {
            let s = s.clone();
            tokio::spawn(async move { s.handle_signal(signal(Side::Buy)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.stop();

        assert_eq!(task.await.unwrap(), SignalOutcome::Cancelled);
        assert!(ex.fills().is_empty());
        assert!(s.cooldown_until("BTC-USDT-SWAP").is_none());
    }

    #[tokio::test]
    async fn worker_drains_queue_in_order() {
        let (s, ex, _) = paper_session(AccountSettings::new("acct"));
        s.start(Duration::from_secs(300));
        assert!(s.queue().offer(signal(Side::Buy)));

        for _ in 0..100 {
            if s.trail_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.trail_count(), 1);
        assert_eq!(ex.fills().len(), 1);
        s.stop();
    }
}
