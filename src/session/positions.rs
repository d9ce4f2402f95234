// =============================================================================
// Position cache — periodic snapshot of the account's open positions
// =============================================================================
//
// The refresh replaces the whole cache and is the only place that forgets
// trail states: a state whose position is no longer reported is dropped,
// unless it was registered after the snapshot was requested (the entry may
// simply not be visible yet). Such a state keeps its cached position too, so
// it stays trailed and listed until a later snapshot reports it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::Session;
use crate::error::Result;
use crate::types::ExchangePosition;

impl Session {
    /// Refresh immediately, then every `every`, until cancelled.
    pub(crate) async fn run_position_worker(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_positions().await {
                        warn!(account = %self.account_id, error = %e, "position refresh failed");
                    }
                }
            }
        }
        debug!(account = %self.account_id, "position worker exited");
    }

    /// Replace the cache with the exchange's view and drop trail states whose
    /// position is gone. Returns the number of cached positions.
    pub async fn refresh_positions(&self) -> Result<usize> {
        let requested_at = Utc::now();
        let positions = self.gateway.open_positions().await?;

        let mut next: HashMap<String, ExchangePosition> = positions
            .into_iter()
            .filter(|p| p.size > 0.0)
            .map(|p| (p.key(), p))
            .collect();

        // Unreported states: stale ones go, newer ones wait for the next snapshot.
        let (removed, pending) = {
            let mut trails = self.trails.lock();
            let mut stale = Vec::new();
            let mut pending = Vec::new();
            for (key, st) in trails.iter() {
                if next.contains_key(key) {
                    continue;
                }
                if st.opened_at < requested_at {
                    stale.push(key.clone());
                } else {
                    pending.push(key.clone());
                }
            }
            for key in &stale {
                trails.remove(key);
            }
            (stale, pending)
        };

        let count = {
            let mut cache = self.positions.write();
            for key in &pending {
                if let Some(p) = cache.get(key) {
                    next.insert(key.clone(), p.clone());
                }
            }
            let count = next.len();
            *cache = next;
            count
        };
        *self.positions_at.write() = Some(Utc::now());

        for key in &removed {
            info!(account = %self.account_id, key = %key, "position gone, trail state dropped");
        }
        debug!(account = %self.account_id, count, "position cache refreshed");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::paper_session;
    use super::*;
    use crate::exchange::paper::tests::btc_meta;
    use crate::exchange::paper::{PaperCall, PaperExchange};
    use crate::exchange::ExchangeGateway;
    use crate::exit::PositionTrailState;
    use crate::notifier::testing::RecordingNotifier;
    use crate::session::TrailOutcome;
    use crate::settings::AccountSettings;
    use crate::queue::QueuePolicy;
    use crate::types::{CandleTick, InstrumentMeta, PosSide, Side};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};

    /// Paper gateway whose position snapshot is taken on request but only
    /// delivered `delay` later.
    struct SlowSnapshot {
        inner: Arc<PaperExchange>,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl ExchangeGateway for SlowSnapshot {
        async fn instrument_meta(&self, inst_id: &str) -> Result<InstrumentMeta> {
            self.inner.instrument_meta(inst_id).await
        }

        async fn account_equity(&self) -> Result<f64> {
            self.inner.account_equity().await
        }

        async fn place_market_order(
            &self,
            inst_id: &str,
            size: f64,
            side: Side,
            leverage: u32,
        ) -> Result<String> {
            self.inner.place_market_order(inst_id, size, side, leverage).await
        }

        async fn place_conditional_order(
            &self,
            inst_id: &str,
            pos_side: PosSide,
            size: f64,
            trigger_price: f64,
            is_take_profit: bool,
        ) -> Result<String> {
            self.inner
                .place_conditional_order(inst_id, pos_side, size, trigger_price, is_take_profit)
                .await
        }

        async fn cancel_conditional_order(&self, inst_id: &str, algo_id: &str) -> Result<()> {
            self.inner.cancel_conditional_order(inst_id, algo_id).await
        }

        async fn close_market(&self, inst_id: &str, pos_side: PosSide, size: f64) -> Result<String> {
            self.inner.close_market(inst_id, pos_side, size).await
        }

        async fn open_positions(&self) -> Result<Vec<ExchangePosition>> {
            let snapshot = self.inner.open_positions().await;
            tokio::time::sleep(self.delay).await;
            snapshot
        }

        async fn settle_to_usdt(&self, ccy: &str) -> Result<f64> {
            self.inner.settle_to_usdt(ccy).await
        }

        async fn candles(&self, inst_id: &str, timeframe: &str, limit: usize) -> Result<Vec<CandleTick>> {
            self.inner.candles(inst_id, timeframe, limit).await
        }
    }

    fn trail(inst: &str, opened_ago_secs: i64) -> PositionTrailState {
        PositionTrailState {
            inst_id: inst.into(),
            pos_side: PosSide::Long,
            entry: 100.0,
            stop_loss: 99.0,
            take_profit: 102.0,
            risk_distance: 1.0,
            tick_size: 0.1,
            sl_algo_id: "sl".into(),
            stop_cancelled: false,
            tp_algo_id: None,
            size: 1.0,
            mfe: 100.0,
            moved_to_be: false,
            locked_profit: false,
            took_partial: false,
            opened_at: Utc::now() - Duration::seconds(opened_ago_secs),
            last_trail_at: None,
            last_slot: None,
        }
    }

    #[tokio::test]
    async fn refresh_drops_stale_trails_only() {
        let (s, ex, _) = paper_session(AccountSettings::new("acct"));
        ex.seed_position(ExchangePosition {
            inst_id: "BTC-USDT-SWAP".into(),
            pos_side: PosSide::Long,
            size: 1.0,
            entry_price: 100.0,
            mark_price: 101.0,
            leverage: 5,
        });
        ex.seed_position(ExchangePosition {
            inst_id: "XRP-USDT-SWAP".into(),
            pos_side: PosSide::Short,
            size: 0.0,
            entry_price: 1.0,
            mark_price: 1.0,
            leverage: 5,
        });
        {
            let mut trails = s.trails.lock();
            trails.insert("BTC-USDT-SWAP:long".into(), trail("BTC-USDT-SWAP", 600));
            trails.insert("ETH-USDT-SWAP:long".into(), trail("ETH-USDT-SWAP", 600));
            // Registered after the snapshot request: kept.
            trails.insert("SOL-USDT-SWAP:long".into(), trail("SOL-USDT-SWAP", -5));
        }

        assert_eq!(s.refresh_positions().await.unwrap(), 1);
        assert!(s.trail_state("BTC-USDT-SWAP", PosSide::Long).is_some());
        assert!(s.trail_state("ETH-USDT-SWAP", PosSide::Long).is_none());
        assert!(s.trail_state("SOL-USDT-SWAP", PosSide::Long).is_some());
        assert!(s.positions_refreshed_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_during_refresh_stays_cached_and_trailed() {
        let ex = Arc::new(PaperExchange::new(1_000.0));
        ex.add_instrument(btc_meta());
        let gateway = Arc::new(SlowSnapshot {
            inner: ex.clone(),
            delay: std::time::Duration::from_secs(2),
        });
        let s = Session::new(
            AccountSettings::new("acct"),
            gateway,
            RecordingNotifier::approving(),
            8,
            QueuePolicy::DropNewest,
        );

        let refresh = tokio::spawn({
            let s = s.clone();
            async move { s.refresh_positions().await }
        });
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        // The entry lands after the snapshot was taken.
        ex.place_market_order("BTC-USDT-SWAP", 1.0, Side::Buy, 5)
            .await
            .unwrap();
        let key = "BTC-USDT-SWAP:long".to_string();
        s.positions.write().insert(
            key.clone(),
            ExchangePosition {
                inst_id: "BTC-USDT-SWAP".into(),
                pos_side: PosSide::Long,
                size: 1.0,
                entry_price: 100.0,
                mark_price: 100.0,
                leverage: 5,
            },
        );
        s.trails.lock().insert(key, trail("BTC-USDT-SWAP", 0));

        assert_eq!(refresh.await.unwrap().unwrap(), 1);
        assert_eq!(s.trail_count(), 1);
        assert_eq!(s.cached_positions().len(), 1);
        let status = s.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].stop_loss, Some(99.0));

        let end: DateTime<Utc> = Utc::now() + Duration::minutes(1);
        let candle = CandleTick::from_start(
            "BTC-USDT-SWAP",
            "1m",
            end - Duration::minutes(1),
            [100.0, 100.2, 100.0, 100.2, 1.0],
        );
        let out = s.on_candle_close(&candle).await;
        assert_eq!(out.len(), 1, "{out:?}");
        assert_ne!(out[0], TrailOutcome::Skipped);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_cache() {
        let (s, ex, _) = paper_session(AccountSettings::new("acct"));
        ex.seed_position(ExchangePosition {
            inst_id: "BTC-USDT-SWAP".into(),
            pos_side: PosSide::Long,
            size: 1.0,
            entry_price: 100.0,
            mark_price: 101.0,
            leverage: 5,
        });
        s.refresh_positions().await.unwrap();
        ex.fail_next(PaperCall::Positions);
        assert!(s.refresh_positions().await.is_err());
        assert_eq!(s.cached_positions().len(), 1);
    }
}
