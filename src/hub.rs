// =============================================================================
// Strategy Hub — warmup gating between the candle streams and the router
// =============================================================================
//
// Every closed candle passes through here:
//   1m candles      → router latest-candle table (trailing)
//   every candle    → signal engine
//   engine signals  → router, once warmup is done
//
// Each instrument reports "became ready" once per role (LTF and HTF), so the
// expected ready count is twice the watchlist size. Warmup is done when that
// count is reached, or when at least 99% of it is reached and no instrument
// has made progress for the stall window (a dead instrument must not hold the
// whole watchlist back).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::exchange::ExchangeGateway;
use crate::router::Router;
use crate::runtime_config::StrategyParams;
use crate::strategy::SignalEngine;
use crate::types::{normalize_timeframe, CandleTick, Signal};

/// Ready events reported per instrument (LTF role + HTF role).
pub const READY_EVENTS_PER_INSTRUMENT: usize = 2;

#[derive(Debug)]
struct WarmupProgress {
    ready: usize,
    last_progress: Instant,
    done: bool,
}

pub struct StrategyHub {
    engine: Arc<dyn SignalEngine>,
    router: Arc<Router>,
    expected_ready: usize,
    stall_after: Duration,
    progress: Mutex<WarmupProgress>,
}

impl StrategyHub {
    pub fn new(
        engine: Arc<dyn SignalEngine>,
        router: Arc<Router>,
        symbol_count: usize,
        stall_after: Duration,
    ) -> Self {
        let expected_ready = symbol_count * READY_EVENTS_PER_INSTRUMENT;
        Self {
            engine,
            router,
            expected_ready,
            stall_after,
            progress: Mutex::new(WarmupProgress {
                ready: 0,
                last_progress: Instant::now(),
                done: expected_ready == 0,
            }),
        }
    }

    pub fn ready_count(&self) -> usize {
        self.progress.lock().ready
    }

    pub fn expected_ready(&self) -> usize {
        self.expected_ready
    }

    fn mark_ready(&self, inst_id: &str) {
        let mut p = self.progress.lock();
        p.ready += 1;
        p.last_progress = Instant::now();
        debug!(inst = %inst_id, ready = p.ready, expected = self.expected_ready, "instrument role ready");
    }

    /// Whether signals are forwarded. Latches once true.
    pub fn warmup_done(&self) -> bool {
        let mut p = self.progress.lock();
        if p.done {
            return true;
        }
        if p.ready >= self.expected_ready {
            p.done = true;
            info!(ready = p.ready, expected = self.expected_ready, "warmup complete");
            return true;
        }
        let nearly = p.ready * 100 >= self.expected_ready * 99;
        if nearly && p.last_progress.elapsed() >= self.stall_after {
            p.done = true;
            warn!(
                ready = p.ready,
                expected = self.expected_ready,
                stalled_secs = self.stall_after.as_secs(),
                "warmup stalled, enabling signals anyway"
            );
            return true;
        }
        false
    }

    /// Feed one live closed candle. Returns the signal if one was routed.
    pub fn on_candle(&self, candle: &CandleTick) -> Option<Signal> {
        if normalize_timeframe(&candle.timeframe) == "1m" {
            self.router.on_candle_close(candle);
        }

        let outcome = self.engine.on_candle(candle);
        if outcome.became_ready {
            self.mark_ready(&candle.inst_id);
        }
        let signal = outcome.signal?;

        if !self.warmup_done() {
            debug!(
                inst = %signal.inst_id,
                side = %signal.side,
                ready = self.ready_count(),
                expected = self.expected_ready,
                "signal suppressed during warmup"
            );
            return None;
        }
        self.router.on_signal(&signal);
        Some(signal)
    }

    /// Feed historical candles. Signals are discarded.
    pub fn feed_history(&self, candles: &[CandleTick]) -> usize {
        let mut signals = 0;
        for c in candles {
            let outcome = self.engine.on_candle(c);
            if outcome.became_ready {
                self.mark_ready(&c.inst_id);
            }
            if outcome.signal.is_some() {
                signals += 1;
            }
        }
        signals
    }

    // -------------------------------------------------------------------------
    // REST warmup
    // -------------------------------------------------------------------------

    /// Download HTF then LTF history for every symbol, at most `concurrency`
    /// at a time, and feed it through the engine. A failed download is
    /// logged and skipped. Returns the number of candles fed.
    pub async fn warmup(
        self: &Arc<Self>,
        gateway: Arc<dyn ExchangeGateway>,
        symbols: &[String],
        params: &StrategyParams,
        concurrency: usize,
    ) -> usize {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut set = JoinSet::new();
        let started = Instant::now();

        for sym in symbols {
            let hub = self.clone();
            let gateway = gateway.clone();
            let permits = permits.clone();
            let sym = sym.clone();
            let htf = (params.htf.clone(), params.htf_history_bars());
            let ltf = (params.ltf.clone(), params.ltf_history_bars());

            set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return 0;
                };
                let mut fed = 0;
                for (tf, bars) in [htf, ltf] {
                    match gateway.candles(&sym, &tf, bars).await {
                        Ok(candles) => {
                            hub.feed_history(&candles);
                            fed += candles.len();
                        }
                        Err(e) => {
                            warn!(inst = %sym, tf = %tf, error = %e, "history download failed");
                        }
                    }
                }
                fed
            });
        }

        let mut total = 0;
        while let Some(res) = set.join_next().await {
            match res {
                Ok(n) => total += n,
                Err(e) => warn!(error = %e, "warmup task panicked"),
            }
        }
        info!(
            symbols = symbols.len(),
            candles = total,
            ready = self.ready_count(),
            expected = self.expected_ready,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "REST warmup finished"
        );
        total
    }
}

impl std::fmt::Debug for StrategyHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyHub")
            .field("engine", &self.engine.name())
            .field("expected_ready", &self.expected_ready)
            .field("progress", &*self.progress.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::{PaperExchange, PaperGatewayFactory};
    use crate::router::RouterConfig;
    use crate::strategy::{CandleOutcome, DonchianBreakoutEngine};
    use crate::types::Side;
    use chrono::{TimeZone, Utc};

    /// Emits a signal on every 15m candle and reports ready on candles
    /// whose volume is 1.
    struct ScriptedEngine;

    impl SignalEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn on_candle(&self, tick: &CandleTick) -> CandleOutcome {
            let signal = (tick.timeframe == "15m").then(|| Signal {
                inst_id: tick.inst_id.clone(),
                timeframe: tick.timeframe.clone(),
                side: Side::Buy,
                price: tick.close,
                strategy: "scripted".into(),
                reason: "test".into(),
                created_at: Utc::now(),
            });
            CandleOutcome {
                signal,
                became_ready: tick.volume == 1.0,
            }
        }

        fn is_ready(&self, _inst_id: &str) -> bool {
            true
        }

        fn dump(&self, inst_id: &str) -> String {
            inst_id.to_string()
        }
    }

    fn router() -> Arc<Router> {
        let factory = Arc::new(PaperGatewayFactory::new(1_000.0, None));
        Arc::new(Router::new(RouterConfig::default(), factory, None, None))
    }

    fn tick(inst: &str, tf: &str, minute: u32, volume: f64) -> CandleTick {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, minute, 0).unwrap();
        CandleTick::from_start(inst, tf, start, [100.0, 101.0, 99.0, 100.0, volume])
    }

    #[tokio::test(start_paused = true)]
    async fn signals_gated_until_all_roles_ready() {
        let hub = StrategyHub::new(Arc::new(ScriptedEngine), router(), 1, Duration::from_secs(300));
        assert_eq!(hub.expected_ready(), 2);

        assert!(hub.on_candle(&tick("BTC", "15m", 0, 1.0)).is_none());
        assert_eq!(hub.ready_count(), 1);
        assert!(!hub.warmup_done());

        // Second role ready on this candle; its own signal already passes.
        assert!(hub.on_candle(&tick("BTC", "15m", 15, 1.0)).is_some());
        assert!(hub.warmup_done());
    }

    #[tokio::test(start_paused = true)]
    async fn stall_releases_gate_only_when_nearly_ready() {
        // 50 instruments -> 100 expected ready events.
        let hub = StrategyHub::new(Arc::new(ScriptedEngine), router(), 50, Duration::from_secs(300));
        for i in 0..98 {
            hub.on_candle(&tick(&format!("I{i}"), "1h", 0, 1.0));
        }
        tokio::time::advance(Duration::from_secs(301)).await;
        // 98% is not enough, however long it stalls.
        assert!(!hub.warmup_done());

        hub.on_candle(&tick("I98", "1h", 0, 1.0));
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!hub.warmup_done());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(hub.warmup_done());
    }

    #[tokio::test]
    async fn one_minute_candles_reach_trailing_table() {
        let r = router();
        let hub = StrategyHub::new(Arc::new(ScriptedEngine), r.clone(), 1, Duration::from_secs(300));
        hub.on_candle(&tick("BTC", "1m", 3, 0.0));
        hub.on_candle(&tick("BTC", "15m", 0, 0.0));
        let drained = r.drain_latest();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].timeframe, "1m");
    }

    #[tokio::test]
    async fn rest_warmup_feeds_htf_then_ltf_history() {
        let params = StrategyParams {
            ltf: "15m".into(),
            htf: "1h".into(),
            donchian_period: 5,
            min_channel_pct: 0.0,
            min_body_pct: 0.0,
            breakout_pct: 0.0,
            htf_ema_fast: 2,
            htf_ema_slow: 3,
            min_warmup_ltf: 5,
            min_warmup_htf: 3,
        };
        let engine = Arc::new(DonchianBreakoutEngine::new(params.clone()).unwrap());
        let hub = Arc::new(StrategyHub::new(engine.clone(), router(), 2, Duration::from_secs(300)));

        let ex = Arc::new(PaperExchange::new(1_000.0));
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let htf: Vec<CandleTick> = (0..10)
            .map(|i| {
                let px = 100.0 + i as f64;
                CandleTick::from_start("BTC-USDT-SWAP", "1h", t0 + chrono::Duration::hours(i), [px, px + 1.0, px - 1.0, px, 1.0])
            })
            .collect();
        let ltf: Vec<CandleTick> = (0..10)
            .map(|i| {
                CandleTick::from_start(
                    "BTC-USDT-SWAP",
                    "15m",
                    t0 + chrono::Duration::minutes(15 * i),
                    [105.0, 106.0, 104.0, 105.0, 1.0],
                )
            })
            .collect();
        ex.seed_candles("BTC-USDT-SWAP", "1h", htf);
        ex.seed_candles("BTC-USDT-SWAP", "15m", ltf);

        let symbols = vec!["BTC-USDT-SWAP".to_string(), "ETH-USDT-SWAP".to_string()];
        let fed = hub.warmup(ex, &symbols, &params, 8).await;

        assert_eq!(fed, 20);
        assert!(engine.is_ready("BTC-USDT-SWAP"));
        assert!(!engine.is_ready("ETH-USDT-SWAP"));
        assert_eq!(hub.ready_count(), 2);
        assert!(!hub.warmup_done());
    }
}
