// =============================================================================
// Strategy Engine — Donchian breakout filtered by a higher-timeframe trend
// =============================================================================
//
// Consumes closed candles of two timeframes for every instrument:
//
//   HTF (e.g. 1h) : feeds an EMA-fast / EMA-slow pair. Once both EMAs and a
//                   minimum bar count are warmed up the instrument's trend is
//                   Up (fast > slow), Down (fast < slow) or None.
//   LTF (e.g. 15m): maintains a rolling window of highs/lows. The channel is
//                   computed BEFORE the current candle is folded in. A signal
//                   fires when the candle opens inside the channel and closes
//                   beyond the buffered edge in the direction of the trend.
//
// Filters (all must pass):
//   channel width  (dh - dl) / close      >= min_channel_pct
//   candle body    |close - open| / close >= min_body_pct
//   breakout       close > dh * (1 + buffer)  (Up)   or
//                  close < dl * (1 - buffer)  (Down)
//
// At most one signal per LTF candle end time per instrument. All state lives
// behind a single mutex per engine instance.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::indicators::ema::EmaState;
use crate::runtime_config::StrategyParams;
use crate::types::{normalize_timeframe, CandleTick, Side, Signal, Trend};

pub const STRATEGY_TAG: &str = "donchian_htf";

/// Result of feeding one candle into an engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleOutcome {
    pub signal: Option<Signal>,
    /// The instrument completed warmup for one of its roles on this candle.
    pub became_ready: bool,
}

/// A per-instrument signal generator driven by closed candles.
pub trait SignalEngine: Send + Sync {
    fn name(&self) -> &str;
    fn on_candle(&self, tick: &CandleTick) -> CandleOutcome;
    /// Both roles warmed up and a trend is asserted.
    fn is_ready(&self, inst_id: &str) -> bool;
    /// One-line diagnostic of the instrument's state.
    fn dump(&self, inst_id: &str) -> String;
}

// =============================================================================
// Per-instrument state
// =============================================================================

#[derive(Debug, Clone)]
struct EngineState {
    // ── LTF ──
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    ltf_warmup: usize,
    ltf_ready: bool,
    last_ltf_end: Option<DateTime<Utc>>,

    // ── HTF ──
    ema_fast: EmaState,
    ema_slow: EmaState,
    htf_warmup: usize,
    htf_ready: bool,
    trend: Trend,
    last_htf_end: Option<DateTime<Utc>>,

    /// End time of the candle that produced the last signal.
    last_signal_end: Option<DateTime<Utc>>,
}

impl EngineState {
    fn new(p: &StrategyParams) -> Self {
        Self {
            highs: VecDeque::with_capacity(p.donchian_period + 1),
            lows: VecDeque::with_capacity(p.donchian_period + 1),
            ltf_warmup: 0,
            ltf_ready: false,
            last_ltf_end: None,
            ema_fast: EmaState::new(p.htf_ema_fast),
            ema_slow: EmaState::new(p.htf_ema_slow),
            htf_warmup: 0,
            htf_ready: false,
            trend: Trend::None,
            last_htf_end: None,
            last_signal_end: None,
        }
    }

    fn channel(&self) -> (f64, f64) {
        let dh = self.highs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let dl = self.lows.iter().copied().fold(f64::INFINITY, f64::min);
        (dh, dl)
    }

    fn push_bar(&mut self, high: f64, low: f64, period: usize) {
        self.highs.push_back(high);
        self.lows.push_back(low);
        while self.highs.len() > period {
            self.highs.pop_front();
            self.lows.pop_front();
        }
    }

    #[cfg(test)]
    fn window_len(&self) -> usize {
        self.highs.len()
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct DonchianBreakoutEngine {
    params: StrategyParams,
    ltf: String,
    htf: String,
    states: Mutex<HashMap<String, EngineState>>,
}

impl DonchianBreakoutEngine {
    pub fn new(params: StrategyParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            ltf: normalize_timeframe(&params.ltf),
            htf: normalize_timeframe(&params.htf),
            params,
            states: Mutex::new(HashMap::new()),
        })
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    pub fn ltf(&self) -> &str {
        &self.ltf
    }

    pub fn htf(&self) -> &str {
        &self.htf
    }

    pub fn trend(&self, inst_id: &str) -> Trend {
        self.states
            .lock()
            .get(inst_id)
            .map(|s| s.trend)
            .unwrap_or_default()
    }

    fn on_htf(&self, st: &mut EngineState, t: &CandleTick) -> bool {
        if st.last_htf_end.is_some_and(|end| t.end <= end) {
            return false;
        }
        st.last_htf_end = Some(t.end);

        st.ema_fast.update(t.close);
        st.ema_slow.update(t.close);
        st.htf_warmup += 1;

        if st.htf_warmup < self.params.min_warmup_htf
            || !st.ema_fast.is_ready()
            || !st.ema_slow.is_ready()
        {
            return false;
        }

        let became_ready = !st.htf_ready;
        st.htf_ready = true;

        let (f, s) = (st.ema_fast.value(), st.ema_slow.value());
        st.trend = if f > s {
            Trend::Up
        } else if f < s {
            Trend::Down
        } else {
            Trend::None
        };

        if became_ready {
            info!(inst = %t.inst_id, trend = %st.trend, fast = f, slow = s, "HTF warmed up");
        }
        became_ready
    }

    fn on_ltf(&self, st: &mut EngineState, t: &CandleTick) -> CandleOutcome {
        let p = &self.params;
        let mut out = CandleOutcome::default();

        if st.last_ltf_end.is_some_and(|end| t.end <= end) {
            debug!(inst = %t.inst_id, end = %t.end, "stale or duplicate LTF candle ignored");
            return out;
        }
        st.last_ltf_end = Some(t.end);

        // Channel over the existing window, before this candle is folded in.
        let channel = if st.highs.len() >= p.donchian_period {
            let (dh, dl) = st.channel();
            (dh > 0.0 && dl > 0.0 && dh > dl).then_some((dh, dl))
        } else {
            None
        };

        st.ltf_warmup += 1;
        if !st.ltf_ready && st.ltf_warmup >= p.min_warmup_ltf && st.highs.len() >= p.donchian_period {
            st.ltf_ready = true;
            out.became_ready = true;
            info!(inst = %t.inst_id, bars = st.ltf_warmup, "LTF warmed up");
        }

        if let Some((dh, dl)) = channel {
            if st.ltf_ready && st.htf_ready && st.trend != Trend::None {
                out.signal = self.evaluate_breakout(st, t, dh, dl);
            }
        }

        st.push_bar(t.high, t.low, p.donchian_period);
        out
    }

    fn evaluate_breakout(
        &self,
        st: &mut EngineState,
        t: &CandleTick,
        dh: f64,
        dl: f64,
    ) -> Option<Signal> {
        let p = &self.params;

        let ch_pct = (dh - dl) / t.close;
        if ch_pct < p.min_channel_pct {
            return None;
        }

        let body_pct = (t.close - t.open).abs() / t.close;
        if body_pct < p.min_body_pct {
            return None;
        }

        if t.open < dl || t.open > dh {
            return None;
        }

        let bo = p.breakout_pct.max(0.0);
        let up_level = dh * (1.0 + bo);
        let dn_level = dl * (1.0 - bo);

        let side = match st.trend {
            Trend::Up if t.close > up_level => Side::Buy,
            Trend::Down if t.close < dn_level => Side::Sell,
            _ => return None,
        };

        if st.last_signal_end == Some(t.end) {
            return None;
        }
        st.last_signal_end = Some(t.end);

        let reason = format!(
            "trend={} don[{}] ch={:.4} body={:.4} dh={:.6} dl={:.6} bo={:.4} up={:.6} dn={:.6}",
            st.trend, p.donchian_period, ch_pct, body_pct, dh, dl, bo, up_level, dn_level
        );

        info!(
            inst = %t.inst_id,
            side = %side,
            close = t.close,
            dh,
            dl,
            trend = %st.trend,
            "breakout signal"
        );

        Some(Signal {
            inst_id: t.inst_id.clone(),
            timeframe: self.ltf.clone(),
            side,
            price: t.close,
            strategy: STRATEGY_TAG.to_string(),
            reason,
            created_at: Utc::now(),
        })
    }
}

impl SignalEngine for DonchianBreakoutEngine {
    fn name(&self) -> &str {
        STRATEGY_TAG
    }

    fn on_candle(&self, tick: &CandleTick) -> CandleOutcome {
        if !(tick.close > 0.0 && tick.high > 0.0 && tick.low > 0.0) {
            return CandleOutcome::default();
        }

        let tf = normalize_timeframe(&tick.timeframe);
        if tf != self.htf && tf != self.ltf {
            return CandleOutcome::default();
        }

        let mut states = self.states.lock();
        let st = states
            .entry(tick.inst_id.clone())
            .or_insert_with(|| EngineState::new(&self.params));

        if tf == self.htf {
            CandleOutcome {
                signal: None,
                became_ready: self.on_htf(st, tick),
            }
        } else {
            self.on_ltf(st, tick)
        }
    }

    fn is_ready(&self, inst_id: &str) -> bool {
        self.states
            .lock()
            .get(inst_id)
            .is_some_and(|s| s.ltf_ready && s.htf_ready && s.trend != Trend::None)
    }

    fn dump(&self, inst_id: &str) -> String {
        let states = self.states.lock();
        let Some(st) = states.get(inst_id) else {
            return format!("{inst_id}: no state");
        };
        let (dh, dl) = if st.highs.is_empty() {
            (0.0, 0.0)
        } else {
            st.channel()
        };
        format!(
            "{inst_id} [{}] w={}/{} ready={} dh={:.6} dl={:.6} | [{}] w={}/{} fast={:.6} slow={:.6} trend={} ready={}",
            self.ltf,
            st.ltf_warmup,
            self.params.min_warmup_ltf,
            st.ltf_ready,
            dh,
            dl,
            self.htf,
            st.htf_warmup,
            self.params.min_warmup_htf,
            st.ema_fast.value(),
            st.ema_slow.value(),
            st.trend,
            st.htf_ready,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const INST: &str = "BTC-USDT-SWAP";

    fn params() -> StrategyParams {
        StrategyParams {
            ltf: "15m".into(),
            htf: "1h".into(),
            donchian_period: 20,
            min_channel_pct: 0.012,
            min_body_pct: 0.003,
            breakout_pct: 0.002,
            htf_ema_fast: 3,
            htf_ema_slow: 5,
            min_warmup_ltf: 20,
            min_warmup_htf: 5,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn candle(tf: &str, idx: i64, o: f64, h: f64, l: f64, c: f64) -> CandleTick {
        let step = if tf == "1h" { 3_600 } else { 900 };
        CandleTick::from_start(INST, tf, t0() + Duration::seconds(idx * step), [o, h, l, c, 1.0])
    }

    /// HTF closes rising steadily give fast > slow => trend Up.
    fn warm_htf_up(engine: &DonchianBreakoutEngine) {
        for i in 0..6 {
            let px = 100.0 + i as f64;
            engine.on_candle(&candle("1h", i, px, px + 1.0, px - 1.0, px));
        }
        assert_eq!(engine.trend(INST), Trend::Up);
    }

    fn warm_htf_down(engine: &DonchianBreakoutEngine) {
        for i in 0..6 {
            let px = 100.0 - i as f64;
            engine.on_candle(&candle("1h", i, px, px + 1.0, px - 1.0, px));
        }
        assert_eq!(engine.trend(INST), Trend::Down);
    }

    /// 20 LTF bars spanning exactly [100, 110].
    fn warm_ltf_channel(engine: &DonchianBreakoutEngine) {
        for i in 0..20 {
            let got = engine.on_candle(&candle("15m", i, 105.0, 110.0, 100.0, 105.5));
            assert!(got.signal.is_none());
        }
    }

    #[test]
    fn breakout_up_emits_buy_at_close() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_htf_up(&engine);
        warm_ltf_channel(&engine);

        let out = engine.on_candle(&candle("15m", 20, 108.0, 112.5, 107.5, 112.0));
        let sig = out.signal.expect("expected a breakout signal");
        assert_eq!(sig.side, Side::Buy);
        assert!((sig.price - 112.0).abs() < 1e-12);
        assert_eq!(sig.timeframe, "15m");
        assert_eq!(sig.strategy, STRATEGY_TAG);
        assert!(engine.is_ready(INST));
    }

    #[test]
    fn breakout_down_emits_sell_in_downtrend() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_htf_down(&engine);
        warm_ltf_channel(&engine);

        let out = engine.on_candle(&candle("15m", 20, 101.0, 101.5, 97.5, 98.0));
        assert_eq!(out.signal.map(|s| s.side), Some(Side::Sell));
    }

    #[test]
    fn counter_trend_breakout_is_ignored() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_htf_down(&engine);
        warm_ltf_channel(&engine);

        let out = engine.on_candle(&candle("15m", 20, 108.0, 112.5, 107.5, 112.0));
        assert!(out.signal.is_none());
    }

    #[test]
    fn close_inside_buffer_does_not_signal() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_htf_up(&engine);
        warm_ltf_channel(&engine);

        // 110 * 1.002 = 110.22
        let out = engine.on_candle(&candle("15m", 20, 109.0, 110.3, 108.9, 110.2));
        assert!(out.signal.is_none());
    }

    #[test]
    fn open_outside_channel_does_not_signal() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_htf_up(&engine);
        warm_ltf_channel(&engine);

        let out = engine.on_candle(&candle("15m", 20, 110.5, 113.0, 110.4, 112.0));
        assert!(out.signal.is_none());
    }

    #[test]
    fn narrow_channel_filtered() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_htf_up(&engine);
        for i in 0..20 {
            engine.on_candle(&candle("15m", i, 100.2, 100.5, 100.0, 100.3));
        }
        // width 0.5 / 101 < 1.2%
        let out = engine.on_candle(&candle("15m", 20, 100.1, 101.2, 100.0, 101.0));
        assert!(out.signal.is_none());
    }

    #[test]
    fn duplicate_delivery_signals_once() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_htf_up(&engine);
        warm_ltf_channel(&engine);

        let c = candle("15m", 20, 108.0, 112.5, 107.5, 112.0);
        assert!(engine.on_candle(&c).signal.is_some());
        assert!(engine.on_candle(&c).signal.is_none());
    }

    #[test]
    fn no_signal_before_htf_ready() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_ltf_channel(&engine);
        let out = engine.on_candle(&candle("15m", 20, 108.0, 112.5, 107.5, 112.0));
        assert!(out.signal.is_none());
        assert!(!engine.is_ready(INST));
    }

    #[test]
    fn became_ready_reported_once_per_role() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        let mut ready_events = 0;
        for i in 0..10 {
            let px = 100.0 + i as f64;
            if engine.on_candle(&candle("1h", i, px, px + 1.0, px - 1.0, px)).became_ready {
                ready_events += 1;
            }
        }
        for i in 0..30 {
            if engine.on_candle(&candle("15m", i, 105.0, 110.0, 100.0, 105.5)).became_ready {
                ready_events += 1;
            }
        }
        assert_eq!(ready_events, 2);
    }

    #[test]
    fn window_never_exceeds_period() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_htf_up(&engine);
        for i in 0..200 {
            let px = 100.0 + ((i * 37) % 23) as f64;
            engine.on_candle(&candle("15m", i, px, px + 2.0, px - 2.0, px + 1.0));
            let len = engine.states.lock().get(INST).map(|s| s.window_len()).unwrap();
            assert!(len <= 20, "window grew to {len}");
        }
    }

    #[test]
    fn garbage_and_foreign_timeframes_ignored() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        let out = engine.on_candle(&candle("15m", 0, 1.0, 0.0, 0.0, 0.0));
        assert_eq!(out, CandleOutcome::default());
        let out = engine.on_candle(&CandleTick::from_start(INST, "5m", t0(), [1.0, 1.0, 1.0, 1.0, 1.0]));
        assert_eq!(out, CandleOutcome::default());
        assert_eq!(engine.dump(INST), format!("{INST}: no state"));
    }

    #[test]
    fn invalid_params_rejected() {
        let mut p = params();
        p.htf_ema_fast = 200;
        p.htf_ema_slow = 50;
        assert!(DonchianBreakoutEngine::new(p).is_err());
    }

    #[test]
    fn dump_reports_channel_and_trend() {
        let engine = DonchianBreakoutEngine::new(params()).unwrap();
        warm_htf_up(&engine);
        warm_ltf_channel(&engine);
        let d = engine.dump(INST);
        assert!(d.contains("dh=110.000000"), "{d}");
        assert!(d.contains("dl=100.000000"), "{d}");
        assert!(d.contains("trend=UP"), "{d}");
    }
}
