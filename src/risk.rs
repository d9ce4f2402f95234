// =============================================================================
// Risk / Sizing Engine — stop, target and size from a signal
// =============================================================================
//
// Steps:
//   1. Raw SL = entry * (1 -/+ stop_pct). Rounded to the tick AWAY from entry
//      (down for longs, up for shorts) so realised risk is never understated.
//   2. R = |entry - SL| measured after rounding.
//   3. Raw TP = entry +/- RR * R. Rounded away from entry as well.
//   4. Size from money at risk:
//        linear   size = risk_usdt / (R * ct_val)
//        inverse  size = risk_usdt / (ct_val * |1/entry - 1/SL| * settle_usdt)
//   5. Cap by margin (equity * leverage / (entry * ct_val)) and by the
//      instrument's max market size.
//   6. Floor to the lot step; raise to min size if below it. The raise may
//      overshoot the money risk slightly; that is accepted over skipping the
//      trade.
//
// Everything here is pure except `size_for_signal`, which fetches equity and
// the settlement conversion rate from the gateway first.
// =============================================================================

use tracing::debug;

use crate::error::{BotError, Result};
use crate::exchange::ExchangeGateway;
use crate::settings::{TradingSettings, MAX_STOP_PCT};
use crate::types::{ContractKind, InstrumentMeta, PosSide, Side, TradeParams};

/// RR used when the configured one is not positive.
pub const DEFAULT_RR: f64 = 2.0;

const TICK_EPS: f64 = 1e-12;
const LOT_EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Tick helpers
// ---------------------------------------------------------------------------

/// Largest multiple of `tick` not above `px`. A non-positive tick is a no-op.
pub fn round_down_to_tick(px: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return px;
    }
    (px / tick + TICK_EPS).floor() * tick
}

/// Smallest multiple of `tick` not below `px`. A non-positive tick is a no-op.
pub fn round_up_to_tick(px: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return px;
    }
    (px / tick - TICK_EPS).ceil() * tick
}

/// Round a stop price away from entry for the given position side.
pub fn round_stop(px: f64, tick: f64, pos_side: PosSide) -> f64 {
    match pos_side {
        PosSide::Long => round_down_to_tick(px, tick),
        PosSide::Short => round_up_to_tick(px, tick),
    }
}

/// Round a target price away from entry for the given position side.
pub fn round_target(px: f64, tick: f64, pos_side: PosSide) -> f64 {
    match pos_side {
        PosSide::Long => round_up_to_tick(px, tick),
        PosSide::Short => round_down_to_tick(px, tick),
    }
}

fn finite_positive(name: &str, v: f64) -> Result<f64> {
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(BotError::invalid(format!("{name} must be positive and finite (got {v})")))
    }
}

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Account-level inputs to sizing that come from the exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountSnapshot {
    /// Equity in USDT.
    pub equity: f64,
    /// Price of the settlement currency in USDT (1.0 for USDT itself).
    pub settle_to_usdt: f64,
}

/// Contract count whose stop-out loses `equity * risk_pct`, subject to the
/// margin and market-size caps and the lot grid.
pub fn size_by_risk(
    meta: &InstrumentMeta,
    entry: f64,
    stop_loss: f64,
    risk_pct: f64,
    leverage: u32,
    account: AccountSnapshot,
) -> Result<f64> {
    let entry = finite_positive("entry", entry)?;
    let stop_loss = finite_positive("stop loss", stop_loss)?;
    let equity = finite_positive("equity", account.equity)?;
    let ct_val = finite_positive("contract value", meta.contract_value)?;
    let risk_fraction = finite_positive("risk_pct", risk_pct)? / 100.0;

    let risk_usdt = equity * risk_fraction;
    let lev = leverage.max(1) as f64;

    let by_risk = match meta.kind {
        ContractKind::Linear => {
            let dist = finite_positive("stop distance", (entry - stop_loss).abs())?;
            risk_usdt / (dist * ct_val)
        }
        ContractKind::Inverse => {
            let d = finite_positive("inverse stop distance", (1.0 / entry - 1.0 / stop_loss).abs())?;
            let rate = finite_positive("settlement rate", account.settle_to_usdt)?;
            risk_usdt / (ct_val * d * rate)
        }
    };
    let by_risk = finite_positive("risk size", by_risk)?;

    // Inverse margin is coin-denominated; the USDT estimate is used as a cap.
    let by_margin = finite_positive("margin cap", (equity * lev) / (entry * ct_val))?;

    let mut size = by_risk.min(by_margin);

    let max_mkt = meta.max_market_size.filter(|m| *m > 0.0);
    if let Some(max) = max_mkt {
        size = size.min(max);
    }

    let lot = if meta.lot_size > 0.0 { meta.lot_size } else { 1.0 };
    let min = if meta.min_size > 0.0 { meta.min_size } else { lot };

    size = (size / lot + LOT_EPS).floor() * lot;
    if size < min {
        debug!(
            inst = %meta.inst_id,
            computed = size,
            min,
            "size below minimum, raising to min size"
        );
        size = min;
    }

    if let Some(max) = max_mkt {
        if size > max {
            return Err(BotError::invalid(format!(
                "min size {min} exceeds max market size {max} for {}",
                meta.inst_id
            )));
        }
    }

    finite_positive("size", size)
}

/// Full trade parameters for an entry on `side` at `entry`.
pub fn compute_trade_params(
    side: Side,
    entry: f64,
    settings: &TradingSettings,
    meta: &InstrumentMeta,
    account: AccountSnapshot,
) -> Result<TradeParams> {
    let pos_side = PosSide::from_entry(side)
        .ok_or_else(|| BotError::invalid("signal has no side"))?;

    let entry = finite_positive("entry", entry)?;

    let stop_pct = settings.stop_pct;
    if !stop_pct.is_finite() || stop_pct <= 0.0 {
        return Err(BotError::invalid(format!("stop_pct must be > 0 (got {stop_pct})")));
    }
    if stop_pct > MAX_STOP_PCT {
        return Err(BotError::invalid(format!(
            "stop_pct {stop_pct} exceeds sanity bound {MAX_STOP_PCT}"
        )));
    }
    let stop_fraction = stop_pct / 100.0;

    let rr = if settings.take_profit_rr.is_finite() && settings.take_profit_rr > 0.0 {
        settings.take_profit_rr
    } else {
        DEFAULT_RR
    };
    let leverage = settings.leverage.max(1);
    let tick = meta.tick_size;

    let sign = pos_side.sign();
    let sl_raw = entry * (1.0 - sign * stop_fraction);
    let stop_loss = finite_positive("stop loss", round_stop(sl_raw, tick, pos_side))?;

    let risk_distance = finite_positive("risk distance", (entry - stop_loss).abs())?;

    let tp_raw = entry + sign * rr * risk_distance;
    let take_profit = finite_positive("take profit", round_target(tp_raw, tick, pos_side))?;

    let size = size_by_risk(meta, entry, stop_loss, settings.risk_pct, leverage, account)?;

    Ok(TradeParams {
        entry,
        stop_loss,
        take_profit,
        size,
        tick_size: tick,
        risk_pct: settings.risk_pct,
        rr,
        risk_distance,
        leverage,
        pos_side,
    })
}

/// Fetch equity (and the settlement rate for inverse contracts) and size the
/// trade.
pub async fn size_for_signal(
    gateway: &dyn ExchangeGateway,
    side: Side,
    entry: f64,
    settings: &TradingSettings,
    meta: &InstrumentMeta,
) -> Result<TradeParams> {
    let equity = gateway.account_equity().await?;
    let settle_to_usdt = match meta.kind {
        ContractKind::Linear => 1.0,
        ContractKind::Inverse => gateway.settle_to_usdt(&meta.settle_ccy).await?,
    };
    compute_trade_params(
        side,
        entry,
        settings,
        meta,
        AccountSnapshot {
            equity,
            settle_to_usdt,
        },
    )
}
