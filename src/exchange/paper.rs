// =============================================================================
// Paper Exchange — in-memory fills, conditional orders and positions
// =============================================================================
//
// Fills market orders at the last known price, keeps long/short positions per
// instrument and triggers stop/target conditionals when `set_price` crosses
// them. Market metadata comes from seeded values or, when configured, from a
// public market-data gateway (so demo mode trades on live prices).
//
// Tests use `fail_next` / `fail_nth` to make a specific call reject once.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ExchangeGateway, GatewayFactory};
use crate::error::{BotError, Result};
use crate::settings::AccountSettings;
use crate::types::{
    normalize_timeframe, position_key, CandleTick, ContractKind, ExchangePosition, InstrumentMeta,
    PosSide, Side,
};

/// Gateway operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperCall {
    InstrumentMeta,
    Equity,
    MarketOrder,
    Conditional,
    Cancel,
    Close,
    Positions,
}

/// A resting conditional order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperAlgo {
    pub algo_id: String,
    pub inst_id: String,
    pub pos_side: PosSide,
    pub size: f64,
    pub trigger_price: f64,
    pub is_take_profit: bool,
}

/// One executed market order, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperFill {
    pub ord_id: String,
    pub inst_id: String,
    pub side: Side,
    pub pos_side: PosSide,
    pub size: f64,
    pub price: f64,
    pub reduce_only: bool,
}

#[derive(Default)]
struct PaperState {
    equity: f64,
    metas: HashMap<String, InstrumentMeta>,
    prices: HashMap<String, f64>,
    positions: HashMap<String, ExchangePosition>,
    algos: Vec<PaperAlgo>,
    fills: Vec<PaperFill>,
    candles: HashMap<(String, String), Vec<CandleTick>>,
    /// Calls to let through before the scripted failure fires.
    failures: HashMap<PaperCall, u32>,
}

impl PaperState {
    fn check(&mut self, call: PaperCall) -> Result<()> {
        match self.failures.get_mut(&call) {
            Some(0) => {
                self.failures.remove(&call);
                Err(BotError::rejection("paper", format!("scripted {call:?} failure")))
            }
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn price_of(&self, inst_id: &str) -> Option<f64> {
        self.prices
            .get(inst_id)
            .copied()
            .or_else(|| self.metas.get(inst_id).map(|m| m.last_price))
            .filter(|p| *p > 0.0)
    }

    /// Realised PnL in USDT of closing `size` contracts at `exit`.
    fn realised_pnl(&self, pos: &ExchangePosition, size: f64, exit: f64) -> f64 {
        let Some(meta) = self.metas.get(&pos.inst_id) else {
            return 0.0;
        };
        let sign = pos.pos_side.sign();
        match meta.kind {
            ContractKind::Linear => (exit - pos.entry_price) * sign * size * meta.contract_value,
            ContractKind::Inverse => {
                if pos.entry_price <= 0.0 || exit <= 0.0 {
                    return 0.0;
                }
                let coin = size * meta.contract_value * (1.0 / pos.entry_price - 1.0 / exit) * sign;
                coin * exit
            }
        }
    }

    /// Reduce a position; drops it and its conditionals once flat.
    fn reduce(&mut self, key: &str, size: f64, exit: f64) -> Option<f64> {
        let pos = self.positions.get(key)?.clone();
        let closed = size.min(pos.size);
        let pnl = self.realised_pnl(&pos, closed, exit);
        self.equity += pnl;

        let remaining = pos.size - closed;
        if remaining <= 1e-12 {
            self.positions.remove(key);
            self.algos
                .retain(|a| !(a.inst_id == pos.inst_id && a.pos_side == pos.pos_side));
        } else if let Some(p) = self.positions.get_mut(key) {
            p.size = remaining;
        }
        Some(closed)
    }
}

/// In-memory exchange used for paper trading and tests.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    market: Option<Arc<dyn ExchangeGateway>>,
}

impl PaperExchange {
    pub fn new(equity: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                equity,
                ..Default::default()
            }),
            market: None,
        }
    }

    /// Paper account that pulls instrument metadata, prices and candles from
    /// a public market-data gateway.
    pub fn with_market(equity: f64, market: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            market: Some(market),
            ..Self::new(equity)
        }
    }

    // -------------------------------------------------------------------------
    // Seeding / scripting
    // -------------------------------------------------------------------------

    pub fn add_instrument(&self, meta: InstrumentMeta) {
        let mut st = self.state.lock();
        st.prices.insert(meta.inst_id.clone(), meta.last_price);
        st.metas.insert(meta.inst_id.clone(), meta);
    }

    pub fn seed_candles(&self, inst_id: &str, timeframe: &str, candles: Vec<CandleTick>) {
        self.state
            .lock()
            .candles
            .insert((inst_id.to_string(), normalize_timeframe(timeframe)), candles);
    }

    /// Insert a position directly (as if opened outside the bot).
    pub fn seed_position(&self, pos: ExchangePosition) {
        self.state.lock().positions.insert(pos.key(), pos);
    }

    pub fn set_equity(&self, equity: f64) {
        self.state.lock().equity = equity;
    }

    /// Make the next call of `call` fail.
    pub fn fail_next(&self, call: PaperCall) {
        self.fail_nth(call, 0);
    }

    /// Let `skip` calls of `call` succeed, then fail the one after.
    pub fn fail_nth(&self, call: PaperCall, skip: u32) {
        self.state.lock().failures.insert(call, skip);
    }

    /// Move the price of `inst_id`, marking positions and firing any
    /// conditionals it crosses. Returns the ids of the triggered orders.
    pub fn set_price(&self, inst_id: &str, price: f64) -> Vec<String> {
        if !(price.is_finite() && price > 0.0) {
            return Vec::new();
        }
        let mut st = self.state.lock();
        st.prices.insert(inst_id.to_string(), price);
        if let Some(m) = st.metas.get_mut(inst_id) {
            m.last_price = price;
        }
        for p in st.positions.values_mut().filter(|p| p.inst_id == inst_id) {
            p.mark_price = price;
        }

        let triggered: Vec<PaperAlgo> = st
            .algos
            .iter()
            .filter(|a| a.inst_id == inst_id)
            .filter(|a| {
                let favourable = match a.pos_side {
                    PosSide::Long => price >= a.trigger_price,
                    PosSide::Short => price <= a.trigger_price,
                };
                if a.is_take_profit {
                    favourable
                } else {
                    match a.pos_side {
                        PosSide::Long => price <= a.trigger_price,
                        PosSide::Short => price >= a.trigger_price,
                    }
                }
            })
            .cloned()
            .collect();

        let mut fired = Vec::new();
        for algo in triggered {
            // A sibling may already have flattened the position.
            if !st.algos.iter().any(|a| a.algo_id == algo.algo_id) {
                continue;
            }
            st.algos.retain(|a| a.algo_id != algo.algo_id);
            let key = position_key(&algo.inst_id, algo.pos_side);
            if let Some(closed) = st.reduce(&key, algo.size, price) {
                info!(
                    inst_id,
                    pos_side = %algo.pos_side,
                    closed,
                    price,
                    take_profit = algo.is_take_profit,
                    "paper conditional triggered"
                );
                fired.push(algo.algo_id);
            }
        }
        fired
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn algo_orders(&self) -> Vec<PaperAlgo> {
        self.state.lock().algos.clone()
    }

    pub fn fills(&self) -> Vec<PaperFill> {
        self.state.lock().fills.clone()
    }

    pub fn positions_snapshot(&self) -> Vec<ExchangePosition> {
        self.state.lock().positions.values().cloned().collect()
    }

    pub fn equity(&self) -> f64 {
        self.state.lock().equity
    }

    fn record_fill(st: &mut PaperState, fill: PaperFill) -> String {
        let id = fill.ord_id.clone();
        st.fills.push(fill);
        id
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn instrument_meta(&self, inst_id: &str) -> Result<InstrumentMeta> {
        {
            let mut st = self.state.lock();
            st.check(PaperCall::InstrumentMeta)?;
            if let Some(meta) = st.metas.get(inst_id) {
                let mut meta = meta.clone();
                if let Some(px) = st.price_of(inst_id) {
                    meta.last_price = px;
                }
                return Ok(meta);
            }
        }
        let market = self
            .market
            .as_ref()
            .ok_or_else(|| BotError::NotFound(format!("instrument {inst_id}")))?;
        let meta = market.instrument_meta(inst_id).await?;
        self.add_instrument(meta.clone());
        Ok(meta)
    }

    async fn account_equity(&self) -> Result<f64> {
        let mut st = self.state.lock();
        st.check(PaperCall::Equity)?;
        Ok(st.equity)
    }

    async fn place_market_order(
        &self,
        inst_id: &str,
        size: f64,
        side: Side,
        leverage: u32,
    ) -> Result<String> {
        let pos_side = PosSide::from_entry(side)
            .ok_or_else(|| BotError::invalid("market order without a side"))?;
        if !(size.is_finite() && size > 0.0) {
            return Err(BotError::rejection("51000", "Parameter sz error"));
        }

        let mut st = self.state.lock();
        st.check(PaperCall::MarketOrder)?;
        let price = st
            .price_of(inst_id)
            .ok_or_else(|| BotError::rejection("51001", format!("unknown instrument {inst_id}")))?;

        let key = position_key(inst_id, pos_side);
        let pos = st.positions.entry(key).or_insert_with(|| ExchangePosition {
            inst_id: inst_id.to_string(),
            pos_side,
            size: 0.0,
            entry_price: price,
            mark_price: price,
            leverage: leverage.max(1),
        });
        let total = pos.size + size;
        pos.entry_price = (pos.entry_price * pos.size + price * size) / total;
        pos.size = total;
        pos.mark_price = price;
        pos.leverage = leverage.max(1);

        let ord_id = Uuid::new_v4().to_string();
        debug!(inst_id, side = %side, size, price, "paper market fill");
        Ok(Self::record_fill(
            &mut st,
            PaperFill {
                ord_id,
                inst_id: inst_id.to_string(),
                side,
                pos_side,
                size,
                price,
                reduce_only: false,
            },
        ))
    }

    async fn place_conditional_order(
        &self,
        inst_id: &str,
        pos_side: PosSide,
        size: f64,
        trigger_price: f64,
        is_take_profit: bool,
    ) -> Result<String> {
        let mut st = self.state.lock();
        st.check(PaperCall::Conditional)?;
        if !(trigger_price.is_finite() && trigger_price > 0.0) {
            return Err(BotError::rejection("51000", "Parameter triggerPx error"));
        }
        let algo_id = Uuid::new_v4().to_string();
        st.algos.push(PaperAlgo {
            algo_id: algo_id.clone(),
            inst_id: inst_id.to_string(),
            pos_side,
            size,
            trigger_price,
            is_take_profit,
        });
        Ok(algo_id)
    }

    async fn cancel_conditional_order(&self, inst_id: &str, algo_id: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check(PaperCall::Cancel)?;
        let before = st.algos.len();
        st.algos
            .retain(|a| !(a.inst_id == inst_id && a.algo_id == algo_id));
        if st.algos.len() == before {
            return Err(BotError::rejection("51603", format!("algo {algo_id} does not exist")));
        }
        Ok(())
    }

    async fn close_market(&self, inst_id: &str, pos_side: PosSide, size: f64) -> Result<String> {
        let mut st = self.state.lock();
        st.check(PaperCall::Close)?;
        let price = st
            .price_of(inst_id)
            .ok_or_else(|| BotError::rejection("51001", format!("unknown instrument {inst_id}")))?;
        let key = position_key(inst_id, pos_side);
        let closed = st
            .reduce(&key, size, price)
            .ok_or_else(|| BotError::rejection("51169", "position does not exist"))?;

        Ok(Self::record_fill(
            &mut st,
            PaperFill {
                ord_id: Uuid::new_v4().to_string(),
                inst_id: inst_id.to_string(),
                side: pos_side.closing_side(),
                pos_side,
                size: closed,
                price,
                reduce_only: true,
            },
        ))
    }

    async fn open_positions(&self) -> Result<Vec<ExchangePosition>> {
        let mut st = self.state.lock();
        st.check(PaperCall::Positions)?;
        Ok(st.positions.values().cloned().collect())
    }

    async fn settle_to_usdt(&self, ccy: &str) -> Result<f64> {
        let ccy = ccy.trim().to_uppercase();
        if ccy.is_empty() || ccy == "USDT" {
            return Ok(1.0);
        }
        let pair = format!("{ccy}-USDT");
        let swap = format!("{ccy}-USDT-SWAP");
        let local = {
            let st = self.state.lock();
            st.price_of(&pair).or_else(|| st.price_of(&swap))
        };
        if let Some(px) = local {
            return Ok(px);
        }
        match &self.market {
            Some(m) => m.settle_to_usdt(&ccy).await,
            None => Err(BotError::NotFound(format!("no USDT price for {ccy}"))),
        }
    }

    async fn candles(&self, inst_id: &str, timeframe: &str, limit: usize) -> Result<Vec<CandleTick>> {
        let seeded = self
            .state
            .lock()
            .candles
            .get(&(inst_id.to_string(), normalize_timeframe(timeframe)))
            .cloned();
        match (seeded, &self.market) {
            (Some(c), _) => {
                let skip = c.len().saturating_sub(limit);
                Ok(c.into_iter().skip(skip).collect())
            }
            (None, Some(m)) => m.candles(inst_id, timeframe, limit).await,
            (None, None) => Ok(Vec::new()),
        }
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Hands every account its own paper book, sharing one market-data source.
pub struct PaperGatewayFactory {
    equity: f64,
    market: Option<Arc<dyn ExchangeGateway>>,
    books: Mutex<HashMap<String, Arc<PaperExchange>>>,
}

impl PaperGatewayFactory {
    pub fn new(equity: f64, market: Option<Arc<dyn ExchangeGateway>>) -> Self {
        Self {
            equity,
            market,
            books: Mutex::new(HashMap::new()),
        }
    }

    /// The paper book of `account_id`, created on first use.
    pub fn book(&self, account_id: &str) -> Arc<PaperExchange> {
        self.books
            .lock()
            .entry(account_id.to_string())
            .or_insert_with(|| {
                Arc::new(match &self.market {
                    Some(m) => PaperExchange::with_market(self.equity, m.clone()),
                    None => PaperExchange::new(self.equity),
                })
            })
            .clone()
    }

    /// Feed a price into every book.
    pub fn set_price(&self, inst_id: &str, price: f64) {
        let books: Vec<Arc<PaperExchange>> = self.books.lock().values().cloned().collect();
        for b in books {
            b.set_price(inst_id, price);
        }
    }
}

impl GatewayFactory for PaperGatewayFactory {
    fn for_account(&self, settings: &AccountSettings) -> Result<Arc<dyn ExchangeGateway>> {
        Ok(self.book(&settings.account_id))
    }
}
