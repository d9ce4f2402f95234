// =============================================================================
// Exchange Gateway — the narrow contract the trading core depends on
// =============================================================================
//
// The core only ever sees the typed results defined in `types.rs`. Wire
// formats, request signing and transport errors stay behind this trait.
//
// Implementations:
//   okx::OkxClient       signed REST client for OKX v5 perpetual swaps.
//   paper::PaperExchange in-memory simulation for demo mode and tests.
// =============================================================================

pub mod okx;
pub mod paper;
pub mod wire;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::settings::AccountSettings;
use crate::types::{CandleTick, ExchangePosition, InstrumentMeta, PosSide, Side};

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Contract parameters plus the current last price.
    async fn instrument_meta(&self, inst_id: &str) -> Result<InstrumentMeta>;

    /// Account equity in USDT.
    async fn account_equity(&self) -> Result<f64>;

    /// Open (or add to) a position with a market order. Returns the order id.
    async fn place_market_order(
        &self,
        inst_id: &str,
        size: f64,
        side: Side,
        leverage: u32,
    ) -> Result<String>;

    /// Place a reduce-side conditional order protecting `pos_side`: a stop
    /// when `is_take_profit` is false, a target otherwise. Returns the algo id.
    async fn place_conditional_order(
        &self,
        inst_id: &str,
        pos_side: PosSide,
        size: f64,
        trigger_price: f64,
        is_take_profit: bool,
    ) -> Result<String>;

    async fn cancel_conditional_order(&self, inst_id: &str, algo_id: &str) -> Result<()>;

    /// Reduce-only market close of `size` contracts. Returns the order id.
    async fn close_market(&self, inst_id: &str, pos_side: PosSide, size: f64) -> Result<String>;

    async fn open_positions(&self) -> Result<Vec<ExchangePosition>>;

    /// Price of `ccy` in USDT; 1.0 for USDT itself.
    async fn settle_to_usdt(&self, ccy: &str) -> Result<f64>;

    /// Closed candles, oldest first.
    async fn candles(&self, inst_id: &str, timeframe: &str, limit: usize) -> Result<Vec<CandleTick>>;
}

/// Builds the gateway an account trades through from its credentials.
pub trait GatewayFactory: Send + Sync {
    fn for_account(&self, settings: &AccountSettings) -> Result<Arc<dyn ExchangeGateway>>;
}
