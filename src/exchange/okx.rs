// =============================================================================
// OKX v5 REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the API secret and passphrase are never logged or serialized.
// The signature is base64(HMAC-SHA256(secret, ts + METHOD + path + body))
// where `path` includes the query string.
//
// Accounts trade USDT-margined or coin-margined perpetual swaps in cross
// margin, long/short position mode.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::wire::{
    okx_bar, parse_candle_row, BalanceWire, Envelope, InstrumentWire, OrderAck, PositionWire,
    TickerWire,
};
use super::{ExchangeGateway, GatewayFactory};
use crate::error::{BotError, Result};
use crate::settings::{AccountSettings, Credentials};
use crate::types::{CandleTick, ExchangePosition, InstrumentMeta, PosSide, Side};

type HmacSha256 = Hmac<Sha256>;

/// OKX caps a single candles page at 300 rows.
const MAX_CANDLES_PER_PAGE: usize = 300;

/// Format a size or price without float noise (`0.30000000000000004` -> `0.3`).
pub fn fmt_decimal(v: f64) -> String {
    let s = format!("{v:.10}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

/// OKX v5 REST client. Without credentials it serves public market data only.
#[derive(Clone)]
pub struct OkxClient {
    credentials: Option<Credentials>,
    base_url: String,
    client: reqwest::Client,
}

impl OkxClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Signed client for one account.
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Result<Self> {
        if !credentials.is_complete() {
            return Err(BotError::config("OKX credentials are incomplete"));
        }
        Self::build(base_url.into(), Some(credentials))
    }

    /// Unsigned client for candles, tickers and instruments.
    pub fn public(base_url: impl Into<String>) -> Result<Self> {
        Self::build(base_url.into(), None)
    }

    fn build(base_url: String, credentials: Option<Credentials>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BotError::config(format!("failed to build http client: {e}")))?;

        debug!(
            base_url = %base_url,
            signed = credentials.is_some(),
            "OkxClient initialised"
        );

        Ok(Self {
            credentials,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// base64(HMAC-SHA256(secret, prehash)).
    pub fn sign(secret: &str, prehash: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| BotError::config(format!("invalid api secret: {e}")))?;
        mac.update(prehash.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// ISO-8601 UTC timestamp with milliseconds, as OKX expects.
    pub fn timestamp() -> String {
        chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> Result<Envelope<T>> {
        let body_str = match &body {
            Some(b) => serde_json::to_string(b)
                .map_err(|e| BotError::invalid(format!("unserialisable body: {e}")))?,
            None => String::new(),
        };

        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Content-Type", "application/json");

        if signed {
            let creds = self
                .credentials
                .as_ref()
                .ok_or_else(|| BotError::config("signed request on a public client"))?;
            let ts = Self::timestamp();
            let prehash = format!("{ts}{}{path}{body_str}", method.as_str());
            let sig = Self::sign(&creds.api_secret, &prehash)?;
            req = req
                .header("OK-ACCESS-KEY", &creds.api_key)
                .header("OK-ACCESS-SIGN", sig)
                .header("OK-ACCESS-TIMESTAMP", ts)
                .header("OK-ACCESS-PASSPHRASE", &creds.passphrase);
            if creds.simulated {
                req = req.header("x-simulated-trading", "1");
            }
        }

        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        match serde_json::from_str::<Envelope<T>>(&text) {
            Ok(env) => Ok(env),
            Err(e) if status.is_success() => Err(BotError::rejection(
                "decode",
                format!("{} {path}: {e}", method.as_str()),
            )),
            Err(_) => Err(BotError::rejection(
                status.as_u16().to_string(),
                format!("{} {path}: {}", method.as_str(), text.chars().take(200).collect::<String>()),
            )),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, signed: bool) -> Result<Vec<T>> {
        self.request::<T>(Method::GET, path, None, signed)
            .await?
            .into_data()
    }

    async fn post_order(&self, path: &str, body: serde_json::Value) -> Result<OrderAck> {
        self.request::<OrderAck>(Method::POST, path, Some(body), true)
            .await?
            .into_ack()
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v5/market/ticker returns the last traded price.
    #[instrument(skip(self), name = "okx::last_price")]
    pub async fn last_price(&self, inst_id: &str) -> Result<f64> {
        let rows: Vec<TickerWire> = self
            .get(&format!("/api/v5/market/ticker?instId={inst_id}"), false)
            .await?;
        let last = rows
            .first()
            .map(|t| super::wire::num(&t.last))
            .unwrap_or(0.0);
        if last <= 0.0 {
            return Err(BotError::NotFound(format!("no last price for {inst_id}")));
        }
        Ok(last)
    }

    /// GET /api/v5/market/candles returns closed candles, oldest first.
    #[instrument(skip(self), name = "okx::get_candles")]
    pub async fn get_candles(
        &self,
        inst_id: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<CandleTick>> {
        let limit = limit.clamp(1, MAX_CANDLES_PER_PAGE);
        let path = format!(
            "/api/v5/market/candles?instId={inst_id}&bar={}&limit={limit}",
            okx_bar(timeframe)
        );
        let rows: Vec<Vec<String>> = self.get(&path, false).await?;

        // Newest first on the wire; the still-forming bar is dropped.
        let mut candles: Vec<CandleTick> = rows
            .iter()
            .filter_map(|row| parse_candle_row(inst_id, timeframe, row))
            .filter(|(_, confirmed)| *confirmed)
            .map(|(c, _)| c)
            .collect();
        candles.reverse();

        debug!(inst_id, timeframe, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// POST /api/v5/account/set-leverage (cross margin).
    #[instrument(skip(self), name = "okx::set_leverage")]
    pub async fn set_leverage(&self, inst_id: &str, leverage: u32) -> Result<()> {
        let body = json!({
            "instId": inst_id,
            "lever": leverage.max(1).to_string(),
            "mgnMode": "cross",
        });
        self.request::<serde_json::Value>(Method::POST, "/api/v5/account/set-leverage", Some(body), true)
            .await?
            .into_data()
            .map(|_| ())
    }
}

#[async_trait]
impl ExchangeGateway for OkxClient {
    #[instrument(skip(self), name = "okx::instrument_meta")]
    async fn instrument_meta(&self, inst_id: &str) -> Result<InstrumentMeta> {
        let rows: Vec<InstrumentWire> = self
            .get(
                &format!("/api/v5/public/instruments?instType=SWAP&instId={inst_id}"),
                false,
            )
            .await?;
        let wire = rows
            .into_iter()
            .next()
            .ok_or_else(|| BotError::NotFound(format!("instrument {inst_id}")))?;
        let last = self.last_price(inst_id).await?;
        wire.into_meta(last)
    }

    #[instrument(skip(self), name = "okx::account_equity")]
    async fn account_equity(&self) -> Result<f64> {
        let rows: Vec<BalanceWire> = self.get("/api/v5/account/balance?ccy=USDT", true).await?;
        let equity = rows.first().map(BalanceWire::usdt_equity).unwrap_or(0.0);
        debug!(equity, "equity retrieved");
        Ok(equity)
    }

    #[instrument(skip(self), name = "okx::place_market_order")]
    async fn place_market_order(
        &self,
        inst_id: &str,
        size: f64,
        side: Side,
        leverage: u32,
    ) -> Result<String> {
        let pos_side = PosSide::from_entry(side)
            .ok_or_else(|| BotError::invalid("market order without a side"))?;

        if let Err(e) = self.set_leverage(inst_id, leverage).await {
            warn!(inst_id, leverage, error = %e, "set-leverage failed; placing order anyway");
        }

        let body = json!({
            "instId": inst_id,
            "tdMode": "cross",
            "side": side.as_str(),
            "posSide": pos_side.as_str(),
            "ordType": "market",
            "sz": fmt_decimal(size),
        });
        let ack = self.post_order("/api/v5/trade/order", body).await?;
        debug!(inst_id, side = %side, size, ord_id = %ack.ord_id, "market order placed");
        Ok(ack.ord_id)
    }

    #[instrument(skip(self), name = "okx::place_conditional_order")]
    async fn place_conditional_order(
        &self,
        inst_id: &str,
        pos_side: PosSide,
        size: f64,
        trigger_price: f64,
        is_take_profit: bool,
    ) -> Result<String> {
        let px = fmt_decimal(trigger_price);
        let mut body = json!({
            "instId": inst_id,
            "tdMode": "cross",
            "side": pos_side.closing_side().as_str(),
            "posSide": pos_side.as_str(),
            "ordType": "conditional",
            "sz": fmt_decimal(size),
        });
        let (trigger_key, ord_key, type_key) = if is_take_profit {
            ("tpTriggerPx", "tpOrdPx", "tpTriggerPxType")
        } else {
            ("slTriggerPx", "slOrdPx", "slTriggerPxType")
        };
        body[trigger_key] = json!(px);
        body[ord_key] = json!("-1");
        body[type_key] = json!("last");

        let ack = self.post_order("/api/v5/trade/order-algo", body).await?;
        debug!(inst_id, %pos_side, trigger_price, is_take_profit, algo_id = %ack.algo_id, "conditional placed");
        Ok(ack.algo_id)
    }

    #[instrument(skip(self), name = "okx::cancel_conditional_order")]
    async fn cancel_conditional_order(&self, inst_id: &str, algo_id: &str) -> Result<()> {
        let body = json!([{ "instId": inst_id, "algoId": algo_id }]);
        self.post_order("/api/v5/trade/cancel-algos", body).await?;
        debug!(inst_id, algo_id, "conditional cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "okx::close_market")]
    async fn close_market(&self, inst_id: &str, pos_side: PosSide, size: f64) -> Result<String> {
        let body = json!({
            "instId": inst_id,
            "tdMode": "cross",
            "side": pos_side.closing_side().as_str(),
            "posSide": pos_side.as_str(),
            "ordType": "market",
            "sz": fmt_decimal(size),
            "reduceOnly": true,
        });
        let ack = self.post_order("/api/v5/trade/order", body).await?;
        debug!(inst_id, %pos_side, size, ord_id = %ack.ord_id, "reduce-only close placed");
        Ok(ack.ord_id)
    }

    #[instrument(skip(self), name = "okx::open_positions")]
    async fn open_positions(&self) -> Result<Vec<ExchangePosition>> {
        let rows: Vec<PositionWire> = self
            .get("/api/v5/account/positions?instType=SWAP", true)
            .await?;
        let positions: Vec<ExchangePosition> = rows
            .into_iter()
            .filter_map(PositionWire::into_position)
            .collect();
        debug!(count = positions.len(), "open positions retrieved");
        Ok(positions)
    }

    async fn settle_to_usdt(&self, ccy: &str) -> Result<f64> {
        let ccy = ccy.trim().to_uppercase();
        if ccy.is_empty() || ccy == "USDT" {
            return Ok(1.0);
        }
        self.last_price(&format!("{ccy}-USDT")).await
    }

    async fn candles(&self, inst_id: &str, timeframe: &str, limit: usize) -> Result<Vec<CandleTick>> {
        self.get_candles(inst_id, timeframe, limit).await
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// One signed client per account, all against the same REST base URL.
#[derive(Debug, Clone)]
pub struct OkxGatewayFactory {
    base_url: String,
}

impl OkxGatewayFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl GatewayFactory for OkxGatewayFactory {
    fn for_account(&self, settings: &AccountSettings) -> Result<Arc<dyn ExchangeGateway>> {
        let client = OkxClient::new(self.base_url.clone(), settings.credentials.clone())?;
        Ok(Arc::new(client))
    }
}
