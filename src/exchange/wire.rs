// =============================================================================
// OKX v5 wire types — one tagged struct per endpoint payload
// =============================================================================
//
// Every REST response is `{ "code": "0", "msg": "", "data": [...] }`. Order
// endpoints add a per-item `sCode`/`sMsg`. Numbers arrive as strings; empty
// strings mean "not set".
//
// Nothing in here leaks past the gateway: conversions produce the core types.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{BotError, Result};
use crate::types::{
    normalize_timeframe, CandleTick, ContractKind, ExchangePosition, InstrumentMeta, PosSide,
};

/// Parse an OKX numeric string; empty or malformed values read as 0.
pub fn num(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

/// Timeframe label in OKX `bar` form (`15m`, `1H`, `4H`, `1D`).
pub fn okx_bar(tf: &str) -> String {
    let tf = normalize_timeframe(tf);
    if let Some(n) = tf.strip_suffix('h') {
        format!("{n}H")
    } else if let Some(n) = tf.strip_suffix('d') {
        format!("{n}D")
    } else {
        tf
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Envelope<T> {
    /// Data rows if the top-level code is "0".
    pub fn into_data(self) -> Result<Vec<T>> {
        if self.code != "0" {
            return Err(BotError::rejection(self.code, self.msg));
        }
        Ok(self.data)
    }
}

// ── Orders ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    #[serde(default)]
    pub ord_id: String,
    #[serde(default)]
    pub algo_id: String,
    #[serde(default)]
    pub s_code: String,
    #[serde(default)]
    pub s_msg: String,
}

impl Envelope<OrderAck> {
    /// First acknowledgement, failing on either the top-level or the item
    /// code. The item code is reported first since it is more specific.
    pub fn into_ack(self) -> Result<OrderAck> {
        if let Some(first) = self.data.first() {
            if !first.s_code.is_empty() && first.s_code != "0" {
                return Err(BotError::rejection(first.s_code.clone(), first.s_msg.clone()));
            }
        }
        let mut data = self.into_data()?;
        if data.is_empty() {
            return Err(BotError::rejection("empty", "no acknowledgement in response"));
        }
        Ok(data.swap_remove(0))
    }
}

// ── Instruments / tickers ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentWire {
    #[serde(default)]
    pub inst_id: String,
    #[serde(default)]
    pub ct_type: String,
    #[serde(default)]
    pub ct_val: String,
    #[serde(default)]
    pub ct_mult: String,
    #[serde(default)]
    pub settle_ccy: String,
    #[serde(default)]
    pub lot_sz: String,
    #[serde(default)]
    pub min_sz: String,
    #[serde(default)]
    pub tick_sz: String,
    #[serde(default)]
    pub max_mkt_sz: String,
}

impl InstrumentWire {
    pub fn into_meta(self, last_price: f64) -> Result<InstrumentMeta> {
        let kind = match self.ct_type.as_str() {
            "linear" => ContractKind::Linear,
            "inverse" => ContractKind::Inverse,
            other => {
                return Err(BotError::invalid(format!(
                    "{}: unsupported contract type {other:?}",
                    self.inst_id
                )))
            }
        };

        let ct_val = num(&self.ct_val);
        let ct_mult = match num(&self.ct_mult) {
            m if m > 0.0 => m,
            _ => 1.0,
        };
        let max_mkt = num(&self.max_mkt_sz);

        Ok(InstrumentMeta {
            last_price,
            tick_size: num(&self.tick_sz),
            lot_size: num(&self.lot_sz),
            min_size: num(&self.min_sz),
            contract_value: ct_val * ct_mult,
            kind,
            settle_ccy: self.settle_ccy.to_uppercase(),
            max_market_size: (max_mkt > 0.0).then_some(max_mkt),
            inst_id: self.inst_id,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerWire {
    #[serde(default)]
    pub inst_id: String,
    #[serde(default)]
    pub last: String,
}

// ── Account ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceDetailWire {
    #[serde(default)]
    pub ccy: String,
    #[serde(default)]
    pub eq: String,
    #[serde(default)]
    pub avail_eq: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceWire {
    #[serde(default)]
    pub total_eq: String,
    #[serde(default)]
    pub details: Vec<BalanceDetailWire>,
}

impl BalanceWire {
    /// USDT available equity, then USDT equity, then account total equity.
    pub fn usdt_equity(&self) -> f64 {
        if let Some(d) = self.details.iter().find(|d| d.ccy == "USDT") {
            let avail = num(&d.avail_eq);
            if avail > 0.0 {
                return avail;
            }
            let eq = num(&d.eq);
            if eq > 0.0 {
                return eq;
            }
        }
        num(&self.total_eq)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionWire {
    #[serde(default)]
    pub inst_id: String,
    #[serde(default)]
    pub pos_side: String,
    #[serde(default)]
    pub pos: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub mark_px: String,
    #[serde(default)]
    pub last: String,
    #[serde(default)]
    pub lever: String,
}

impl PositionWire {
    /// `None` for flat rows or rows without a long/short side.
    pub fn into_position(self) -> Option<ExchangePosition> {
        let size = num(&self.pos).abs();
        if size <= 0.0 {
            return None;
        }
        let pos_side = PosSide::parse(&self.pos_side)?;
        let mark = match num(&self.last) {
            px if px > 0.0 => px,
            _ => num(&self.mark_px),
        };
        Some(ExchangePosition {
            inst_id: self.inst_id,
            pos_side,
            size,
            entry_price: num(&self.avg_px),
            mark_price: mark,
            leverage: self.lever.trim().parse::<f64>().map(|l| l as u32).unwrap_or(1),
        })
    }
}

// ── Candles ──────────────────────────────────────────────────────────────────

/// Decode one candle row `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`.
/// Returns the candle and whether it is closed (`confirm == "1"`). History
/// rows without a confirm column count as closed.
pub fn parse_candle_row(inst_id: &str, timeframe: &str, row: &[String]) -> Option<(CandleTick, bool)> {
    if row.len() < 5 {
        return None;
    }
    let ts_ms: i64 = row[0].parse().ok()?;
    let start = DateTime::<Utc>::from_timestamp_millis(ts_ms)?;
    let close = num(&row[4]);
    if close <= 0.0 {
        return None;
    }
    let volume = row.get(5).map(|v| num(v)).unwrap_or(0.0);
    let confirmed = row.get(8).map(|c| c == "1").unwrap_or(true);

    let tick = CandleTick::from_start(
        inst_id,
        timeframe,
        start,
        [num(&row[1]), num(&row[2]), num(&row[3]), close, volume],
    );
    Some((tick, confirmed))
}

/// A push frame on the business websocket.
#[derive(Debug, Deserialize)]
pub struct WsPush {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub arg: Option<WsArg>,
    #[serde(default)]
    pub data: Vec<Vec<String>>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsArg {
    pub channel: String,
    #[serde(default)]
    pub inst_id: String,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_meta_multiplies_contract_value() {
        let json = r#"{"code":"0","msg":"","data":[{"instId":"BTC-USDT-SWAP","ctType":"linear",
            "ctVal":"0.01","ctMult":"1","settleCcy":"USDT","lotSz":"0.01","minSz":"0.01",
            "tickSz":"0.1","maxMktSz":"10000"}]}"#;
        let env: Envelope<InstrumentWire> = serde_json::from_str(json).unwrap();
        let meta = env.into_data().unwrap().remove(0).into_meta(65_000.0).unwrap();
        assert_eq!(meta.kind, ContractKind::Linear);
        assert!((meta.contract_value - 0.01).abs() < 1e-12);
        assert_eq!(meta.max_market_size, Some(10_000.0));
        assert!((meta.last_price - 65_000.0).abs() < 1e-9);
    }

    #[test]
    fn unsupported_contract_type_rejected() {
        let w = InstrumentWire {
            inst_id: "X".into(),
            ct_type: "".into(),
            ..Default::default()
        };
        assert!(w.into_meta(1.0).is_err());
    }

    #[test]
    fn order_item_code_surfaces_as_rejection() {
        let json = r#"{"code":"1","msg":"All operations failed",
            "data":[{"ordId":"","sCode":"51008","sMsg":"Insufficient margin"}]}"#;
        let env: Envelope<OrderAck> = serde_json::from_str(json).unwrap();
        match env.into_ack() {
            Err(BotError::ExchangeRejection { code, message }) => {
                assert_eq!(code, "51008");
                assert_eq!(message, "Insufficient margin");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn successful_algo_ack() {
        let json = r#"{"code":"0","msg":"","data":[{"algoId":"7788","sCode":"0","sMsg":""}]}"#;
        let env: Envelope<OrderAck> = serde_json::from_str(json).unwrap();
        assert_eq!(env.into_ack().unwrap().algo_id, "7788");
    }

    #[test]
    fn balance_prefers_usdt_available() {
        let b = BalanceWire {
            total_eq: "2000".into(),
            details: vec![BalanceDetailWire {
                ccy: "USDT".into(),
                eq: "1500".into(),
                avail_eq: "1200".into(),
            }],
        };
        assert!((b.usdt_equity() - 1_200.0).abs() < 1e-9);
        let b = BalanceWire {
            total_eq: "2000".into(),
            details: vec![],
        };
        assert!((b.usdt_equity() - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn flat_positions_skipped() {
        let flat = PositionWire {
            inst_id: "ETH-USDT-SWAP".into(),
            pos_side: "long".into(),
            pos: "0".into(),
            ..Default::default()
        };
        assert!(flat.into_position().is_none());

        let short = PositionWire {
            inst_id: "ETH-USDT-SWAP".into(),
            pos_side: "short".into(),
            pos: "-3".into(),
            avg_px: "3000".into(),
            mark_px: "2990".into(),
            lever: "10".into(),
            ..Default::default()
        };
        let p = short.into_position().unwrap();
        assert_eq!(p.pos_side, PosSide::Short);
        assert!((p.size - 3.0).abs() < 1e-12);
        assert!((p.mark_price - 2_990.0).abs() < 1e-9);
        assert_eq!(p.leverage, 10);
    }

    #[test]
    fn candle_row_with_confirm_flag() {
        let row: Vec<String> = ["1704067200000", "1", "2", "0.5", "1.5", "100", "0", "0", "0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (c, confirmed) = parse_candle_row("BTC-USDT-SWAP", "candle1m", &row).unwrap();
        assert!(!confirmed);
        assert_eq!(c.timeframe, "1m");
        assert_eq!((c.end - c.start).num_seconds(), 60);
    }

    #[test]
    fn okx_bar_uppercases_hours() {
        assert_eq!(okx_bar("1h"), "1H");
        assert_eq!(okx_bar("60m"), "1H");
        assert_eq!(okx_bar("15m"), "15m");
    }
}
