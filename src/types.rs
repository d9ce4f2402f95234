// =============================================================================
// Shared types used across the breakout engine, sessions and gateways
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Directions ───────────────────────────────────────────────────────────────

/// Order side of a signal or an order leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
    None,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
            Self::None => Self::None,
        }
    }

    /// Lower-case wire form ("buy" / "sell").
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::None => write!(f, "NONE"),
        }
    }
}

/// Side of an open position in long/short (hedge) mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosSide {
    Long,
    Short,
}

impl PosSide {
    /// Position side opened by an entry order on `side`.
    pub fn from_entry(side: Side) -> Option<Self> {
        match side {
            Side::Buy => Some(Self::Long),
            Side::Sell => Some(Self::Short),
            Side::None => None,
        }
    }

    pub fn entry_side(self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    /// Side of the order that reduces or closes this position.
    pub fn closing_side(self) -> Side {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short. Multiplies a price move into signed profit.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for PosSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Higher-timeframe trend derived from the fast/slow EMA pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Trend {
    #[default]
    None,
    Up,
    Down,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}

/// Linear contracts settle in the quote currency, inverse in the base coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractKind {
    Linear,
    Inverse,
}

// ── Timeframes ───────────────────────────────────────────────────────────────

/// Normalise a timeframe label: strips a `candle` prefix and folds the hourly
/// spellings (`60m`, `1H`, `1h`) into `1h`.
pub fn normalize_timeframe(tf: &str) -> String {
    let t = tf.trim();
    let t = t.strip_prefix("candle").unwrap_or(t);
    match t {
        "60m" | "1H" | "1h" => "1h".to_string(),
        "4H" | "4h" => "4h".to_string(),
        "1D" | "1d" => "1d".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Length of a (normalised) timeframe in seconds.
pub fn timeframe_secs(tf: &str) -> Option<i64> {
    let tf = normalize_timeframe(tf);
    let (num, unit) = tf.split_at(tf.len().checked_sub(1)?);
    let n: i64 = num.parse().ok()?;
    if n <= 0 {
        return None;
    }
    let mult = match unit {
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return None,
    };
    Some(n * mult)
}

// ── Market data ──────────────────────────────────────────────────────────────

/// A closed candle covering the half-open interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleTick {
    pub inst_id: String,
    pub timeframe: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CandleTick {
    /// Build a candle from its open time; `end` is derived from the timeframe
    /// (falls back to one minute for an unknown label).
    pub fn from_start(
        inst_id: impl Into<String>,
        timeframe: &str,
        start: DateTime<Utc>,
        ohlcv: [f64; 5],
    ) -> Self {
        let secs = timeframe_secs(timeframe).unwrap_or(60);
        Self {
            inst_id: inst_id.into(),
            timeframe: normalize_timeframe(timeframe),
            open: ohlcv[0],
            high: ohlcv[1],
            low: ohlcv[2],
            close: ohlcv[3],
            volume: ohlcv[4],
            start,
            end: start + Duration::seconds(secs),
        }
    }
}

/// A trade signal produced by the strategy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub inst_id: String,
    pub timeframe: String,
    pub side: Side,
    pub price: f64,
    pub strategy: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ── Sizing ───────────────────────────────────────────────────────────────────

/// Fully resolved parameters for one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeParams {
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Order size in contracts.
    pub size: f64,
    pub tick_size: f64,
    pub risk_pct: f64,
    pub rr: f64,
    /// |entry - stop_loss| after tick rounding.
    pub risk_distance: f64,
    pub leverage: u32,
    pub pos_side: PosSide,
}

/// Static and live parameters of a perpetual contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub inst_id: String,
    pub last_price: f64,
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_size: f64,
    /// Contract value (ctVal multiplied by ctMult).
    pub contract_value: f64,
    pub kind: ContractKind,
    pub settle_ccy: String,
    pub max_market_size: Option<f64>,
}

// ── Positions ────────────────────────────────────────────────────────────────

/// An open position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub inst_id: String,
    pub pos_side: PosSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
}

impl ExchangePosition {
    pub fn key(&self) -> String {
        position_key(&self.inst_id, self.pos_side)
    }
}

/// Key for per-position state: `instrument:side`.
pub fn position_key(inst_id: &str, pos_side: PosSide) -> String {
    format!("{inst_id}:{}", pos_side.as_str())
}

/// Operator-facing view of one open position: the cached exchange position
/// overlaid with live trailing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub inst_id: String,
    pub pos_side: PosSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub moved_to_be: bool,
    pub locked_profit: bool,
    pub took_partial: bool,
    /// Unrealised PnL in percent of entry (not leveraged).
    pub pnl_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timeframe_labels_normalise() {
        assert_eq!(normalize_timeframe("candle1H"), "1h");
        assert_eq!(normalize_timeframe("60m"), "1h");
        assert_eq!(normalize_timeframe("candle15m"), "15m");
        assert_eq!(timeframe_secs("15m"), Some(900));
        assert_eq!(timeframe_secs("1H"), Some(3_600));
        assert_eq!(timeframe_secs("bogus"), None);
    }

    #[test]
    fn candle_end_follows_timeframe() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let c = CandleTick::from_start("BTC-USDT-SWAP", "15m", start, [1.0, 2.0, 0.5, 1.5, 10.0]);
        assert_eq!((c.end - c.start).num_seconds(), 900);
    }

    #[test]
    fn closing_side_is_opposite_of_entry() {
        assert_eq!(PosSide::Long.closing_side(), Side::Sell);
        assert_eq!(PosSide::Short.closing_side(), Side::Buy);
        assert_eq!(PosSide::from_entry(Side::None), None);
        assert_eq!(position_key("ETH-USDT-SWAP", PosSide::Short), "ETH-USDT-SWAP:short");
    }
}
