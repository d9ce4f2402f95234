// =============================================================================
// Runtime Configuration — process-wide settings with atomic save
// =============================================================================
//
// Holds everything that is shared by all accounts: the watchlist, strategy
// parameters, queue/trailing plumbing knobs and the defaults applied to newly
// enabled accounts. Per-account parameters live in `settings.rs`.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::BotError;
use crate::queue::QueuePolicy;
use crate::settings::{TradingSettings, TrailingConfig};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTC-USDT-SWAP".to_string(),
        "ETH-USDT-SWAP".to_string(),
        "SOL-USDT-SWAP".to_string(),
    ]
}

fn default_ltf() -> String {
    "15m".to_string()
}

fn default_htf() -> String {
    "1h".to_string()
}

fn default_donchian_period() -> usize {
    20
}

fn default_min_channel_pct() -> f64 {
    0.012
}

fn default_min_body_pct() -> f64 {
    0.003
}

fn default_breakout_pct() -> f64 {
    0.002
}

fn default_htf_ema_fast() -> usize {
    50
}

fn default_htf_ema_slow() -> usize {
    200
}

fn default_min_warmup_ltf() -> usize {
    20
}

fn default_min_warmup_htf() -> usize {
    200
}

fn default_queue_capacity() -> usize {
    64
}

fn default_trail_drain_interval_ms() -> u64 {
    1_000
}

fn default_trail_concurrency() -> usize {
    4
}

fn default_position_refresh_secs() -> u64 {
    300
}

fn default_warmup_concurrency() -> usize {
    8
}

fn default_warmup_stall_secs() -> u64 {
    300
}

fn default_paper_equity() -> f64 {
    1_000.0
}

fn default_rest_base_url() -> String {
    "https://www.okx.com".to_string()
}

fn default_ws_business_url() -> String {
    "wss://ws.okx.com:8443/ws/v5/business".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_settings_path() -> String {
    "accounts.json".to_string()
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Parameters of the Donchian breakout engine. Percentages are fractions here
/// (0.012 = 1.2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Signal timeframe.
    #[serde(default = "default_ltf")]
    pub ltf: String,

    /// Trend-filter timeframe.
    #[serde(default = "default_htf")]
    pub htf: String,

    #[serde(default = "default_donchian_period")]
    pub donchian_period: usize,

    /// Minimum channel width relative to close.
    #[serde(default = "default_min_channel_pct")]
    pub min_channel_pct: f64,

    /// Minimum candle body relative to close.
    #[serde(default = "default_min_body_pct")]
    pub min_body_pct: f64,

    /// Buffer beyond the channel edge a close must clear.
    #[serde(default = "default_breakout_pct")]
    pub breakout_pct: f64,

    #[serde(default = "default_htf_ema_fast")]
    pub htf_ema_fast: usize,

    #[serde(default = "default_htf_ema_slow")]
    pub htf_ema_slow: usize,

    #[serde(default = "default_min_warmup_ltf")]
    pub min_warmup_ltf: usize,

    #[serde(default = "default_min_warmup_htf")]
    pub min_warmup_htf: usize,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            ltf: default_ltf(),
            htf: default_htf(),
            donchian_period: default_donchian_period(),
            min_channel_pct: default_min_channel_pct(),
            min_body_pct: default_min_body_pct(),
            breakout_pct: default_breakout_pct(),
            htf_ema_fast: default_htf_ema_fast(),
            htf_ema_slow: default_htf_ema_slow(),
            min_warmup_ltf: default_min_warmup_ltf(),
            min_warmup_htf: default_min_warmup_htf(),
        }
    }
}

impl StrategyParams {
    pub fn validate(&self) -> std::result::Result<(), BotError> {
        if self.donchian_period == 0 {
            return Err(BotError::config("donchian_period must be >= 1"));
        }
        if self.htf_ema_fast == 0 || self.htf_ema_fast >= self.htf_ema_slow {
            return Err(BotError::config(format!(
                "htf_ema_fast ({}) must be >= 1 and below htf_ema_slow ({})",
                self.htf_ema_fast, self.htf_ema_slow
            )));
        }
        if crate::types::normalize_timeframe(&self.ltf) == crate::types::normalize_timeframe(&self.htf) {
            return Err(BotError::config(format!(
                "ltf and htf must differ (both {})",
                self.ltf
            )));
        }
        for (name, v) in [
            ("min_channel_pct", self.min_channel_pct),
            ("min_body_pct", self.min_body_pct),
            ("breakout_pct", self.breakout_pct),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(BotError::config(format!("{name} must be >= 0 (got {v})")));
            }
        }
        Ok(())
    }

    /// LTF bars needed before the first evaluation (window plus warmup).
    pub fn ltf_history_bars(&self) -> usize {
        self.donchian_period.max(self.min_warmup_ltf) + 30
    }

    /// HTF bars needed for the slow EMA and HTF warmup.
    pub fn htf_history_bars(&self) -> usize {
        self.htf_ema_slow.max(self.min_warmup_htf) + 30
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Instrument ids streamed and evaluated, e.g. `BTC-USDT-SWAP`.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub strategy: StrategyParams,

    /// Capacity of each account's signal queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub queue_policy: QueuePolicy,

    /// How often the latest 1m candles are drained to the trailing evaluators.
    #[serde(default = "default_trail_drain_interval_ms")]
    pub trail_drain_interval_ms: u64,

    /// Global cap on concurrent trailing evaluations (outbound REST calls).
    #[serde(default = "default_trail_concurrency")]
    pub trail_concurrency: usize,

    #[serde(default = "default_position_refresh_secs")]
    pub position_refresh_secs: u64,

    /// Parallel history downloads during warmup.
    #[serde(default = "default_warmup_concurrency")]
    pub warmup_concurrency: usize,

    /// Warmup is declared stalled after this long without progress.
    #[serde(default = "default_warmup_stall_secs")]
    pub warmup_stall_secs: u64,

    /// Route orders to the in-memory paper exchange instead of the live API.
    #[serde(default = "default_true")]
    pub paper_trading: bool,

    #[serde(default = "default_paper_equity")]
    pub paper_equity: f64,

    /// Answer confirmation prompts automatically when running headless.
    #[serde(default)]
    pub auto_approve: bool,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_business_url")]
    pub ws_business_url: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// JSON file holding per-account settings.
    #[serde(default = "default_settings_path")]
    pub settings_path: String,

    /// Applied to accounts created without explicit trading settings.
    #[serde(default)]
    pub default_trading: TradingSettings,

    #[serde(default)]
    pub default_trailing: TrailingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            strategy: StrategyParams::default(),
            queue_capacity: default_queue_capacity(),
            queue_policy: QueuePolicy::default(),
            trail_drain_interval_ms: default_trail_drain_interval_ms(),
            trail_concurrency: default_trail_concurrency(),
            position_refresh_secs: default_position_refresh_secs(),
            warmup_concurrency: default_warmup_concurrency(),
            warmup_stall_secs: default_warmup_stall_secs(),
            paper_trading: true,
            paper_equity: default_paper_equity(),
            auto_approve: false,
            rest_base_url: default_rest_base_url(),
            ws_business_url: default_ws_business_url(),
            bind_addr: default_bind_addr(),
            settings_path: default_settings_path(),
            default_trading: TradingSettings::default(),
            default_trailing: TrailingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            ltf = %config.strategy.ltf,
            htf = %config.strategy.htf,
            paper = config.paper_trading,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `BOT_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("BOT_SYMBOLS") {
            self.symbols = parse_symbols(&syms);
        }
        if let Ok(v) = std::env::var("BOT_PAPER") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.paper_trading = true,
                "0" | "false" | "no" => self.paper_trading = false,
                other => warn!(value = %other, "ignoring unrecognised BOT_PAPER"),
            }
        }
        if let Ok(addr) = std::env::var("BOT_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("BOT_SETTINGS_PATH") {
            if !path.trim().is_empty() {
                self.settings_path = path.trim().to_string();
            }
        }
        if self.symbols.is_empty() {
            warn!("empty watchlist after overrides, restoring defaults");
            self.symbols = default_symbols();
        }
    }
}

/// Split a comma-separated watchlist into upper-cased instrument ids.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols.len(), 3);
        assert_eq!(cfg.symbols[0], "BTC-USDT-SWAP");
        assert_eq!(cfg.strategy.donchian_period, 20);
        assert_eq!(cfg.strategy.htf_ema_slow, 200);
        assert!((cfg.strategy.breakout_pct - 0.002).abs() < f64::EPSILON);
        assert_eq!(cfg.queue_capacity, 64);
        assert_eq!(cfg.trail_concurrency, 4);
        assert!(cfg.paper_trading);
        assert!(cfg.strategy.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.strategy.ltf, "15m");
        assert_eq!(cfg.queue_policy, QueuePolicy::DropNewest);
        assert_eq!(cfg.position_refresh_secs, 300);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETH-USDT-SWAP"], "strategy": { "donchian_period": 55 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETH-USDT-SWAP"]);
        assert_eq!(cfg.strategy.donchian_period, 55);
        assert_eq!(cfg.strategy.htf_ema_fast, 50);
    }

    #[test]
    fn ema_fast_not_below_slow_is_configuration_error() {
        let p = StrategyParams {
            htf_ema_fast: 200,
            htf_ema_slow: 200,
            ..StrategyParams::default()
        };
        assert!(matches!(p.validate(), Err(BotError::Configuration(_))));
    }

    #[test]
    fn same_timeframes_rejected() {
        let p = StrategyParams {
            ltf: "60m".into(),
            htf: "1H".into(),
            ..StrategyParams::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn history_bars_cover_warmup() {
        let p = StrategyParams::default();
        assert_eq!(p.htf_history_bars(), 230);
        assert_eq!(p.ltf_history_bars(), 50);
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("bot-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["DOGE-USDT-SWAP".into()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, cfg.symbols);
        assert!(!path.with_extension("json.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn parse_symbols_trims_and_uppercases() {
        assert_eq!(
            parse_symbols(" btc-usdt-swap, ,eth-usdt-swap "),
            vec!["BTC-USDT-SWAP", "ETH-USDT-SWAP"]
        );
    }
}
