// =============================================================================
// Account Settings — per-account risk, confirmation and trailing parameters
// =============================================================================
//
// One `AccountSettings` per enabled account. The session reads a snapshot on
// every signal and every trailing evaluation, so an update through the router
// takes effect on the next event without restarting workers.
//
// Percent fields are expressed in percent (1.0 = 1%), matching what the
// operator types. Conversion to fractions happens inside the risk engine.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{BotError, Result};
use crate::queue::QueuePolicy;

/// Upper sanity bound for the stop distance, in percent of entry.
pub const MAX_STOP_PCT: f64 = 20.0;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_true() -> bool {
    true
}
fn default_risk_pct() -> f64 {
    1.0
}
fn default_stop_pct() -> f64 {
    0.5
}
fn default_rr() -> f64 {
    2.0
}
fn default_leverage() -> u32 {
    20
}
fn default_max_open_positions() -> u32 {
    10
}
fn default_confirm_timeout_secs() -> u64 {
    30
}
fn default_cooldown_secs() -> u64 {
    6 * 3_600
}

// =============================================================================
// Credentials
// =============================================================================

/// Exchange API credentials. Never logged: `Debug` redacts everything but a
/// key prefix.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: String,
    /// Route requests to the exchange's simulated-trading environment.
    #[serde(default)]
    pub simulated: bool,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty() && !self.passphrase.is_empty()
    }

    /// Read `BOT_OKX_API_KEY`, `BOT_OKX_API_SECRET`, `BOT_OKX_PASSPHRASE` and
    /// `BOT_OKX_SIMULATED`. Missing variables read as empty.
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).map(|v| v.trim().to_string()).unwrap_or_default();
        Self {
            api_key: var("BOT_OKX_API_KEY"),
            api_secret: var("BOT_OKX_API_SECRET"),
            passphrase: var("BOT_OKX_PASSPHRASE"),
            simulated: matches!(var("BOT_OKX_SIMULATED").to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.api_key.chars().take(4).collect();
        f.debug_struct("Credentials")
            .field("api_key", &format!("{prefix}…"))
            .field("api_secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("simulated", &self.simulated)
            .finish()
    }
}

// =============================================================================
// TradingSettings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSettings {
    /// Money at risk per trade, percent of equity.
    #[serde(default = "default_risk_pct")]
    pub risk_pct: f64,

    /// Stop distance, percent of entry price.
    #[serde(default = "default_stop_pct")]
    pub stop_pct: f64,

    /// Take-profit distance as a multiple of the realised risk distance.
    #[serde(default = "default_rr")]
    pub take_profit_rr: f64,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,

    /// Ask the operator before every entry.
    #[serde(default = "default_true")]
    pub confirm_required: bool,

    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,

    /// Per-instrument cooldown after a decline or confirmation timeout.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Overrides the process-wide queue policy for this account.
    #[serde(default)]
    pub queue_policy: Option<QueuePolicy>,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            risk_pct: default_risk_pct(),
            stop_pct: default_stop_pct(),
            take_profit_rr: default_rr(),
            leverage: default_leverage(),
            max_open_positions: default_max_open_positions(),
            confirm_required: true,
            confirm_timeout_secs: default_confirm_timeout_secs(),
            cooldown_secs: default_cooldown_secs(),
            queue_policy: None,
        }
    }
}

// =============================================================================
// TrailingConfig
// =============================================================================

/// Thresholds for the post-entry trailing state machine, all in R units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingConfig {
    pub be_trigger_r: f64,
    pub be_offset_r: f64,

    pub lock_trigger_r: f64,
    pub lock_offset_r: f64,

    /// Number of 15-minute bars after which a stalled position is closed.
    /// 0 disables the time-stop.
    pub time_stop_bars: u32,
    pub time_stop_min_mfe_r: f64,

    pub partial_enabled: bool,
    pub partial_trigger_r: f64,
    /// Fraction of the current size closed by the partial take.
    pub partial_close_frac: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        let mut cfg = Self {
            be_trigger_r: 0.0,
            be_offset_r: 0.0,
            lock_trigger_r: 0.0,
            lock_offset_r: 0.0,
            time_stop_bars: 0,
            time_stop_min_mfe_r: 0.0,
            partial_enabled: false,
            partial_trigger_r: 0.0,
            partial_close_frac: 0.0,
        };
        Preset::Mid.apply_trailing(&mut cfg);
        cfg
    }
}

// =============================================================================
// AccountSettings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSettings {
    pub account_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trading: TradingSettings,
    #[serde(default)]
    pub trailing: TrailingConfig,
    #[serde(default)]
    pub credentials: Credentials,
}

impl AccountSettings {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            ..Default::default()
        }
    }

    /// Reject settings the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(BotError::config("account id is empty"));
        }

        let t = &self.trading;
        if !t.risk_pct.is_finite() || t.risk_pct <= 0.0 {
            return Err(BotError::config(format!("risk_pct must be > 0 (got {})", t.risk_pct)));
        }
        if !t.stop_pct.is_finite() || t.stop_pct <= 0.0 || t.stop_pct > MAX_STOP_PCT {
            return Err(BotError::config(format!(
                "stop_pct must be in (0, {MAX_STOP_PCT}] (got {})",
                t.stop_pct
            )));
        }
        if !t.take_profit_rr.is_finite() || t.take_profit_rr <= 0.0 {
            return Err(BotError::config(format!(
                "take_profit_rr must be > 0 (got {})",
                t.take_profit_rr
            )));
        }
        if t.leverage == 0 {
            return Err(BotError::config("leverage must be >= 1"));
        }
        if t.confirm_required && t.confirm_timeout_secs == 0 {
            return Err(BotError::config("confirm_timeout_secs must be > 0 when confirmation is required"));
        }

        let tr = &self.trailing;
        if tr.partial_enabled && !(tr.partial_close_frac > 0.0 && tr.partial_close_frac <= 1.0) {
            return Err(BotError::config(format!(
                "partial_close_frac must be in (0, 1] (got {})",
                tr.partial_close_frac
            )));
        }
        for (name, v) in [
            ("be_trigger_r", tr.be_trigger_r),
            ("lock_trigger_r", tr.lock_trigger_r),
            ("partial_trigger_r", tr.partial_trigger_r),
            ("time_stop_min_mfe_r", tr.time_stop_min_mfe_r),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(BotError::config(format!("{name} must be >= 0 (got {v})")));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Presets
// =============================================================================

/// Named bundles of trading and trailing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Safe,
    Mid,
    Aggr,
}

impl std::str::FromStr for Preset {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "mid" => Ok(Self::Mid),
            "aggr" | "aggressive" => Ok(Self::Aggr),
            other => Err(BotError::config(format!("unknown preset {other:?}"))),
        }
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Mid => write!(f, "mid"),
            Self::Aggr => write!(f, "aggr"),
        }
    }
}

impl Preset {
    /// Risk profile: overwrites risk, stop, RR and leverage. The safe profile
    /// also switches partial profit-taking on.
    pub fn apply_trading(self, ts: &mut TradingSettings, tr: &mut TrailingConfig) {
        match self {
            Self::Safe => {
                ts.risk_pct = 0.5;
                ts.stop_pct = 1.2;
                ts.take_profit_rr = 2.0;
                ts.leverage = 5;
                tr.partial_enabled = true;
                tr.partial_trigger_r = 1.0;
                tr.partial_close_frac = 0.5;
            }
            Self::Mid => {
                ts.risk_pct = 1.0;
                ts.stop_pct = 1.5;
                ts.take_profit_rr = 2.5;
                ts.leverage = 10;
            }
            Self::Aggr => {
                ts.risk_pct = 2.0;
                ts.stop_pct = 2.5;
                ts.take_profit_rr = 3.0;
                ts.leverage = 20;
            }
        }
    }

    /// Trailing profile: overwrites every trailing threshold.
    pub fn apply_trailing(self, tr: &mut TrailingConfig) {
        let (be, lock, time_stop, partial) = match self {
            Self::Safe => ((0.4, 0.0), (0.8, 0.2), (8, 0.3), (true, 0.8, 0.6)),
            Self::Mid => ((0.6, 0.0), (1.0, 0.3), (12, 0.4), (true, 1.0, 0.5)),
            Self::Aggr => ((1.0, 0.1), (1.5, 0.5), (20, 0.6), (false, 0.0, 0.0)),
        };
        tr.be_trigger_r = be.0;
        tr.be_offset_r = be.1;
        tr.lock_trigger_r = lock.0;
        tr.lock_offset_r = lock.1;
        tr.time_stop_bars = time_stop.0;
        tr.time_stop_min_mfe_r = time_stop.1;
        tr.partial_enabled = partial.0;
        tr.partial_trigger_r = partial.1;
        tr.partial_close_frac = partial.2;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let s = AccountSettings::new("acc-1");
        assert!(s.validate().is_ok());
        assert!((s.trading.risk_pct - 1.0).abs() < f64::EPSILON);
        assert_eq!(s.trading.cooldown_secs, 21_600);
        assert!((s.trailing.be_trigger_r - 0.6).abs() < f64::EPSILON);
        assert_eq!(s.trailing.time_stop_bars, 12);
    }

    #[test]
    fn stop_pct_out_of_bounds_is_configuration_error() {
        let mut s = AccountSettings::new("acc-1");
        s.trading.stop_pct = 25.0;
        assert!(matches!(s.validate(), Err(BotError::Configuration(_))));
        s.trading.stop_pct = 0.0;
        assert!(matches!(s.validate(), Err(BotError::Configuration(_))));
    }

    #[test]
    fn partial_fraction_checked_only_when_enabled() {
        let mut s = AccountSettings::new("acc-1");
        Preset::Aggr.apply_trailing(&mut s.trailing);
        assert!(!s.trailing.partial_enabled);
        assert!(s.validate().is_ok());

        s.trailing.partial_enabled = true;
        assert!(s.validate().is_err());
    }

    #[test]
    fn empty_json_uses_defaults() {
        let s: AccountSettings = serde_json::from_str(r#"{"account_id":"42"}"#).unwrap();
        assert_eq!(s.trading.leverage, 20);
        assert!(s.trading.confirm_required);
        assert!(s.trading.queue_policy.is_none());
    }

    #[test]
    fn presets_parse_and_apply() {
        let p: Preset = "SAFE".parse().unwrap();
        let mut ts = TradingSettings::default();
        let mut tr = TrailingConfig::default();
        p.apply_trading(&mut ts, &mut tr);
        assert_eq!(ts.leverage, 5);
        assert!(tr.partial_enabled);
        assert!("yolo".parse::<Preset>().is_err());
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let c = Credentials {
            api_key: "abcd1234".into(),
            api_secret: "topsecret".into(),
            passphrase: "pass".into(),
            simulated: false,
        };
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("topsecret"));
        assert!(!dbg.contains("1234"));
        assert!(c.is_complete());
    }
}
