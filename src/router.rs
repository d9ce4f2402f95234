// =============================================================================
// Router — account registry, signal fan-out and trailing dispatch
// =============================================================================
//
// Signals are offered to every enabled session's queue without blocking; a
// full queue drops the signal for that account only.
//
// Closed 1-minute candles are collapsed into a latest-candle-per-instrument
// table. A drain loop empties it on a fixed tick and hands every candle to
// every session through a shared semaphore. When no permit is free that
// (session, candle) pair is skipped; the next tick brings a newer candle.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BotError, Result};
use crate::exchange::GatewayFactory;
use crate::notifier::Notifier;
use crate::queue::QueuePolicy;
use crate::runtime_config::RuntimeConfig;
use crate::session::Session;
use crate::settings::AccountSettings;
use crate::settings_store::SettingsStore;
use crate::strategy::SignalEngine;
use crate::types::{normalize_timeframe, CandleTick, OpenPosition, Signal};

/// Knobs the router applies to every session it creates.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub queue_capacity: usize,
    pub queue_policy: QueuePolicy,
    pub trail_concurrency: usize,
    pub position_refresh: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            queue_policy: QueuePolicy::DropNewest,
            trail_concurrency: 4,
            position_refresh: Duration::from_secs(300),
        }
    }
}

impl From<&RuntimeConfig> for RouterConfig {
    fn from(c: &RuntimeConfig) -> Self {
        Self {
            queue_capacity: c.queue_capacity,
            queue_policy: c.queue_policy,
            trail_concurrency: c.trail_concurrency,
            position_refresh: Duration::from_secs(c.position_refresh_secs),
        }
    }
}

/// One line of the account list.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub name: String,
    pub queued_signals: usize,
    pub trailed_positions: usize,
    pub cached_positions: usize,
}

pub struct Router {
    cfg: RouterConfig,
    factory: Arc<dyn GatewayFactory>,
    store: Option<Arc<dyn SettingsStore>>,
    engine: Option<Arc<dyn SignalEngine>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    latest: Mutex<HashMap<String, CandleTick>>,
    trail_permits: Arc<Semaphore>,
}

impl Router {
    pub fn new(
        cfg: RouterConfig,
        factory: Arc<dyn GatewayFactory>,
        store: Option<Arc<dyn SettingsStore>>,
        engine: Option<Arc<dyn SignalEngine>>,
    ) -> Self {
        let permits = cfg.trail_concurrency.max(1);
        Self {
            cfg,
            factory,
            store,
            engine,
            sessions: RwLock::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            trail_permits: Arc::new(Semaphore::new(permits)),
        }
    }

    // -------------------------------------------------------------------------
    // Account lifecycle
    // -------------------------------------------------------------------------

    /// Validate the settings, build the account's gateway and start its
    /// session. Returns `false` if the account is already enabled.
    pub fn enable_account(
        &self,
        settings: AccountSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Result<bool> {
        settings.validate()?;
        let id = settings.account_id.clone();
        if self.sessions.read().contains_key(&id) {
            debug!(account = %id, "account already enabled");
            return Ok(false);
        }

        let gateway = self.factory.for_account(&settings)?;
        let session = Session::new(
            settings,
            gateway,
            notifier,
            self.cfg.queue_capacity,
            self.cfg.queue_policy,
        );

        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                return Ok(false);
            }
            sessions.insert(id.clone(), session.clone());
        }
        session.start(self.cfg.position_refresh);
        info!(account = %id, "account enabled");
        Ok(true)
    }

    /// Stop and forget the account's session. Returns `false` if it was not
    /// enabled.
    pub fn disable_account(&self, account_id: &str) -> bool {
        let removed = self.sessions.write().remove(account_id);
        match removed {
            Some(session) => {
                session.stop();
                info!(account = %account_id, "account disabled");
                true
            }
            None => false,
        }
    }

    /// Validate, persist, then swap the live settings of an enabled account.
    pub async fn update_settings(&self, account_id: &str, settings: AccountSettings) -> Result<()> {
        if settings.account_id != account_id {
            return Err(BotError::invalid(format!(
                "settings belong to {} not {account_id}",
                settings.account_id
            )));
        }
        settings.validate()?;
        let session = self
            .session(account_id)
            .ok_or_else(|| BotError::NotFound(format!("account {account_id} is not enabled")))?;

        if let Some(store) = &self.store {
            store.save(&settings).await?;
        }
        session.replace_settings(settings);
        info!(account = %account_id, "account settings updated");
        Ok(())
    }

    /// Stop every session.
    pub fn shutdown(&self) {
        let all: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for s in &all {
            s.stop();
        }
        info!(count = all.len(), "all sessions stopped");
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn session(&self, account_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(account_id).cloned()
    }

    fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Cached positions with trailing overlay, without calling the exchange.
    pub fn account_status(&self, account_id: &str) -> Result<Vec<OpenPosition>> {
        self.session(account_id)
            .map(|s| s.status())
            .ok_or_else(|| BotError::NotFound(format!("account {account_id} is not enabled")))
    }

    pub fn accounts(&self) -> Vec<AccountSummary> {
        let mut out: Vec<AccountSummary> = self
            .all_sessions()
            .iter()
            .map(|s| {
                let settings = s.settings();
                AccountSummary {
                    account_id: settings.account_id,
                    name: settings.name,
                    queued_signals: s.queue().len(),
                    trailed_positions: s.trail_count(),
                    cached_positions: s.cached_positions().len(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        out
    }

    pub fn engine_dump(&self, inst_id: &str) -> String {
        match &self.engine {
            Some(engine) => engine.dump(inst_id),
            None => format!("{inst_id}: no engine attached"),
        }
    }

    // -------------------------------------------------------------------------
    // Signal fan-out
    // -------------------------------------------------------------------------

    /// Offer `signal` to every session. Returns how many queues accepted it.
    pub fn on_signal(&self, signal: &Signal) -> usize {
        let sessions = self.all_sessions();
        let mut accepted = 0;
        for s in &sessions {
            if s.queue().offer(signal.clone()) {
                accepted += 1;
            } else {
                debug!(
                    account = %s.account_id(),
                    inst = %signal.inst_id,
                    "signal dropped by session queue"
                );
            }
        }
        info!(
            inst = %signal.inst_id,
            side = %signal.side,
            tf = %signal.timeframe,
            accepted,
            sessions = sessions.len(),
            "signal routed"
        );
        accepted
    }

    // -------------------------------------------------------------------------
    // Trailing dispatch
    // -------------------------------------------------------------------------

    /// Record a closed 1-minute candle; anything else is ignored.
    pub fn on_candle_close(&self, candle: &CandleTick) {
        if normalize_timeframe(&candle.timeframe) != "1m" {
            return;
        }
        self.latest
            .lock()
            .insert(candle.inst_id.clone(), candle.clone());
    }

    /// Take every pending latest candle, leaving the table empty.
    pub fn drain_latest(&self) -> Vec<CandleTick> {
        self.latest.lock().drain().map(|(_, c)| c).collect()
    }

    /// Drain the table and spawn one trailing pass per (session, candle) for
    /// which a permit is free. Returns the number of passes spawned.
    pub fn dispatch_trailing(&self) -> usize {
        let candles = self.drain_latest();
        if candles.is_empty() {
            return 0;
        }
        let sessions = self.all_sessions();
        let mut spawned = 0;
        let mut skipped = 0;

        for candle in &candles {
            for session in &sessions {
                let Ok(permit) = self.trail_permits.clone().try_acquire_owned() else {
                    skipped += 1;
                    continue;
                };
                let session = session.clone();
                let candle = candle.clone();
                tokio::spawn(async move {
                    session.on_candle_close(&candle).await;
                    drop(permit);
                });
                spawned += 1;
            }
        }
        if skipped > 0 {
            warn!(spawned, skipped, "trailing permits exhausted, candles skipped");
        }
        spawned
    }

    /// Dispatch trailing on every tick until cancelled.
    pub async fn run_trail_drain(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = every.as_millis() as u64, "trail drain loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.dispatch_trailing();
                }
            }
        }
        info!("trail drain loop stopped");
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("cfg", &self.cfg)
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::tests::btc_meta;
    use crate::exchange::paper::PaperGatewayFactory;
    use crate::notifier::{ConfirmOutcome, LogNotifier};
    use crate::settings_store::JsonSettingsStore;
    use crate::types::Side;
    use chrono::{TimeZone, Utc};

    fn router_with(cfg: RouterConfig) -> (Router, Arc<PaperGatewayFactory>) {
        let factory = Arc::new(PaperGatewayFactory::new(1_000.0, None));
        let router = Router::new(cfg, factory.clone(), None, None);
        (router, factory)
    }

    fn notifier() -> Arc<dyn Notifier> {
        Arc::new(LogNotifier::new(Some(ConfirmOutcome::Declined)))
    }

    fn signal(inst: &str) -> Signal {
        Signal {
            inst_id: inst.into(),
            timeframe: "15m".into(),
            side: Side::Buy,
            price: 100.0,
            strategy: "donchian_htf".into(),
            reason: "test".into(),
            created_at: Utc::now(),
        }
    }

    fn minute(inst: &str, m: u32, tf: &str) -> CandleTick {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, m, 0).unwrap();
        CandleTick::from_start(inst, tf, start, [100.0, 101.0, 99.0, 100.5, 1.0])
    }

    #[tokio::test]
    async fn enable_is_idempotent_and_validates() {
        let (r, _) = router_with(RouterConfig::default());
        assert!(r.enable_account(AccountSettings::new("a"), notifier()).unwrap());
        assert!(!r.enable_account(AccountSettings::new("a"), notifier()).unwrap());

        let mut bad = AccountSettings::new("b");
        bad.trading.stop_pct = 0.0;
        assert!(matches!(
            r.enable_account(bad, notifier()),
            Err(BotError::Configuration(_))
        ));
        assert_eq!(r.accounts().len(), 1);
        r.shutdown();
    }

    #[tokio::test]
    async fn disable_stops_session_and_hides_status() {
        let (r, _) = router_with(RouterConfig::default());
        r.enable_account(AccountSettings::new("a"), notifier()).unwrap();
        let s = r.session("a").unwrap();
        assert!(r.account_status("a").unwrap().is_empty());

        assert!(r.disable_account("a"));
        assert!(!r.disable_account("a"));
        assert!(s.is_stopped());
        assert!(matches!(r.account_status("a"), Err(BotError::NotFound(_))));
    }

    #[tokio::test]
    async fn signals_fan_out_and_full_queue_drops() {
        let cfg = RouterConfig {
            queue_capacity: 1,
            ..RouterConfig::default()
        };
        let (r, _) = router_with(cfg);
        // Sessions are built but not started, so nothing drains the queues.
        for id in ["a", "b"] {
            let session = Session::new(
                AccountSettings::new(id),
                Arc::new(crate::exchange::paper::PaperExchange::new(1_000.0)),
                notifier(),
                1,
                QueuePolicy::DropNewest,
            );
            r.sessions.write().insert(id.into(), session);
        }

        assert_eq!(r.on_signal(&signal("BTC-USDT-SWAP")), 2);
        assert_eq!(r.on_signal(&signal("ETH-USDT-SWAP")), 0);
        assert_eq!(r.session("a").unwrap().queue().len(), 1);
    }

    #[test]
    fn latest_table_keeps_newest_minute_per_instrument() {
        let (r, _) = router_with(RouterConfig::default());
        r.on_candle_close(&minute("BTC-USDT-SWAP", 1, "1m"));
        r.on_candle_close(&minute("BTC-USDT-SWAP", 2, "1m"));
        r.on_candle_close(&minute("ETH-USDT-SWAP", 2, "candle1m"));
        r.on_candle_close(&minute("BTC-USDT-SWAP", 0, "15m"));

        let mut drained = r.drain_latest();
        drained.sort_by(|a, b| a.inst_id.cmp(&b.inst_id));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].inst_id, "BTC-USDT-SWAP");
        assert_eq!(drained[0].start.format("%M").to_string(), "02");
        assert!(r.drain_latest().is_empty());
    }

    #[tokio::test]
    async fn dispatch_skips_when_permits_exhausted() {
        let cfg = RouterConfig {
            trail_concurrency: 1,
            ..RouterConfig::default()
        };
        let (r, _) = router_with(cfg);
        r.enable_account(AccountSettings::new("a"), notifier()).unwrap();
        r.enable_account(AccountSettings::new("b"), notifier()).unwrap();

        r.on_candle_close(&minute("BTC-USDT-SWAP", 1, "1m"));
        // Permits are taken synchronously; spawned passes have not run yet.
        assert_eq!(r.dispatch_trailing(), 1);
        // The skipped pair is not replayed.
        assert_eq!(r.dispatch_trailing(), 0);
        r.shutdown();
    }

    #[tokio::test]
    async fn update_settings_persists_and_swaps() {
        let path = std::env::temp_dir().join(format!("router-settings-{}.json", uuid::Uuid::new_v4()));
        let store: Arc<dyn SettingsStore> = Arc::new(JsonSettingsStore::new(&path));
        let factory = Arc::new(PaperGatewayFactory::new(1_000.0, None));
        factory.book("a").add_instrument(btc_meta());
        let r = Router::new(RouterConfig::default(), factory, Some(store.clone()), None);
        r.enable_account(AccountSettings::new("a"), notifier()).unwrap();

        let mut next = AccountSettings::new("a");
        next.trading.leverage = 3;
        r.update_settings("a", next.clone()).await.unwrap();
        assert_eq!(r.session("a").unwrap().settings().trading.leverage, 3);
        assert_eq!(store.load_all().await.unwrap()[0].trading.leverage, 3);

        next.trading.risk_pct = -1.0;
        assert!(r.update_settings("a", next.clone()).await.is_err());
        assert!(matches!(
            r.update_settings("zzz", AccountSettings::new("zzz")).await,
            Err(BotError::NotFound(_))
        ));
        r.shutdown();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn engine_dump_without_engine() {
        let (r, _) = router_with(RouterConfig::default());
        assert_eq!(r.engine_dump("BTC-USDT-SWAP"), "BTC-USDT-SWAP: no engine attached");
    }
}
