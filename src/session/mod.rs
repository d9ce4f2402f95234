// =============================================================================
// Account Session — per-account queue, workers and mutable trading state
// =============================================================================
//
// One `Session` exists per enabled account. It owns:
//   - the bounded signal queue drained by a single confirm worker, which
//     serialises every entry for the account;
//   - the pending set and per-instrument cooldowns;
//   - the cached exchange positions, refreshed on a timer;
//   - the trailing state of every position the bot opened.
//
// Every map sits behind its own lock and no guard is held across an await.
// Cancelling the session token stops both workers; in-flight workflows check
// it between steps.
// =============================================================================

mod confirm;
mod positions;
mod trail;

pub use confirm::{DropReason, SignalOutcome};
pub use trail::TrailOutcome;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::exchange::ExchangeGateway;
use crate::exit::PositionTrailState;
use crate::notifier::{Notifier, NotifyThrottle};
use crate::queue::{QueuePolicy, SignalQueue};
use crate::settings::AccountSettings;
use crate::types::{ExchangePosition, OpenPosition, PosSide};

/// Minimum spacing of the max-open-positions notice.
pub(crate) const LIMIT_NOTICE_EVERY: Duration = Duration::from_secs(30 * 60);
/// Minimum spacing of partial-close notices per position.
pub(crate) const PARTIAL_NOTICE_EVERY: Duration = Duration::from_secs(30 * 60);
/// Minimum spacing of stop-moved notices per position.
pub(crate) const TRAIL_NOTICE_EVERY: Duration = Duration::from_secs(15 * 60);

pub struct Session {
    account_id: String,
    settings: RwLock<AccountSettings>,
    queue: Arc<SignalQueue>,
    gateway: Arc<dyn ExchangeGateway>,
    notifier: Arc<dyn Notifier>,
    throttle: NotifyThrottle,

    /// Instruments with a confirm/execute workflow in flight.
    pending: Mutex<HashSet<String>>,
    /// Instrument -> time until which new signals are ignored.
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Last exchange snapshot, keyed `inst:side`.
    positions: RwLock<HashMap<String, ExchangePosition>>,
    positions_at: RwLock<Option<DateTime<Utc>>>,
    /// Trailing state, keyed `inst:side`.
    trails: Mutex<HashMap<String, PositionTrailState>>,
    /// Keys with a trailing evaluation currently executing.
    trail_busy: Mutex<HashSet<String>>,

    cancel: CancellationToken,
}

impl Session {
    /// Build a session. The queue policy comes from the account settings,
    /// falling back to `default_policy`.
    pub fn new(
        settings: AccountSettings,
        gateway: Arc<dyn ExchangeGateway>,
        notifier: Arc<dyn Notifier>,
        queue_capacity: usize,
        default_policy: QueuePolicy,
    ) -> Arc<Self> {
        let policy = settings.trading.queue_policy.unwrap_or(default_policy);
        Arc::new(Self {
            account_id: settings.account_id.clone(),
            settings: RwLock::new(settings),
            queue: Arc::new(SignalQueue::new(queue_capacity, policy)),
            gateway,
            notifier,
            throttle: NotifyThrottle::new(),
            pending: Mutex::new(HashSet::new()),
            cooldowns: Mutex::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            positions_at: RwLock::new(None),
            trails: Mutex::new(HashMap::new()),
            trail_busy: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the confirm worker and the position-cache worker.
    pub fn start(self: &Arc<Self>, refresh_every: Duration) {
        tokio::spawn(self.clone().run_confirm_worker());
        tokio::spawn(self.clone().run_position_worker(refresh_every));
        info!(account = %self.account_id, refresh_secs = refresh_every.as_secs(), "session workers started");
    }

    /// Cancel both workers and close the queue. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.queue.close();
            info!(account = %self.account_id, "session stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn queue(&self) -> &Arc<SignalQueue> {
        &self.queue
    }

    /// Snapshot of the live settings.
    pub fn settings(&self) -> AccountSettings {
        self.settings.read().clone()
    }

    /// Swap the live settings; the next signal or candle sees the change.
    pub fn replace_settings(&self, settings: AccountSettings) {
        *self.settings.write() = settings;
    }

    pub fn trail_state(&self, inst_id: &str, pos_side: PosSide) -> Option<PositionTrailState> {
        self.trails
            .lock()
            .get(&crate::types::position_key(inst_id, pos_side))
            .cloned()
    }

    pub fn trail_count(&self) -> usize {
        self.trails.lock().len()
    }

    pub fn cooldown_until(&self, inst_id: &str) -> Option<DateTime<Utc>> {
        self.cooldowns.lock().get(inst_id).copied()
    }

    pub fn set_cooldown(&self, inst_id: &str, until: DateTime<Utc>) {
        self.cooldowns.lock().insert(inst_id.to_string(), until);
    }

    pub fn cached_positions(&self) -> Vec<ExchangePosition> {
        self.positions.read().values().cloned().collect()
    }

    pub fn positions_refreshed_at(&self) -> Option<DateTime<Utc>> {
        *self.positions_at.read()
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Cached positions overlaid with trailing SL/TP and progress flags.
    pub fn status(&self) -> Vec<OpenPosition> {
        let positions: Vec<ExchangePosition> = self.positions.read().values().cloned().collect();
        let trails = self.trails.lock();

        let mut out: Vec<OpenPosition> = positions
            .into_iter()
            .map(|p| {
                let trail = trails.get(&p.key());
                let pnl_pct = if p.entry_price > 0.0 && p.mark_price > 0.0 {
                    (p.mark_price - p.entry_price) / p.entry_price * 100.0 * p.pos_side.sign()
                } else {
                    0.0
                };
                OpenPosition {
                    stop_loss: trail.map(|t| t.stop_loss),
                    take_profit: trail.map(|t| t.take_profit),
                    moved_to_be: trail.is_some_and(|t| t.moved_to_be),
                    locked_profit: trail.is_some_and(|t| t.locked_profit),
                    took_partial: trail.is_some_and(|t| t.took_partial),
                    pnl_pct,
                    inst_id: p.inst_id,
                    pos_side: p.pos_side,
                    size: p.size,
                    entry_price: p.entry_price,
                    mark_price: p.mark_price,
                }
            })
            .collect();
        out.sort_by(|a, b| (&a.inst_id, a.pos_side.as_str()).cmp(&(&b.inst_id, b.pos_side.as_str())));
        out
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account_id", &self.account_id)
            .field("queued", &self.queue.len())
            .field("trails", &self.trails.lock().len())
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Removes an entry from a key set when dropped, so every exit path of a
/// workflow releases it.
pub(crate) struct KeyGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> KeyGuard<'a> {
    /// Claim `key`, or `None` if it is already held.
    pub(crate) fn claim(set: &'a Mutex<HashSet<String>>, key: &str) -> Option<Self> {
        if set.lock().insert(key.to_string()) {
            Some(Self {
                set,
                key: key.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exchange::paper::tests::btc_meta;
    use crate::exchange::paper::PaperExchange;
    use crate::notifier::testing::RecordingNotifier;

    pub(crate) fn paper_session(
        settings: AccountSettings,
    ) -> (Arc<Session>, Arc<PaperExchange>, Arc<RecordingNotifier>) {
        let ex = Arc::new(PaperExchange::new(1_000.0));
        ex.add_instrument(btc_meta());
        let notifier = RecordingNotifier::approving();
        let session = Session::new(
            settings,
            ex.clone(),
            notifier.clone(),
            8,
            QueuePolicy::DropNewest,
        );
        (session, ex, notifier)
    }

    #[test]
    fn key_guard_releases_on_drop() {
        let set = Mutex::new(HashSet::new());
        {
            let g = KeyGuard::claim(&set, "BTC");
            assert!(g.is_some());
            assert!(KeyGuard::claim(&set, "BTC").is_none());
        }
        assert!(set.lock().is_empty());
    }

    #[tokio::test]
    async fn status_overlays_trail_and_pnl() {
        let (s, ex, _) = paper_session(AccountSettings::new("acct"));
        ex.seed_position(ExchangePosition {
            inst_id: "BTC-USDT-SWAP".into(),
            pos_side: PosSide::Short,
            size: 2.0,
            entry_price: 100.0,
            mark_price: 95.0,
            leverage: 5,
        });
        s.refresh_positions().await.unwrap();

        let st = s.status();
        assert_eq!(st.len(), 1);
        assert!((st[0].pnl_pct - 5.0).abs() < 1e-9);
        assert_eq!(st[0].stop_loss, None);
        assert!(!st[0].moved_to_be);
    }

    #[test]
    fn settings_queue_policy_overrides_default() {
        let mut settings = AccountSettings::new("acct");
        settings.trading.queue_policy = Some(QueuePolicy::DropOldest);
        let (s, _, _) = paper_session(settings);
        assert_eq!(s.queue().policy(), QueuePolicy::DropOldest);
    }

    #[test]
    fn stop_closes_queue_once() {
        let (s, _, _) = paper_session(AccountSettings::new("acct"));
        s.stop();
        s.stop();
        assert!(s.is_stopped());
        assert!(s.queue().is_closed());
    }
}
