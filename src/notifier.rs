// =============================================================================
// Operator notifications and interactive confirmation
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

/// Answer to an interactive confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Approved,
    Declined,
    TimedOut,
}

/// Delivery sink for one operator. Implementations must not block the
/// caller beyond `timeout` in `confirm`; the session also enforces it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, account_id: &str, text: &str);

    async fn confirm(&self, account_id: &str, prompt: &str, timeout: Duration) -> ConfirmOutcome;
}

// ── Throttle ─────────────────────────────────────────────────────────────────

/// Minimum interval between notices sharing an (account, key) pair.
#[derive(Debug, Default)]
pub struct NotifyThrottle {
    last: Mutex<HashMap<(String, String), Instant>>,
}

impl NotifyThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// True (and records the send) if nothing with this key went out within
    /// `min_interval`.
    pub fn can_send(&self, account_id: &str, key: &str, min_interval: Duration) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        let k = (account_id.to_string(), key.to_string());
        match last.get(&k) {
            Some(prev) if now.duration_since(*prev) < min_interval => false,
            _ => {
                last.insert(k, now);
                true
            }
        }
    }
}

// ── Log notifier ─────────────────────────────────────────────────────────────

/// Headless notifier: messages go to the log. Confirmations get a fixed
/// answer, or time out when none is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    auto_answer: Option<ConfirmOutcome>,
}

impl LogNotifier {
    pub fn new(auto_answer: Option<ConfirmOutcome>) -> Self {
        Self { auto_answer }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, account_id: &str, text: &str) {
        info!(account = %account_id, "{text}");
    }

    async fn confirm(&self, account_id: &str, prompt: &str, timeout: Duration) -> ConfirmOutcome {
        info!(
            account = %account_id,
            timeout_secs = timeout.as_secs(),
            auto_answer = ?self.auto_answer,
            "confirmation requested: {prompt}"
        );
        match self.auto_answer {
            Some(answer) => answer,
            None => {
                tokio::time::sleep(timeout).await;
                ConfirmOutcome::TimedOut
            }
        }
    }
}
