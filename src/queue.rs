// =============================================================================
// Signal Queue — bounded, non-blocking, single-consumer
// =============================================================================
//
// Producers call `offer`, which never blocks and never fails loudly: when the
// queue is full the configured policy decides whether the incoming signal or
// the oldest queued one is discarded. Delivery is at-most-once.
//
// The session's confirm worker is the only consumer and awaits `recv`, which
// returns `None` once the queue has been closed and drained.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::types::Signal;

/// Backpressure strategy applied by `SignalQueue::offer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Reject the incoming signal when the queue is full, or when a signal for
    /// the same instrument is already waiting.
    #[default]
    #[serde(alias = "drop_same_symbol")]
    DropNewest,
    /// Evict the oldest queued signal to make room for the incoming one.
    DropOldest,
}

impl std::fmt::Display for QueuePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DropNewest => write!(f, "drop_newest"),
            Self::DropOldest => write!(f, "drop_oldest"),
        }
    }
}

struct Inner {
    items: VecDeque<Signal>,
    closed: bool,
}

pub struct SignalQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    policy: QueuePolicy,
}

impl SignalQueue {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    /// Try to enqueue `signal`. Returns `true` if it was accepted.
    pub fn offer(&self, signal: Signal) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }

            match self.policy {
                QueuePolicy::DropNewest => {
                    if inner.items.len() >= self.capacity {
                        debug!(inst = %signal.inst_id, "queue full, dropping incoming signal");
                        return false;
                    }
                    if inner.items.iter().any(|s| s.inst_id == signal.inst_id) {
                        debug!(inst = %signal.inst_id, "signal for instrument already queued, dropping");
                        return false;
                    }
                }
                QueuePolicy::DropOldest => {
                    while inner.items.len() >= self.capacity {
                        if let Some(evicted) = inner.items.pop_front() {
                            debug!(inst = %evicted.inst_id, "queue full, evicted oldest signal");
                        }
                    }
                }
            }

            inner.items.push_back(signal);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next signal. `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<Signal> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(s) = inner.items.pop_front() {
                    return Some(s);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting signals and discard whatever is still queued.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.items.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }
}

impl std::fmt::Debug for SignalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn sig(inst: &str) -> Signal {
        Signal {
            inst_id: inst.to_string(),
            timeframe: "15m".into(),
            side: Side::Buy,
            price: 100.0,
            strategy: "donchian".into(),
            reason: "test".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn full_queue_drops_third_signal_without_blocking() {
        let q = SignalQueue::new(2, QueuePolicy::DropNewest);
        assert!(q.offer(sig("BTC-USDT-SWAP")));
        assert!(q.offer(sig("ETH-USDT-SWAP")));
        assert!(!q.offer(sig("SOL-USDT-SWAP")));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn drop_newest_rejects_same_instrument_already_waiting() {
        let q = SignalQueue::new(8, QueuePolicy::DropNewest);
        assert!(q.offer(sig("BTC-USDT-SWAP")));
        assert!(!q.offer(sig("BTC-USDT-SWAP")));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_head() {
        let q = SignalQueue::new(2, QueuePolicy::DropOldest);
        assert!(q.offer(sig("A")));
        assert!(q.offer(sig("B")));
        assert!(q.offer(sig("C")));
        assert_eq!(q.len(), 2);
        assert_eq!(q.recv().await.unwrap().inst_id, "B");
        assert_eq!(q.recv().await.unwrap().inst_id, "C");
    }

    #[tokio::test]
    async fn recv_wakes_on_offer_and_returns_none_after_close() {
        let q = Arc::new(SignalQueue::new(4, QueuePolicy::DropNewest));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                let first = q.recv().await.map(|s| s.inst_id);
                let second = q.recv().await;
                (first, second)
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(q.offer(sig("A")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();

        let (first, second) = consumer.await.unwrap();
        assert_eq!(first.as_deref(), Some("A"));
        assert!(second.is_none());
        assert!(!q.offer(sig("B")));
    }

    #[test]
    fn policy_accepts_legacy_alias() {
        let p: QueuePolicy = serde_json::from_str(r#""drop_same_symbol""#).unwrap();
        assert_eq!(p, QueuePolicy::DropNewest);
        let p: QueuePolicy = serde_json::from_str(r#""drop_oldest""#).unwrap();
        assert_eq!(p, QueuePolicy::DropOldest);
    }
}
