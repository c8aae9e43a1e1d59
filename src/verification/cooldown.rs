//! Process-wide cooldown table.
//!
//! One table is shared by every open verification session so that multiple
//! reply forms for the same thread observe the same wait. Entries are removed
//! on expiry or explicit completion; each `arm` schedules a one-shot expiry
//! check whose firing is gated on the record still being the one it armed —
//! racing fetches that re-arm an equivalent cooldown must not produce
//! duplicate expiry notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// Broadcast to every session watching the table when a key's wait ends.
#[derive(Debug, Clone)]
pub struct CooldownExpired {
    pub key: String,
}

#[derive(Clone)]
pub struct CooldownStore {
    inner: Arc<Inner>,
}

struct Inner {
    /// session key → expiry instant. The only state shared across sessions.
    records: Mutex<HashMap<String, Instant>>,
    /// Last notification instant per key, for notification rate limiting.
    last_notified: Mutex<HashMap<String, Instant>>,
    notify_tx: broadcast::Sender<CooldownExpired>,
    tolerance: Duration,
    notify_min_interval: Duration,
}

impl CooldownStore {
    pub fn new(tolerance_ms: u64, notify_min_interval_ms: u64) -> Self {
        let (notify_tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(HashMap::new()),
                last_notified: Mutex::new(HashMap::new()),
                notify_tx,
                tolerance: Duration::from_millis(tolerance_ms),
                notify_min_interval: Duration::from_millis(notify_min_interval_ms),
            }),
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.remaining_secs(key) > 0
    }

    /// Whole seconds left on the cooldown for `key`, 0 when none is armed.
    pub fn remaining_secs(&self, key: &str) -> u64 {
        let records = self.inner.records.lock().expect("cooldown table poisoned");
        records
            .get(key)
            .map(|expiry| expiry.saturating_duration_since(Instant::now()).as_secs())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().expect("cooldown table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch for expiry notifications across all keys.
    pub fn subscribe(&self) -> broadcast::Receiver<CooldownExpired> {
        self.inner.notify_tx.subscribe()
    }

    /// Arm (or re-arm) the cooldown for `key`.
    ///
    /// A new expiry within `tolerance` of the existing record is treated as
    /// the same cooldown: the record and its scheduled check are left alone,
    /// so racing fetches reporting the same wait cannot double-notify.
    pub fn arm(&self, key: &str, seconds: u32) {
        let target = Instant::now() + Duration::from_secs(u64::from(seconds));

        {
            let mut records = self.inner.records.lock().expect("cooldown table poisoned");
            if let Some(existing) = records.get(key) {
                let diff = if *existing > target {
                    *existing - target
                } else {
                    target - *existing
                };
                if diff <= self.inner.tolerance {
                    debug!(key, seconds, "cooldown re-arm within tolerance, keeping record");
                    return;
                }
            }
            debug!(key, seconds, "cooldown armed");
            records.insert(key.to_string(), target);
        }

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(target).await;
            inner.fire_if_still_due(&key, target);
        });
    }

    /// Remove the record without notification — the server accepted a solve.
    pub fn clear(&self, key: &str) {
        let removed = self
            .inner
            .records
            .lock()
            .expect("cooldown table poisoned")
            .remove(key)
            .is_some();
        if removed {
            debug!(key, "cooldown cleared");
        }
    }
}

impl Inner {
    /// One-shot expiry check. Re-reads the record: a re-arm past tolerance
    /// replaced it (and scheduled its own check), so a mismatch means this
    /// timer is stale and must do nothing.
    fn fire_if_still_due(&self, key: &str, armed_target: Instant) {
        {
            let mut records = self.records.lock().expect("cooldown table poisoned");
            match records.get(key) {
                Some(expiry) if *expiry == armed_target => {
                    records.remove(key);
                }
                _ => {
                    debug!(key, "stale cooldown timer, skipping");
                    return;
                }
            }
        }

        // Rate-limit notifications per key: several sessions observing the
        // same key get one broadcast each cycle, not a storm.
        let now = Instant::now();
        {
            let mut last = self.last_notified.lock().expect("cooldown table poisoned");
            if let Some(prev) = last.get(key) {
                if now.saturating_duration_since(*prev) < self.notify_min_interval {
                    debug!(key, "cooldown notification suppressed by rate limit");
                    return;
                }
            }
            last.insert(key.to_string(), now);
        }

        debug!(key, "cooldown expired");
        let _ = self.notify_tx.send(CooldownExpired {
            key: key.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, pause};

    fn store() -> CooldownStore {
        CooldownStore::new(2_000, 500)
    }

    #[tokio::test]
    async fn remaining_counts_down() {
        pause();
        let s = store();
        s.arm("b_0", 30);
        assert!(s.is_active("b_0"));
        assert_eq!(s.remaining_secs("b_0"), 30);

        advance(Duration::from_secs(10)).await;
        assert_eq!(s.remaining_secs("b_0"), 20);
    }

    /// Arming 60s then 61s within 2s of the first keeps the original record:
    /// exactly one notification, at the original time.
    #[tokio::test]
    async fn rearm_within_tolerance_does_not_reschedule() {
        pause();
        let s = store();
        let mut rx = s.subscribe();

        s.arm("b_0", 60);
        advance(Duration::from_secs(1)).await;
        s.arm("b_0", 61); // 61s from t=1s lands ≤2s from the original expiry

        advance(Duration::from_secs(60)).await;
        let fired = rx.try_recv().expect("expiry should have fired once");
        assert_eq!(fired.key, "b_0");
        assert!(!s.is_active("b_0"));

        advance(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "no second notification expected");
    }

    /// A re-arm beyond tolerance replaces the record; the original timer must
    /// notice it is stale and stay silent.
    #[tokio::test]
    async fn rearm_beyond_tolerance_reschedules() {
        pause();
        let s = store();
        let mut rx = s.subscribe();

        s.arm("b_0", 10);
        s.arm("b_0", 30);

        advance(Duration::from_secs(11)).await;
        assert!(rx.try_recv().is_err(), "original timer must be stale");
        assert!(s.is_active("b_0"));

        advance(Duration::from_secs(20)).await;
        assert_eq!(rx.try_recv().unwrap().key, "b_0");
        assert!(!s.is_active("b_0"));
    }

    #[tokio::test]
    async fn clear_removes_without_notification() {
        pause();
        let s = store();
        let mut rx = s.subscribe();

        s.arm("v_99", 30);
        s.clear("v_99");
        assert!(!s.is_active("v_99"));

        advance(Duration::from_secs(31)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        pause();
        let s = store();
        s.arm("b_0", 30);
        s.arm("global", 90);

        advance(Duration::from_secs(31)).await;
        assert!(!s.is_active("b_0"));
        assert!(s.is_active("global"));
    }
}
