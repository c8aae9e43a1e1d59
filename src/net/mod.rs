//! Network resilience collaborators.
//!
//! The engine consumes two small services per site: a pacer enforcing a
//! minimum time between outbound challenge requests (with jitter, so retry
//! traffic doesn't form a detectable rhythm) and a mirror rotator that fails
//! over across a site's root domains. Both are owned by the engine and
//! handed to sessions; neither knows anything about challenges.

use crate::core::types::SiteDescriptor;
use rand::RngExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// Minimum-interval throttle for outbound challenge requests.
pub struct RequestPacer {
    min_interval: Duration,
    jitter: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval_ms: u64, jitter_ms: u64) -> Self {
        Self {
            min_interval: Duration::from_millis(min_interval_ms),
            jitter: Duration::from_millis(jitter_ms),
            last_request: Mutex::new(None),
        }
    }

    /// Time until the next request is allowed. The presentation layer folds
    /// this into cooldown countdowns.
    pub fn remaining(&self) -> Duration {
        let last = self.last_request.lock().expect("pacer poisoned");
        match *last {
            Some(at) => (at + self.min_interval).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Wait until a request is allowed, then claim the slot.
    pub async fn wait_for_next_request(&self) {
        let wait = {
            let last = self.last_request.lock().expect("pacer poisoned");
            match *last {
                Some(at) => {
                    let jitter_ms = if self.jitter.is_zero() {
                        0
                    } else {
                        let mut rng = rand::rng();
                        rng.random_range(0..=self.jitter.as_millis() as u64)
                    };
                    let target = at + self.min_interval + Duration::from_millis(jitter_ms);
                    target.saturating_duration_since(Instant::now())
                }
                None => Duration::ZERO,
            }
        };

        if !wait.is_zero() {
            debug!("pacing outbound request by {}ms", wait.as_millis());
            tokio::time::sleep(wait).await;
        }

        *self.last_request.lock().expect("pacer poisoned") = Some(Instant::now());
    }
}

/// Failover across a site's root domains.
///
/// The active mirror only advances on reported transport failure; responses
/// that parse (even to errors) keep the current mirror, since application
/// errors are the server talking, not the mirror being dead.
pub struct MirrorRotator {
    roots: Vec<Url>,
    active_idx: AtomicUsize,
}

impl MirrorRotator {
    pub fn new(roots: Vec<Url>) -> Self {
        Self {
            roots,
            active_idx: AtomicUsize::new(0),
        }
    }

    pub fn active_root(&self) -> Url {
        let idx = self.active_idx.load(Ordering::Relaxed) % self.roots.len().max(1);
        self.roots[idx].clone()
    }

    /// Report the outcome of a request against `root`. A failure of the
    /// active mirror advances to the next one; stale reports (against a
    /// mirror we already left) are ignored.
    pub fn record_result(&self, root: &Url, success: bool) {
        if success {
            return;
        }
        let idx = self.active_idx.load(Ordering::Relaxed) % self.roots.len().max(1);
        if self.roots.get(idx).is_some_and(|active| active == root) && self.roots.len() > 1 {
            let next = (idx + 1) % self.roots.len();
            self.active_idx.store(next, Ordering::Relaxed);
            warn!(
                "mirror {} failed, switching to {}",
                root, self.roots[next]
            );
        }
    }
}

/// Per-site pacers and rotators, keyed by site identity.
pub struct NetRegistry {
    min_interval_ms: u64,
    jitter_ms: u64,
    pacers: Mutex<HashMap<String, Arc<RequestPacer>>>,
    rotators: Mutex<HashMap<String, Arc<MirrorRotator>>>,
}

impl NetRegistry {
    pub fn new(min_interval_ms: u64, jitter_ms: u64) -> Self {
        Self {
            min_interval_ms,
            jitter_ms,
            pacers: Mutex::new(HashMap::new()),
            rotators: Mutex::new(HashMap::new()),
        }
    }

    pub fn pacer_for(&self, site: &SiteDescriptor) -> Arc<RequestPacer> {
        let mut pacers = self.pacers.lock().expect("net registry poisoned");
        Arc::clone(pacers.entry(site.identity.clone()).or_insert_with(|| {
            Arc::new(RequestPacer::new(self.min_interval_ms, self.jitter_ms))
        }))
    }

    pub fn rotator_for(&self, site: &SiteDescriptor) -> Arc<MirrorRotator> {
        let mut rotators = self.rotators.lock().expect("net registry poisoned");
        Arc::clone(
            rotators
                .entry(site.identity.clone())
                .or_insert_with(|| Arc::new(MirrorRotator::new(site.roots.clone()))),
        )
    }
}
