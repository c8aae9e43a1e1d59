//! Process-wide ticket cache.
//!
//! Servers issue an opaque continuation token ("ticket") with challenge
//! responses and expect it replayed on subsequent requests within the same
//! verification window. The cache is last-writer-wins across sessions and
//! bounded by each site's declared TTL — when the window elapses the entry
//! evicts itself, which is the `expire_session` path.

use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone)]
struct TicketEntry {
    ticket: String,
    ttl: Duration,
}

struct TicketExpiry;

impl moka::Expiry<String, TicketEntry> for TicketExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &TicketEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct TicketStore {
    cache: moka::sync::Cache<String, TicketEntry>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self {
            cache: moka::sync::Cache::builder()
                .max_capacity(256)
                .expire_after(TicketExpiry)
                .build(),
        }
    }

    /// Record the latest ticket for a site. Last writer wins by requirement:
    /// the server's most recent token is the only one it will accept.
    pub fn set(&self, site_identity: &str, ticket: &str, ttl_secs: u64) {
        if ticket.is_empty() {
            return;
        }
        debug!(site = site_identity, "ticket cached");
        self.cache.insert(
            site_identity.to_string(),
            TicketEntry {
                ticket: ticket.to_string(),
                ttl: Duration::from_secs(ttl_secs),
            },
        );
    }

    pub fn get(&self, site_identity: &str) -> Option<String> {
        self.cache.get(site_identity).map(|e| e.ticket)
    }

    /// Drop the cached ticket for a site before its TTL — used when the
    /// verification window is known to be dead (e.g. the server rejected it).
    pub fn invalidate(&self, site_identity: &str) {
        self.cache.invalidate(site_identity);
    }
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_writer_wins() {
        let store = TicketStore::new();
        store.set("testchan", "first", 120);
        store.set("testchan", "second", 120);
        assert_eq!(store.get("testchan").as_deref(), Some("second"));
    }

    #[test]
    fn empty_ticket_is_ignored() {
        let store = TicketStore::new();
        store.set("testchan", "", 120);
        assert_eq!(store.get("testchan"), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let store = TicketStore::new();
        store.set("testchan", "abc", 120);
        store.invalidate("testchan");
        assert_eq!(store.get("testchan"), None);
    }

    #[test]
    fn sites_are_namespaced() {
        let store = TicketStore::new();
        store.set("alpha", "a", 120);
        store.set("beta", "b", 120);
        assert_eq!(store.get("alpha").as_deref(), Some("a"));
        assert_eq!(store.get("beta").as_deref(), Some("b"));
    }
}
