//! Completion reporting — the single exit point of a session.
//!
//! Converts a detected solution into the (challenge-id, response-token)
//! pair the caller awaits, exactly once per session. Whatever the session
//! observes afterwards (duplicate form-field events, a second script
//! message, a racing poll) is a no-op here.

use crate::core::error::SolveError;
use crate::core::types::Solution;
use crate::verification::cooldown::CooldownStore;
use tokio::sync::oneshot;
use tracing::{debug, info};

pub struct CompletionReporter {
    tx: Option<oneshot::Sender<Result<Solution, SolveError>>>,
    cooldowns: CooldownStore,
    session_key: String,
}

impl CompletionReporter {
    pub fn new(
        tx: oneshot::Sender<Result<Solution, SolveError>>,
        cooldowns: CooldownStore,
        session_key: String,
    ) -> Self {
        Self {
            tx: Some(tx),
            cooldowns,
            session_key,
        }
    }

    pub fn is_reported(&self) -> bool {
        self.tx.is_none()
    }

    /// Deliver a solved challenge. The server accepted the solve, so the
    /// session's cooldown record is cleared. Returns `false` on a duplicate
    /// call (nothing delivered).
    pub fn solved(&mut self, challenge_id: &str, response_token: &str) -> bool {
        let Some(tx) = self.tx.take() else {
            debug!(key = %self.session_key, "duplicate completion ignored");
            return false;
        };
        info!(key = %self.session_key, "challenge solved");
        self.cooldowns.clear(&self.session_key);
        let _ = tx.send(Ok(Solution::new(challenge_id, response_token)));
        true
    }

    /// Companion path for "verification not required": completes with an
    /// empty id/token pair.
    pub fn not_required(&mut self) -> bool {
        let Some(tx) = self.tx.take() else {
            return false;
        };
        info!(key = %self.session_key, "verification not required");
        self.cooldowns.clear(&self.session_key);
        let _ = tx.send(Ok(Solution::not_required()));
        true
    }

    /// Terminal failure. Does not touch the cooldown record — the server
    /// did not accept anything.
    pub fn failed(&mut self, error: SolveError) -> bool {
        let Some(tx) = self.tx.take() else {
            return false;
        };
        let _ = tx.send(Err(error));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> (
        CompletionReporter,
        oneshot::Receiver<Result<Solution, SolveError>>,
        CooldownStore,
    ) {
        let (tx, rx) = oneshot::channel();
        let cooldowns = CooldownStore::new(2_000, 500);
        let r = CompletionReporter::new(tx, cooldowns.clone(), "b_0".into());
        (r, rx, cooldowns)
    }

    /// Completion is idempotent: two calls, one delivery.
    #[tokio::test]
    async fn second_completion_is_a_no_op() {
        let (mut r, rx, _) = reporter();
        assert!(r.solved("c1", "tok"));
        assert!(!r.solved("c2", "other"));
        assert!(!r.not_required());

        let delivered = rx.await.unwrap().unwrap();
        assert_eq!(delivered, Solution::new("c1", "tok"));
    }

    #[tokio::test]
    async fn solved_clears_the_cooldown_record() {
        let (mut r, _rx, cooldowns) = reporter();
        cooldowns.arm("b_0", 60);
        assert!(cooldowns.is_active("b_0"));
        r.solved("c1", "tok");
        assert!(!cooldowns.is_active("b_0"));
    }

    #[tokio::test]
    async fn not_required_delivers_empty_pair() {
        let (mut r, rx, _) = reporter();
        r.not_required();
        let delivered = rx.await.unwrap().unwrap();
        assert!(delivered.is_not_required());
    }

    #[tokio::test]
    async fn failure_keeps_the_cooldown_record() {
        let (mut r, rx, cooldowns) = reporter();
        cooldowns.arm("b_0", 60);
        r.failed(SolveError::SiteRejection {
            message: "banned".into(),
        });
        assert!(cooldowns.is_active("b_0"));
        assert!(matches!(
            rx.await.unwrap(),
            Err(SolveError::SiteRejection { .. })
        ));
    }
}
