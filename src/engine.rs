//! Engine facade — what the posting UI talks to.
//!
//! Owns the process-wide state (cooldown table, ticket cache, HTTP client,
//! per-site network policy) and spawns one session task per solve request.
//! The caller gets a [`SessionHandle`]: a stream of UI hints plus an
//! awaitable solution. Dropping the handle cancels the session; no late
//! callback ever reaches a dead owner.

use crate::acquire::{run_session, SessionContext, SessionMsg};
use crate::core::config::EngineConfig;
use crate::core::error::SolveError;
use crate::core::types::{SiteDescriptor, Solution};
use crate::core::EngineState;
use crate::present::{PresentationController, UiEvent};
use crate::report::CompletionReporter;
use crate::sandbox::Sandbox;
use crate::verification::session_key::session_key;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub struct VerificationEngine {
    state: Arc<EngineState>,
}

impl VerificationEngine {
    /// Build an engine with explicit config. All shared services are created
    /// here, up front.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        Ok(Self {
            state: Arc::new(EngineState::new(config)?),
        })
    }

    /// Build an engine from `postgate.json` / env-var config.
    pub fn with_loaded_config() -> anyhow::Result<Self> {
        Self::new(EngineConfig::load())
    }

    /// Start a verification session for one posting attempt.
    pub fn begin(
        &self,
        sandbox: Arc<dyn Sandbox>,
        site: &SiteDescriptor,
        board: &str,
        thread_id: u64,
    ) -> SessionHandle {
        let key = session_key(site, board, thread_id);
        let instance_id = Uuid::new_v4();

        let (ui_tx, ui_rx) = mpsc::channel(64);
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (result_tx, result_rx) = oneshot::channel();

        let presenter = PresentationController::new(
            Arc::clone(&sandbox),
            self.state.net.pacer_for(site),
            ui_tx,
        );
        let reporter =
            CompletionReporter::new(result_tx, self.state.cooldowns.clone(), key.clone());

        let ctx = SessionContext {
            state: Arc::clone(&self.state),
            sandbox_events: sandbox.subscribe(),
            sandbox,
            site: site.clone(),
            board: board.to_string(),
            thread_id,
            session_key: key,
            instance_id,
            presenter,
            reporter,
            msg_rx,
            msg_tx: msg_tx.clone(),
        };
        tokio::spawn(run_session(ctx));

        SessionHandle {
            instance_id,
            ui_rx,
            result_rx: Some(result_rx),
            msg_tx,
        }
    }

    /// Convenience: begin a session and wait for its outcome, ignoring UI
    /// hints.
    pub async fn solve(
        &self,
        sandbox: Arc<dyn Sandbox>,
        site: &SiteDescriptor,
        board: &str,
        thread_id: u64,
    ) -> Result<Solution, SolveError> {
        let mut handle = self.begin(sandbox, site, board, thread_id);
        handle.solution().await
    }

    pub fn is_on_cooldown(&self, site: &SiteDescriptor, board: &str, thread_id: u64) -> bool {
        self.state
            .cooldowns
            .is_active(&session_key(site, board, thread_id))
    }

    pub fn remaining_cooldown_seconds(
        &self,
        site: &SiteDescriptor,
        board: &str,
        thread_id: u64,
    ) -> u64 {
        self.state
            .cooldowns
            .remaining_secs(&session_key(site, board, thread_id))
    }

    /// The ticket currently cached for a site, if its verification window is
    /// still open. The posting flow replays this with the post request.
    pub fn cached_ticket(&self, site: &SiteDescriptor) -> Option<String> {
        self.state.tickets.get(&site.identity)
    }

    /// Drop a site's cached verification-window state (ticket) ahead of its
    /// TTL. Independent of the posting cooldown.
    pub fn expire_session(&self, site: &SiteDescriptor) {
        self.state.tickets.invalidate(&site.identity);
    }
}

/// One live verification session, from the caller's side.
pub struct SessionHandle {
    pub instance_id: Uuid,
    ui_rx: mpsc::Receiver<UiEvent>,
    result_rx: Option<oneshot::Receiver<Result<Solution, SolveError>>>,
    msg_tx: mpsc::Sender<SessionMsg>,
}

impl SessionHandle {
    /// Next UI hint, or `None` once the session is gone. Hints are advisory
    /// and may be dropped under backpressure.
    pub async fn next_ui_event(&mut self) -> Option<UiEvent> {
        self.ui_rx.recv().await
    }

    pub fn try_ui_event(&mut self) -> Option<UiEvent> {
        self.ui_rx.try_recv().ok()
    }

    /// Stop the session. Idempotent; also implied by drop.
    pub fn cancel(&self) {
        let _ = self.msg_tx.try_send(SessionMsg::Cancel);
    }

    /// Wait for the session's single outcome. Awaiting it a second time
    /// reports the session as closed.
    pub async fn solution(&mut self) -> Result<Solution, SolveError> {
        let Some(rx) = self.result_rx.take() else {
            return Err(SolveError::SessionClosed);
        };
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SolveError::SessionClosed),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.msg_tx.try_send(SessionMsg::Cancel);
    }
}
