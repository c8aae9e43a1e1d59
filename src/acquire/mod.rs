//! The acquisition strategy chain.
//!
//! Orders three ways of obtaining a fresh challenge payload — authenticated
//! background fetch, in-sandbox same-origin fetch, full native page load —
//! and escalates between them under per-strategy retry budgets. The whole
//! chain runs on one session task: workers and the sandbox deliver results
//! as messages, so no two continuations of the same session ever run
//! concurrently and retry counters need no locks.
//!
//! Retryable failures (transport, empty/malformed payloads) die inside this
//! module; only explicit server rejections and chain exhaustion escape to
//! presentation.

pub mod background;
pub mod native;

use crate::core::error::{SandboxError, SolveError};
use crate::core::types::{ChallengeData, Payload, SiteDescriptor};
use crate::core::EngineState;
use crate::present::PresentationController;
use crate::report::CompletionReporter;
use crate::sandbox::{Sandbox, SandboxEvent};
use crate::verification::cooldown::CooldownExpired;
use crate::verification::extract::{extract, is_fingerprint_message, strip_markup};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where the chain currently is for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Idle,
    AwaitingBackgroundFetch,
    AwaitingSandboxFetch,
    AwaitingNativeLoad,
    Resolved,
    Failed,
}

/// Per-strategy counters, scoped to one session. Reset whenever the session
/// points at a fresh target.
#[derive(Debug, Default)]
pub struct RetryBudget {
    /// Consecutive misses (empty payloads / transport failures) on the
    /// current fetch strategy.
    pub failed_attempts: u32,
    /// In-sandbox fetches auto-triggered since the last native page load.
    /// Capped at one per load to stop native-load/fetch oscillation.
    pub auto_fetch_count: u32,
    /// Document polls since the last load-finished.
    pub native_retry_attempts: u32,
    /// Full native reloads this session.
    pub native_reloads: u32,
}

impl RetryBudget {
    pub fn reset_for_new_target(&mut self) {
        self.failed_attempts = 0;
        self.auto_fetch_count = 0;
        self.native_retry_attempts = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchOrigin {
    Background,
    SandboxFetch,
}

/// Which side of the sandbox boundary a payload came from. Payloads from the
/// native document describe what is already on screen; payloads from a data
/// channel describe something not yet shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadSource {
    DataChannel,
    NativeDocument,
}

/// Everything posted back onto the session task.
#[derive(Debug)]
pub(crate) enum SessionMsg {
    FetchResult {
        origin: FetchOrigin,
        result: Result<String, String>,
    },
    PollTick,
    Cancel,
}

pub(crate) struct SessionContext {
    pub state: Arc<EngineState>,
    pub sandbox: Arc<dyn Sandbox>,
    /// Subscribed by the engine before the session task is spawned, so no
    /// early sandbox event can slip past the session.
    pub sandbox_events: broadcast::Receiver<SandboxEvent>,
    pub site: SiteDescriptor,
    pub board: String,
    pub thread_id: u64,
    pub session_key: String,
    pub instance_id: Uuid,
    pub presenter: PresentationController,
    pub reporter: CompletionReporter,
    pub msg_rx: mpsc::Receiver<SessionMsg>,
    pub msg_tx: mpsc::Sender<SessionMsg>,
}

/// Session entry point: single-consumer loop over everything that can wake
/// this session. Runs until a completion is reported or the owner goes away.
pub(crate) async fn run_session(ctx: SessionContext) {
    let SessionContext {
        state,
        sandbox,
        sandbox_events,
        site,
        board,
        thread_id,
        session_key,
        instance_id,
        presenter,
        reporter,
        msg_rx,
        msg_tx,
    } = ctx;

    let mut msg_rx = msg_rx;
    let mut sandbox_events = sandbox_events;
    let mut cooldown_events = state.cooldowns.subscribe();

    let mut driver = SessionDriver {
        state,
        sandbox,
        site,
        board,
        thread_id,
        session_key,
        instance_id,
        presenter,
        reporter,
        msg_tx,
        chain: ChainState::Idle,
        budget: RetryBudget::default(),
        live_challenge: false,
        current_challenge: None,
        waiting_cooldown: false,
        total_attempts: 0,
    };

    info!(session = %driver.instance_id, key = %driver.session_key, "verification session started");
    driver.begin().await;

    while !driver.reporter.is_reported() {
        tokio::select! {
            msg = msg_rx.recv() => match msg {
                None | Some(SessionMsg::Cancel) => {
                    debug!(session = %driver.instance_id, "session cancelled");
                    driver.reporter.failed(SolveError::SessionClosed);
                    break;
                }
                Some(SessionMsg::FetchResult { origin, result }) => {
                    driver.on_fetch_result(origin, result).await;
                }
                Some(SessionMsg::PollTick) => driver.on_poll_tick().await,
            },
            event = sandbox_events.recv() => match event {
                Ok(event) => driver.on_sandbox_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %driver.instance_id, skipped, "sandbox event backlog");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    driver.reporter.failed(SolveError::Sandbox(SandboxError::Closed));
                    break;
                }
            },
            expired = cooldown_events.recv() => {
                if let Ok(expired) = expired {
                    driver.on_cooldown_expired(expired).await;
                }
            }
        }
    }

    driver.presenter.teardown();
    info!(session = %driver.instance_id, "verification session ended");
}

struct SessionDriver {
    state: Arc<EngineState>,
    sandbox: Arc<dyn Sandbox>,
    site: SiteDescriptor,
    board: String,
    thread_id: u64,
    session_key: String,
    instance_id: Uuid,
    presenter: PresentationController,
    reporter: CompletionReporter,
    msg_tx: mpsc::Sender<SessionMsg>,
    chain: ChainState,
    budget: RetryBudget,
    /// The user is actively solving a displayed challenge. While set, no
    /// strategy may navigate away, and "no data yet" signals from parallel
    /// channels are discarded instead of triggering a reload.
    live_challenge: bool,
    current_challenge: Option<ChallengeData>,
    waiting_cooldown: bool,
    total_attempts: u32,
}

impl SessionDriver {
    async fn begin(&mut self) {
        let remaining = self.state.cooldowns.remaining_secs(&self.session_key);
        if remaining > 0 {
            debug!(key = %self.session_key, remaining, "cooldown active, short-circuiting");
            self.waiting_cooldown = true;
            self.presenter.show_cooldown(remaining);
            // Belt alongside the broadcast: a local check in case this key's
            // notification was coalesced away.
            self.schedule_poll_in(Duration::from_secs(remaining) + Duration::from_millis(200));
        } else {
            self.start_background_fetch();
        }
    }

    // ── Strategy: background fetch ───────────────────────────────────────────

    fn start_background_fetch(&mut self) {
        self.chain = ChainState::AwaitingBackgroundFetch;
        self.total_attempts += 1;
        background::spawn(background::FetchJob {
            http: self.state.http.clone(),
            site: self.site.clone(),
            board: self.board.clone(),
            thread_id: self.thread_id,
            ticket: self.state.tickets.get(&self.site.identity),
            pacer: self.state.net.pacer_for(&self.site),
            rotator: self.state.net.rotator_for(&self.site),
            sandbox: Arc::clone(&self.sandbox),
            msg_tx: self.msg_tx.clone(),
            retry_max_elapsed: Duration::from_secs(
                self.state.config.transport_retry_max_elapsed_secs,
            ),
        });
    }

    // ── Strategy: in-sandbox fetch ───────────────────────────────────────────

    fn start_sandbox_fetch(&mut self) {
        self.chain = ChainState::AwaitingSandboxFetch;
        self.total_attempts += 1;

        let root = self.state.net.rotator_for(&self.site).active_root();
        let ticket = self.state.tickets.get(&self.site.identity);
        let url = match self
            .site
            .challenge_url(&root, &self.board, self.thread_id, ticket.as_deref())
        {
            Ok(url) => url,
            Err(e) => {
                warn!("bad challenge endpoint for sandbox fetch: {}", e);
                return;
            }
        };

        let script = native::same_origin_fetch_script(&url);
        let sandbox = Arc::clone(&self.sandbox);
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            let result = match sandbox.evaluate_script(&script).await {
                Ok(serde_json::Value::String(body)) => {
                    match body.strip_prefix(native::FETCH_ERROR_PREFIX) {
                        Some(err) => Err(err.to_string()),
                        None => Ok(body),
                    }
                }
                Ok(other) => Err(format!("unexpected in-sandbox fetch result: {}", other)),
                Err(e) => Err(e.to_string()),
            };
            let _ = msg_tx
                .send(SessionMsg::FetchResult {
                    origin: FetchOrigin::SandboxFetch,
                    result,
                })
                .await;
        });
    }

    // ── Strategy: native load ────────────────────────────────────────────────

    async fn escalate_to_native(&mut self) {
        info!(session = %self.instance_id, "escalating to native challenge load");
        self.budget.reset_for_new_target();
        self.chain = ChainState::AwaitingNativeLoad;
        self.total_attempts += 1;

        let rotator = self.state.net.rotator_for(&self.site);
        let root = rotator.active_root();
        let ticket = self.state.tickets.get(&self.site.identity);
        let url = match self
            .site
            .challenge_url(&root, &self.board, self.thread_id, ticket.as_deref())
        {
            Ok(url) => url,
            Err(e) => {
                warn!("bad challenge endpoint for native load: {}", e);
                self.give_up().await;
                return;
            }
        };

        if let Err(e) = self.sandbox.load_url(&url, &[]).await {
            warn!("native challenge load failed: {}", e);
            rotator.record_result(&root, false);
            self.reload_native_or_give_up().await;
        }
        // On success the sandbox reports LoadFinished, which starts polling.
    }

    async fn reload_native_or_give_up(&mut self) {
        self.budget.native_reloads += 1;
        if self.budget.native_reloads > self.state.config.native_reload_max {
            self.give_up().await;
        } else {
            Box::pin(self.escalate_to_native()).await;
        }
    }

    /// Chain exhaustion: stop looping, hand control to the user.
    async fn give_up(&mut self) {
        self.chain = ChainState::Failed;
        self.presenter.manual_retry_available();
        self.presenter
            .show_overlay("Tap to request a new challenge", true)
            .await;
        self.reporter.failed(SolveError::Exhausted {
            attempts: self.total_attempts,
        });
    }

    // ── Message handlers ─────────────────────────────────────────────────────

    async fn on_fetch_result(&mut self, origin: FetchOrigin, result: Result<String, String>) {
        let expected = match origin {
            FetchOrigin::Background => ChainState::AwaitingBackgroundFetch,
            FetchOrigin::SandboxFetch => ChainState::AwaitingSandboxFetch,
        };
        let stale = self.chain != expected;

        match result {
            Ok(raw) => {
                let payload = extract(&raw);
                debug!(
                    session = %self.instance_id,
                    payload = payload.tag(),
                    ?origin,
                    stale,
                    "fetch result classified"
                );
                // A channel we've already left may still deliver something
                // actionable (a challenge, a verdict); but its low-value
                // signals are just echoes of a state we moved past.
                if stale
                    && matches!(
                        payload,
                        Payload::Empty | Payload::Cooldown { .. } | Payload::RateLimited { .. }
                    )
                {
                    debug!("discarding stale low-value fetch result");
                    return;
                }
                self.apply_payload(PayloadSource::DataChannel, payload).await;
            }
            Err(err) => {
                if stale {
                    debug!("discarding stale transport failure");
                    return;
                }
                warn!(session = %self.instance_id, "fetch transport failure: {}", err);
                self.register_miss().await;
            }
        }
    }

    async fn on_sandbox_event(&mut self, event: SandboxEvent) {
        match event {
            SandboxEvent::LoadFinished { url } => {
                if self.chain == ChainState::AwaitingNativeLoad {
                    debug!(%url, "native challenge page loaded");
                    self.budget.native_retry_attempts = 0;
                    self.budget.auto_fetch_count = 0;
                    self.schedule_poll();
                }
            }
            SandboxEvent::ScriptMessage { json } => self.on_script_message(json).await,
            SandboxEvent::FormFieldValue { name, value } => {
                if native::RESPONSE_FIELD_NAMES.contains(&name.as_str()) && !value.is_empty() {
                    self.complete_solved(None, &value);
                }
            }
        }
    }

    async fn on_script_message(&mut self, json: String) {
        // A solved-response message from a challenge document…
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json) {
            if let Some(response) = value.get("response").and_then(|v| v.as_str()) {
                if !response.is_empty() {
                    let id = value
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    self.complete_solved(id, response);
                    return;
                }
            }
        }
        // …or a raw gate payload posted by the page's own script.
        let source = if self.chain == ChainState::AwaitingNativeLoad || self.live_challenge {
            PayloadSource::NativeDocument
        } else {
            PayloadSource::DataChannel
        };
        self.apply_payload(source, extract(&json)).await;
    }

    async fn on_cooldown_expired(&mut self, expired: CooldownExpired) {
        if expired.key == self.session_key && self.waiting_cooldown {
            self.waiting_cooldown = false;
            self.presenter.cooldown_finished();
            self.start_background_fetch();
        }
    }

    async fn on_poll_tick(&mut self) {
        // Poll ticks double as the local cooldown wake-up.
        if self.waiting_cooldown {
            if self.state.cooldowns.is_active(&self.session_key) {
                let remaining = self.state.cooldowns.remaining_secs(&self.session_key);
                self.schedule_poll_in(Duration::from_secs(remaining) + Duration::from_millis(200));
            } else {
                self.waiting_cooldown = false;
                self.presenter.cooldown_finished();
                self.start_background_fetch();
            }
            return;
        }

        if self.chain != ChainState::AwaitingNativeLoad {
            return;
        }

        match native::probe_document(self.sandbox.as_ref()).await {
            Err(e) => {
                debug!("document probe failed: {}", e);
                self.budget.native_retry_attempts += 1;
                self.continue_polling("").await;
            }
            Ok(probe) => {
                if let Some(token) = probe.response.as_deref().filter(|t| !t.is_empty()) {
                    // The page's own logic filled the response field.
                    let token = token.to_string();
                    self.complete_solved(None, &token);
                    return;
                }
                if let Some(text) = probe.blocking.as_deref().filter(|t| !t.trim().is_empty()) {
                    let message = strip_markup(text);
                    if is_fingerprint_message(&message) {
                        // Expected transient state: the page's script is
                        // still working. Keep the document alive and wait.
                        self.budget.native_retry_attempts += 1;
                        self.continue_polling(&probe.body).await;
                    } else {
                        self.terminal_rejection(message).await;
                    }
                    return;
                }

                let payload = extract(&probe.body);
                match payload {
                    Payload::Empty => {
                        if self.budget.auto_fetch_count == 0 {
                            // One same-origin fetch per native load: the
                            // document may hold the session state needed for
                            // the endpoint to answer.
                            self.budget.auto_fetch_count = 1;
                            self.start_sandbox_fetch();
                            return;
                        }
                        self.budget.native_retry_attempts += 1;
                        self.continue_polling(&probe.body).await;
                    }
                    other => self.apply_payload(PayloadSource::NativeDocument, other).await,
                }
            }
        }
    }

    /// Keep polling the native document, or stop at the page-appropriate
    /// ceiling: recognized challenge pages legitimately run long,
    /// unrecognized ones get a short leash and then a manual retry control.
    async fn continue_polling(&mut self, body: &str) {
        let ceiling = if native::is_known_challenge_page(body) {
            self.state.config.native_poll_known_max
        } else {
            self.state.config.native_poll_unknown_max
        };
        if self.budget.native_retry_attempts >= ceiling {
            debug!(
                attempts = self.budget.native_retry_attempts,
                ceiling, "native poll ceiling reached"
            );
            self.give_up().await;
        } else {
            self.schedule_poll();
        }
    }

    // ── Payload application ──────────────────────────────────────────────────

    async fn apply_payload(&mut self, source: PayloadSource, payload: Payload) {
        match payload {
            Payload::Cooldown { seconds } => self.enter_cooldown(seconds, None).await,
            Payload::RateLimited { seconds, message } => {
                // Expected server behavior, not an error: same cooldown path.
                self.enter_cooldown(seconds, Some(message)).await;
            }
            Payload::Challenge(data) => self.present_challenge(source, data).await,
            Payload::VerifiedNone => {
                self.chain = ChainState::Resolved;
                self.reporter.not_required();
            }
            Payload::SiteError {
                message,
                fingerprint_gate: true,
            } => self.on_fingerprint_gate(&message).await,
            Payload::SiteError { message, .. } => self.terminal_rejection(message).await,
            Payload::Empty => self.on_empty().await,
        }
    }

    async fn enter_cooldown(&mut self, seconds: u32, message: Option<String>) {
        self.state.cooldowns.arm(&self.session_key, seconds);
        if self.live_challenge {
            // The user is mid-solve; record the cooldown but leave the
            // challenge alone.
            debug!("cooldown recorded behind a live challenge");
            return;
        }
        self.chain = ChainState::Idle;
        self.waiting_cooldown = true;
        if let Some(message) = message {
            self.presenter.show_overlay(&message, false).await;
        }
        self.presenter.show_cooldown(u64::from(seconds));
        self.schedule_poll_in(Duration::from_secs(u64::from(seconds)) + Duration::from_millis(200));
    }

    async fn present_challenge(&mut self, source: PayloadSource, data: ChallengeData) {
        if let Some(ticket) = data.ticket.as_deref() {
            self.state
                .tickets
                .set(&self.site.identity, ticket, self.site.session_ttl_secs);
        }

        if self.live_challenge && self.current_challenge.as_ref() == Some(&data) {
            debug!("identical challenge re-delivered, ignoring");
            return;
        }

        match source {
            PayloadSource::NativeDocument => {
                // The page on screen is the challenge; don't replace it.
                self.presenter.challenge_on_native_page(data.kind);
            }
            PayloadSource::DataChannel => {
                let base = self.state.net.rotator_for(&self.site).active_root();
                if let Err(e) = self.presenter.show_challenge(&data, &base).await {
                    warn!("failed to render challenge document: {}", e);
                    self.reporter.failed(SolveError::Sandbox(e));
                    return;
                }
            }
        }

        self.live_challenge = true;
        self.current_challenge = Some(data);
        self.chain = ChainState::Resolved;
    }

    /// A fingerprint gate is not terminal: the server wants client-side
    /// script to finish before it issues further state.
    async fn on_fingerprint_gate(&mut self, message: &str) {
        debug!(session = %self.instance_id, "fingerprint gate: {}", message);
        let page_alive = matches!(
            self.chain,
            ChainState::AwaitingNativeLoad | ChainState::AwaitingSandboxFetch
        );
        if page_alive {
            // The loaded document is running the gate's script; keep it
            // alive and check back. A reload here would restart the very
            // work the server is waiting on.
            self.chain = ChainState::AwaitingNativeLoad;
            self.budget.native_retry_attempts += 1;
            self.presenter.show_overlay(message, false).await;
            self.schedule_poll();
        } else if self.live_challenge {
            // Mid-solve: status only, never touch the document.
            self.presenter.show_overlay(message, false).await;
        } else {
            // A data channel cannot execute script; only a native load can
            // satisfy this gate.
            self.escalate_to_native().await;
        }
    }

    async fn on_empty(&mut self) {
        if self.live_challenge {
            debug!("discarding empty signal while a challenge is live");
            return;
        }
        self.register_miss().await;
    }

    /// Count a miss against the current strategy and escalate at the cap.
    async fn register_miss(&mut self) {
        self.budget.failed_attempts += 1;
        let cap = self.state.config.empty_escalation_cap;
        debug!(
            session = %self.instance_id,
            failed = self.budget.failed_attempts,
            cap,
            state = ?self.chain,
            "strategy miss"
        );

        if self.budget.failed_attempts >= cap {
            self.budget.failed_attempts = 0;
            match self.chain {
                ChainState::AwaitingBackgroundFetch => self.escalate_to_native().await,
                ChainState::AwaitingSandboxFetch => self.reload_native_or_give_up().await,
                _ => self.give_up().await,
            }
            return;
        }

        match self.chain {
            ChainState::AwaitingBackgroundFetch => self.start_background_fetch(),
            ChainState::AwaitingSandboxFetch => self.start_sandbox_fetch(),
            ChainState::AwaitingNativeLoad => self.schedule_poll(),
            _ => {}
        }
    }

    async fn terminal_rejection(&mut self, message: String) {
        self.chain = ChainState::Failed;
        self.presenter.terminal_error(&message).await;
        self.reporter.failed(SolveError::SiteRejection { message });
    }

    fn complete_solved(&mut self, id: Option<String>, token: &str) {
        let id = id
            .filter(|s| !s.is_empty())
            .or_else(|| self.current_challenge.as_ref().and_then(|c| c.id.clone()))
            .or_else(|| self.current_challenge.as_ref().and_then(|c| c.ticket.clone()))
            .unwrap_or_default();
        self.chain = ChainState::Resolved;
        self.reporter.solved(&id, token);
    }

    // ── Scheduling ───────────────────────────────────────────────────────────

    fn schedule_poll(&self) {
        self.schedule_poll_in(Duration::from_millis(self.state.config.native_poll_delay_ms));
    }

    /// Post a future tick back to the session task. A failed send means the
    /// session is gone and the tick dies with it.
    fn schedule_poll_in(&self, delay: Duration) {
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = msg_tx.send(SessionMsg::PollTick).await;
        });
    }
}
