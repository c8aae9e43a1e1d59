//! Challenge presentation.
//!
//! Decides what the hosting UI should show for the current session state —
//! a countdown, the challenge itself, or a status overlay — and drives the
//! sandbox accordingly. Emits [`UiEvent`]s for the hosting shell; events are
//! advisory and never block the session (a slow or absent UI consumer just
//! misses hints).

pub mod template;

use crate::core::error::SandboxError;
use crate::core::types::{ChallengeData, ChallengeKind};
use crate::net::RequestPacer;
use crate::sandbox::{OverrideResponse, RequestInterceptor, Sandbox};
use base64::Engine;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

/// Hints for the hosting UI shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Disable the action affordance and count down `seconds`.
    CooldownStarted { seconds: u64 },
    /// Re-enable the action affordance.
    CooldownFinished,
    /// A challenge document is now live in the sandbox.
    ChallengeShown { kind: ChallengeKind },
    /// Challenges are tap-only; any soft input method must go away.
    HideSoftInput,
    /// Transient status text shown over the live document.
    StatusOverlay { text: String, tappable: bool },
    /// Automatic acquisition gave up; offer a manual retry control.
    ManualRetryAvailable,
    /// Terminal, user-visible failure text (server message, markup stripped).
    TerminalError { message: String },
}

/// Serves challenge asset bytes to the synthetic document through request
/// interception, so the document itself stays small and same-origin.
struct ChallengeAssetInterceptor {
    assets: Vec<(String, Vec<u8>)>, // (path suffix, bytes)
}

impl RequestInterceptor for ChallengeAssetInterceptor {
    fn intercept(&self, url: &str) -> Option<OverrideResponse> {
        self.assets
            .iter()
            .find(|(path, _)| url.ends_with(path.as_str()))
            .map(|(_, bytes)| OverrideResponse {
                status: 200,
                content_type: "image/png".to_string(),
                body: bytes.clone(),
            })
    }
}

pub struct PresentationController {
    sandbox: Arc<dyn Sandbox>,
    pacer: Arc<RequestPacer>,
    ui_tx: mpsc::Sender<UiEvent>,
}

impl PresentationController {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        pacer: Arc<RequestPacer>,
        ui_tx: mpsc::Sender<UiEvent>,
    ) -> Self {
        Self {
            sandbox,
            pacer,
            ui_tx,
        }
    }

    fn emit(&self, event: UiEvent) {
        // Advisory channel: drop on full rather than stall the session.
        if self.ui_tx.try_send(event).is_err() {
            debug!("ui event dropped (no consumer or buffer full)");
        }
    }

    /// Countdown shown while a cooldown is active. The effective wait is the
    /// larger of the server cooldown and the request pacer's remaining
    /// throttle.
    pub fn show_cooldown(&self, cooldown_secs: u64) {
        let throttle_secs = self.pacer.remaining().as_secs();
        let seconds = cooldown_secs.max(throttle_secs);
        self.emit(UiEvent::CooldownStarted { seconds });
    }

    pub fn cooldown_finished(&self) {
        self.emit(UiEvent::CooldownFinished);
    }

    /// Render the challenge as a synthetic document with the real server's
    /// base origin, serving asset bytes through interception.
    pub async fn show_challenge(
        &self,
        data: &ChallengeData,
        base_url: &Url,
    ) -> Result<(), SandboxError> {
        let mut assets: Vec<(String, Vec<u8>)> = Vec::new();
        let b64 = base64::engine::general_purpose::STANDARD;
        if let Some(image) = &data.assets.image {
            match b64.decode(image.trim()) {
                Ok(bytes) => assets.push((template::IMAGE_ASSET_PATH.to_string(), bytes)),
                Err(e) => warn!("challenge image failed to decode: {}", e),
            }
        }
        if let Some(background) = &data.assets.background {
            match b64.decode(background.trim()) {
                Ok(bytes) => assets.push((template::BACKGROUND_ASSET_PATH.to_string(), bytes)),
                Err(e) => warn!("challenge background failed to decode: {}", e),
            }
        }
        self.sandbox
            .set_interceptor(Some(Arc::new(ChallengeAssetInterceptor { assets })));

        let html = template::challenge_document(data);
        self.sandbox
            .load_synthetic_document(&html, base_url)
            .await?;

        self.emit(UiEvent::HideSoftInput);
        self.emit(UiEvent::ChallengeShown { kind: data.kind });
        Ok(())
    }

    /// The challenge is already on screen as the native page itself; emit
    /// the UI hints without touching the document.
    pub fn challenge_on_native_page(&self, kind: ChallengeKind) {
        self.emit(UiEvent::HideSoftInput);
        self.emit(UiEvent::ChallengeShown { kind });
    }

    /// Transient status text. Drawn as an overlay over the live document —
    /// never a navigation, so an in-flight verification widget on the page
    /// is not torn down.
    pub async fn show_overlay(&self, text: &str, tappable: bool) {
        let script = template::overlay_script(text, tappable);
        if let Err(e) = self.sandbox.evaluate_script(&script).await {
            debug!("overlay injection failed: {}", e);
        }
        self.emit(UiEvent::StatusOverlay {
            text: text.to_string(),
            tappable,
        });
    }

    pub async fn clear_overlay(&self) {
        let _ = self
            .sandbox
            .evaluate_script(template::clear_overlay_script())
            .await;
    }

    pub fn manual_retry_available(&self) {
        self.emit(UiEvent::ManualRetryAvailable);
    }

    /// Terminal failure: overlay the message and tell the shell.
    pub async fn terminal_error(&self, message: &str) {
        self.show_overlay(message, false).await;
        self.emit(UiEvent::TerminalError {
            message: message.to_string(),
        });
    }

    /// Detach session-scoped sandbox state on teardown.
    pub fn teardown(&self) {
        self.sandbox.set_interceptor(None);
    }
}
