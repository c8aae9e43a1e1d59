//! The script-execution sandbox capability.
//!
//! The engine drives a script-capable document renderer it does not
//! implement: it can point it at real URLs, feed it synthetic documents with
//! a chosen base origin, evaluate script in it, substitute responses for
//! requests it is about to make, and listen to what the hosted page says
//! back. Everything else — cookie storage, script execution, layout — is the
//! renderer's business.
//!
//! Two implementations ship: [`cdp::CdpSandbox`] on a native headless
//! Chromium, and [`fake::FakeSandbox`], a scripted host for tests.

use crate::core::error::SandboxError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

pub mod cdp;
pub mod fake;

/// Inbound traffic from the hosted document.
#[derive(Debug, Clone)]
pub enum SandboxEvent {
    /// A document finished loading.
    LoadFinished { url: String },
    /// A script inside the document posted a message; `json` is the raw
    /// payload text, uninterpreted.
    ScriptMessage { json: String },
    /// A form field in the document obtained a value.
    FormFieldValue { name: String, value: String },
}

/// Response substituted for an outgoing request the sandbox is about to make.
pub struct OverrideResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Consulted for every outgoing request while installed.
pub trait RequestInterceptor: Send + Sync {
    /// Return a response to serve instead of performing the request, or
    /// `None` to let it through.
    fn intercept(&self, url: &str) -> Option<OverrideResponse>;
}

/// The renderer contract. All calls are asynchronous and must never block
/// the calling task on renderer internals.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Navigate to a real URL. Extra headers apply to this navigation.
    async fn load_url(&self, url: &Url, headers: &[(String, String)]) -> Result<(), SandboxError>;

    /// Render caller-supplied HTML as if it had been served from `base_url`,
    /// so same-origin script behavior and cookie scoping match the real
    /// server.
    async fn load_synthetic_document(
        &self,
        html: &str,
        base_url: &Url,
    ) -> Result<(), SandboxError>;

    /// Evaluate script in the current document and return its JSON result.
    async fn evaluate_script(&self, code: &str) -> Result<serde_json::Value, SandboxError>;

    /// Install (or clear, with `None`) the request interceptor.
    fn set_interceptor(&self, interceptor: Option<Arc<dyn RequestInterceptor>>);

    /// Subscribe to the inbound event channel.
    fn subscribe(&self) -> broadcast::Receiver<SandboxEvent>;

    /// The cookie header the sandbox would attach to a request to `url`.
    /// Out-of-sandbox fetches use this to share the renderer's session.
    async fn cookie_header(&self, url: &Url) -> Result<Option<String>, SandboxError>;
}
