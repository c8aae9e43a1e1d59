use thiserror::Error;

/// Terminal outcomes of a verification session.
///
/// Everything retryable (transport hiccups, empty payloads, malformed
/// fragments, fingerprint gates) is absorbed inside the acquisition chain and
/// never surfaces here; a session fails only with an explicit server
/// rejection, chain exhaustion, or because its owner went away.
#[derive(Debug, Error)]
pub enum SolveError {
    /// The server rejected the attempt outright (ban, ToS block, service
    /// gate). The message is the server's own text, markup stripped.
    #[error("{message}")]
    SiteRejection { message: String },

    /// Every acquisition strategy was spent without producing a challenge.
    #[error("challenge acquisition exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The session handle was dropped or cancelled before completion.
    #[error("verification session closed before a solution was reported")]
    SessionClosed,

    /// The sandbox collaborator failed in a way the chain cannot route
    /// around (e.g. the renderer process died).
    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Failures crossing the core-to-sandbox boundary.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    #[error("synthetic document load failed: {0}")]
    SyntheticLoad(String),

    #[error("sandbox is closed")]
    Closed,
}
