pub mod acquire;
pub mod core;
pub mod engine;
pub mod net;
pub mod present;
pub mod report;
pub mod sandbox;
pub mod verification;

// --- Primary core exports ---
pub use crate::core::config::EngineConfig;
pub use crate::core::error::{SandboxError, SolveError};
pub use crate::core::types;
pub use crate::core::types::{ChallengeData, ChallengeKind, Payload, SiteDescriptor, Solution};

// --- Engine surface ---
pub use engine::{SessionHandle, VerificationEngine};
pub use present::UiEvent;
pub use sandbox::{Sandbox, SandboxEvent};
