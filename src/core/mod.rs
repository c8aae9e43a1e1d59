pub mod config;
pub mod engine_state;
pub mod error;
pub mod types;

pub use engine_state::EngineState;
