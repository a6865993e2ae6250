//! The `phagentd` binary's supporting library: configuration, component
//! wiring, and the `doctor` diagnostic, factored out of `main.rs` so they
//! can be unit-tested without spawning the compiled binary.

pub mod cli;
pub mod config;
pub mod doctor;
pub mod wiring;

pub use config::{AgentConfig, ConfigLoadError, ConfigLoader};
pub use wiring::{Agent, WiringError};
