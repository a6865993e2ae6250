//! Concrete mechanism executors: the layer that actually touches the OS
//! (registry, services, scheduled tasks, firewall, scripts) on behalf of
//! [`pha_catalog`](../pha_catalog/index.html) policies.

pub mod dispatch;
pub mod error;
pub mod executor;
pub mod mechanisms;
pub mod sysinfo;

pub use dispatch::ExecutorRegistry;
pub use error::ExecutorError;
pub use executor::{ApplyOutcome, Executor, RevertOutcome};
