//! Wire and data-model types shared between the privileged agent and its
//! IPC clients.
//!
//! This crate has no I/O of its own: it is the vocabulary the engine,
//! catalog, executors, store, and IPC transport all speak so that none of
//! them need to depend on each other's internals.

pub mod change;
pub mod commands;
pub mod envelope;
pub mod error;
pub mod integrity;
pub mod policy;
pub mod sysinfo;

pub use change::{ChangeRecord, Snapshot, SnapshotPolicyState};
pub use commands::ProgressFrame;
pub use envelope::{CommandEnvelope, CommandType, ResponseEnvelope};
pub use error::{AgentError, ErrorDetail};
pub use policy::{
    AllowedValue, DependencyEdge, DependencyKind, Mechanism, Policy, Reversibility, RiskLevel,
    SupportStatus,
};
pub use sysinfo::SystemInfo;

/// Current IPC protocol version. Bumped on any wire-incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Named-pipe endpoint name clients connect to (Windows: `\\.\pipe\<NAME>`).
pub const IPC_ENDPOINT_NAME: &str = "PrivacyHardeningService_v1";
