//! Error taxonomy (spec §7), flattened to the wire `ErrorDetail` shape used
//! in every `ResponseEnvelope`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::PolicyId;

/// A single structured error as it appears on the wire, inside
/// `ResponseEnvelope::errors`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
}

/// Every error the agent can surface, grouped by spec §7's families.
/// Converts to the wire `ErrorDetail` via [`AgentError::code`] /
/// [`AgentError::into_detail`].
#[derive(Debug, Error)]
pub enum AgentError {
    // --- Protocol ---
    #[error("invalid command envelope: {0}")]
    InvalidCommand(String),
    #[error("protocol version mismatch: client={client}, server={server}")]
    VersionMismatch { client: u32, server: u32 },
    #[error("command validation failed: {0}")]
    ValidationFailed(String),
    #[error("caller is not authorized to run this command")]
    Unauthorized,

    // --- Catalog ---
    #[error("unknown policy: {0}")]
    UnknownPolicy(PolicyId),
    #[error("duplicate policy id: {0}")]
    DuplicatePolicyId(PolicyId),
    #[error("circular dependency: {cycle}")]
    CircularDependency { cycle: String },
    #[error("conflicting policies requested: {a} conflicts with {b}")]
    ConflictingPolicies { a: PolicyId, b: PolicyId },
    #[error("schema violation on {policy_id}: {invariant}")]
    SchemaViolation {
        policy_id: PolicyId,
        invariant: String,
    },
    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(String),

    // --- Applicability ---
    #[error("policy {policy_id} is not applicable: {reason}")]
    NotApplicable { policy_id: PolicyId, reason: String },

    // --- Execution ---
    #[error("mechanism error for {policy_id}: {message}")]
    MechanismError { policy_id: PolicyId, message: String },
    #[error("policy {0} is already applied")]
    AlreadyApplied(PolicyId),
    #[error("mechanism {mechanism} has no registered executor")]
    Unsupported { mechanism: String },

    // --- Store ---
    #[error("change-log store is unavailable: {0}")]
    StoreUnavailable(String),
    #[error("failed to persist change: {0}")]
    PersistenceFailed(String),

    // --- System ---
    #[error("restore point unavailable: {0}")]
    RestorePointUnavailable(String),
    #[error("operation was cancelled")]
    OperationCancelled,
}

impl AgentError {
    /// Stable machine-readable code, matching the names used in spec §7.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidCommand(_) => "InvalidCommand",
            AgentError::VersionMismatch { .. } => "VersionMismatch",
            AgentError::ValidationFailed(_) => "ValidationFailed",
            AgentError::Unauthorized => "Unauthorized",
            AgentError::UnknownPolicy(_) => "UnknownPolicy",
            AgentError::DuplicatePolicyId(_) => "DuplicatePolicyId",
            AgentError::CircularDependency { .. } => "CircularDependency",
            AgentError::ConflictingPolicies { .. } => "ConflictingPolicies",
            AgentError::SchemaViolation { .. } => "SchemaViolation",
            AgentError::UnknownSnapshot(_) => "UnknownSnapshot",
            AgentError::NotApplicable { .. } => "NotApplicable",
            AgentError::MechanismError { .. } => "MechanismError",
            AgentError::AlreadyApplied(_) => "AlreadyApplied",
            AgentError::Unsupported { .. } => "Unsupported",
            AgentError::StoreUnavailable(_) => "StoreUnavailable",
            AgentError::PersistenceFailed(_) => "PersistenceFailed",
            AgentError::RestorePointUnavailable(_) => "RestorePointUnavailable",
            AgentError::OperationCancelled => "OperationCancelled",
        }
    }

    /// The `policy_id` this error is about, if any, surfaced separately on
    /// the wire so clients can correlate without string-parsing `message`.
    pub fn policy_id(&self) -> Option<PolicyId> {
        match self {
            AgentError::UnknownPolicy(id)
            | AgentError::DuplicatePolicyId(id)
            | AgentError::NotApplicable { policy_id: id, .. }
            | AgentError::MechanismError { policy_id: id, .. }
            | AgentError::AlreadyApplied(id) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn into_detail(self) -> ErrorDetail {
        let code = self.code().to_string();
        let policy_id = self.policy_id();
        ErrorDetail {
            code,
            message: self.to_string(),
            details: None,
            policy_id,
        }
    }
}
