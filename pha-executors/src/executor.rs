//! The shared mechanism-executor contract (spec §4.3).
//!
//! Every concrete executor is mechanism-local: it parses its own corner of
//! [`pha_protocol::policy::Mechanism`] and never inspects another
//! mechanism's parameters. `apply` must be idempotent -- applying an
//! already-applied policy succeeds without changing system state twice --
//! and must capture enough previous-state to make `revert` deterministic
//! without re-probing the system.

use async_trait::async_trait;
use pha_protocol::policy::Policy;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;

/// Checked at the top of every executor operation: a cancellation that
/// fired before the mechanism touched the system must short-circuit
/// rather than run anyway.
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<(), ExecutorError> {
    if cancel.is_cancelled() {
        return Err(ExecutorError::Cancelled);
    }
    Ok(())
}

/// What `apply` captured, for the change log to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Opaque serialized previous state, sufficient to revert without
    /// re-probing the system.
    pub previous_state: String,
    /// Opaque serialized new state, for audit/drift comparison.
    pub new_state: String,
    /// True if this apply changed nothing because the policy was already
    /// applied (idempotent no-op).
    pub already_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertOutcome {
    pub new_state: String,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable mechanism tag this executor handles, matching
    /// [`pha_protocol::policy::Mechanism::tag`].
    fn mechanism_tag(&self) -> &'static str;

    /// Is the policy currently applied on this system?
    async fn probe_applied(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<bool, ExecutorError>;

    /// The current value at the mechanism's control point, as an opaque
    /// string (drift detection and audit compare this, never interpret it).
    async fn get_current_value(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError>;

    /// Apply the policy. Must be safe to call when already applied.
    async fn apply(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ExecutorError>;

    /// Revert to `previous_state` as captured by a prior `apply`.
    async fn revert(
        &self,
        policy: &Policy,
        previous_state: &str,
        cancel: &CancellationToken,
    ) -> Result<RevertOutcome, ExecutorError>;
}
