//! Executor-local error type (spec §4.3, §7's Execution family).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// No executor is registered for this mechanism tag (spec §4.3:
    /// `GroupPolicy`/`MDM`/`HostsFile`/`WFPDriver`).
    #[error("mechanism '{0}' has no registered executor")]
    Unsupported(String),

    #[error("invalid mechanism parameters: {0}")]
    InvalidParams(String),

    #[error("mechanism failed: {0}")]
    MechanismFailure(String),

    #[error("platform API error (code {code}): {message}")]
    Platform { code: i64, message: String },

    /// The caller's cancellation token fired before or during the
    /// operation (spec §5: every executor operation must honor
    /// cancellation).
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
