//! Restore-Point Manager (spec §4.6): asks the OS for a System Restore
//! checkpoint before a privileged session, and can enumerate existing ones.
//!
//! Two restore-point transports co-exist in comparable systems (WMI and
//! PowerShell's `Checkpoint-Computer`/`Get-ComputerRestorePoint` cmdlets,
//! which are themselves a thin WMI wrapper over
//! `SystemRestore.CreateRestorePoint`). This crate binds to the PowerShell
//! cmdlets (spec §9 open question, decided in `DESIGN.md`): it needs no COM
//! bindings of its own, and the cmdlets already fail closed the same way the
//! raw WMI call does when System Restore is turned off.
//!
//! Restore-point creation must never be fatal to the enclosing Apply/Revert:
//! every failure mode this module can observe -- System Restore disabled,
//! the cmdlet missing, the shell failing to spawn -- is reported as
//! [`CreateOutcome::Disabled`], not an error.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Only a transport-level failure that prevented the manager from even
/// asking the question (the shell itself would not spawn, or its output
/// could not be parsed) is a hard error. "System Restore is off" is not one
/// of these -- see [`CreateOutcome::Disabled`].
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("failed to invoke the restore-point shell: {0}")]
    ShellUnavailable(String),
    #[error("could not parse restore-point listing: {0}")]
    UnparseableOutput(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A checkpoint was created.
    Created { restore_point_id: String },
    /// No checkpoint was created; the engine should surface `reason` as a
    /// warning and proceed with the enclosing operation regardless.
    Disabled { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePoint {
    pub sequence_number: u32,
    pub description: String,
    pub creation_time: DateTime<Utc>,
}

pub struct RestorePointManager;

impl RestorePointManager {
    pub fn new() -> Self {
        Self
    }

    /// Requests a checkpoint named `description`. Fails soft: any OS-level
    /// refusal comes back as `Disabled`, never `Err`.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, description: &str) -> Result<CreateOutcome, RestoreError> {
        platform::create(description).await
    }

    /// Existing checkpoints, most recent first.
    #[tracing::instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<RestorePoint>, RestoreError> {
        platform::list().await
    }
}

impl Default for RestorePointManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
mod platform {
    use super::{CreateOutcome, RestoreError, RestorePoint};
    use chrono::{DateTime, Utc};
    use tokio::process::Command;

    fn powershell(script: &str) -> Command {
        let mut cmd = Command::new("powershell.exe");
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", script]);
        cmd.kill_on_drop(true);
        cmd
    }

    pub async fn create(description: &str) -> Result<CreateOutcome, RestoreError> {
        let escaped = description.replace('\'', "''");
        let script = format!(
            "Checkpoint-Computer -Description '{escaped}' -RestorePointType MODIFY_SETTINGS"
        );
        let output = powershell(&script)
            .output()
            .await
            .map_err(|e| RestoreError::ShellUnavailable(e.to_string()))?;

        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if reason.is_empty() {
                format!("Checkpoint-Computer exited with {}", output.status)
            } else {
                reason
            };
            tracing::warn!(%reason, "restore point not created");
            return Ok(CreateOutcome::Disabled { reason });
        }

        match latest().await? {
            Some(point) => Ok(CreateOutcome::Created {
                restore_point_id: point.sequence_number.to_string(),
            }),
            None => Ok(CreateOutcome::Disabled {
                reason: "Checkpoint-Computer reported success but no matching restore point was found"
                    .to_string(),
            }),
        }
    }

    async fn latest() -> Result<Option<RestorePoint>, RestoreError> {
        list().await.map(|mut points| {
            points.sort_by_key(|p| std::cmp::Reverse(p.sequence_number));
            points.into_iter().next()
        })
    }

    pub async fn list() -> Result<Vec<RestorePoint>, RestoreError> {
        let script = "Get-ComputerRestorePoint | \
             Select-Object SequenceNumber,Description,CreationTime | \
             ConvertTo-Json -Compress";
        let output = powershell(script)
            .output()
            .await
            .map_err(|e| RestoreError::ShellUnavailable(e.to_string()))?;

        if !output.status.success() {
            // System Restore disabled entirely: an empty list is the correct
            // answer, not an error.
            return Ok(Vec::new());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Vec::new());
        }

        parse_restore_points(stdout)
    }

    #[derive(serde::Deserialize)]
    struct RawPoint {
        #[serde(rename = "SequenceNumber")]
        sequence_number: u32,
        #[serde(rename = "Description")]
        description: String,
        // WMI's `/Date(ms)/` wrapper is normalized by PowerShell's own JSON
        // cmdlet into an ISO-8601 string, so this parses like any other
        // timestamp field.
        #[serde(rename = "CreationTime")]
        creation_time: String,
    }

    fn parse_restore_points(json: &str) -> Result<Vec<RestorePoint>, RestoreError> {
        let raw: Vec<RawPoint> = if json.starts_with('[') {
            serde_json::from_str(json).map_err(|e| RestoreError::UnparseableOutput(e.to_string()))?
        } else {
            let single: RawPoint =
                serde_json::from_str(json).map_err(|e| RestoreError::UnparseableOutput(e.to_string()))?;
            vec![single]
        };

        raw.into_iter()
            .map(|p| {
                let creation_time = DateTime::parse_from_rfc3339(&p.creation_time)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| RestoreError::UnparseableOutput(e.to_string()))?;
                Ok(RestorePoint {
                    sequence_number: p.sequence_number,
                    description: p.description,
                    creation_time,
                })
            })
            .collect()
    }
}

#[cfg(not(windows))]
mod platform {
    use super::{CreateOutcome, RestoreError, RestorePoint};

    pub async fn create(_description: &str) -> Result<CreateOutcome, RestoreError> {
        Ok(CreateOutcome::Disabled {
            reason: "restore points are only available on Windows".to_string(),
        })
    }

    pub async fn list() -> Result<Vec<RestorePoint>, RestoreError> {
        Ok(Vec::new())
    }
}
