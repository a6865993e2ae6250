//! Script mechanism executor (spec §3/§4.3: `Mechanism::Script`), the one
//! mechanism that runs the same way on any host: `apply_command` /
//! `revert_command` / `probe_command` are handed to the platform shell
//! (`cmd.exe` on Windows, `sh` elsewhere) via [`tokio::process::Command`].
//!
//! `probe_command` must print exactly `true` or `false` (trimmed,
//! case-insensitive) on stdout; anything else is a mechanism failure, not a
//! silently-assumed `false`.

use async_trait::async_trait;
use pha_protocol::policy::{Mechanism, Policy, ScriptParams};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::executor::{ApplyOutcome, Executor, RevertOutcome, check_cancelled};

fn params(policy: &Policy) -> Result<&ScriptParams, ExecutorError> {
    match &policy.mechanism {
        Mechanism::Script(params) => Ok(params),
        other => Err(ExecutorError::InvalidParams(format!(
            "expected script mechanism, got {}",
            other.tag()
        ))),
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd.exe");
        cmd.arg("/C").arg(command);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    // A cancelled run must not leave an orphaned child behind.
    cmd.kill_on_drop(true);
    cmd
}

/// Runs `command`, racing it against `cancel`. A cancellation mid-flight
/// kills the child rather than waiting out its exit.
async fn run(command: &str, cancel: &CancellationToken) -> Result<String, ExecutorError> {
    let mut child = shell_command(command)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| ExecutorError::MechanismFailure(format!("spawning '{command}': {e}")))?;

    let output = tokio::select! {
        result = child.wait_with_output() => {
            result.map_err(|e| ExecutorError::MechanismFailure(format!("running '{command}': {e}")))?
        }
        () = cancel.cancelled() => {
            return Err(ExecutorError::Cancelled);
        }
    };

    if !output.status.success() {
        return Err(ExecutorError::MechanismFailure(format!(
            "'{command}' exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn run_probe(probe_command: &str, cancel: &CancellationToken) -> Result<bool, ExecutorError> {
    let stdout = run(probe_command, cancel).await?;
    match stdout.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ExecutorError::MechanismFailure(format!(
            "probe_command printed '{other}', expected true/false"
        ))),
    }
}

pub struct ScriptExecutor;

#[async_trait]
impl Executor for ScriptExecutor {
    fn mechanism_tag(&self) -> &'static str {
        "script"
    }

    async fn probe_applied(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<bool, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        run_probe(&p.probe_command, cancel).await
    }

    async fn get_current_value(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        Ok(run_probe(&p.probe_command, cancel).await?.to_string())
    }

    async fn apply(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        let was_applied = run_probe(&p.probe_command, cancel).await?;
        if !was_applied {
            run(&p.apply_command, cancel).await?;
        }
        Ok(ApplyOutcome {
            previous_state: was_applied.to_string(),
            new_state: "true".to_string(),
            already_applied: was_applied,
        })
    }

    async fn revert(
        &self,
        policy: &Policy,
        previous_state: &str,
        cancel: &CancellationToken,
    ) -> Result<RevertOutcome, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        let revert_command = p.revert_command.as_deref().ok_or_else(|| {
            ExecutorError::MechanismFailure("policy has no revert_command".to_string())
        })?;
        if previous_state == "false" {
            run(revert_command, cancel).await?;
        }
        Ok(RevertOutcome {
            new_state: previous_state.to_string(),
        })
    }
}
