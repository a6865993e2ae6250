//! Background drift monitor (spec §4.7): periodically runs `DetectDrift`
//! against the most recent snapshot and, if configured, auto-remediates by
//! re-running `Apply` over the drifted policies.
//!
//! The interval is watched live: a config change takes effect on the next
//! tick boundary rather than requiring the monitor to be restarted (spec
//! §4.7, §9). An interval of zero disables the monitor entirely -- it still
//! runs the watch loop so a later nonzero update re-arms it without needing
//! a fresh `DriftMonitor`.

use std::sync::Arc;
use std::time::Duration;

use pha_protocol::commands::{ApplyParams, DetectDriftParams};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::PolicyEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftMonitorConfig {
    /// Zero disables periodic checks.
    pub interval: Duration,
    /// Re-apply drifted policies automatically after detecting them.
    pub auto_remediate: bool,
}

impl Default for DriftMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            auto_remediate: false,
        }
    }
}

/// Owns the background task's handle and the live config it watches.
/// Dropping this stops the task the next time it wakes (it also honors the
/// `CancellationToken` passed to [`DriftMonitor::spawn`] for a prompt stop).
pub struct DriftMonitor {
    config_tx: watch::Sender<DriftMonitorConfig>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl DriftMonitor {
    /// Spawns the background task. `engine` must outlive the monitor (it's
    /// wrapped in an `Arc` the task holds for its lifetime).
    pub fn spawn(engine: Arc<PolicyEngine>, initial: DriftMonitorConfig) -> Self {
        let (config_tx, config_rx) = watch::channel(initial);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(run_loop(engine, config_rx, task_cancel));
        Self {
            config_tx,
            cancel,
            handle,
        }
    }

    /// Updates the watched config; picked up at the next tick boundary.
    pub fn update_config(&self, config: DriftMonitorConfig) {
        let _ = self.config_tx.send(config);
    }

    pub fn current_config(&self) -> DriftMonitorConfig {
        *self.config_tx.borrow()
    }

    /// Signals the background task to stop and waits for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run_loop(
    engine: Arc<PolicyEngine>,
    mut config_rx: watch::Receiver<DriftMonitorConfig>,
    cancel: CancellationToken,
) {
    loop {
        let config = *config_rx.borrow();
        if config.interval.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = config_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            _ = tokio::time::sleep(config.interval) => {}
        }

        run_once(&engine, config.auto_remediate, &cancel).await;
    }
}

async fn run_once(engine: &PolicyEngine, auto_remediate: bool, cancel: &CancellationToken) {
    let result = match engine.detect_drift(DetectDriftParams { snapshot_id: None }, cancel).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "drift monitor: detect_drift failed");
            return;
        }
    };

    if result.items.is_empty() {
        tracing::debug!("drift monitor: no drift detected");
        return;
    }

    for item in &result.items {
        tracing::warn!(
            policy_id = %item.policy_id,
            expected = %item.expected_value,
            current = %item.current_value,
            "drift detected"
        );
    }

    if !auto_remediate {
        return;
    }

    let policy_ids = result.items.iter().map(|i| i.policy_id.clone()).collect();
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel(16);
    // No one is watching the progress stream for a background remediation;
    // drain it so `apply`'s sends never block on a full channel.
    tokio::spawn(async move { while progress_rx.recv().await.is_some() {} });

    match engine
        .apply(
            Uuid::new_v4(),
            ApplyParams {
                policy_ids,
                dry_run: false,
                create_restore_point: false,
                continue_on_error: true,
            },
            progress_tx,
            cancel.child_token(),
        )
        .await
    {
        Ok((applied, warnings)) => {
            tracing::info!(
                applied = applied.applied_policies.len(),
                failed = applied.failed_policies.len(),
                "drift monitor: auto-remediation complete"
            );
            for w in warnings {
                tracing::warn!(%w, "drift monitor: auto-remediation warning");
            }
        }
        Err(e) => tracing::warn!(error = %e, "drift monitor: auto-remediation failed"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_is_disabled() {
        let config = DriftMonitorConfig::default();
        assert!(config.interval.is_zero());
        assert!(!config.auto_remediate);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_ticks_until_reconfigured() {
        let (tx, mut rx) = watch::channel(DriftMonitorConfig::default());
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let config = *rx.borrow();
            assert!(config.interval.is_zero());
            tokio::select! {
                _ = task_cancel.cancelled() => {}
                _ = rx.changed() => {}
            }
        });

        tokio::time::advance(Duration::from_secs(5)).await;
        tx.send(DriftMonitorConfig {
            interval: Duration::from_secs(1),
            auto_remediate: false,
        })
        .unwrap();
        handle.await.unwrap();
        cancel.cancel();
    }
}
