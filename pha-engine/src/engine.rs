//! The orchestrator: Audit, Apply, Revert, GetState, GetPolicies,
//! DetectDrift, CreateSnapshot, ReloadCatalog (spec §4.5, SPEC_FULL §4.5,
//! §10.1, §10.2).
//!
//! Apply and Revert are the only mutating operations; both take
//! [`PolicyEngine::mutation_lock`] for their whole duration so they never
//! overlap each other on the same process (spec §5). Every other operation
//! only reads the catalog snapshot and the store, and may run concurrently
//! with anything else.

use std::sync::Arc;

use chrono::Utc;
use pha_catalog::{Catalog, ResolveError, resolve};
use pha_executors::{ExecutorError, ExecutorRegistry};
use pha_protocol::change::{ChangeOperation, ChangeRecord, SnapshotPolicyState};
use pha_protocol::commands::{
    AuditItem, AuditParams, AuditResult, CreateSnapshotParams, CreateSnapshotResult,
    DetectDriftParams, DetectDriftResult, DriftItem, GetPoliciesParams, GetPoliciesResult,
    GetStateParams, GetStateResult, ProgressFrame, ReloadCatalogResult, RevertParams,
    RevertResult, RevertTarget,
};
use pha_protocol::commands::{ApplyParams, ApplyResult};
use pha_protocol::error::AgentError;
use pha_protocol::policy::{Mechanism, Policy, PolicyId};
use pha_restore::{CreateOutcome, RestorePointManager};
use pha_store::{Store, StoreError};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::probe::SystemProbe;

/// Tag a policy carries in [`Policy::tags`] to mark it as needing a restart
/// to take full effect. Not part of the wire data model (spec §3 does not
/// name a dedicated field for it); a tag is the same mechanism the catalog
/// already uses for free-form metadata.
const REQUIRES_RESTART_TAG: &str = "requires_restart";

fn requires_restart(policy: &Policy) -> bool {
    policy.tags.iter().any(|t| t == REQUIRES_RESTART_TAG)
}

fn resolve_err_to_agent(err: ResolveError) -> AgentError {
    match err {
        ResolveError::UnknownPolicy(id) => AgentError::UnknownPolicy(id),
        ResolveError::CircularDependency { cycle } => AgentError::CircularDependency { cycle },
        ResolveError::ConflictingPolicies { a, b } => AgentError::ConflictingPolicies { a, b },
    }
}

fn executor_err_to_agent(policy_id: &str, err: ExecutorError) -> AgentError {
    match err {
        ExecutorError::Unsupported(mechanism) => AgentError::Unsupported { mechanism },
        ExecutorError::Cancelled => AgentError::OperationCancelled,
        other => AgentError::MechanismError {
            policy_id: policy_id.to_string(),
            message: other.to_string(),
        },
    }
}

fn store_err_to_agent(err: StoreError) -> AgentError {
    match err {
        StoreError::UnknownSnapshot(id) => AgentError::UnknownSnapshot(id.to_string()),
        StoreError::Pool(msg) => AgentError::StoreUnavailable(msg),
        other => AgentError::PersistenceFailed(other.to_string()),
    }
}

fn load_err_to_agent(err: pha_catalog::LoadError) -> AgentError {
    match err {
        pha_catalog::LoadError::DuplicatePolicyId { policy_id, .. } => {
            AgentError::DuplicatePolicyId(policy_id)
        }
        other => AgentError::ValidationFailed(other.to_string()),
    }
}

/// The human-readable value a mechanism's parameters say a policy should
/// produce once applied, for display in [`AuditItem::expected_value`].
/// Opaque mechanisms (`Script` and the executor-less placeholders) have no
/// statically-known expected value -- only their own probe can say.
fn expected_value_hint(mechanism: &Mechanism) -> Option<String> {
    match mechanism {
        Mechanism::Registry(p) => Some(p.applied_value.to_string()),
        Mechanism::Service(p) => Some(format!("{:?}", p.applied_start_mode)),
        Mechanism::ScheduledTask(p) => Some(format!("{:?}", p.selected_value)),
        Mechanism::Firewall(p) => Some(format!("{:?} {}", p.action, p.rule_name)),
        Mechanism::Script(_)
        | Mechanism::GroupPolicy(_)
        | Mechanism::Mdm(_)
        | Mechanism::HostsFile(_)
        | Mechanism::WfpDriver(_) => None,
    }
}

pub struct PolicyEngine {
    catalog: Arc<Catalog>,
    executors: Arc<ExecutorRegistry>,
    store: Arc<Store>,
    restore: Arc<RestorePointManager>,
    probe: Arc<dyn SystemProbe>,
    /// Apply and Revert serialize on this; every read-only command ignores
    /// it entirely (spec §5).
    mutation_lock: Mutex<()>,
}

impl PolicyEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        executors: Arc<ExecutorRegistry>,
        store: Arc<Store>,
        restore: Arc<RestorePointManager>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        Self {
            catalog,
            executors,
            store,
            restore,
            probe,
            mutation_lock: Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // -----------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------

    #[tracing::instrument(skip(self, cancel))]
    pub async fn audit(
        &self,
        params: AuditParams,
        cancel: &CancellationToken,
    ) -> Result<(AuditResult, Vec<String>), AgentError> {
        let catalog = self.catalog.snapshot();

        let ids: Vec<PolicyId> = match &params.policy_ids {
            Some(ids) => {
                for id in ids {
                    if catalog.get(id).is_none() {
                        return Err(AgentError::UnknownPolicy(id.clone()));
                    }
                }
                ids.clone()
            }
            None => catalog.policies().iter().map(|p| p.policy_id.clone()).collect(),
        };

        let system_info = self
            .probe
            .probe()
            .map_err(|e| executor_err_to_agent("<system>", e))?;

        let mut items = Vec::with_capacity(ids.len());
        let mut warnings = Vec::new();

        for id in ids {
            let Some(policy) = catalog.get(&id) else {
                continue;
            };

            if let Err(reason) = system_info.check_applicability(&policy.applicability) {
                items.push(AuditItem {
                    policy_id: id,
                    applied: false,
                    applicable: false,
                    not_applicable_reason: Some(reason),
                    current_value: None,
                    expected_value: None,
                    matches: false,
                    drift_description: None,
                });
                continue;
            }

            let applied = match self.executors.probe_applied(policy, cancel).await {
                Ok(v) => v,
                Err(e) => {
                    warnings.push(format!("{id}: probe failed: {e}"));
                    items.push(AuditItem {
                        policy_id: id,
                        applied: false,
                        applicable: true,
                        not_applicable_reason: None,
                        current_value: None,
                        expected_value: expected_value_hint(&policy.mechanism),
                        matches: false,
                        drift_description: Some(e.to_string()),
                    });
                    continue;
                }
            };
            let current_value = self.executors.get_current_value(policy, cancel).await.ok();
            let expected_value = expected_value_hint(&policy.mechanism);
            let drift_description = (!applied).then(|| {
                format!(
                    "expected policy to be applied; current value: {}",
                    current_value.as_deref().unwrap_or("<unknown>")
                )
            });

            items.push(AuditItem {
                policy_id: id,
                applied,
                applicable: true,
                not_applicable_reason: None,
                current_value,
                expected_value,
                matches: applied,
                drift_description,
            });
        }

        Ok((AuditResult::new(items, system_info), warnings))
    }

    // -----------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------

    /// Runs the Apply state machine (spec §4.5): RESOLVING -> GATING ->
    /// SNAPSHOTTING -> APPLYING(0..n) -> REPORTING. `progress` carries one
    /// [`ProgressFrame`] per processed policy plus a terminal frame at 100
    /// before this function returns (spec §5: same ordering guarantee as
    /// the wire protocol, just not yet serialized to JSON).
    #[tracing::instrument(skip(self, progress, cancel))]
    pub async fn apply(
        &self,
        command_id: Uuid,
        params: ApplyParams,
        progress: mpsc::Sender<ProgressFrame>,
        cancel: CancellationToken,
    ) -> Result<(ApplyResult, Vec<String>), AgentError> {
        let _guard = self.mutation_lock.lock().await;
        let mut warnings = Vec::new();

        // RESOLVING
        let catalog = self.catalog.snapshot();
        let plan = resolve(&params.policy_ids, catalog.policies()).map_err(resolve_err_to_agent)?;

        let system_info = self
            .probe
            .probe()
            .map_err(|e| executor_err_to_agent("<system>", e))?;

        // GATING: non-applicable policies become warnings, not errors.
        let mut target_ids = Vec::with_capacity(plan.order.len());
        for id in &plan.order {
            let Some(policy) = catalog.get(id) else {
                return Err(AgentError::UnknownPolicy(id.clone()));
            };
            match system_info.check_applicability(&policy.applicability) {
                Ok(()) => target_ids.push(id.clone()),
                Err(reason) => warnings.push(format!("{id} is not applicable: {reason}")),
            }
        }

        let restore_point_id = if params.dry_run {
            None
        } else {
            self.maybe_create_restore_point(
                params.create_restore_point,
                &format!("Privacy hardening apply ({command_id})"),
                &mut warnings,
            )
            .await
        };

        // SNAPSHOTTING
        let snapshot = self
            .store
            .create_snapshot(
                Some(format!("apply: {}", params.policy_ids.join(", "))),
                &system_info,
                restore_point_id.clone(),
            )
            .map_err(store_err_to_agent)?;

        // APPLYING(0..n)
        let total = target_ids.len();
        let mut applied_policies = Vec::new();
        let mut failed_policies = Vec::new();
        let mut changes = Vec::new();
        let mut policies_requiring_restart = Vec::new();
        let mut stopped_early = false;

        for (i, policy_id) in target_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                warnings.push("apply cancelled; returning partial result".to_string());
                stopped_early = true;
                break;
            }
            let Some(policy) = catalog.get(policy_id) else {
                continue;
            };
            if requires_restart(policy) {
                policies_requiring_restart.push(policy_id.clone());
            }

            if params.dry_run {
                applied_policies.push(policy_id.clone());
            } else {
                let outcome = self.executors.apply(policy, &cancel).await;
                let (success, previous_state, new_state, error_message) = match outcome {
                    Ok(o) => (true, o.previous_state, o.new_state, None),
                    Err(e) => (false, String::new(), String::new(), Some(e.to_string())),
                };

                let change = ChangeRecord {
                    change_id: Uuid::new_v4(),
                    policy_id: policy_id.clone(),
                    snapshot_id: snapshot.snapshot_id,
                    operation: ChangeOperation::Apply,
                    applied_at: Utc::now(),
                    mechanism_tag: policy.mechanism.tag().to_string(),
                    description: format!("apply {}", policy.name),
                    previous_state,
                    new_state,
                    success,
                    error_message,
                };
                self.store.record_change(&change).map_err(store_err_to_agent)?;
                changes.push(change);

                if success {
                    applied_policies.push(policy_id.clone());
                    if let Ok(current) =
                        self.executors.get_current_value(policy, &cancel).await
                    {
                        let _ = self.store.record_snapshot_policy_state(&SnapshotPolicyState {
                            snapshot_id: snapshot.snapshot_id,
                            policy_id: policy_id.clone(),
                            is_applied: true,
                            current_value: current,
                        });
                    }
                } else {
                    failed_policies.push(policy_id.clone());
                    if !params.continue_on_error {
                        stopped_early = true;
                    }
                }
            }

            let percent = (((i + 1) * 100) / total.max(1)).min(100) as u8;
            let _ = progress
                .send(ProgressFrame {
                    command_id,
                    percent,
                    message: format!("processed {policy_id}"),
                    current_policy_id: Some(policy_id.clone()),
                })
                .await;

            if stopped_early {
                break;
            }
        }

        // REPORTING
        let final_message = if stopped_early && cancel.is_cancelled() {
            "cancelled"
        } else if !failed_policies.is_empty() && !params.continue_on_error {
            "stopped after failure"
        } else {
            "completed"
        };
        let _ = progress
            .send(ProgressFrame {
                command_id,
                percent: 100,
                message: final_message.to_string(),
                current_policy_id: None,
            })
            .await;

        Ok((
            ApplyResult {
                applied_policies,
                failed_policies,
                changes,
                snapshot_id: snapshot.snapshot_id,
                restore_point_id,
                completed_at: Utc::now(),
                restart_recommended: !policies_requiring_restart.is_empty(),
                policies_requiring_restart,
            },
            warnings,
        ))
    }

    // -----------------------------------------------------------------
    // Revert
    // -----------------------------------------------------------------

    #[tracing::instrument(skip(self, cancel))]
    pub async fn revert(
        &self,
        params: RevertParams,
        cancel: CancellationToken,
    ) -> Result<(RevertResult, Vec<String>), AgentError> {
        let _guard = self.mutation_lock.lock().await;
        let mut warnings = Vec::new();

        let mut targets = self.collect_revert_targets(&params.target, &mut warnings)?;

        let system_info = self
            .probe
            .probe()
            .map_err(|e| executor_err_to_agent("<system>", e))?;

        let restore_point_id = self
            .maybe_create_restore_point(
                params.create_restore_point,
                "Privacy hardening revert",
                &mut warnings,
            )
            .await;

        let snapshot = self
            .store
            .create_snapshot(Some("revert session".to_string()), &system_info, restore_point_id.clone())
            .map_err(store_err_to_agent)?;

        let catalog = self.catalog.snapshot();
        let mut reverted_policies = Vec::new();
        let mut failed_policies = Vec::new();
        let mut changes = Vec::new();

        // Newest first: reverse of the order changes were originally applied.
        targets.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));

        for prior in &targets {
            if cancel.is_cancelled() {
                warnings.push("revert cancelled; returning partial result".to_string());
                break;
            }
            let Some(policy) = catalog.get(&prior.policy_id) else {
                warnings.push(format!(
                    "{} no longer exists in the catalog; cannot revert",
                    prior.policy_id
                ));
                failed_policies.push(prior.policy_id.clone());
                continue;
            };

            let outcome = self
                .executors
                .revert(policy, &prior.previous_state, &cancel)
                .await;
            let (success, new_state, error_message) = match outcome {
                Ok(o) => (true, o.new_state, None),
                Err(e) => (false, String::new(), Some(e.to_string())),
            };

            let change = ChangeRecord {
                change_id: Uuid::new_v4(),
                policy_id: prior.policy_id.clone(),
                snapshot_id: snapshot.snapshot_id,
                operation: ChangeOperation::Revert,
                applied_at: Utc::now(),
                mechanism_tag: policy.mechanism.tag().to_string(),
                description: format!("revert {}", policy.name),
                previous_state: prior.new_state.clone(),
                new_state,
                success,
                error_message,
            };
            self.store.record_change(&change).map_err(store_err_to_agent)?;
            changes.push(change);

            if success {
                reverted_policies.push(prior.policy_id.clone());
            } else {
                failed_policies.push(prior.policy_id.clone());
                if params.all_or_nothing {
                    break;
                }
            }
        }

        Ok((
            RevertResult {
                reverted_policies,
                failed_policies,
                changes,
                snapshot_id: snapshot.snapshot_id,
                restore_point_id,
            },
            warnings,
        ))
    }

    /// Resolves a [`RevertTarget`] into the change records to undo, oldest
    /// application first (caller re-sorts newest-first before replay).
    /// Spec §4.4: session revert re-reads by `snapshot_id`; §3's invariant
    /// that the most recent successful change determines revertibility
    /// covers the `PolicyIds`/`AllApplied` cases.
    fn collect_revert_targets(
        &self,
        target: &RevertTarget,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<ChangeRecord>, AgentError> {
        match target {
            RevertTarget::PolicyIds(ids) => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    let history = self.store.history(Some(id)).map_err(store_err_to_agent)?;
                    match history.into_iter().find(|c| c.success) {
                        Some(c) if c.operation == ChangeOperation::Apply => out.push(c),
                        Some(_) => warnings.push(format!("{id} has already been reverted")),
                        None => warnings.push(format!("{id} has no change history")),
                    }
                }
                Ok(out)
            }
            RevertTarget::SnapshotId(snapshot_id) => {
                if self
                    .store
                    .get_snapshot(*snapshot_id)
                    .map_err(store_err_to_agent)?
                    .is_none()
                {
                    return Err(AgentError::UnknownSnapshot(snapshot_id.to_string()));
                }
                let changes = self
                    .store
                    .changes_for_snapshot(*snapshot_id)
                    .map_err(store_err_to_agent)?;
                Ok(changes
                    .into_iter()
                    .filter(|c| c.operation == ChangeOperation::Apply && c.success)
                    .collect())
            }
            RevertTarget::AllApplied => {
                let mut out = Vec::new();
                for id in self.store.applied_policy_ids().map_err(store_err_to_agent)? {
                    let history = self.store.history(Some(&id)).map_err(store_err_to_agent)?;
                    if let Some(c) = history.into_iter().find(|c| c.success) {
                        out.push(c);
                    }
                }
                Ok(out)
            }
        }
    }

    async fn maybe_create_restore_point(
        &self,
        requested: bool,
        description: &str,
        warnings: &mut Vec<String>,
    ) -> Option<String> {
        if !requested {
            return None;
        }
        match self.restore.create(description).await {
            Ok(CreateOutcome::Created { restore_point_id }) => Some(restore_point_id),
            Ok(CreateOutcome::Disabled { reason }) => {
                warnings.push(format!("restore point not created: {reason}"));
                None
            }
            Err(e) => {
                warnings.push(format!("restore point request failed: {e}"));
                None
            }
        }
    }

    // -----------------------------------------------------------------
    // GetState
    // -----------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn get_state(&self, params: GetStateParams) -> Result<GetStateResult, AgentError> {
        let applied_policy_ids = self.store.applied_policy_ids().map_err(store_err_to_agent)?;
        let history = if params.include_history {
            Some(self.store.history(None).map_err(store_err_to_agent)?)
        } else {
            None
        };
        Ok(GetStateResult {
            applied_policy_ids,
            history,
        })
    }

    // -----------------------------------------------------------------
    // GetPolicies (SPEC_FULL §4.5, §10.2)
    // -----------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn get_policies(&self, params: GetPoliciesParams) -> Result<GetPoliciesResult, AgentError> {
        let catalog = self.catalog.snapshot();
        let system_info = if params.applicable_only {
            Some(
                self.probe
                    .probe()
                    .map_err(|e| executor_err_to_agent("<system>", e))?,
            )
        } else {
            None
        };

        let policies = catalog
            .policies()
            .iter()
            .filter(|p| params.category.as_deref().is_none_or(|c| c == p.category))
            .filter(|p| {
                params
                    .tag
                    .as_deref()
                    .is_none_or(|t| p.tags.iter().any(|tag| tag == t))
            })
            .filter(|p| match &system_info {
                Some(info) => info.check_applicability(&p.applicability).is_ok(),
                None => true,
            })
            .cloned()
            .collect();

        Ok(GetPoliciesResult { policies })
    }

    // -----------------------------------------------------------------
    // DetectDrift
    // -----------------------------------------------------------------

    #[tracing::instrument(skip(self, cancel))]
    pub async fn detect_drift(
        &self,
        params: DetectDriftParams,
        cancel: &CancellationToken,
    ) -> Result<DetectDriftResult, AgentError> {
        let snapshot = match params.snapshot_id {
            Some(id) => self
                .store
                .get_snapshot(id)
                .map_err(store_err_to_agent)?
                .ok_or(AgentError::UnknownSnapshot(id.to_string()))?,
            None => self
                .store
                .most_recent_snapshot()
                .map_err(store_err_to_agent)?
                .ok_or_else(|| AgentError::UnknownSnapshot("<no snapshot exists yet>".to_string()))?,
        };

        let states = self
            .store
            .snapshot_policy_states(snapshot.snapshot_id)
            .map_err(store_err_to_agent)?;
        let catalog = self.catalog.snapshot();

        let mut items = Vec::new();
        let mut diagnostics = Vec::new();

        for state in states.into_iter().filter(|s| s.is_applied) {
            let Some(policy) = catalog.get(&state.policy_id) else {
                diagnostics.push(format!(
                    "{} is no longer present in the catalog; skipped",
                    state.policy_id
                ));
                continue;
            };

            match self.executors.probe_applied(policy, cancel).await {
                Ok(true) => {}
                Ok(false) => {
                    let current_value = self
                        .executors
                        .get_current_value(policy, cancel)
                        .await
                        .unwrap_or_else(|e| format!("<probe failed: {e}>"));
                    items.push(DriftItem {
                        policy_id: state.policy_id.clone(),
                        expected_value: state.current_value.clone(),
                        current_value,
                        drift_reason: format!(
                            "{} is no longer applied on the live system",
                            state.policy_id
                        ),
                    });
                }
                Err(e) => diagnostics.push(format!("{}: probe failed: {e}", state.policy_id)),
            }
        }

        Ok(DetectDriftResult {
            snapshot_id: snapshot.snapshot_id,
            items,
            diagnostics,
        })
    }

    // -----------------------------------------------------------------
    // CreateSnapshot
    // -----------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn create_snapshot(
        &self,
        params: CreateSnapshotParams,
    ) -> Result<(CreateSnapshotResult, Vec<String>), AgentError> {
        let mut warnings = Vec::new();
        let system_info = self
            .probe
            .probe()
            .map_err(|e| executor_err_to_agent("<system>", e))?;

        let restore_point_id = self
            .maybe_create_restore_point(
                params.create_restore_point,
                "Manual snapshot checkpoint",
                &mut warnings,
            )
            .await;

        let snapshot = self
            .store
            .create_snapshot(params.description, &system_info, restore_point_id.clone())
            .map_err(store_err_to_agent)?;

        Ok((
            CreateSnapshotResult {
                snapshot_id: snapshot.snapshot_id,
                restore_point_id,
                created_at: snapshot.created_at,
            },
            warnings,
        ))
    }

    // -----------------------------------------------------------------
    // ReloadCatalog (SPEC_FULL §10.1)
    // -----------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn reload_catalog(&self) -> Result<ReloadCatalogResult, AgentError> {
        let policy_count = self.catalog.reload().map_err(load_err_to_agent)?;
        Ok(ReloadCatalogResult {
            policy_count,
            reloaded_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pha_catalog::Catalog;
    use pha_executors::ExecutorRegistry;
    use pha_protocol::policy::{
        Applicability, ControlFlags, Reversibility, RiskLevel, ScriptParams, SupportStatus,
    };
    use pha_protocol::sysinfo::SystemInfo;
    use pha_restore::RestorePointManager;
    use std::fs;

    const SCRIPT_POLICY: &str = r#"
policy_id = "tel-001"
version = "1.0.0"
name = "Disable diagnostic telemetry"
description = "Sets telemetry reporting to the minimum level"
category = "telemetry"
tags = ["privacy"]
risk_level = "low"
support_status = "supported"

[mechanism]
mechanism = "script"
apply_command = "true"
revert_command = "true"
probe_command = "true"

[applicability]
min_build = 10240
supported_skus = ["Professional"]

[reversibility]
reversible = true
how = "re-run with the previous telemetry level"
"#;

    fn fixed_system_info() -> SystemInfo {
        SystemInfo {
            build_number: 22621,
            version_string: "10.0.22621".to_string(),
            sku_name: "Professional".to_string(),
            domain_joined: false,
            mdm_managed: false,
            tamper_protection_enabled: true,
        }
    }

    fn engine_with_catalog(dir: &std::path::Path) -> PolicyEngine {
        fs::write(dir.join("tel-001.toml"), SCRIPT_POLICY).unwrap();
        let catalog = Arc::new(Catalog::load(dir.to_path_buf()).unwrap());
        let executors = Arc::new(ExecutorRegistry::with_default_executors());
        let store = Arc::new(pha_store::Store::open_in_memory().unwrap());
        let restore = Arc::new(RestorePointManager::new());
        let probe: Arc<dyn SystemProbe> = Arc::new(crate::probe::FixedSystemProbe(fixed_system_info()));
        PolicyEngine::new(catalog, executors, store, restore, probe)
    }

    #[tokio::test]
    async fn audit_unknown_policy_is_a_structural_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_catalog(dir.path());
        let err = engine
            .audit(
                AuditParams {
                    policy_ids: Some(vec!["nope-999".to_string()]),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownPolicy(id) if id == "nope-999"));
    }

    #[tokio::test]
    async fn dry_run_apply_journals_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_catalog(dir.path());
        let (tx, mut rx) = mpsc::channel(16);
        let (result, _warnings) = engine
            .apply(
                Uuid::new_v4(),
                ApplyParams {
                    policy_ids: vec!["tel-001".to_string()],
                    dry_run: true,
                    create_restore_point: false,
                    continue_on_error: false,
                },
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.applied_policies, vec!["tel-001".to_string()]);
        assert!(result.changes.is_empty());
        assert!(result.restore_point_id.is_none());

        let mut saw_nonzero = false;
        while let Some(frame) = rx.recv().await {
            if frame.percent > 0 {
                saw_nonzero = true;
            }
            if frame.percent == 100 {
                break;
            }
        }
        assert!(saw_nonzero);
    }

    #[tokio::test]
    async fn get_policies_filters_by_category() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_catalog(dir.path());
        let result = engine
            .get_policies(GetPoliciesParams {
                category: Some("nonexistent".to_string()),
                tag: None,
                applicable_only: false,
            })
            .unwrap();
        assert!(result.policies.is_empty());

        let result = engine
            .get_policies(GetPoliciesParams {
                category: Some("telemetry".to_string()),
                tag: None,
                applicable_only: false,
            })
            .unwrap();
        assert_eq!(result.policies.len(), 1);
    }

    #[tokio::test]
    async fn detect_drift_with_no_snapshots_is_unknown_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_catalog(dir.path());
        let err = engine
            .detect_drift(DetectDriftParams { snapshot_id: None }, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownSnapshot(_)));
    }

    #[tokio::test]
    async fn revert_snapshot_unknown_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_catalog(dir.path());
        let err = engine
            .revert(
                RevertParams {
                    target: RevertTarget::SnapshotId(Uuid::new_v4()),
                    create_restore_point: false,
                    all_or_nothing: false,
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownSnapshot(_)));
    }

    fn sample_policy() -> Policy {
        Policy {
            policy_id: "unused".to_string(),
            version: "1.0.0".to_string(),
            name: String::new(),
            description: String::new(),
            category: String::new(),
            tags: vec![],
            mechanism: Mechanism::Script(ScriptParams {
                apply_command: "true".to_string(),
                revert_command: None,
                probe_command: "true".to_string(),
            }),
            risk_level: RiskLevel::Low,
            support_status: SupportStatus::Supported,
            applicability: Applicability {
                min_build: 0,
                max_build: None,
                supported_skus: vec![],
                excluded_skus: vec![],
                requires_device: false,
                deprecated_as_of_build: None,
            },
            reversibility: Reversibility {
                reversible: false,
                how: String::new(),
            },
            known_breakage: vec![],
            dependencies: vec![],
            control_flags: ControlFlags::default(),
            help_text: None,
            allowed_values: vec![],
        }
    }

    #[test]
    fn requires_restart_detects_tag() {
        let mut p = sample_policy();
        assert!(!requires_restart(&p));
        p.tags.push(REQUIRES_RESTART_TAG.to_string());
        assert!(requires_restart(&p));
    }
}
