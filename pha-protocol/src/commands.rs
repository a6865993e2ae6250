//! Per-command parameter and result payloads (spec §4.5, §6, §10).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::ChangeRecord;
use crate::policy::{Policy, PolicyId};
use crate::sysinfo::SystemInfo;

// ---------------------------------------------------------------------
// audit
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AuditParams {
    /// `None` audits every policy in the resolved catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_ids: Option<Vec<PolicyId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditItem {
    pub policy_id: PolicyId,
    pub applied: bool,
    pub applicable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_applicable_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<String>,
    pub matches: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_description: Option<String>,
}

/// Roll-up counts over an audit's items (supplemental, SPEC_FULL §10.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AuditSummary {
    pub applied: usize,
    pub not_applied: usize,
    pub not_applicable: usize,
    pub drifted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditResult {
    pub items: Vec<AuditItem>,
    pub system_info: SystemInfo,
    pub summary: AuditSummary,
}

impl AuditResult {
    pub fn new(items: Vec<AuditItem>, system_info: SystemInfo) -> Self {
        let mut summary = AuditSummary::default();
        for item in &items {
            if !item.applicable {
                summary.not_applicable += 1;
            } else if item.applied {
                summary.applied += 1;
            } else {
                summary.not_applied += 1;
            }
            if item.drift_description.is_some() {
                summary.drifted += 1;
            }
        }
        Self {
            items,
            system_info,
            summary,
        }
    }
}

// ---------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApplyParams {
    pub policy_ids: Vec<PolicyId>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub create_restore_point: bool,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// One progress update on the same connection as an in-flight `apply`,
/// preceding the terminal [`ApplyResult`] (spec §4.5, §5: monotonically
/// increasing `percent`, terminal frame reaches 100 before the result).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProgressFrame {
    pub command_id: Uuid,
    pub percent: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_policy_id: Option<PolicyId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApplyResult {
    pub applied_policies: Vec<PolicyId>,
    pub failed_policies: Vec<PolicyId>,
    pub changes: Vec<ChangeRecord>,
    pub snapshot_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_point_id: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub restart_recommended: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies_requiring_restart: Vec<PolicyId>,
}

// ---------------------------------------------------------------------
// revert
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RevertTarget {
    PolicyIds(Vec<PolicyId>),
    SnapshotId(Uuid),
    AllApplied,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RevertParams {
    pub target: RevertTarget,
    #[serde(default)]
    pub create_restore_point: bool,
    /// All-or-nothing: stop the whole session revert on the first failure
    /// rather than continuing (spec §7).
    #[serde(default)]
    pub all_or_nothing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RevertResult {
    pub reverted_policies: Vec<PolicyId>,
    pub failed_policies: Vec<PolicyId>,
    pub changes: Vec<ChangeRecord>,
    pub snapshot_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_point_id: Option<String>,
}

// ---------------------------------------------------------------------
// getState
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct GetStateParams {
    #[serde(default)]
    pub include_history: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GetStateResult {
    pub applied_policy_ids: Vec<PolicyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ChangeRecord>>,
}

// ---------------------------------------------------------------------
// getPolicies
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct GetPoliciesParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub applicable_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GetPoliciesResult {
    pub policies: Vec<Policy>,
}

// ---------------------------------------------------------------------
// detectDrift
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DetectDriftParams {
    /// Spec §9 open question, resolved: absent means "use the most recent
    /// applied snapshot"; an id that does not exist is `UnknownSnapshot`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DriftItem {
    pub policy_id: PolicyId,
    pub expected_value: String,
    pub current_value: String,
    pub drift_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DetectDriftResult {
    pub snapshot_id: Uuid,
    pub items: Vec<DriftItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

// ---------------------------------------------------------------------
// createSnapshot
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CreateSnapshotParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub create_restore_point: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateSnapshotResult {
    pub snapshot_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_point_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// reloadCatalog (supplemental, SPEC_FULL §10.1)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReloadCatalogParams {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReloadCatalogResult {
    pub policy_count: usize,
    pub reloaded_at: DateTime<Utc>,
}
