//! Change Record, Snapshot, and Snapshot Policy State (spec §3).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::PolicyId;
use crate::sysinfo::SystemInfo;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Apply,
    Revert,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChangeRecord {
    pub change_id: Uuid,
    pub policy_id: PolicyId,
    pub snapshot_id: Uuid,
    pub operation: ChangeOperation,
    pub applied_at: DateTime<Utc>,
    pub mechanism_tag: String,
    pub description: String,
    /// Opaque previous-state blob; the engine never interprets it.
    pub previous_state: String,
    /// Opaque new-state blob.
    pub new_state: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub system_info: SystemInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_point_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SnapshotPolicyState {
    pub snapshot_id: Uuid,
    pub policy_id: PolicyId,
    pub is_applied: bool,
    pub current_value: String,
}
