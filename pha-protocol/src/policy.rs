//! The policy data model (spec §3).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Stable policy identifier: lowercase category prefix + 3-digit sequence,
/// e.g. `tel-001`.
pub type PolicyId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SupportStatus {
    Supported,
    Experimental,
    Deprecated,
}

/// The kind of OS surface a policy mutates. Mechanism-specific parameters
/// live alongside the tag so catalog validation can dispatch to the right
/// parser without a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "mechanism", rename_all = "snake_case")]
pub enum Mechanism {
    Registry(RegistryParams),
    Service(ServiceParams),
    ScheduledTask(ScheduledTaskParams),
    Firewall(FirewallParams),
    Script(ScriptParams),
    /// Loadable and validatable, but no executor is registered for it yet
    /// (spec §4.3): applying or probing one of these mechanisms fails with
    /// `ExecutionError::Unsupported`.
    GroupPolicy(serde_json::Value),
    Mdm(serde_json::Value),
    HostsFile(serde_json::Value),
    WfpDriver(serde_json::Value),
}

impl Mechanism {
    /// Stable lowercase tag used for executor registry lookups and logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Mechanism::Registry(_) => "registry",
            Mechanism::Service(_) => "service",
            Mechanism::ScheduledTask(_) => "scheduled_task",
            Mechanism::Firewall(_) => "firewall",
            Mechanism::Script(_) => "script",
            Mechanism::GroupPolicy(_) => "group_policy",
            Mechanism::Mdm(_) => "mdm",
            Mechanism::HostsFile(_) => "hosts_file",
            Mechanism::WfpDriver(_) => "wfp_driver",
        }
    }

    /// True for the mechanisms this engine has a registered executor for.
    pub fn has_executor(&self) -> bool {
        matches!(
            self,
            Mechanism::Registry(_)
                | Mechanism::Service(_)
                | Mechanism::ScheduledTask(_)
                | Mechanism::Firewall(_)
                | Mechanism::Script(_)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryHive {
    HkeyLocalMachine,
    HkeyCurrentUser,
    HkeyUsers,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RegistryValueKind {
    Dword,
    Qword,
    String,
    MultiString,
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RegistryParams {
    pub hive: RegistryHive,
    /// Key path under the hive, e.g. `SOFTWARE\Policies\Microsoft\Windows\DataCollection`.
    pub key_path: String,
    pub value_name: String,
    pub value_kind: RegistryValueKind,
    /// The value to write when the policy is applied, serialized as a
    /// JSON scalar or array (array only valid for `MultiString`).
    pub applied_value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStartMode {
    Boot,
    System,
    Automatic,
    Manual,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServiceParams {
    pub service_name: String,
    pub applied_start_mode: ServiceStartMode,
    /// If true, the executor also stops a running service on apply.
    #[serde(default)]
    pub stop_if_running: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledTaskSelectedValue {
    Disable,
    Delete,
    ModifyTriggers,
    ExportOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ScheduledTaskParams {
    /// Task Scheduler path, e.g. `\Microsoft\Windows\Application Experience\ProgramDataUpdater`.
    pub task_path: String,
    pub selected_value: ScheduledTaskSelectedValue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FirewallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirewallAction {
    Block,
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FirewallParams {
    pub rule_name: String,
    pub direction: FirewallDirection,
    pub action: FirewallAction,
    /// Program path, service name, or `*` for a protocol/port-only rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ports: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ScriptParams {
    /// Shell/PowerShell invoked to apply the policy.
    pub apply_command: String,
    /// Shell/PowerShell invoked to revert; absent implies `reversible = false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_command: Option<String>,
    /// Shell/PowerShell invoked to probe current state; must print `"true"`
    /// or `"false"` on stdout.
    pub probe_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Applicability {
    pub min_build: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_build: Option<u32>,
    pub supported_skus: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_skus: Vec<String>,
    #[serde(default)]
    pub requires_device: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_as_of_build: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Reversibility {
    pub reversible: bool,
    pub how: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BreakageSeverity {
    Minor,
    Moderate,
    Severe,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct KnownBreakage {
    pub scenario: String,
    pub severity: BreakageSeverity,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Required,
    Recommended,
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DependencyEdge {
    pub other_policy_id: PolicyId,
    pub kind: DependencyKind,
    /// For `Recommended` edges: can the user decline auto-inclusion?
    #[serde(default)]
    pub user_overridable: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub auto_select: bool,
    pub reason: String,
}

impl DependencyEdge {
    /// True iff this edge participates in the gating graph built by the
    /// dependency resolver (spec §4.2): `Required`, or non-overridable
    /// `Recommended`.
    pub fn gates_execution(&self) -> bool {
        match self.kind {
            DependencyKind::Required => true,
            DependencyKind::Recommended => !self.user_overridable,
            DependencyKind::Conflict => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AllowedValue {
    pub value: serde_json::Value,
    pub label: String,
    pub description: String,
}

/// Granular-control invariants enforced on every loaded policy (spec §4.1,
/// §9, GLOSSARY). A policy failing any of these is rejected at load time,
/// never silently coerced.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ControlFlags {
    pub auto_apply: bool,
    pub requires_confirmation: bool,
    pub show_in_ui: bool,
    pub enabled_by_default: bool,
    /// Required set when `risk_level = Critical` (spec §4.1).
    #[serde(default)]
    pub user_must_choose: bool,
}

impl Default for ControlFlags {
    fn default() -> Self {
        // The only combination that ever passes validation; a policy file
        // omitting this struct gets the compliant defaults rather than a
        // parse error, keeping the loader permissive-on-unknown/strict-on-
        // required split from spec §4.1.
        Self {
            auto_apply: false,
            requires_confirmation: true,
            show_in_ui: true,
            enabled_by_default: false,
            user_must_choose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Policy {
    pub policy_id: PolicyId,
    /// Semantic version, `^\d+\.\d+\.\d+$`.
    pub version: String,
    pub name: String,
    pub description: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    pub mechanism: Mechanism,

    pub risk_level: RiskLevel,
    pub support_status: SupportStatus,

    pub applicability: Applicability,
    pub reversibility: Reversibility,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_breakage: Vec<KnownBreakage>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyEdge>,

    #[serde(default)]
    pub control_flags: ControlFlags,

    /// Required when `risk_level = Critical` (spec §4.1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<AllowedValue>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_control_flags_are_granular_compliant() {
        let flags = ControlFlags::default();
        assert!(!flags.auto_apply);
        assert!(flags.requires_confirmation);
        assert!(flags.show_in_ui);
        assert!(!flags.enabled_by_default);
    }

    #[test]
    fn required_edge_gates_execution() {
        let edge = DependencyEdge {
            other_policy_id: "tel-002".to_string(),
            kind: DependencyKind::Required,
            user_overridable: false,
            optional: false,
            auto_select: true,
            reason: "needed".to_string(),
        };
        assert!(edge.gates_execution());
    }

    #[test]
    fn overridable_recommended_edge_does_not_gate() {
        let edge = DependencyEdge {
            other_policy_id: "tel-002".to_string(),
            kind: DependencyKind::Recommended,
            user_overridable: true,
            optional: true,
            auto_select: false,
            reason: "pairs well".to_string(),
        };
        assert!(!edge.gates_execution());
    }

    #[test]
    fn conflict_edge_never_gates() {
        let edge = DependencyEdge {
            other_policy_id: "tel-002".to_string(),
            kind: DependencyKind::Conflict,
            user_overridable: false,
            optional: false,
            auto_select: false,
            reason: "mutually exclusive".to_string(),
        };
        assert!(!edge.gates_execution());
    }

    #[test]
    fn mechanism_tag_matches_variant() {
        let m = Mechanism::Registry(RegistryParams {
            hive: RegistryHive::HkeyLocalMachine,
            key_path: "SOFTWARE\\Test".to_string(),
            value_name: "Value".to_string(),
            value_kind: RegistryValueKind::Dword,
            applied_value: serde_json::json!(1),
        });
        assert_eq!(m.tag(), "registry");
        assert!(m.has_executor());

        let unsupported = Mechanism::Mdm(serde_json::json!({}));
        assert!(!unsupported.has_executor());
    }
}
