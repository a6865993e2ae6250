//! Per-policy schema/invariant validation (spec §4.1).

use pha_protocol::policy::{Mechanism, Policy, RiskLevel};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("policy id '{0}' is empty")]
    EmptyPolicyId(String),
    #[error("policy id '{0}' does not match ^[a-z]+-\\d{{3}}$")]
    MalformedPolicyId(String),
    #[error("version '{version}' on {policy_id} is not a valid semantic version")]
    InvalidVersion { policy_id: String, version: String },
    #[error("{policy_id} has risk_level = critical but no help_text")]
    CriticalMissingHelpText { policy_id: String },
    #[error("{policy_id} has risk_level = critical but control_flags.user_must_choose is false")]
    CriticalNotUserMustChoose { policy_id: String },
    #[error("{policy_id} is marked reversible but its script mechanism has no revert_command")]
    ReversibleScriptMissingRevert { policy_id: String },
    #[error("{policy_id} has a dependency edge pointing at itself")]
    SelfDependency { policy_id: String },
    #[error(
        "{policy_id}.control_flags violates the granular-control invariant (auto_apply=false, requires_confirmation=true, show_in_ui=true, enabled_by_default=false)"
    )]
    ControlFlagsNotGranular { policy_id: String },
    #[error("{policy_id}.applicability.min_build must be greater than zero")]
    ZeroMinBuild { policy_id: String },
    #[error("{policy_id}.applicability.supported_skus is empty")]
    EmptySupportedSkus { policy_id: String },
    #[error("{policy_id} has fewer than two allowed_values; parameterized policies need a real choice")]
    NotEnoughAllowedValues { policy_id: String },
    #[error("{policy_id} has an allowed_value with an empty label or description")]
    AllowedValueMissingText { policy_id: String },
}

/// `^[a-z]+-\d{3}$` without pulling in a regex crate for one fixed shape:
/// a lowercase category prefix, a hyphen, and exactly three digits.
fn is_valid_policy_id(id: &str) -> bool {
    let Some((prefix, suffix)) = id.split_once('-') else {
        return false;
    };
    !prefix.is_empty()
        && prefix.chars().all(|c| c.is_ascii_lowercase())
        && suffix.len() == 3
        && suffix.chars().all(|c| c.is_ascii_digit())
}

/// `^\d+\.\d+\.\d+$`: exactly three dot-separated non-empty numeric segments.
fn is_valid_semver(version: &str) -> bool {
    let segments: Vec<&str> = version.split('.').collect();
    segments.len() == 3
        && segments
            .iter()
            .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
}

/// Validate the invariants spec §4.1 requires of every policy loaded into the
/// catalog. Does not check cross-policy invariants (duplicate ids, dependency
/// cycles) -- those belong to [`crate::loader`] and [`crate::resolver`].
pub fn validate_policy(policy: &Policy) -> Result<(), ValidationError> {
    if policy.policy_id.trim().is_empty() {
        return Err(ValidationError::EmptyPolicyId(policy.policy_id.clone()));
    }
    if !is_valid_policy_id(&policy.policy_id) {
        return Err(ValidationError::MalformedPolicyId(policy.policy_id.clone()));
    }

    if !is_valid_semver(&policy.version) {
        return Err(ValidationError::InvalidVersion {
            policy_id: policy.policy_id.clone(),
            version: policy.version.clone(),
        });
    }

    if policy.risk_level == RiskLevel::Critical {
        let has_help_text = policy
            .help_text
            .as_ref()
            .is_some_and(|t| !t.trim().is_empty());
        if !has_help_text {
            return Err(ValidationError::CriticalMissingHelpText {
                policy_id: policy.policy_id.clone(),
            });
        }
        if !policy.control_flags.user_must_choose {
            return Err(ValidationError::CriticalNotUserMustChoose {
                policy_id: policy.policy_id.clone(),
            });
        }
    }

    if policy.reversibility.reversible
        && let Mechanism::Script(script) = &policy.mechanism
        && script.revert_command.is_none()
    {
        return Err(ValidationError::ReversibleScriptMissingRevert {
            policy_id: policy.policy_id.clone(),
        });
    }

    for edge in &policy.dependencies {
        if edge.other_policy_id == policy.policy_id {
            return Err(ValidationError::SelfDependency {
                policy_id: policy.policy_id.clone(),
            });
        }
    }

    let flags = &policy.control_flags;
    if flags.auto_apply || !flags.requires_confirmation || !flags.show_in_ui || flags.enabled_by_default {
        return Err(ValidationError::ControlFlagsNotGranular {
            policy_id: policy.policy_id.clone(),
        });
    }

    if policy.applicability.min_build == 0 {
        return Err(ValidationError::ZeroMinBuild {
            policy_id: policy.policy_id.clone(),
        });
    }
    if policy.applicability.supported_skus.is_empty() {
        return Err(ValidationError::EmptySupportedSkus {
            policy_id: policy.policy_id.clone(),
        });
    }

    if !policy.allowed_values.is_empty() {
        if policy.allowed_values.len() < 2 {
            return Err(ValidationError::NotEnoughAllowedValues {
                policy_id: policy.policy_id.clone(),
            });
        }
        let has_blank_text = policy
            .allowed_values
            .iter()
            .any(|v| v.label.trim().is_empty() || v.description.trim().is_empty());
        if has_blank_text {
            return Err(ValidationError::AllowedValueMissingText {
                policy_id: policy.policy_id.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pha_protocol::policy::{
        Applicability, ControlFlags, Reversibility, ScriptParams, SupportStatus,
    };

    fn base_policy() -> Policy {
        Policy {
            policy_id: "tel-001".to_string(),
            version: "1.0.0".to_string(),
            name: "Disable diagnostic telemetry".to_string(),
            description: "Sets telemetry reporting to the minimum level".to_string(),
            category: "telemetry".to_string(),
            tags: vec!["privacy".to_string()],
            mechanism: Mechanism::Script(ScriptParams {
                apply_command: "Set-TelemetryLevel -Level Security".to_string(),
                revert_command: Some("Set-TelemetryLevel -Level Full".to_string()),
                probe_command: "Get-TelemetryLevel".to_string(),
            }),
            risk_level: RiskLevel::Low,
            support_status: SupportStatus::Supported,
            applicability: Applicability {
                min_build: 10240,
                max_build: None,
                supported_skus: vec!["Professional".to_string()],
                excluded_skus: vec![],
                requires_device: false,
                deprecated_as_of_build: None,
            },
            reversibility: Reversibility {
                reversible: true,
                how: "re-run with the previous telemetry level".to_string(),
            },
            known_breakage: vec![],
            dependencies: vec![],
            control_flags: ControlFlags::default(),
            help_text: None,
            allowed_values: vec![],
        }
    }

    #[test]
    fn well_formed_policy_passes() {
        assert!(validate_policy(&base_policy()).is_ok());
    }

    #[test]
    fn malformed_policy_id_rejected() {
        let mut p = base_policy();
        p.policy_id = "Tel1".to_string();
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::MalformedPolicyId("Tel1".to_string()))
        );
    }

    #[test]
    fn policy_id_with_four_digit_suffix_rejected() {
        let mut p = base_policy();
        p.policy_id = "tel-0001".to_string();
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::MalformedPolicyId("tel-0001".to_string()))
        );
    }

    #[test]
    fn bad_version_rejected() {
        let mut p = base_policy();
        p.version = "1.0".to_string();
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::InvalidVersion {
                policy_id: "tel-001".to_string(),
                version: "1.0".to_string(),
            })
        );
    }

    #[test]
    fn critical_without_help_text_rejected() {
        let mut p = base_policy();
        p.risk_level = RiskLevel::Critical;
        p.control_flags.user_must_choose = true;
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::CriticalMissingHelpText {
                policy_id: "tel-001".to_string(),
            })
        );
    }

    #[test]
    fn critical_without_user_must_choose_rejected() {
        let mut p = base_policy();
        p.risk_level = RiskLevel::Critical;
        p.help_text = Some("This disables a core diagnostics pipeline.".to_string());
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::CriticalNotUserMustChoose {
                policy_id: "tel-001".to_string(),
            })
        );
    }

    #[test]
    fn critical_with_both_fields_passes() {
        let mut p = base_policy();
        p.risk_level = RiskLevel::Critical;
        p.help_text = Some("This disables a core diagnostics pipeline.".to_string());
        p.control_flags.user_must_choose = true;
        assert!(validate_policy(&p).is_ok());
    }

    #[test]
    fn reversible_script_without_revert_command_rejected() {
        let mut p = base_policy();
        if let Mechanism::Script(script) = &mut p.mechanism {
            script.revert_command = None;
        }
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::ReversibleScriptMissingRevert {
                policy_id: "tel-001".to_string(),
            })
        );
    }

    #[test]
    fn auto_apply_true_violates_granular_control() {
        let mut p = base_policy();
        p.control_flags.auto_apply = true;
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::ControlFlagsNotGranular {
                policy_id: "tel-001".to_string(),
            })
        );
    }

    #[test]
    fn enabled_by_default_true_violates_granular_control() {
        let mut p = base_policy();
        p.control_flags.enabled_by_default = true;
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::ControlFlagsNotGranular {
                policy_id: "tel-001".to_string(),
            })
        );
    }

    #[test]
    fn zero_min_build_rejected() {
        let mut p = base_policy();
        p.applicability.min_build = 0;
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::ZeroMinBuild {
                policy_id: "tel-001".to_string(),
            })
        );
    }

    #[test]
    fn empty_supported_skus_rejected() {
        let mut p = base_policy();
        p.applicability.supported_skus = vec![];
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::EmptySupportedSkus {
                policy_id: "tel-001".to_string(),
            })
        );
    }

    #[test]
    fn single_allowed_value_rejected() {
        use pha_protocol::policy::AllowedValue;
        let mut p = base_policy();
        p.allowed_values = vec![AllowedValue {
            value: serde_json::json!("only"),
            label: "Only".to_string(),
            description: "The only choice".to_string(),
        }];
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::NotEnoughAllowedValues {
                policy_id: "tel-001".to_string(),
            })
        );
    }

    #[test]
    fn allowed_value_with_blank_label_rejected() {
        use pha_protocol::policy::AllowedValue;
        let mut p = base_policy();
        p.allowed_values = vec![
            AllowedValue {
                value: serde_json::json!("a"),
                label: String::new(),
                description: "First choice".to_string(),
            },
            AllowedValue {
                value: serde_json::json!("b"),
                label: "B".to_string(),
                description: "Second choice".to_string(),
            },
        ];
        assert_eq!(
            validate_policy(&p),
            Err(ValidationError::AllowedValueMissingText {
                policy_id: "tel-001".to_string(),
            })
        );
    }

    #[test]
    fn two_well_formed_allowed_values_pass() {
        use pha_protocol::policy::AllowedValue;
        let mut p = base_policy();
        p.allowed_values = vec![
            AllowedValue {
                value: serde_json::json!("security"),
                label: "Security".to_string(),
                description: "Minimum diagnostic data".to_string(),
            },
            AllowedValue {
                value: serde_json::json!("full"),
                label: "Full".to_string(),
                description: "All diagnostic data".to_string(),
            },
        ];
        assert!(validate_policy(&p).is_ok());
    }
}
