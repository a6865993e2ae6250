//! Firewall mechanism executor (spec §3/§4.3: `Mechanism::Firewall`) via
//! the Windows Firewall with Advanced Security COM API (`INetFwPolicy2`).
//!
//! Previous state is the rule's prior existence plus, when it existed, its
//! enabled/action/profile fields serialized as JSON so revert can either
//! delete a newly-created rule or restore the fields it overwrote.

use async_trait::async_trait;
use pha_protocol::policy::{FirewallAction, FirewallDirection, FirewallParams, Mechanism, Policy};
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::executor::{ApplyOutcome, Executor, RevertOutcome, check_cancelled};

fn params(policy: &Policy) -> Result<&FirewallParams, ExecutorError> {
    match &policy.mechanism {
        Mechanism::Firewall(params) => Ok(params),
        other => Err(ExecutorError::InvalidParams(format!(
            "expected firewall mechanism, got {}",
            other.tag()
        ))),
    }
}

pub struct FirewallExecutor;

#[async_trait]
impl Executor for FirewallExecutor {
    fn mechanism_tag(&self) -> &'static str {
        "firewall"
    }

    async fn probe_applied(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<bool, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        match platform::find_rule(&p.rule_name)? {
            Some(found) => Ok(found.direction == p.direction
                && found.action == p.action
                && found.enabled),
            None => Ok(false),
        }
    }

    async fn get_current_value(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        match platform::find_rule(&p.rule_name)? {
            Some(found) => Ok(serde_json::to_string(&found)
                .map_err(|e| ExecutorError::MechanismFailure(e.to_string()))?),
            None => Ok("absent".to_string()),
        }
    }

    async fn apply(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        let existing = platform::find_rule(&p.rule_name)?;
        let previous_state = match &existing {
            Some(found) => {
                serde_json::to_string(found).map_err(|e| ExecutorError::MechanismFailure(e.to_string()))?
            }
            None => "absent".to_string(),
        };
        let already_applied = existing
            .as_ref()
            .is_some_and(|f| f.direction == p.direction && f.action == p.action && f.enabled);

        if !already_applied {
            platform::upsert_rule(p)?;
        }

        Ok(ApplyOutcome {
            previous_state,
            new_state: "enabled".to_string(),
            already_applied,
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
        if previous_state == "absent" {
            platform::delete_rule(&p.rule_name)?;
            Ok(RevertOutcome {
                new_state: "absent".to_string(),
            })
        } else {
            let found: platform::FoundRule = serde_json::from_str(previous_state)
                .map_err(|e| ExecutorError::InvalidParams(e.to_string()))?;
            platform::restore_rule(&p.rule_name, &found)?;
            Ok(RevertOutcome {
                new_state: previous_state.to_string(),
            })
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::{ExecutorError, FirewallAction, FirewallDirection, FirewallParams};
    use serde::{Deserialize, Serialize};
    use windows::Win32::NetworkManagement::WindowsFirewall::{
        INetFwPolicy2, NET_FW_ACTION_ALLOW, NET_FW_ACTION_BLOCK, NET_FW_PROFILE2_ALL,
        NET_FW_RULE_DIR_IN, NET_FW_RULE_DIR_OUT, NetFwPolicy2, NetFwRule,
    };
    use windows::Win32::System::Com::{
        CLSCTX_INPROC_SERVER, COINIT_APARTMENTTHREADED, CoCreateInstance, CoInitializeEx,
    };
    use windows::core::BSTR;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    pub struct FoundRule {
        pub direction: FirewallDirection,
        pub action: FirewallAction,
        pub enabled: bool,
        pub program_path: Option<String>,
        pub remote_ports: Option<String>,
    }

    fn policy() -> Result<INetFwPolicy2, ExecutorError> {
        unsafe {
            let _ = CoInitializeEx(None, COINIT_APARTMENTTHREADED);
            CoCreateInstance(&NetFwPolicy2, None, CLSCTX_INPROC_SERVER)
                .map_err(|e| ExecutorError::MechanismFailure(format!("CoCreateInstance: {e}")))
        }
    }

    pub fn find_rule(rule_name: &str) -> Result<Option<FoundRule>, ExecutorError> {
        let policy = policy()?;
        unsafe {
            let rules = policy
                .Rules()
                .map_err(|e| ExecutorError::MechanismFailure(format!("Rules(): {e}")))?;
            match rules.Item(&BSTR::from(rule_name)) {
                Ok(rule) => Ok(Some(read_rule(&rule)?)),
                Err(_) => Ok(None),
            }
        }
    }

    unsafe fn read_rule(rule: &NetFwRule) -> Result<FoundRule, ExecutorError> {
        unsafe {
            let direction = if rule.Direction().map_err(wrap)? == NET_FW_RULE_DIR_IN {
                FirewallDirection::Inbound
            } else {
                FirewallDirection::Outbound
            };
            let action = if rule.Action().map_err(wrap)? == NET_FW_ACTION_BLOCK {
                FirewallAction::Block
            } else {
                FirewallAction::Allow
            };
            let enabled = rule.Enabled().map_err(wrap)?.as_bool();
            let program_path = rule.ApplicationName().ok().map(|b| b.to_string());
            let remote_ports = rule.RemotePorts().ok().map(|b| b.to_string());
            Ok(FoundRule {
                direction,
                action,
                enabled,
                program_path,
                remote_ports,
            })
        }
    }

    fn wrap(e: windows::core::Error) -> ExecutorError {
        ExecutorError::MechanismFailure(e.to_string())
    }

    fn new_rule(params: &FirewallParams) -> Result<NetFwRule, ExecutorError> {
        unsafe {
            let _ = CoInitializeEx(None, COINIT_APARTMENTTHREADED);
            let rule: NetFwRule = CoCreateInstance(&windows::Win32::NetworkManagement::WindowsFirewall::NetFwRule, None, CLSCTX_INPROC_SERVER)
                .map_err(wrap)?;
            rule.SetName(&BSTR::from(params.rule_name.as_str())).map_err(wrap)?;
            rule.SetDirection(if params.direction == FirewallDirection::Inbound {
                NET_FW_RULE_DIR_IN
            } else {
                NET_FW_RULE_DIR_OUT
            })
            .map_err(wrap)?;
            rule.SetAction(if params.action == FirewallAction::Block {
                NET_FW_ACTION_BLOCK
            } else {
                NET_FW_ACTION_ALLOW
            })
            .map_err(wrap)?;
            if let Some(program) = &params.program_path {
                rule.SetApplicationName(&BSTR::from(program.as_str())).map_err(wrap)?;
            }
            if let Some(ports) = &params.remote_ports {
                rule.SetRemotePorts(&BSTR::from(ports.as_str())).map_err(wrap)?;
            }
            rule.SetEnabled(windows::core::BOOL::from(true)).map_err(wrap)?;
            rule.SetProfiles(NET_FW_PROFILE2_ALL.0).map_err(wrap)?;
            Ok(rule)
        }
    }

    pub fn upsert_rule(params: &FirewallParams) -> Result<(), ExecutorError> {
        let policy = policy()?;
        let rule = new_rule(params)?;
        unsafe {
            let rules = policy.Rules().map_err(wrap)?;
            // `Add` replaces an existing rule with the same name.
            rules.Add(&rule).map_err(wrap)?;
        }
        Ok(())
    }

    pub fn restore_rule(rule_name: &str, found: &FoundRule) -> Result<(), ExecutorError> {
        let params = FirewallParams {
            rule_name: rule_name.to_string(),
            direction: found.direction,
            action: found.action,
            program_path: found.program_path.clone(),
            remote_ports: found.remote_ports.clone(),
        };
        upsert_rule(&params)?;
        if !found.enabled {
            let policy = policy()?;
            unsafe {
                let rules = policy.Rules().map_err(wrap)?;
                let rule = rules.Item(&BSTR::from(rule_name)).map_err(wrap)?;
                rule.SetEnabled(windows::core::BOOL::from(false)).map_err(wrap)?;
            }
        }
        Ok(())
    }

    pub fn delete_rule(rule_name: &str) -> Result<(), ExecutorError> {
        let policy = policy()?;
        unsafe {
            let rules = policy.Rules().map_err(wrap)?;
            rules
                .Remove(&BSTR::from(rule_name))
                .map_err(wrap)?;
        }
        Ok(())
    }
}

#[cfg(not(windows))]
mod platform {
    use super::{ExecutorError, FirewallAction, FirewallDirection, FirewallParams};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    pub struct FoundRule {
        pub direction: FirewallDirection,
        pub action: FirewallAction,
        pub enabled: bool,
        pub program_path: Option<String>,
        pub remote_ports: Option<String>,
    }

    fn unsupported() -> ExecutorError {
        ExecutorError::MechanismFailure("firewall mechanism requires Windows".to_string())
    }

    pub fn find_rule(_rule_name: &str) -> Result<Option<FoundRule>, ExecutorError> {
        Err(unsupported())
    }
    pub fn upsert_rule(_params: &FirewallParams) -> Result<(), ExecutorError> {
        Err(unsupported())
    }
    pub fn restore_rule(_rule_name: &str, _found: &FoundRule) -> Result<(), ExecutorError> {
        Err(unsupported())
    }
    pub fn delete_rule(_rule_name: &str) -> Result<(), ExecutorError> {
        Err(unsupported())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn sample_policy(direction: FirewallDirection, action: FirewallAction) -> Policy {
        Policy {
            policy_id: "net-999".to_string(),
            version: "1.0.0".to_string(),
            name: "test".to_string(),
            description: String::new(),
            category: "test".to_string(),
            tags: vec![],
            mechanism: Mechanism::Firewall(FirewallParams {
                rule_name: "PHA Test Rule".to_string(),
                direction,
                action,
                program_path: None,
                remote_ports: Some("443".to_string()),
            }),
            risk_level: pha_protocol::policy::RiskLevel::Low,
            support_status: pha_protocol::policy::SupportStatus::Experimental,
            applicability: pha_protocol::policy::Applicability {
                min_build: 0,
                max_build: None,
                supported_skus: vec!["Professional".to_string()],
                excluded_skus: vec![],
                requires_device: false,
                deprecated_as_of_build: None,
            },
            reversibility: pha_protocol::policy::Reversibility {
                reversible: true,
                how: "delete the rule or restore its prior fields".to_string(),
            },
            known_breakage: vec![],
            dependencies: vec![],
            control_flags: pha_protocol::policy::ControlFlags::default(),
            help_text: None,
            allowed_values: vec![],
        }
    }

    #[test]
    fn params_rejects_wrong_mechanism() {
        let mut policy = sample_policy(FirewallDirection::Outbound, FirewallAction::Block);
        policy.mechanism = Mechanism::Service(pha_protocol::policy::ServiceParams {
            service_name: "DiagTrack".to_string(),
            applied_start_mode: pha_protocol::policy::ServiceStartMode::Disabled,
            stop_if_running: true,
        });
        assert!(params(&policy).is_err());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn non_windows_probe_fails_closed() {
        let policy = sample_policy(FirewallDirection::Outbound, FirewallAction::Block);
        let executor = FirewallExecutor;
        assert!(
            executor
                .probe_applied(&policy, &CancellationToken::new())
                .await
                .is_err()
        );
    }
}
