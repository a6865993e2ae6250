//! Scheduled task mechanism executor (spec §3/§4.3:
//! `Mechanism::ScheduledTask`) via the Task Scheduler COM API
//! (`ITaskService`).
//!
//! `ModifyTriggers` and `ExportOnly` selected values are load/validate-only
//! for now: the catalog can describe them, but applying one returns
//! [`ExecutorError::MechanismFailure`] naming the gap rather than silently
//! doing nothing.

use async_trait::async_trait;
use pha_protocol::policy::{Mechanism, Policy, ScheduledTaskParams, ScheduledTaskSelectedValue};
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::executor::{ApplyOutcome, Executor, RevertOutcome, check_cancelled};

fn params(policy: &Policy) -> Result<&ScheduledTaskParams, ExecutorError> {
    match &policy.mechanism {
        Mechanism::ScheduledTask(params) => Ok(params),
        other => Err(ExecutorError::InvalidParams(format!(
            "expected scheduled_task mechanism, got {}",
            other.tag()
        ))),
    }
}

pub struct ScheduledTaskExecutor;

#[async_trait]
impl Executor for ScheduledTaskExecutor {
    fn mechanism_tag(&self) -> &'static str {
        "scheduled_task"
    }

    async fn probe_applied(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<bool, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        match p.selected_value {
            ScheduledTaskSelectedValue::Disable => {
                Ok(!platform::is_enabled(&p.task_path)?)
            }
            ScheduledTaskSelectedValue::Delete => Ok(!platform::exists(&p.task_path)?),
            ScheduledTaskSelectedValue::ModifyTriggers | ScheduledTaskSelectedValue::ExportOnly => {
                Err(ExecutorError::MechanismFailure(format!(
                    "selected_value {:?} has no executor behavior yet",
                    p.selected_value
                )))
            }
        }
    }

    async fn get_current_value(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        if platform::exists(&p.task_path)? {
            Ok(if platform::is_enabled(&p.task_path)? {
                "enabled".to_string()
            } else {
                "disabled".to_string()
            })
        } else {
            Ok("absent".to_string())
        }
    }

    async fn apply(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        match p.selected_value {
            ScheduledTaskSelectedValue::Disable => {
                let previously_enabled = platform::is_enabled(&p.task_path)?;
                if previously_enabled {
                    platform::set_enabled(&p.task_path, false)?;
                }
                Ok(ApplyOutcome {
                    previous_state: if previously_enabled {
                        "enabled".to_string()
                    } else {
                        "disabled".to_string()
                    },
                    new_state: "disabled".to_string(),
                    already_applied: !previously_enabled,
                })
            }
            ScheduledTaskSelectedValue::Delete => {
                let existed = platform::exists(&p.task_path)?;
                let previous_state = if existed {
                    platform::export_definition(&p.task_path)?
                } else {
                    String::new()
                };
                if existed {
                    platform::delete(&p.task_path)?;
                }
                Ok(ApplyOutcome {
                    previous_state,
                    new_state: "deleted".to_string(),
                    already_applied: !existed,
                })
            }
            ScheduledTaskSelectedValue::ModifyTriggers | ScheduledTaskSelectedValue::ExportOnly => {
                Err(ExecutorError::MechanismFailure(format!(
                    "selected_value {:?} has no executor behavior yet",
                    p.selected_value
                )))
            }
        }
    }

    async fn revert(
        &self,
        policy: &Policy,
        previous_state: &str,
        cancel: &CancellationToken,
    ) -> Result<RevertOutcome, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        match p.selected_value {
            ScheduledTaskSelectedValue::Disable => {
                if previous_state == "enabled" {
                    platform::set_enabled(&p.task_path, true)?;
                }
                Ok(RevertOutcome {
                    new_state: previous_state.to_string(),
                })
            }
            ScheduledTaskSelectedValue::Delete => {
                if !previous_state.is_empty() {
                    platform::import_definition(&p.task_path, previous_state)?;
                }
                Ok(RevertOutcome {
                    new_state: if previous_state.is_empty() {
                        "deleted".to_string()
                    } else {
                        "enabled".to_string()
                    },
                })
            }
            ScheduledTaskSelectedValue::ModifyTriggers | ScheduledTaskSelectedValue::ExportOnly => {
                Err(ExecutorError::MechanismFailure(format!(
                    "selected_value {:?} has no executor behavior yet",
                    p.selected_value
                )))
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::ExecutorError;
    use windows::Win32::System::Com::{
        CLSCTX_INPROC_SERVER, COINIT_APARTMENTTHREADED, CoCreateInstance, CoInitializeEx,
    };
    use windows::Win32::System::TaskScheduler::{
        ITaskFolder, ITaskService, TaskScheduler, TASK_ENUM_HIDDEN,
    };
    use windows::core::{BSTR, VARIANT};

    fn with_task_service<T>(
        f: impl FnOnce(&ITaskService) -> windows::core::Result<T>,
    ) -> Result<T, ExecutorError> {
        unsafe {
            // Idempotent per-thread: a second CoInitializeEx returns S_FALSE,
            // which `windows` surfaces as Ok, not an error.
            let _ = CoInitializeEx(None, COINIT_APARTMENTTHREADED);
            let service: ITaskService =
                CoCreateInstance(&TaskScheduler, None, CLSCTX_INPROC_SERVER)
                    .map_err(|e| ExecutorError::MechanismFailure(format!("CoCreateInstance: {e}")))?;
            service
                .Connect(&VARIANT::default(), &VARIANT::default(), &VARIANT::default(), &VARIANT::default())
                .map_err(|e| ExecutorError::MechanismFailure(format!("ITaskService::Connect: {e}")))?;
            f(&service).map_err(|e| ExecutorError::MechanismFailure(e.to_string()))
        }
    }

    fn split_folder_and_name(task_path: &str) -> (String, String) {
        match task_path.rfind('\\') {
            Some(idx) => (task_path[..=idx].to_string(), task_path[idx + 1..].to_string()),
            None => ("\\".to_string(), task_path.to_string()),
        }
    }

    fn folder_for(service: &ITaskService, task_path: &str) -> windows::core::Result<ITaskFolder> {
        let (folder_path, _) = split_folder_and_name(task_path);
        unsafe { service.GetFolder(&BSTR::from(folder_path)) }
    }

    pub fn exists(task_path: &str) -> Result<bool, ExecutorError> {
        with_task_service(|service| {
            let folder = folder_for(service, task_path)?;
            let (_, name) = split_folder_and_name(task_path);
            unsafe {
                match folder.GetTask(&BSTR::from(name)) {
                    Ok(_) => Ok(true),
                    Err(_) => Ok(false),
                }
            }
        })
    }

    pub fn is_enabled(task_path: &str) -> Result<bool, ExecutorError> {
        with_task_service(|service| {
            let folder = folder_for(service, task_path)?;
            let (_, name) = split_folder_and_name(task_path);
            unsafe {
                let task = folder.GetTask(&BSTR::from(name))?;
                Ok(task.Enabled()?.as_bool())
            }
        })
    }

    pub fn set_enabled(task_path: &str, enabled: bool) -> Result<(), ExecutorError> {
        with_task_service(|service| {
            let folder = folder_for(service, task_path)?;
            let (_, name) = split_folder_and_name(task_path);
            unsafe {
                let task = folder.GetTask(&BSTR::from(name))?;
                task.SetEnabled(windows::core::BOOL::from(enabled))
            }
        })
    }

    pub fn delete(task_path: &str) -> Result<(), ExecutorError> {
        with_task_service(|service| {
            let folder = folder_for(service, task_path)?;
            let (_, name) = split_folder_and_name(task_path);
            unsafe { folder.DeleteTask(&BSTR::from(name), 0) }
        })
    }

    pub fn export_definition(task_path: &str) -> Result<String, ExecutorError> {
        with_task_service(|service| {
            let folder = folder_for(service, task_path)?;
            let (_, name) = split_folder_and_name(task_path);
            unsafe {
                let task = folder.GetTask(&BSTR::from(name))?;
                Ok(task.Xml()?.to_string())
            }
        })
    }

    pub fn import_definition(task_path: &str, xml: &str) -> Result<(), ExecutorError> {
        with_task_service(|service| {
            let (folder_path, name) = split_folder_and_name(task_path);
            let folder = unsafe { service.GetFolder(&BSTR::from(folder_path)) }?;
            unsafe {
                folder.RegisterTask(
                    &BSTR::from(name),
                    &BSTR::from(xml),
                    windows::Win32::System::TaskScheduler::TASK_CREATE_OR_UPDATE.0,
                    &VARIANT::default(),
                    &VARIANT::default(),
                    windows::Win32::System::TaskScheduler::TASK_LOGON_NONE,
                    &VARIANT::default(),
                )?;
            }
            Ok(())
        })
    }

    #[allow(dead_code)]
    const _UNUSED: u32 = TASK_ENUM_HIDDEN.0 as u32;
}

#[cfg(not(windows))]
mod platform {
    use super::ExecutorError;

    fn unsupported() -> ExecutorError {
        ExecutorError::MechanismFailure("scheduled task mechanism requires Windows".to_string())
    }

    pub fn exists(_task_path: &str) -> Result<bool, ExecutorError> {
        Err(unsupported())
    }
    pub fn is_enabled(_task_path: &str) -> Result<bool, ExecutorError> {
        Err(unsupported())
    }
    pub fn set_enabled(_task_path: &str, _enabled: bool) -> Result<(), ExecutorError> {
        Err(unsupported())
    }
    pub fn delete(_task_path: &str) -> Result<(), ExecutorError> {
        Err(unsupported())
    }
    pub fn export_definition(_task_path: &str) -> Result<String, ExecutorError> {
        Err(unsupported())
    }
    pub fn import_definition(_task_path: &str, _xml: &str) -> Result<(), ExecutorError> {
        Err(unsupported())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn modify_triggers_is_unimplemented_not_silently_ignored() {
        let policy = Policy {
            policy_id: "task-001".to_string(),
            version: "1.0.0".to_string(),
            name: "test".to_string(),
            description: String::new(),
            category: "test".to_string(),
            tags: vec![],
            mechanism: Mechanism::ScheduledTask(ScheduledTaskParams {
                task_path: "\\Microsoft\\Windows\\Test\\Task".to_string(),
                selected_value: ScheduledTaskSelectedValue::ModifyTriggers,
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
                reversible: false,
                how: "not applicable".to_string(),
            },
            known_breakage: vec![],
            dependencies: vec![],
            control_flags: pha_protocol::policy::ControlFlags::default(),
            help_text: None,
            allowed_values: vec![],
        };

        let executor = ScheduledTaskExecutor;
        let err = executor
            .apply(&policy, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::MechanismFailure(_)));
    }
}
