//! Service mechanism executor (spec §3/§4.3: `Mechanism::Service`).
//!
//! Previous state is the service's start mode before `apply`, captured as
//! the start-mode tag string; revert restores it and never re-starts a
//! service `apply` stopped.

use async_trait::async_trait;
use pha_protocol::policy::{Mechanism, Policy, ServiceParams, ServiceStartMode};
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::executor::{ApplyOutcome, Executor, RevertOutcome, check_cancelled};

fn params(policy: &Policy) -> Result<&ServiceParams, ExecutorError> {
    match &policy.mechanism {
        Mechanism::Service(params) => Ok(params),
        other => Err(ExecutorError::InvalidParams(format!(
            "expected service mechanism, got {}",
            other.tag()
        ))),
    }
}

fn mode_tag(mode: ServiceStartMode) -> &'static str {
    match mode {
        ServiceStartMode::Boot => "boot",
        ServiceStartMode::System => "system",
        ServiceStartMode::Automatic => "automatic",
        ServiceStartMode::Manual => "manual",
        ServiceStartMode::Disabled => "disabled",
    }
}

fn mode_from_tag(tag: &str) -> Result<ServiceStartMode, ExecutorError> {
    match tag {
        "boot" => Ok(ServiceStartMode::Boot),
        "system" => Ok(ServiceStartMode::System),
        "automatic" => Ok(ServiceStartMode::Automatic),
        "manual" => Ok(ServiceStartMode::Manual),
        "disabled" => Ok(ServiceStartMode::Disabled),
        other => Err(ExecutorError::InvalidParams(format!(
            "unknown service start mode tag '{other}'"
        ))),
    }
}

pub struct ServiceExecutor;

#[async_trait]
impl Executor for ServiceExecutor {
    fn mechanism_tag(&self) -> &'static str {
        "service"
    }

    async fn probe_applied(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<bool, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        let current = platform::query_start_mode(&p.service_name)?;
        Ok(current == p.applied_start_mode)
    }

    async fn get_current_value(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        let current = platform::query_start_mode(&p.service_name)?;
        Ok(mode_tag(current).to_string())
    }

    async fn apply(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        let previous = platform::query_start_mode(&p.service_name)?;
        let already_applied = previous == p.applied_start_mode;

        if !already_applied {
            platform::set_start_mode(&p.service_name, p.applied_start_mode)?;
        }
        if p.stop_if_running {
            platform::stop_if_running(&p.service_name)?;
        }

        Ok(ApplyOutcome {
            previous_state: mode_tag(previous).to_string(),
            new_state: mode_tag(p.applied_start_mode).to_string(),
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
        let mode = mode_from_tag(previous_state)?;
        platform::set_start_mode(&p.service_name, mode)?;
        Ok(RevertOutcome {
            new_state: previous_state.to_string(),
        })
    }
}

#[cfg(windows)]
mod platform {
    use super::{ExecutorError, ServiceStartMode};
    use windows_sys::Win32::System::Services::{
        CloseServiceHandle, ControlService, OpenSCManagerW, OpenServiceW, QueryServiceConfigW,
        QueryServiceStatus, ChangeServiceConfigW, SC_MANAGER_CONNECT, SERVICE_AUTO_START,
        SERVICE_BOOT_START, SERVICE_CHANGE_CONFIG, QUERY_SERVICE_CONFIGW, SERVICE_CONTROL_STOP,
        SERVICE_DEMAND_START, SERVICE_DISABLED, SERVICE_NO_CHANGE, SERVICE_QUERY_CONFIG,
        SERVICE_QUERY_STATUS, SERVICE_RUNNING, SERVICE_STATUS, SERVICE_STOP, SERVICE_SYSTEM_START,
    };
    use windows_sys::Win32::Foundation::HANDLE;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    struct ScHandle(HANDLE);

    impl Drop for ScHandle {
        fn drop(&mut self) {
            unsafe {
                CloseServiceHandle(self.0);
            }
        }
    }

    fn open_manager() -> Result<ScHandle, ExecutorError> {
        let handle = unsafe { OpenSCManagerW(std::ptr::null(), std::ptr::null(), SC_MANAGER_CONNECT) };
        if handle.is_null() {
            return Err(ExecutorError::MechanismFailure(
                "OpenSCManagerW failed".to_string(),
            ));
        }
        Ok(ScHandle(handle))
    }

    fn open_service(manager: &ScHandle, name: &str, access: u32) -> Result<ScHandle, ExecutorError> {
        let wide_name = wide(name);
        let handle = unsafe { OpenServiceW(manager.0, wide_name.as_ptr(), access) };
        if handle.is_null() {
            return Err(ExecutorError::MechanismFailure(format!(
                "OpenServiceW({name}) failed"
            )));
        }
        Ok(ScHandle(handle))
    }

    fn start_type_to_mode(start_type: u32) -> ServiceStartMode {
        match start_type {
            SERVICE_BOOT_START => ServiceStartMode::Boot,
            SERVICE_SYSTEM_START => ServiceStartMode::System,
            SERVICE_AUTO_START => ServiceStartMode::Automatic,
            SERVICE_DISABLED => ServiceStartMode::Disabled,
            _ => ServiceStartMode::Manual,
        }
    }

    fn mode_to_start_type(mode: ServiceStartMode) -> u32 {
        match mode {
            ServiceStartMode::Boot => SERVICE_BOOT_START,
            ServiceStartMode::System => SERVICE_SYSTEM_START,
            ServiceStartMode::Automatic => SERVICE_AUTO_START,
            ServiceStartMode::Manual => SERVICE_DEMAND_START,
            ServiceStartMode::Disabled => SERVICE_DISABLED,
        }
    }

    pub fn query_start_mode(service_name: &str) -> Result<ServiceStartMode, ExecutorError> {
        let manager = open_manager()?;
        let service = open_service(&manager, service_name, SERVICE_QUERY_CONFIG)?;

        let mut needed: u32 = 0;
        unsafe {
            QueryServiceConfigW(service.0, std::ptr::null_mut(), 0, &mut needed);
        }

        let mut buf = vec![0u8; needed as usize];
        let mut actual = needed;
        let ok = unsafe {
            QueryServiceConfigW(
                service.0,
                buf.as_mut_ptr().cast::<QUERY_SERVICE_CONFIGW>(),
                buf.len() as u32,
                &mut actual,
            )
        };
        if ok == 0 {
            return Err(ExecutorError::MechanismFailure(format!(
                "QueryServiceConfigW({service_name}) failed"
            )));
        }

        // SAFETY: `buf` was sized and filled by QueryServiceConfigW for a
        // QUERY_SERVICE_CONFIGW header; dwStartType is the struct's first scalar
        // field after the type tag.
        let config = unsafe { &*buf.as_ptr().cast::<QUERY_SERVICE_CONFIGW>() };
        Ok(start_type_to_mode(config.dwStartType))
    }

    pub fn set_start_mode(service_name: &str, mode: ServiceStartMode) -> Result<(), ExecutorError> {
        let manager = open_manager()?;
        let service = open_service(&manager, service_name, SERVICE_CHANGE_CONFIG)?;

        let ok = unsafe {
            ChangeServiceConfigW(
                service.0,
                SERVICE_NO_CHANGE,
                mode_to_start_type(mode),
                SERVICE_NO_CHANGE,
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null_mut(),
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        if ok == 0 {
            return Err(ExecutorError::MechanismFailure(format!(
                "ChangeServiceConfigW({service_name}) failed"
            )));
        }
        Ok(())
    }

    pub fn stop_if_running(service_name: &str) -> Result<(), ExecutorError> {
        let manager = open_manager()?;
        let service = open_service(&manager, service_name, SERVICE_QUERY_STATUS | SERVICE_STOP)?;

        let mut status: SERVICE_STATUS = unsafe { std::mem::zeroed() };
        let ok = unsafe { QueryServiceStatus(service.0, &mut status) };
        if ok == 0 {
            return Err(ExecutorError::MechanismFailure(format!(
                "QueryServiceStatus({service_name}) failed"
            )));
        }
        if status.dwCurrentState != SERVICE_RUNNING {
            return Ok(());
        }

        let mut stop_status: SERVICE_STATUS = unsafe { std::mem::zeroed() };
        let ok = unsafe { ControlService(service.0, SERVICE_CONTROL_STOP, &mut stop_status) };
        if ok == 0 {
            return Err(ExecutorError::MechanismFailure(format!(
                "ControlService(stop, {service_name}) failed"
            )));
        }
        Ok(())
    }
}

#[cfg(not(windows))]
mod platform {
    use super::ExecutorError;
    use pha_protocol::policy::ServiceStartMode;

    pub fn query_start_mode(_service_name: &str) -> Result<ServiceStartMode, ExecutorError> {
        Err(ExecutorError::MechanismFailure(
            "service mechanism requires Windows".to_string(),
        ))
    }

    pub fn set_start_mode(
        _service_name: &str,
        _mode: ServiceStartMode,
    ) -> Result<(), ExecutorError> {
        Err(ExecutorError::MechanismFailure(
            "service mechanism requires Windows".to_string(),
        ))
    }

    pub fn stop_if_running(_service_name: &str) -> Result<(), ExecutorError> {
        Err(ExecutorError::MechanismFailure(
            "service mechanism requires Windows".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn mode_tag_roundtrips() {
        for mode in [
            ServiceStartMode::Boot,
            ServiceStartMode::System,
            ServiceStartMode::Automatic,
            ServiceStartMode::Manual,
            ServiceStartMode::Disabled,
        ] {
            assert_eq!(mode_from_tag(mode_tag(mode)).unwrap(), mode);
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(mode_from_tag("bogus").is_err());
    }
}
