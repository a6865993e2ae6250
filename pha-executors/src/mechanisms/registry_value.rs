//! Registry mechanism executor (spec §3/§4.3: `Mechanism::Registry`).
//!
//! Previous/new state is captured as `{"present": bool, "value": <json>}`
//! so revert can distinguish "restore this value" from "the value didn't
//! exist before, delete it".

use async_trait::async_trait;
use pha_protocol::policy::{Mechanism, Policy, RegistryHive, RegistryParams, RegistryValueKind};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;
use crate::executor::{ApplyOutcome, Executor, RevertOutcome, check_cancelled};

#[derive(Debug, Serialize, Deserialize)]
struct CapturedValue {
    present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
}

fn params(policy: &Policy) -> Result<&RegistryParams, ExecutorError> {
    match &policy.mechanism {
        Mechanism::Registry(params) => Ok(params),
        other => Err(ExecutorError::InvalidParams(format!(
            "expected registry mechanism, got {}",
            other.tag()
        ))),
    }
}

pub struct RegistryExecutor;

#[async_trait]
impl Executor for RegistryExecutor {
    fn mechanism_tag(&self) -> &'static str {
        "registry"
    }

    async fn probe_applied(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<bool, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        let current = platform::read_value(p)?;
        Ok(current
            .as_ref()
            .is_some_and(|v| values_equal(v, &p.applied_value)))
    }

    async fn get_current_value(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        let current = platform::read_value(p)?;
        serialize_captured(&CapturedValue {
            present: current.is_some(),
            value: current,
        })
    }

    async fn apply(
        &self,
        policy: &Policy,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ExecutorError> {
        check_cancelled(cancel)?;
        let p = params(policy)?;
        let previous = platform::read_value(p)?;
        let already_applied = previous
            .as_ref()
            .is_some_and(|v| values_equal(v, &p.applied_value));

        if !already_applied {
            platform::write_value(p, &p.applied_value)?;
        }

        let previous_state = serialize_captured(&CapturedValue {
            present: previous.is_some(),
            value: previous,
        })?;
        let new_state = serialize_captured(&CapturedValue {
            present: true,
            value: Some(p.applied_value.clone()),
        })?;

        Ok(ApplyOutcome {
            previous_state,
            new_state,
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
        let captured: CapturedValue = serde_json::from_str(previous_state)
            .map_err(|e| ExecutorError::InvalidParams(format!("bad previous_state: {e}")))?;

        if captured.present {
            let value = captured
                .value
                .ok_or_else(|| ExecutorError::InvalidParams("present=true but no value".into()))?;
            platform::write_value(p, &value)?;
        } else {
            platform::delete_value(p)?;
        }

        Ok(RevertOutcome {
            new_state: previous_state.to_string(),
        })
    }
}

fn values_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    a == b
}

fn serialize_captured(captured: &CapturedValue) -> Result<String, ExecutorError> {
    serde_json::to_string(captured)
        .map_err(|e| ExecutorError::MechanismFailure(format!("serialize state: {e}")))
}

#[cfg(windows)]
mod platform {
    use super::{ExecutorError, RegistryHive, RegistryParams, RegistryValueKind};
    use windows_sys::Win32::Foundation::{
        ERROR_FILE_NOT_FOUND, ERROR_SUCCESS, GetLastError, HANDLE,
    };
    use windows_sys::Win32::System::Registry::{
        HKEY, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS, KEY_READ, KEY_SET_VALUE,
        REG_BINARY, REG_DWORD, REG_MULTI_SZ, REG_OPTION_NON_VOLATILE, REG_QWORD, REG_SZ,
        RegCloseKey, RegCreateKeyExW, RegDeleteValueW, RegOpenKeyExW, RegQueryValueExW,
        RegSetValueExW,
    };

    fn hive_handle(hive: RegistryHive) -> HKEY {
        match hive {
            RegistryHive::HkeyLocalMachine => HKEY_LOCAL_MACHINE,
            RegistryHive::HkeyCurrentUser => HKEY_CURRENT_USER,
            RegistryHive::HkeyUsers => HKEY_USERS,
        }
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    struct OwnedKey(HKEY);

    impl Drop for OwnedKey {
        fn drop(&mut self) {
            unsafe {
                RegCloseKey(self.0);
            }
        }
    }

    fn open_for_read(params: &RegistryParams) -> Result<Option<OwnedKey>, ExecutorError> {
        let mut hkey: HKEY = std::ptr::null_mut();
        let path = wide(&params.key_path);
        let status = unsafe {
            RegOpenKeyExW(
                hive_handle(params.hive),
                path.as_ptr(),
                0,
                KEY_READ,
                &mut hkey,
            )
        };
        if status as u32 == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        if status as u32 != ERROR_SUCCESS {
            return Err(ExecutorError::Platform {
                code: status as i64,
                message: format!("RegOpenKeyExW({}) failed", params.key_path),
            });
        }
        Ok(Some(OwnedKey(hkey)))
    }

    fn open_or_create_for_write(params: &RegistryParams) -> Result<OwnedKey, ExecutorError> {
        let mut hkey: HKEY = std::ptr::null_mut();
        let path = wide(&params.key_path);
        let mut disposition: u32 = 0;
        let status = unsafe {
            RegCreateKeyExW(
                hive_handle(params.hive),
                path.as_ptr(),
                0,
                std::ptr::null_mut(),
                REG_OPTION_NON_VOLATILE,
                KEY_SET_VALUE,
                std::ptr::null_mut(),
                &mut hkey,
                &mut disposition,
            )
        };
        if status as u32 != ERROR_SUCCESS {
            return Err(ExecutorError::Platform {
                code: status as i64,
                message: format!("RegCreateKeyExW({}) failed", params.key_path),
            });
        }
        Ok(OwnedKey(hkey))
    }

    pub fn read_value(params: &RegistryParams) -> Result<Option<serde_json::Value>, ExecutorError> {
        let Some(key) = open_for_read(params)? else {
            return Ok(None);
        };
        let value_name = wide(&params.value_name);

        let mut value_type: u32 = 0;
        let mut data_len: u32 = 0;
        let status = unsafe {
            RegQueryValueExW(
                key.0,
                value_name.as_ptr(),
                std::ptr::null_mut(),
                &mut value_type,
                std::ptr::null_mut(),
                &mut data_len,
            )
        };
        if status as u32 == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        if status as u32 != ERROR_SUCCESS {
            return Err(ExecutorError::Platform {
                code: status as i64,
                message: format!("RegQueryValueExW({}) size probe failed", params.value_name),
            });
        }

        let mut buf = vec![0u8; data_len as usize];
        let mut actual_len = data_len;
        let status = unsafe {
            RegQueryValueExW(
                key.0,
                value_name.as_ptr(),
                std::ptr::null_mut(),
                &mut value_type,
                buf.as_mut_ptr(),
                &mut actual_len,
            )
        };
        if status as u32 != ERROR_SUCCESS {
            return Err(ExecutorError::Platform {
                code: status as i64,
                message: format!("RegQueryValueExW({}) read failed", params.value_name),
            });
        }
        buf.truncate(actual_len as usize);

        Ok(Some(decode_value(params.value_kind, &buf)))
    }

    fn decode_value(kind: RegistryValueKind, buf: &[u8]) -> serde_json::Value {
        match kind {
            RegistryValueKind::Dword => {
                let bytes: [u8; 4] = buf.get(..4).and_then(|s| s.try_into().ok()).unwrap_or([0; 4]);
                serde_json::json!(u32::from_le_bytes(bytes))
            }
            RegistryValueKind::Qword => {
                let bytes: [u8; 8] = buf.get(..8).and_then(|s| s.try_into().ok()).unwrap_or([0; 8]);
                serde_json::json!(u64::from_le_bytes(bytes))
            }
            RegistryValueKind::String => serde_json::json!(utf16_bytes_to_string(buf)),
            RegistryValueKind::MultiString => {
                let full = utf16_bytes_to_string(buf);
                let parts: Vec<&str> = full.split('\0').filter(|s| !s.is_empty()).collect();
                serde_json::json!(parts)
            }
            RegistryValueKind::Binary => {
                use base64::Engine;
                serde_json::json!(base64::engine::general_purpose::STANDARD.encode(buf))
            }
        }
    }

    fn utf16_bytes_to_string(buf: &[u8]) -> String {
        let units: Vec<u16> = buf
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
            .trim_end_matches('\0')
            .to_string()
    }

    fn encode_value(
        kind: RegistryValueKind,
        value: &serde_json::Value,
    ) -> Result<(u32, Vec<u8>), ExecutorError> {
        match kind {
            RegistryValueKind::Dword => {
                let n = value
                    .as_u64()
                    .ok_or_else(|| ExecutorError::InvalidParams("dword value not a number".into()))?
                    as u32;
                Ok((REG_DWORD, n.to_le_bytes().to_vec()))
            }
            RegistryValueKind::Qword => {
                let n = value
                    .as_u64()
                    .ok_or_else(|| ExecutorError::InvalidParams("qword value not a number".into()))?;
                Ok((REG_QWORD, n.to_le_bytes().to_vec()))
            }
            RegistryValueKind::String => {
                let s = value
                    .as_str()
                    .ok_or_else(|| ExecutorError::InvalidParams("string value not a string".into()))?;
                let w = wide(s);
                Ok((REG_SZ, w.iter().flat_map(|u| u.to_le_bytes()).collect()))
            }
            RegistryValueKind::MultiString => {
                let items = value.as_array().ok_or_else(|| {
                    ExecutorError::InvalidParams("multi_string value not an array".into())
                })?;
                let mut bytes = Vec::new();
                for item in items {
                    let s = item.as_str().ok_or_else(|| {
                        ExecutorError::InvalidParams("multi_string item not a string".into())
                    })?;
                    bytes.extend(s.encode_utf16().flat_map(|u| u.to_le_bytes()));
                    bytes.extend([0u8, 0u8]);
                }
                bytes.extend([0u8, 0u8]);
                Ok((REG_MULTI_SZ, bytes))
            }
            RegistryValueKind::Binary => {
                use base64::Engine;
                let s = value.as_str().ok_or_else(|| {
                    ExecutorError::InvalidParams("binary value not a base64 string".into())
                })?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| ExecutorError::InvalidParams(format!("bad base64: {e}")))?;
                Ok((REG_BINARY, bytes))
            }
        }
    }

    pub fn write_value(
        params: &RegistryParams,
        value: &serde_json::Value,
    ) -> Result<(), ExecutorError> {
        let key = open_or_create_for_write(params)?;
        let value_name = wide(&params.value_name);
        let (reg_type, bytes) = encode_value(params.value_kind, value)?;

        let status = unsafe {
            RegSetValueExW(
                key.0,
                value_name.as_ptr(),
                0,
                reg_type,
                bytes.as_ptr(),
                bytes.len() as u32,
            )
        };
        if status as u32 != ERROR_SUCCESS {
            return Err(ExecutorError::Platform {
                code: status as i64,
                message: format!("RegSetValueExW({}) failed", params.value_name),
            });
        }
        Ok(())
    }

    pub fn delete_value(params: &RegistryParams) -> Result<(), ExecutorError> {
        let Some(key) = open_for_read(params)? else {
            return Ok(());
        };
        // RegDeleteValueW needs KEY_SET_VALUE; re-open with write access.
        drop(key);
        let key = open_or_create_for_write(params)?;
        let value_name = wide(&params.value_name);
        let status = unsafe { RegDeleteValueW(key.0, value_name.as_ptr()) };
        if status as u32 != ERROR_SUCCESS && status as u32 != ERROR_FILE_NOT_FOUND {
            return Err(ExecutorError::Platform {
                code: status as i64,
                message: format!("RegDeleteValueW({}) failed", params.value_name),
            });
        }
        Ok(())
    }

    #[allow(dead_code)]
    fn last_error_code() -> u32 {
        unsafe { GetLastError() }
    }

    #[allow(dead_code)]
    type _UnusedHandle = HANDLE;
}

#[cfg(not(windows))]
mod platform {
    use super::{ExecutorError, RegistryParams};

    pub fn read_value(_params: &RegistryParams) -> Result<Option<serde_json::Value>, ExecutorError> {
        Err(ExecutorError::MechanismFailure(
            "registry mechanism requires Windows".to_string(),
        ))
    }

    pub fn write_value(
        _params: &RegistryParams,
        _value: &serde_json::Value,
    ) -> Result<(), ExecutorError> {
        Err(ExecutorError::MechanismFailure(
            "registry mechanism requires Windows".to_string(),
        ))
    }

    pub fn delete_value(_params: &RegistryParams) -> Result<(), ExecutorError> {
        Err(ExecutorError::MechanismFailure(
            "registry mechanism requires Windows".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pha_protocol::policy::{
        Applicability, ControlFlags, Reversibility, RiskLevel, SupportStatus,
    };

    fn policy(applied_value: serde_json::Value) -> Policy {
        Policy {
            policy_id: "tel-001".to_string(),
            version: "1.0.0".to_string(),
            name: "test".to_string(),
            description: String::new(),
            category: "test".to_string(),
            tags: vec![],
            mechanism: Mechanism::Registry(RegistryParams {
                hive: RegistryHive::HkeyLocalMachine,
                key_path: "SOFTWARE\\Policies\\Microsoft\\Windows\\DataCollection".to_string(),
                value_name: "AllowTelemetry".to_string(),
                value_kind: RegistryValueKind::Dword,
                applied_value,
            }),
            risk_level: RiskLevel::Low,
            support_status: SupportStatus::Supported,
            applicability: Applicability {
                min_build: 0,
                max_build: None,
                supported_skus: vec!["Professional".to_string()],
                excluded_skus: vec![],
                requires_device: false,
                deprecated_as_of_build: None,
            },
            reversibility: Reversibility {
                reversible: true,
                how: "restore previous value".to_string(),
            },
            known_breakage: vec![],
            dependencies: vec![],
            control_flags: ControlFlags::default(),
            help_text: None,
            allowed_values: vec![],
        }
    }

    #[test]
    fn captured_value_roundtrips_through_json() {
        let captured = CapturedValue {
            present: true,
            value: Some(serde_json::json!(1)),
        };
        let json = serialize_captured(&captured).unwrap();
        let back: CapturedValue = serde_json::from_str(&json).unwrap();
        assert!(back.present);
        assert_eq!(back.value, Some(serde_json::json!(1)));
    }

    #[test]
    fn wrong_mechanism_type_is_invalid_params() {
        let mut p = policy(serde_json::json!(0));
        p.mechanism = Mechanism::Mdm(serde_json::json!({}));
        assert!(params(&p).is_err());
    }
}
