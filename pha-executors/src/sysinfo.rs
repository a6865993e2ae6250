//! System State Probe (spec §4.5): captures the live [`SystemInfo`] facts
//! that applicability gating and snapshot/drift comparisons run against.
//!
//! Every fact here is read, never cached across calls -- the caller decides
//! how often to re-probe (the drift monitor's interval, or once per command
//! for the non-privileged read paths).

use pha_protocol::sysinfo::SystemInfo;

use crate::error::ExecutorError;

/// Probe the current system's identity facts.
pub fn probe() -> Result<SystemInfo, ExecutorError> {
    platform::probe()
}

#[cfg(windows)]
mod platform {
    use super::{ExecutorError, SystemInfo};
    use windows_sys::Win32::Foundation::ERROR_SUCCESS;
    use windows_sys::Win32::System::Registry::{
        HKEY, HKEY_LOCAL_MACHINE, KEY_READ, REG_DWORD, REG_SZ, RegCloseKey, RegOpenKeyExW,
        RegQueryValueExW,
    };

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

    fn open(hive: HKEY, path: &str) -> Result<Option<OwnedKey>, ExecutorError> {
        let mut hkey: HKEY = std::ptr::null_mut();
        let wpath = wide(path);
        let status = unsafe { RegOpenKeyExW(hive, wpath.as_ptr(), 0, KEY_READ, &mut hkey) };
        if status as u32 != ERROR_SUCCESS {
            return Ok(None);
        }
        Ok(Some(OwnedKey(hkey)))
    }

    fn read_raw(key: &OwnedKey, value_name: &str) -> Option<(u32, Vec<u8>)> {
        let wname = wide(value_name);
        let mut value_type: u32 = 0;
        let mut data_len: u32 = 0;
        let status = unsafe {
            RegQueryValueExW(
                key.0,
                wname.as_ptr(),
                std::ptr::null_mut(),
                &mut value_type,
                std::ptr::null_mut(),
                &mut data_len,
            )
        };
        if status as u32 != ERROR_SUCCESS {
            return None;
        }
        let mut buf = vec![0u8; data_len as usize];
        let mut actual = data_len;
        let status = unsafe {
            RegQueryValueExW(
                key.0,
                wname.as_ptr(),
                std::ptr::null_mut(),
                &mut value_type,
                buf.as_mut_ptr(),
                &mut actual,
            )
        };
        if status as u32 != ERROR_SUCCESS {
            return None;
        }
        buf.truncate(actual as usize);
        Some((value_type, buf))
    }

    fn read_string(key: &OwnedKey, value_name: &str) -> Option<String> {
        let (value_type, buf) = read_raw(key, value_name)?;
        if value_type != REG_SZ {
            return None;
        }
        let units: Vec<u16> = buf
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Some(
            String::from_utf16_lossy(&units)
                .trim_end_matches('\0')
                .to_string(),
        )
    }

    fn read_dword(key: &OwnedKey, value_name: &str) -> Option<u32> {
        let (value_type, buf) = read_raw(key, value_name)?;
        if value_type != REG_DWORD {
            return None;
        }
        let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    fn current_version_key() -> Result<OwnedKey, ExecutorError> {
        open(
            HKEY_LOCAL_MACHINE,
            r"SOFTWARE\Microsoft\Windows NT\CurrentVersion",
        )?
        .ok_or_else(|| {
            ExecutorError::MechanismFailure(
                "HKLM\\SOFTWARE\\Microsoft\\Windows NT\\CurrentVersion is missing".to_string(),
            )
        })
    }

    fn build_number(key: &OwnedKey) -> u32 {
        read_string(key, "CurrentBuildNumber")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn domain_joined() -> bool {
        // NetGetJoinInformation lives in netapi32 and is the authoritative
        // source, but the registry mirror under this key tracks the same
        // fact without the extra LSA round trip and matches what the other
        // probes in this module already do.
        matches!(
            open(HKEY_LOCAL_MACHINE, r"SYSTEM\CurrentControlSet\Services\Netlogon\Parameters")
                .ok()
                .flatten()
                .and_then(|key| read_dword(&key, "DomainJoined")),
            Some(1)
        )
    }

    fn mdm_managed() -> bool {
        open(HKEY_LOCAL_MACHINE, r"SOFTWARE\Microsoft\Enrollments")
            .ok()
            .flatten()
            .is_some()
    }

    fn tamper_protection_enabled() -> bool {
        matches!(
            open(
                HKEY_LOCAL_MACHINE,
                r"SOFTWARE\Microsoft\Windows Defender\Features",
            )
            .ok()
            .flatten()
            .and_then(|key| read_dword(&key, "TamperProtection")),
            Some(5)
        )
    }

    pub fn probe() -> Result<SystemInfo, ExecutorError> {
        let key = current_version_key()?;
        let build = build_number(&key);
        let display_version =
            read_string(&key, "DisplayVersion").unwrap_or_else(|| "unknown".to_string());
        let sku_name = read_string(&key, "EditionID").unwrap_or_else(|| "unknown".to_string());

        Ok(SystemInfo {
            build_number: build,
            version_string: format!("10.0.{build} ({display_version})"),
            sku_name,
            domain_joined: domain_joined(),
            mdm_managed: mdm_managed(),
            tamper_protection_enabled: tamper_protection_enabled(),
        })
    }
}

#[cfg(not(windows))]
mod platform {
    use super::{ExecutorError, SystemInfo};

    pub fn probe() -> Result<SystemInfo, ExecutorError> {
        Err(ExecutorError::MechanismFailure(
            "system state probe requires Windows".to_string(),
        ))
    }
}

#[cfg(all(test, not(windows)))]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn non_windows_probe_fails_closed() {
        assert!(probe().is_err());
    }
}
