//! Pre-main process hardening for a privileged service binary.
//!
//! `phagentd` runs as a privileged, long-lived process, which makes it a more
//! attractive debugging/injection target than an ordinary CLI. This crate
//! applies a handful of OS-level self-protections before the service does
//! anything else:
//! - Core dumps disabled (a crash must not spill credentials or registry
//!   state to disk).
//! - Debugger attachment prevented.
//! - Library-injection environment variables (`LD_*`, `DYLD_*`) stripped.
//! - On Windows: `SeDebugPrivilege` dropped from the process token and DEP
//!   enforced via the process mitigation policy.
//!
//! Call `pre_main_hardening()` as the first statement in `main()`.

/// Performs the hardening steps appropriate for the current platform.
///
/// On failure of a step that cannot be skipped safely, the process exits
/// with a non-zero code rather than continuing in an unhardened state.
pub fn pre_main_hardening() {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pre_main_hardening_linux();

    #[cfg(target_os = "macos")]
    pre_main_hardening_macos();

    #[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
    pre_main_hardening_bsd();

    #[cfg(windows)]
    pre_main_hardening_windows();
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const PRCTL_FAILED_EXIT_CODE: i32 = 5;

#[cfg(target_os = "macos")]
const PTRACE_DENY_ATTACH_FAILED_EXIT_CODE: i32 = 6;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
const SET_RLIMIT_CORE_FAILED_EXIT_CODE: i32 = 7;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn pre_main_hardening_linux() {
    let ret_code = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) };
    if ret_code != 0 {
        eprintln!(
            "ERROR: prctl(PR_SET_DUMPABLE, 0) failed: {}",
            std::io::Error::last_os_error()
        );
        std::process::exit(PRCTL_FAILED_EXIT_CODE);
    }

    set_core_file_size_limit_to_zero();
    strip_env_prefix("LD_");
}

#[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
fn pre_main_hardening_bsd() {
    set_core_file_size_limit_to_zero();
    strip_env_prefix("LD_");
}

#[cfg(target_os = "macos")]
fn pre_main_hardening_macos() {
    let ret_code = unsafe { libc::ptrace(libc::PT_DENY_ATTACH, 0, std::ptr::null_mut(), 0) };
    if ret_code == -1 {
        eprintln!(
            "ERROR: ptrace(PT_DENY_ATTACH) failed: {}",
            std::io::Error::last_os_error()
        );
        std::process::exit(PTRACE_DENY_ATTACH_FAILED_EXIT_CODE);
    }

    set_core_file_size_limit_to_zero();
    strip_env_prefix("DYLD_");
}

#[cfg(unix)]
fn set_core_file_size_limit_to_zero() {
    let rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    let ret_code = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlim) };
    if ret_code != 0 {
        eprintln!(
            "ERROR: setrlimit(RLIMIT_CORE) failed: {}",
            std::io::Error::last_os_error()
        );
        std::process::exit(SET_RLIMIT_CORE_FAILED_EXIT_CODE);
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd"
))]
fn strip_env_prefix(prefix: &str) {
    let keys: Vec<String> = std::env::vars()
        .filter_map(|(key, _)| key.starts_with(prefix).then_some(key))
        .collect();

    for key in keys {
        unsafe {
            std::env::remove_var(key);
        }
    }
}

#[cfg(windows)]
fn pre_main_hardening_windows() {
    windows_impl::enforce_dep();
    windows_impl::drop_debug_privilege();
}

#[cfg(windows)]
mod windows_impl {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, LUID};
    use windows_sys::Win32::Security::{
        AdjustTokenPrivileges, LUID_AND_ATTRIBUTES, LookupPrivilegeValueW,
        SE_PRIVILEGE_REMOVED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{
        GetCurrentProcess, OpenProcessToken, PROCESS_MITIGATION_DEP_POLICY,
        ProcessDEPPolicy, SetProcessMitigationPolicy,
    };

    /// Enforces hardware DEP even if the binary was built without
    /// `/NXCOMPAT`. Best-effort: a service that already has DEP from the
    /// linker should see this as a no-op.
    pub(super) fn enforce_dep() {
        let policy = PROCESS_MITIGATION_DEP_POLICY {
            Flags: 1, // ENABLE
            Permanent: 0,
        };
        unsafe {
            SetProcessMitigationPolicy(
                ProcessDEPPolicy,
                &policy as *const _ as *const core::ffi::c_void,
                std::mem::size_of::<PROCESS_MITIGATION_DEP_POLICY>(),
            );
        }
    }

    /// Removes `SeDebugPrivilege` from this process's token, if present.
    /// A privileged service that never needs to attach to other processes
    /// should not be carrying around the privilege that lets it.
    pub(super) fn drop_debug_privilege() {
        unsafe {
            let mut token: HANDLE = std::ptr::null_mut();
            if OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
                &mut token,
            ) == 0
            {
                return;
            }

            let name: Vec<u16> = "SeDebugPrivilege\0".encode_utf16().collect();
            let mut luid = LUID {
                LowPart: 0,
                HighPart: 0,
            };
            if LookupPrivilegeValueW(std::ptr::null(), name.as_ptr(), &mut luid) != 0 {
                let mut privileges = TOKEN_PRIVILEGES {
                    PrivilegeCount: 1,
                    Privileges: [LUID_AND_ATTRIBUTES {
                        Luid: luid,
                        Attributes: SE_PRIVILEGE_REMOVED,
                    }],
                };
                AdjustTokenPrivileges(
                    token,
                    0,
                    &mut privileges,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                );
            }

            CloseHandle(token);
        }
    }
}
