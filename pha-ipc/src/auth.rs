//! Caller authorization (spec §6, §8 boundary table).
//!
//! Every accepted connection is identified exactly once, right after
//! `connect`/`accept`, before a single byte of the command stream is read.
//! The identity never changes for the lifetime of the connection. Mutating
//! commands (everything except `Audit`, `GetState`, `GetPolicies`,
//! `DetectDrift`) additionally require ALL THREE of: local-administrators
//! group membership, High integrity or better, and an Authenticode-trusted
//! caller image (spec §8). Read-only commands only require that the caller
//! could be identified at all.
//!
//! Fail-closed by construction: every one of the three checks defaults to
//! "not privileged" when it cannot be performed (unreadable token,
//! unreadable image path, `WinVerifyTrust` failure), and [`parse_integrity_rid`]
//! maps anything that isn't a recognizable mandatory-label SID to RID `0`,
//! which never clears [`MIN_PRIVILEGED_INTEGRITY_RID`].

use pha_protocol::envelope::CommandType;
use pha_protocol::error::AgentError;
use pha_protocol::integrity::is_privileged_integrity;

/// What the transport learned about the process on the other end of the
/// pipe/socket.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub integrity_rid: u32,
    /// True iff the caller's token is a member of the local Administrators
    /// group (`BUILTIN\Administrators`, spec §8).
    pub is_admin: bool,
    /// True iff the caller's executable image passed `WinVerifyTrust`
    /// (Authenticode signature chains to a trusted root, spec §8).
    pub is_code_signed: bool,
    pub process_id: u32,
    /// Best-effort description for audit logging (e.g. the image path);
    /// never parsed, only logged.
    pub description: String,
}

impl CallerIdentity {
    /// All three spec §8 factors, ANDed: group membership, integrity, and
    /// image trust. Any one of them being false denies privileged commands.
    pub fn is_privileged(&self) -> bool {
        self.is_admin && is_privileged_integrity(self.integrity_rid) && self.is_code_signed
    }
}

/// Commands that mutate system or store state and therefore require a
/// privileged caller. Everything else is read-only.
pub fn requires_privilege(command_type: CommandType) -> bool {
    matches!(
        command_type,
        CommandType::Apply | CommandType::Revert | CommandType::CreateSnapshot | CommandType::ReloadCatalog
    )
}

/// Fails closed: unknown/garbage identities are never treated as privileged.
pub fn authorize(identity: &CallerIdentity, command_type: CommandType) -> Result<(), AgentError> {
    if requires_privilege(command_type) && !identity.is_privileged() {
        return Err(AgentError::Unauthorized);
    }
    Ok(())
}

#[cfg(windows)]
pub mod platform {
    //! Identifies the client process on a named pipe via three independent
    //! primitives (spec §8): its access token's `TokenIntegrityLevel` (the
    //! same one UAC elevation checks use), `CheckTokenMembership` against
    //! `BUILTIN\Administrators`, and `WinVerifyTrust` against the caller's
    //! own executable image.

    use super::CallerIdentity;
    use std::io;
    use tokio::net::windows::named_pipe::NamedPipeServer;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        CheckTokenMembership, CreateWellKnownSid, DuplicateToken, GetTokenInformation, OpenProcessToken,
        SecurityImpersonation, TokenIntegrityLevel, TOKEN_DUPLICATE, TOKEN_MANDATORY_LABEL, TOKEN_QUERY,
        WinBuiltinAdministratorsSid,
    };
    use windows_sys::Win32::Security::WinTrust::{
        WinVerifyTrust, WINTRUST_ACTION_GENERIC_VERIFY_V2, WINTRUST_DATA, WINTRUST_DATA_0, WINTRUST_FILE_INFO,
        WTD_CHOICE_FILE, WTD_REVOKE_NONE, WTD_STATEACTION_VERIFY, WTD_UI_NONE,
    };
    use windows_sys::Win32::System::Pipes::GetNamedPipeClientProcessId;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, QueryFullProcessImageNameW, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    /// `SECURITY_MAX_SID_SIZE`: the largest a well-known SID (such as
    /// `BUILTIN\Administrators`) can be.
    const SECURITY_MAX_SID_SIZE: usize = 68;

    pub fn identify(pipe: &NamedPipeServer) -> io::Result<CallerIdentity> {
        use std::os::windows::io::AsRawHandle;

        let pipe_handle = pipe.as_raw_handle() as HANDLE;
        let mut process_id: u32 = 0;
        // SAFETY: `pipe_handle` is a live named-pipe server handle owned by
        // `pipe` for the duration of this call.
        if unsafe { GetNamedPipeClientProcessId(pipe_handle, &mut process_id) } == 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `PROCESS_QUERY_LIMITED_INFORMATION` is enough to read the
        // token and the image path; `process_id` came straight from the pipe
        // handle above.
        let process = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, process_id) };
        if process == 0 {
            // The client process has already exited; every factor fails
            // closed rather than erroring the whole connection out.
            return Ok(CallerIdentity {
                integrity_rid: 0,
                is_admin: false,
                is_code_signed: false,
                process_id,
                description: format!("pid {process_id} (process exited before identification)"),
            });
        }

        let (integrity_rid, is_admin) = token_factors(process).unwrap_or((0, false));
        let is_code_signed = image_path(process)
            .map(|path| is_authenticode_trusted(&path))
            .unwrap_or(false);

        // SAFETY: `process` was returned by the `OpenProcess` call above and
        // is not used again after this.
        unsafe { CloseHandle(process) };

        Ok(CallerIdentity {
            integrity_rid,
            is_admin,
            is_code_signed,
            process_id,
            description: format!("pid {process_id}"),
        })
    }

    /// Opens the process token once and reads both the integrity level and
    /// `BUILTIN\Administrators` membership off it.
    fn token_factors(process: HANDLE) -> io::Result<(u32, bool)> {
        unsafe {
            let mut token: HANDLE = 0;
            if OpenProcessToken(process, TOKEN_QUERY | TOKEN_DUPLICATE, &mut token) == 0 {
                return Err(io::Error::last_os_error());
            }
            let result = (|| {
                let rid = read_integrity_rid(token)?;
                let is_admin = token_is_admin_member(token)?;
                Ok((rid, is_admin))
            })();
            CloseHandle(token);
            result
        }
    }

    /// SAFETY: `token` must be a valid, open access-token handle with
    /// `TOKEN_QUERY` rights; this function does not take ownership of it.
    unsafe fn read_integrity_rid(token: HANDLE) -> io::Result<u32> {
        let mut needed: u32 = 0;
        GetTokenInformation(token, TokenIntegrityLevel, std::ptr::null_mut(), 0, &mut needed);
        if needed == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut buf = vec![0u8; needed as usize];
        if GetTokenInformation(
            token,
            TokenIntegrityLevel,
            buf.as_mut_ptr().cast(),
            needed,
            &mut needed,
        ) == 0
        {
            return Err(io::Error::last_os_error());
        }

        let label = &*(buf.as_ptr().cast::<TOKEN_MANDATORY_LABEL>());
        let sid_ptr = label.Label.Sid as *const core::ffi::c_void;
        Ok(crate::auth::platform::rid_from_sid_ptr(sid_ptr))
    }

    /// SAFETY: `sid` must point to a valid `SID` structure, as produced by
    /// `GetTokenInformation(TokenIntegrityLevel, ...)`.
    unsafe fn rid_from_sid_ptr(sid: *const core::ffi::c_void) -> u32 {
        use windows_sys::Win32::Security::SID;
        let sid = sid.cast::<SID>();
        let count = (*sid).SubAuthorityCount as usize;
        if count == 0 {
            return 0;
        }
        *(*sid).SubAuthority.as_ptr().add(count - 1)
    }

    /// `CheckTokenMembership` requires an impersonation-level token, not the
    /// primary token `OpenProcessToken` hands back, so a throwaway
    /// impersonation duplicate is made first.
    ///
    /// SAFETY: `token` must be a valid, open access-token handle with
    /// `TOKEN_DUPLICATE` rights; this function does not take ownership of it.
    unsafe fn token_is_admin_member(token: HANDLE) -> io::Result<bool> {
        let mut impersonation_token: HANDLE = 0;
        if DuplicateToken(token, SecurityImpersonation, &mut impersonation_token) == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut sid_buf = [0u8; SECURITY_MAX_SID_SIZE];
        let mut sid_size = SECURITY_MAX_SID_SIZE as u32;
        if CreateWellKnownSid(
            WinBuiltinAdministratorsSid,
            std::ptr::null(),
            sid_buf.as_mut_ptr().cast(),
            &mut sid_size,
        ) == 0
        {
            CloseHandle(impersonation_token);
            return Err(io::Error::last_os_error());
        }

        let mut is_member: i32 = 0;
        let checked = CheckTokenMembership(impersonation_token, sid_buf.as_mut_ptr().cast(), &mut is_member);
        CloseHandle(impersonation_token);
        if checked == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(is_member != 0)
    }

    /// SAFETY: `process` must be a valid, open process handle with
    /// `PROCESS_QUERY_LIMITED_INFORMATION` rights.
    fn image_path(process: HANDLE) -> io::Result<String> {
        let mut buf = [0u16; 1024];
        let mut size = buf.len() as u32;
        // SAFETY: `buf` is sized to `size` and both are passed consistently.
        if unsafe { QueryFullProcessImageNameW(process, 0, buf.as_mut_ptr(), &mut size) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(String::from_utf16_lossy(&buf[..size as usize]))
    }

    /// Runs `WinVerifyTrust` against `path` with the generic Authenticode
    /// verify action; true only if the image's signature chains to a
    /// trusted root. Any failure (unsigned, revoked, untrusted root, I/O
    /// error reading the file) returns false -- this check fails closed.
    fn is_authenticode_trusted(path: &str) -> bool {
        let wide_path: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();

        let mut file_info = WINTRUST_FILE_INFO {
            cbStruct: std::mem::size_of::<WINTRUST_FILE_INFO>() as u32,
            pcwszFilePath: wide_path.as_ptr(),
            hFile: 0,
            pgKnownSubject: std::ptr::null(),
        };

        let mut trust_data = WINTRUST_DATA {
            cbStruct: std::mem::size_of::<WINTRUST_DATA>() as u32,
            pPolicyCallbackData: std::ptr::null_mut(),
            pSIPClientData: std::ptr::null_mut(),
            dwUIChoice: WTD_UI_NONE,
            fdwRevocationChecks: WTD_REVOKE_NONE,
            dwUnionChoice: WTD_CHOICE_FILE,
            Anonymous: WINTRUST_DATA_0 {
                pFile: &mut file_info,
            },
            dwStateAction: WTD_STATEACTION_VERIFY,
            hWVTStateData: 0,
            pwszURLReference: std::ptr::null_mut(),
            dwProvFlags: 0,
            dwUIContext: 0,
            pSignatureSettings: std::ptr::null_mut(),
        };

        let mut action_guid = WINTRUST_ACTION_GENERIC_VERIFY_V2;
        // SAFETY: `action_guid` and `trust_data` are both fully initialized
        // and outlive the call; `INVALID_HANDLE_VALUE` (-1) tells
        // `WinVerifyTrust` there is no UI owner window.
        let status = unsafe { WinVerifyTrust(-1isize as HANDLE, &mut action_guid, &mut trust_data as *mut _ as *mut core::ffi::c_void) };
        status == 0
    }
}

#[cfg(not(windows))]
pub mod platform {
    //! No mandatory-integrity-label concept exists off Windows. Every
    //! caller is identified as present but unprivileged, so mutating
    //! commands fail closed with `Unauthorized` rather than silently
    //! granting them -- this transport exists so the rest of the crate is
    //! exercised in CI, not as a production deployment target (spec §1:
    //! Windows-only scope).

    use super::CallerIdentity;
    use std::io;
    use tokio::net::UnixStream;

    pub fn identify(_stream: &UnixStream) -> io::Result<CallerIdentity> {
        Ok(CallerIdentity {
            integrity_rid: 0,
            is_admin: false,
            is_code_signed: false,
            process_id: 0,
            description: "unix socket peer (unprivileged by construction)".to_string(),
        })
    }
}
