//! Small wrappers over the Win32 calls the shell makes directly: wide
//! strings, owned handles, token SIDs and terminal-services sessions.

use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::ptr::{null, null_mut};

use hostshim_core::error::{Result, ShimError};
use winapi::shared::minwindef::{DWORD, FALSE};
use winapi::shared::sddl::ConvertSidToStringSidW;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::processthreadsapi::{
    GetCurrentProcess, GetCurrentProcessId, OpenProcessToken, ProcessIdToSessionId,
};
use winapi::um::securitybaseapi::GetTokenInformation;
use winapi::um::winbase::{LocalFree, LookupAccountSidW, WTSGetActiveConsoleSessionId};
use winapi::um::winnt::{HANDLE, LPWSTR, PSID, SID_NAME_USE, TOKEN_QUERY, TOKEN_USER, TokenUser};
use winapi::um::wtsapi32::WTSQueryUserToken;

/// Returned by `WTSGetActiveConsoleSessionId` when nobody is attached.
const NO_CONSOLE_SESSION: DWORD = 0xFFFF_FFFF;

pub fn to_wide_string(s: &str) -> Vec<u16> {
    OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

/// Decodes up to the first NUL.
pub fn from_wide(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

/// # Safety
/// `ptr` must point at a NUL-terminated UTF-16 string.
unsafe fn from_wide_ptr(ptr: *const u16) -> String {
    let mut len = 0;
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    String::from_utf16_lossy(unsafe { std::slice::from_raw_parts(ptr, len) })
}

/// The thread's last Win32 error, tagged with the failing call.
pub fn last_error(call: &str) -> ShimError {
    let err = io::Error::last_os_error();
    ShimError::Io(io::Error::new(err.kind(), format!("{call}: {err}")))
}

/// An error code returned directly (registry calls do this).
pub fn os_error(call: &str, code: i32) -> ShimError {
    let err = io::Error::from_raw_os_error(code);
    ShimError::Io(io::Error::new(err.kind(), format!("{call}: {err}")))
}

/// A kernel handle closed on drop.
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub fn new(handle: HANDLE, call: &str) -> Result<Self> {
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            Err(last_error(call))
        } else {
            Ok(Self(handle))
        }
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// Token of the running process.
pub fn own_token() -> Result<OwnedHandle> {
    let mut token: HANDLE = null_mut();
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) } == FALSE {
        return Err(last_error("OpenProcessToken"));
    }
    OwnedHandle::new(token, "OpenProcessToken")
}

/// Primary token of the user logged on to `session`. Only LocalSystem may
/// ask for someone else's.
pub fn session_token(session: u32) -> Result<OwnedHandle> {
    let mut token: HANDLE = null_mut();
    if unsafe { WTSQueryUserToken(session, &mut token) } == FALSE {
        return Err(last_error("WTSQueryUserToken"));
    }
    OwnedHandle::new(token, "WTSQueryUserToken")
}

/// Calls `f` with the user SID recorded in `token`.
pub fn with_token_sid<T>(token: &OwnedHandle, f: impl FnOnce(PSID) -> Result<T>) -> Result<T> {
    let mut needed: DWORD = 0;
    unsafe { GetTokenInformation(token.raw(), TokenUser, null_mut(), 0, &mut needed) };
    if needed == 0 {
        return Err(last_error("GetTokenInformation"));
    }
    // u64 storage keeps TOKEN_USER's pointer field aligned.
    let mut buf = vec![0u64; (needed as usize).div_ceil(8)];
    let ok = unsafe {
        GetTokenInformation(token.raw(), TokenUser, buf.as_mut_ptr().cast(), needed, &mut needed)
    };
    if ok == FALSE {
        return Err(last_error("GetTokenInformation"));
    }
    let user = unsafe { &*(buf.as_ptr() as *const TOKEN_USER) };
    f(user.User.Sid)
}

/// `S-1-5-21-...` form of a SID.
pub fn sid_to_string(sid: PSID) -> Result<String> {
    let mut raw: LPWSTR = null_mut();
    if unsafe { ConvertSidToStringSidW(sid, &mut raw) } == FALSE {
        return Err(last_error("ConvertSidToStringSidW"));
    }
    let text = unsafe { from_wide_ptr(raw) };
    unsafe { LocalFree(raw.cast()) };
    Ok(text)
}

/// `DOMAIN\user` for a SID, when the account can be resolved.
pub fn account_name(sid: PSID) -> Option<String> {
    let mut name = [0u16; 256];
    let mut domain = [0u16; 256];
    let mut name_len = name.len() as DWORD;
    let mut domain_len = domain.len() as DWORD;
    let mut kind: SID_NAME_USE = 0;
    let ok = unsafe {
        LookupAccountSidW(
            null(),
            sid,
            name.as_mut_ptr(),
            &mut name_len,
            domain.as_mut_ptr(),
            &mut domain_len,
            &mut kind,
        )
    };
    if ok == FALSE {
        return None;
    }
    let (name, domain) = (from_wide(&name), from_wide(&domain));
    Some(if domain.is_empty() {
        name
    } else {
        format!("{domain}\\{name}")
    })
}

pub fn own_session_id() -> Result<u32> {
    let mut session: DWORD = 0;
    if unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session) } == FALSE {
        return Err(last_error("ProcessIdToSessionId"));
    }
    Ok(session)
}

/// Session attached to the physical console.
pub fn console_session_id() -> Result<u32> {
    match unsafe { WTSGetActiveConsoleSessionId() } {
        NO_CONSOLE_SESSION => Err(ShimError::NoUserSession),
        session => Ok(session),
    }
}

/// SID string of the user owning `session`.
pub fn session_user_sid(session: u32) -> Result<String> {
    let token = session_token(session)?;
    with_token_sid(&token, sid_to_string)
}
