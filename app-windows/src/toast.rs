//! Tray balloon notifications through PowerShell.

use std::mem::{size_of, zeroed};
use std::ptr::{null, null_mut};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hostshim_core::error::Result;
use hostshim_core::platform::Toaster;
use hostshim_core::shell::{CommandRunner, CommandSpec};
use hostshim_core::toast::{
    Toast, ToastOutcome, ToastTarget, powershell_balloon_script,
    powershell_balloon_script_inline, resolve_toast_target,
};
use log::{debug, info, warn};
use winapi::shared::minwindef::{DWORD, FALSE};
use winapi::um::processthreadsapi::{
    CreateProcessAsUserW, PROCESS_INFORMATION, STARTUPINFOW, TerminateProcess,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{CREATE_NO_WINDOW, WAIT_OBJECT_0};

use crate::win32::{self, OwnedHandle, last_error, to_wide_string};

/// The shell keeps a balloon up for at least this long regardless of what
/// `ShowBalloonTip` asks for.
pub const BALLOON_TIMEOUT_SECS: u64 = 10;

/// Grace period on top of the balloon timeout for PowerShell start-up.
const STARTUP_GRACE: Duration = Duration::from_secs(10);

/// `-EncodedCommand` takes base64 over UTF-16LE.
pub fn encode_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

pub struct BalloonToaster {
    runner: Arc<dyn CommandRunner>,
}

impl BalloonToaster {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn deadline() -> Duration {
        Duration::from_secs(BALLOON_TIMEOUT_SECS) + STARTUP_GRACE
    }

    fn toast_here(&self, toast: &Toast) -> Result<ToastOutcome> {
        let spec = CommandSpec::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command", "-"])
            .env("_title", toast.title.as_str())
            .env("_caption", toast.caption.as_str())
            .stdin(powershell_balloon_script(BALLOON_TIMEOUT_SECS))
            .timeout(Self::deadline());
        let stdout = self.runner.run(&spec)?.checked_stdout("powershell")?;
        debug!("powershell: {}", stdout.trim());
        Ok(ToastOutcome::Dismissed)
    }

    /// Launches PowerShell on `session`'s desktop with that user's token.
    fn toast_in_session(&self, toast: &Toast, session: u32) -> Result<ToastOutcome> {
        let token = win32::session_token(session)?;
        let script = powershell_balloon_script_inline(toast, BALLOON_TIMEOUT_SECS);
        let mut command_line = to_wide_string(&format!(
            "powershell.exe -NoProfile -NonInteractive -WindowStyle Hidden -EncodedCommand {}",
            encode_command(&script)
        ));
        let mut desktop = to_wide_string(r"winsta0\default");

        let mut startup: STARTUPINFOW = unsafe { zeroed() };
        startup.cb = size_of::<STARTUPINFOW>() as DWORD;
        startup.lpDesktop = desktop.as_mut_ptr();
        let mut process: PROCESS_INFORMATION = unsafe { zeroed() };

        let ok = unsafe {
            CreateProcessAsUserW(
                token.raw(),
                null(),
                command_line.as_mut_ptr(),
                null_mut(),
                null_mut(),
                FALSE,
                CREATE_NO_WINDOW,
                null_mut(),
                null(),
                &mut startup,
                &mut process,
            )
        };
        if ok == FALSE {
            return Err(last_error("CreateProcessAsUserW"));
        }
        let _thread = OwnedHandle::new(process.hThread, "CreateProcessAsUserW")?;
        let child = OwnedHandle::new(process.hProcess, "CreateProcessAsUserW")?;
        info!("Toast shown in session {session} (pid {})", process.dwProcessId);

        let wait_ms = Self::deadline().as_millis() as DWORD;
        if unsafe { WaitForSingleObject(child.raw(), wait_ms) } != WAIT_OBJECT_0 {
            warn!("Toast helper in session {session} did not exit; terminating");
            unsafe { TerminateProcess(child.raw(), 1) };
        }
        Ok(ToastOutcome::Dismissed)
    }
}

impl Toaster for BalloonToaster {
    fn toast(&self, toast: &Toast) -> Result<ToastOutcome> {
        let own_session = win32::own_session_id()?;
        let target = resolve_toast_target(toast.session, win32::console_session_id(), own_session)?;
        debug!("Toast target: {target:?}");
        match target {
            ToastTarget::OwnSession => self.toast_here(toast),
            ToastTarget::UserSession(session) => self.toast_in_session(toast, session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_command_is_utf16le_base64() {
        // "dir" as UTF-16LE is 64 00 69 00 72 00.
        assert_eq!(encode_command("dir"), "ZABpAHIA");
    }
}
