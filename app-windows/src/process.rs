//! Process enumeration from a Toolhelp32 snapshot.

use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::Arc;

use hostshim_core::error::Result;
use hostshim_core::platform::ProcessManager;
use hostshim_core::process::{
    ProcessInfo, ProcessStatus, ProcessTable, find_in_table, parse_process_csv,
};
use hostshim_core::shell::{CommandRunner, CommandSpec};
use log::debug;
use winapi::shared::minwindef::{DWORD, FALSE};
use winapi::um::processthreadsapi::{OpenProcess, OpenProcessToken};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
    TH32CS_SNAPPROCESS,
};
use winapi::um::winbase::QueryFullProcessImageNameW;
use winapi::um::winnt::{HANDLE, PROCESS_QUERY_LIMITED_INFORMATION, TOKEN_QUERY};

use crate::win32::{self, OwnedHandle, from_wide};

pub struct ToolhelpProcessManager {
    runner: Arc<dyn CommandRunner>,
}

impl ToolhelpProcessManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

fn open_process(pid: u32) -> Option<OwnedHandle> {
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid) };
    OwnedHandle::new(handle, "OpenProcess").ok()
}

fn image_path(process: &OwnedHandle) -> Option<String> {
    let mut buf = [0u16; 1024];
    let mut len = buf.len() as DWORD;
    let ok = unsafe { QueryFullProcessImageNameW(process.raw(), 0, buf.as_mut_ptr(), &mut len) };
    (ok != FALSE).then(|| from_wide(&buf[..len as usize]))
}

fn process_user(process: &OwnedHandle) -> Option<String> {
    let mut token: HANDLE = null_mut();
    if unsafe { OpenProcessToken(process.raw(), TOKEN_QUERY, &mut token) } == FALSE {
        return None;
    }
    let token = OwnedHandle::new(token, "OpenProcessToken").ok()?;
    win32::with_token_sid(&token, |sid| Ok(win32::account_name(sid)))
        .ok()
        .flatten()
}

impl ProcessManager for ToolhelpProcessManager {
    fn list_processes(&self) -> Result<ProcessTable> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
        let snapshot = OwnedHandle::new(snapshot, "CreateToolhelp32Snapshot")?;

        let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<PROCESSENTRY32W>() as DWORD;

        let mut table = ProcessTable::new();
        let mut more = unsafe { Process32FirstW(snapshot.raw(), &mut entry) } != FALSE;
        while more {
            let pid = entry.th32ProcessID;
            // The idle and system pseudo-processes cannot be opened.
            let process = open_process(pid);
            table.insert(
                pid,
                ProcessInfo {
                    pid,
                    user: process.as_ref().and_then(process_user),
                    cmd: from_wide(&entry.szExeFile),
                    path: process.as_ref().and_then(image_path),
                },
            );
            more = unsafe { Process32NextW(snapshot.raw(), &mut entry) } != FALSE;
        }

        debug!("Snapshot holds {} processes", table.len());
        Ok(table)
    }

    fn process_info(&self, pid: u32) -> Result<ProcessStatus> {
        let script =
            format!("Get-Process -IncludeUserName -Id {pid} | ConvertTo-Csv -NoTypeInformation");
        let output = self.runner.run(
            &CommandSpec::new("powershell")
                .args(["-NoProfile", "-NonInteractive", "-Command"])
                .arg(script),
        )?;
        parse_process_csv(&output.stdout, pid)
    }

    fn find_by_command(&self, cmd: &str, path: Option<&str>) -> Result<Vec<u32>> {
        find_in_table(&self.list_processes()?, cmd, path)
    }
}
