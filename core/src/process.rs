//! Process enumeration.
//! POSIX hosts are queried through `ps`/`pgrep` and `/proc`; the parsers here
//! also back the Windows implementation's PowerShell fallback.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{Result, ShimError};
use crate::platform::ProcessManager;
use crate::shell::{CommandRunner, CommandSpec, find_path};

/// One running process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// pid -> process information.
pub type ProcessTable = BTreeMap<u32, ProcessInfo>;

/// Key/value details about a single process (`/proc/<pid>/status` on Linux).
pub type ProcessStatus = BTreeMap<String, String>;

/// Splits off the first `n` whitespace-separated fields and returns them
/// together with the untouched remainder of the line.
fn split_leading_fields(line: &str, n: usize) -> (Vec<&str>, &str) {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        if rest.is_empty() {
            break;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    (fields, rest)
}

/// Parses `ps` output with `pid`, `user` and command columns, in that order.
/// Rows whose first column is not numeric (the header) are skipped.
pub fn parse_ps_table(output: &str) -> ProcessTable {
    let mut table = ProcessTable::new();
    for line in output.lines() {
        let (fields, rest) = split_leading_fields(line, 2);
        let Some(pid) = fields.first().and_then(|p| p.parse::<u32>().ok()) else {
            continue;
        };
        table.insert(
            pid,
            ProcessInfo {
                pid,
                user: fields.get(1).map(|u| u.to_string()),
                cmd: rest.trim_end().to_string(),
                path: None,
            },
        );
    }
    table
}

/// Parses the plain `ps` listing of minimal userlands (busybox), where the
/// command column starts where the header's last column name starts.
pub fn parse_ps_basic(output: &str) -> ProcessTable {
    let mut lines = output.lines();
    let Some(header) = lines.next() else {
        return ProcessTable::new();
    };
    let command_offset = header
        .split_whitespace()
        .last()
        .and_then(|last| header.rfind(last))
        .unwrap_or(0);

    let mut table = ProcessTable::new();
    for line in lines {
        let (fields, rest) = split_leading_fields(line, 2);
        let Some(pid) = fields.first().and_then(|p| p.parse::<u32>().ok()) else {
            continue;
        };
        let cmd = line
            .get(command_offset..)
            .map(str::trim)
            .unwrap_or_else(|| rest.trim());
        table.insert(
            pid,
            ProcessInfo {
                pid,
                user: fields.get(1).map(|u| u.to_string()),
                cmd: cmd.to_string(),
                path: None,
            },
        );
    }
    table
}

/// `/proc/<pid>/cmdline` separates arguments with NULs.
pub fn cmdline_from_bytes(raw: &[u8]) -> String {
    let joined: Vec<u8> = raw
        .iter()
        .map(|&b| if b == 0 { b' ' } else { b })
        .collect();
    String::from_utf8_lossy(&joined).trim().to_string()
}

/// Parses `Key:\tValue` lines.
pub fn parse_proc_status(text: &str) -> ProcessStatus {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.to_string(), value.trim().to_string()))
        .collect()
}

/// Parses one pid per line, as printed by `pgrep`.
pub fn parse_pid_list(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Picks pids out of a `ps -ax -o pid -o command` listing whose command
/// mentions `cmd`. Rows for a `grep` searching for it are ignored.
pub fn parse_command_search(output: &str, cmd: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| {
            let (fields, rest) = split_leading_fields(line, 1);
            let pid = fields.first()?.parse::<u32>().ok()?;
            let program = rest.split_whitespace().next()?;
            (program != "grep" && rest.contains(cmd)).then_some(pid)
        })
        .collect()
}

/// Splits one CSV record, honouring double quotes.
fn split_csv_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parses `Get-Process ... | ConvertTo-Csv -NoTypeInformation` output: a
/// header row and one value row. Empty values are dropped.
pub fn parse_process_csv(text: &str, pid: u32) -> Result<ProcessStatus> {
    let mut rows = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let (Some(keys), Some(values)) = (rows.next(), rows.next()) else {
        return Err(ShimError::NotFound(format!("PID({pid})")));
    };

    Ok(split_csv_record(keys)
        .into_iter()
        .zip(split_csv_record(values))
        .filter(|(_, value)| !value.is_empty())
        .collect())
}

/// Case-insensitive executable-name match, optionally pinned to a full path.
pub fn filter_by_command(table: &ProcessTable, cmd: &str, path: Option<&str>) -> Vec<u32> {
    table
        .values()
        .filter(|info| info.cmd.eq_ignore_ascii_case(cmd))
        .filter(|info| match path {
            None => true,
            Some(wanted) => info
                .path
                .as_deref()
                .is_some_and(|p| p.eq_ignore_ascii_case(wanted)),
        })
        .map(|info| info.pid)
        .collect()
}

/// [`filter_by_command`], with an empty match reported as `<cmd> not found`.
pub fn find_in_table(table: &ProcessTable, cmd: &str, path: Option<&str>) -> Result<Vec<u32>> {
    let pids = filter_by_command(table, cmd, path);
    if pids.is_empty() {
        return Err(ShimError::NotFound(cmd.to_string()));
    }
    Ok(pids)
}

/// Which `ps` dialect and `/proc` layout to expect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PosixFlavor {
    Linux,
    FreeBsd,
    MacOs,
}

impl PosixFlavor {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            PosixFlavor::MacOs
        } else if cfg!(target_os = "freebsd") {
            PosixFlavor::FreeBsd
        } else {
            PosixFlavor::Linux
        }
    }
}

/// Shell-backed process manager for Linux, FreeBSD and macOS.
pub struct PosixProcessManager {
    runner: Arc<dyn CommandRunner>,
    flavor: PosixFlavor,
    root: PathBuf,
}

impl PosixProcessManager {
    pub fn new(runner: Arc<dyn CommandRunner>, flavor: PosixFlavor) -> Self {
        Self::with_root(runner, flavor, "/")
    }

    /// Resolves `/proc` and `/etc` under `root` instead of `/`.
    pub fn with_root(
        runner: Arc<dyn CommandRunner>,
        flavor: PosixFlavor,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            flavor,
            root: root.into(),
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn proc_cmdline(&self, pid: u32) -> Option<String> {
        let raw = fs::read(self.host_path(&format!("/proc/{pid}/cmdline"))).ok()?;
        let cmd = cmdline_from_bytes(&raw);
        (!cmd.is_empty()).then_some(cmd)
    }

    fn refresh_from_proc(&self, table: &mut ProcessTable) {
        for info in table.values_mut() {
            if let Some(cmd) = self.proc_cmdline(info.pid) {
                if cmd != info.cmd {
                    info.cmd = cmd;
                }
            }
        }
    }

    fn list_linux(&self) -> Result<ProcessTable> {
        // Wide user column when shadow-utils is present; busybox rejects the width.
        let user_column = if self.host_path("/etc/login.defs").exists() {
            "user:99"
        } else {
            "user"
        };

        let output = self
            .runner
            .output("ps", &["-e", "-o", "pid", "-o", user_column, "-o", "args"])?;
        if output.success() && output.stderr.trim().is_empty() {
            return Ok(parse_ps_table(&output.stdout));
        }

        warn!(
            "ps rejected extended columns ({:?}: {}), falling back to plain ps",
            output.code,
            output.stderr.trim()
        );
        let output = self.runner.output("ps", &[])?.checked_stdout("ps")?;
        let mut table = parse_ps_basic(&output);
        self.refresh_from_proc(&mut table);
        Ok(table)
    }

    fn list_bsd(&self) -> Result<ProcessTable> {
        let output = self
            .runner
            .output("ps", &["-axo", "pid", "-o", "user", "-o", "command"])?
            .checked_stdout("ps")?;
        let mut table = parse_ps_table(&output);
        if self.flavor == PosixFlavor::FreeBsd {
            self.refresh_from_proc(&mut table);
        }
        Ok(table)
    }

    /// Pids reported by `pgrep <name>`, when `pgrep` is installed.
    pub fn pgrep(&self, name: &str) -> Result<Vec<u32>> {
        let program = find_path(self.runner.as_ref(), "pgrep")
            .ok_or_else(|| ShimError::NotFound("pgrep".to_string()))?;
        self.pgrep_with(&program, name)
    }

    fn pgrep_with(&self, program: &str, name: &str) -> Result<Vec<u32>> {
        let output = self.runner.run(&CommandSpec::new(program).arg(name))?;
        if !output.stderr.trim().is_empty() {
            return Err(ShimError::CommandFailed {
                program: "pgrep".to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        let pids = parse_pid_list(&output.stdout);
        if pids.is_empty() {
            return Err(ShimError::NotFound(name.to_string()));
        }
        Ok(pids)
    }
}

impl ProcessManager for PosixProcessManager {
    fn list_processes(&self) -> Result<ProcessTable> {
        let table = match self.flavor {
            PosixFlavor::Linux => self.list_linux()?,
            PosixFlavor::FreeBsd | PosixFlavor::MacOs => self.list_bsd()?,
        };
        info!("Enumerated {} processes", table.len());
        Ok(table)
    }

    fn process_info(&self, pid: u32) -> Result<ProcessStatus> {
        if self.flavor != PosixFlavor::Linux {
            return Err(ShimError::unsupported("process_info"));
        }
        let path = self.host_path(&format!("/proc/{pid}/status"));
        debug!("Reading {}", path.display());
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ShimError::NotFound(format!("PID({pid})")),
            _ => ShimError::Io(e),
        })?;
        Ok(parse_proc_status(&text))
    }

    fn find_by_command(&self, cmd: &str, path: Option<&str>) -> Result<Vec<u32>> {
        if path.is_some() {
            debug!("Path filter is only honoured on Windows; matching on command");
        }
        if let Some(program) = find_path(self.runner.as_ref(), "pgrep") {
            debug!("Using {program}");
            return self.pgrep_with(&program, cmd);
        }
        let output = self
            .runner
            .output("ps", &["-ax", "-o", "pid", "-o", "command"])?;
        let pids = parse_command_search(&output.stdout, cmd);
        if pids.is_empty() {
            return Err(ShimError::NotFound(cmd.to_string()));
        }
        Ok(pids)
    }
}
