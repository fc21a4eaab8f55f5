//! User session discovery for POSIX hosts.
//! Answers "who owns the console" and "what does their X session look like"
//! from `loginctl`, `who`, `/etc/passwd` and the `/proc` environment of the
//! user's own processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::error::{Result, ShimError};
use crate::platform::SessionProvider;
use crate::shell::CommandRunner;

/// Accounts display managers run their login screens under.
const DISPLAY_MANAGER_USERS: [&str; 5] = ["gdm", "Debian-gdm", "sddm", "lightdm", "greeter"];

/// Display connection details of a graphical session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XInfo {
    pub display: Option<String>,
    pub xauthority: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub home: String,
}

/// `name:x:uid:gid:gecos:home:shell`
pub fn parse_passwd(text: &str) -> Vec<PasswdEntry> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                home: fields[5].to_string(),
            })
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginSession {
    pub id: String,
    pub uid: u32,
    pub user: String,
    pub seat: Option<String>,
}

/// `loginctl list-sessions --no-legend`: `SESSION UID USER [SEAT] [TTY] ...`.
pub fn parse_loginctl_sessions(output: &str) -> Vec<LoginSession> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.to_string();
            let uid = fields.next()?.parse().ok()?;
            let user = fields.next()?.to_string();
            let seat = fields
                .next()
                .filter(|s| s.starts_with("seat"))
                .map(str::to_string);
            Some(LoginSession { id, uid, user, seat })
        })
        .collect()
}

/// The user logged in on the local display according to `who`.
pub fn parse_who_console(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| {
            let mut fields = line.split_whitespace();
            let tty = fields.nth(1).unwrap_or_default();
            tty == "console" || tty.starts_with(':') || line.contains("(:")
        })
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// `/proc/<pid>/environ`: NUL separated `KEY=value` pairs.
pub fn parse_environ(raw: &[u8]) -> BTreeMap<String, String> {
    raw.split(|&b| b == 0)
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Real uid from the `Uid:` line of `/proc/<pid>/status`.
pub fn parse_status_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// Session provider backed by `loginctl`/`who` and the `/proc` filesystem.
pub struct ProcSessions {
    runner: Arc<dyn CommandRunner>,
    own_uid: u32,
    root: PathBuf,
}

impl ProcSessions {
    pub fn new(runner: Arc<dyn CommandRunner>, own_uid: u32) -> Self {
        Self::with_root(runner, own_uid, "/")
    }

    /// Resolves `/proc` and `/etc` under `root` instead of `/`.
    pub fn with_root(runner: Arc<dyn CommandRunner>, own_uid: u32, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            own_uid,
            root: root.into(),
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn passwd(&self) -> Vec<PasswdEntry> {
        fs::read_to_string(self.host_path("/etc/passwd"))
            .map(|text| parse_passwd(&text))
            .unwrap_or_default()
    }

    fn uid_of(&self, name: &str) -> Option<u32> {
        self.passwd().into_iter().find(|e| e.name == name).map(|e| e.uid)
    }

    fn home_of(&self, uid: u32) -> Option<String> {
        self.passwd().into_iter().find(|e| e.uid == uid).map(|e| e.home)
    }

    fn loginctl_value(&self, args: &[&str]) -> Option<String> {
        let output = self.runner.output("loginctl", args).ok()?;
        let value = output.stdout.trim();
        (output.success() && !value.is_empty()).then(|| value.to_string())
    }

    /// Login-screen sessions belong to the display manager, not a user.
    fn is_greeter(&self, session: &LoginSession) -> bool {
        if DISPLAY_MANAGER_USERS.contains(&session.user.as_str()) {
            return true;
        }
        self.loginctl_value(&["show-session", session.id.as_str(), "-p", "Class", "--value"])
            .is_some_and(|class| class.starts_with("greeter"))
    }

    fn console_from_loginctl(&self) -> Option<u32> {
        let output = self
            .runner
            .output("loginctl", &["list-sessions", "--no-legend"])
            .ok()?;
        if !output.success() {
            return None;
        }
        let sessions = parse_loginctl_sessions(&output.stdout);

        let active = self.loginctl_value(&["show-seat", "seat0", "-p", "ActiveSession", "--value"]);
        if let Some(session) = active
            .and_then(|id| sessions.iter().find(|s| s.id == id))
            .filter(|s| s.uid != 0 && !self.is_greeter(s))
        {
            return Some(session.uid);
        }

        sessions
            .iter()
            .filter(|s| s.seat.is_some() && s.uid != 0 && !self.is_greeter(s))
            .min_by_key(|s| s.seat.as_deref() != Some("seat0"))
            .map(|s| s.uid)
    }

    fn console_from_who(&self) -> Option<u32> {
        let output = self.runner.output("who", &[]).ok()?;
        let name = parse_who_console(&output.stdout)?;
        self.uid_of(&name)
    }
}

impl SessionProvider for ProcSessions {
    fn own_uid(&self) -> u32 {
        self.own_uid
    }

    fn console_uid(&self) -> Result<u32> {
        let uid = self
            .console_from_loginctl()
            .or_else(|| self.console_from_who())
            .ok_or(ShimError::NoUserSession)?;
        debug!("Console uid: {uid}");
        Ok(uid)
    }

    fn username(&self, uid: u32) -> Result<String> {
        self.passwd()
            .into_iter()
            .find(|e| e.uid == uid)
            .map(|e| e.name)
            .ok_or_else(|| ShimError::NotFound(format!("user with uid {uid}")))
    }

    fn user_env(&self, uid: u32, key: &str) -> Option<String> {
        let entries = fs::read_dir(self.host_path("/proc")).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().parse::<u32>().is_ok())
            .filter(|entry| {
                fs::read_to_string(entry.path().join("status"))
                    .ok()
                    .and_then(|status| parse_status_uid(&status))
                    == Some(uid)
            })
            .find_map(|entry| {
                let raw = fs::read(entry.path().join("environ")).ok()?;
                parse_environ(&raw).remove(key).filter(|v| !v.is_empty())
            })
    }

    fn x_info(&self, uid: u32) -> Result<XInfo> {
        let display = self.user_env(uid, "DISPLAY");
        let xauthority = self.user_env(uid, "XAUTHORITY").or_else(|| {
            let home = self.home_of(uid)?;
            let candidate = format!("{home}/.Xauthority");
            self.host_path(&candidate).exists().then_some(candidate)
        });
        Ok(XInfo { display, xauthority })
    }
}
