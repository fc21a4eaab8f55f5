//! Desktop toast notifications.
//!
//! On Linux and FreeBSD the notification is shown through whichever desktop
//! helper is installed (zenity, kdialog, notify-send, xmessage), inside the
//! console user's X session. macOS goes through `osascript`. The Windows
//! balloon is a PowerShell script built here and launched by the Windows
//! shell.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Result, ShimError};
use crate::platform::{SessionProvider, Toaster};
use crate::session::XInfo;
use crate::shell::{self, CommandRunner, CommandSpec};

/// Title callers use when they have nothing better; replaced by the
/// configured display name.
pub const GENERIC_TITLE: &str = "hostshim";

const NOTIFICATIONS_SERVICE: &str = "org.freedesktop.Notifications";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toast {
    pub title: String,
    pub caption: String,
    /// Target session (uid on POSIX, session id on Windows); the console
    /// user when unset.
    pub session: Option<u32>,
}

impl Toast {
    pub fn new(title: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            caption: caption.into(),
            session: None,
        }
    }

    pub fn for_session(mut self, session: Option<u32>) -> Self {
        self.session = session;
        self
    }

    /// Swaps an empty or generic title for `display_name`.
    pub fn with_display_name(mut self, display_name: &str) -> Self {
        if self.title.trim().is_empty() || self.title == GENERIC_TITLE {
            self.title = display_name.to_string();
        }
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToastOutcome {
    Dismissed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ZenityVersion {
    pub major: u32,
    pub minor: u32,
}

impl ZenityVersion {
    /// `zenity --version` prints e.g. `3.32.0`.
    pub fn parse(output: &str) -> Option<Self> {
        let mut parts = output.trim().split('.');
        let major = parts.next()?.trim().parse().ok()?;
        let minor = parts.next().and_then(|m| m.trim().parse().ok()).unwrap_or(0);
        Some(Self { major, minor })
    }

    pub fn supports_timeout(&self) -> bool {
        self.major >= 3
    }

    /// `--notification` is unreliable before 3.10.
    pub fn notification_works(&self) -> bool {
        *self >= ZenityVersion { major: 3, minor: 10 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Zenity {
    pub path: String,
    /// `None` when `zenity --version` failed.
    pub version: Option<ZenityVersion>,
}

impl Zenity {
    fn supports_timeout(&self) -> bool {
        self.version.is_some_and(|v| v.supports_timeout())
    }
}

/// Desktop helpers found on the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesktopCapabilities {
    pub linux: bool,
    pub zenity: Option<Zenity>,
    pub notify_send: Option<String>,
    pub kdialog: Option<String>,
    pub xmessage: Option<String>,
    /// A D-Bus notification daemon is registered.
    pub notification_service: bool,
}

/// True when one of the concatenated D-Bus `.service` files declares `name`.
pub fn has_dbus_service(service_files: &str, name: &str) -> bool {
    service_files.lines().any(|line| {
        line.split_once('=')
            .is_some_and(|(key, value)| key.trim() == "Name" && value.trim() == name)
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToastBackend {
    /// `zenity --info`; without `--timeout` support the dialog is killed.
    ZenityInfo { path: String, timeout_flag: bool },
    ZenityNotification { path: String },
    NotifySend { path: String },
    KDialog { path: String },
    Xmessage { path: String },
}

pub fn select_backend(caps: &DesktopCapabilities) -> Result<ToastBackend> {
    if let Some(zenity) = &caps.zenity {
        let info = ToastBackend::ZenityInfo {
            path: zenity.path.clone(),
            timeout_flag: zenity.supports_timeout(),
        };
        if caps.linux && !caps.notification_service {
            return Ok(info);
        }
        let notification_works = zenity.version.is_some_and(|v| v.notification_works());
        if !notification_works {
            return Ok(match &caps.notify_send {
                Some(path) => ToastBackend::NotifySend { path: path.clone() },
                None => info,
            });
        }
        return Ok(ToastBackend::ZenityNotification {
            path: zenity.path.clone(),
        });
    }

    if let Some(path) = &caps.kdialog {
        return Ok(ToastBackend::KDialog { path: path.clone() });
    }
    if let Some(path) = &caps.notify_send {
        return Ok(ToastBackend::NotifySend { path: path.clone() });
    }
    if let Some(path) = &caps.xmessage {
        return Ok(ToastBackend::Xmessage { path: path.clone() });
    }
    Err(ShimError::NotFound("Zenity/KDialog/xmessage".to_string()))
}

/// The desktop session a toast is shown in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToastSession {
    pub uid: u32,
    pub username: String,
    pub x: XInfo,
    pub xdg_runtime_dir: Option<String>,
    /// Set when we are root and have to switch to the session's user.
    pub run_as: Option<u32>,
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn with_display(spec: CommandSpec, session: &ToastSession) -> CommandSpec {
    let mut spec = spec.uid(session.run_as);
    if let Some(xauthority) = &session.x.xauthority {
        spec = spec.env("XAUTHORITY", xauthority);
    }
    if let Some(display) = &session.x.display {
        spec = spec.env("DISPLAY", display);
    }
    spec
}

/// Command line that shows `toast` with `backend`.
pub fn backend_command(
    backend: &ToastBackend,
    toast: &Toast,
    session: &ToastSession,
    timeout_secs: u64,
) -> Result<CommandSpec> {
    let title = &toast.title;
    let caption = &toast.caption;
    let spec = match backend {
        ToastBackend::ZenityInfo { path, timeout_flag } => {
            let spec = CommandSpec::new(path.as_str())
                .arg("--info")
                .arg(format!("--title={title}"))
                .arg(format!("--text={caption}"));
            let spec = if *timeout_flag {
                spec.arg(format!("--timeout={timeout_secs}"))
            } else {
                spec.timeout(Duration::from_secs(timeout_secs))
            };
            with_display(spec, session)
        }
        ToastBackend::ZenityNotification { path } => with_display(
            CommandSpec::new(path.as_str())
                .arg("--notification")
                .arg(format!("--title={title}"))
                .arg(format!("--text={caption}"))
                .arg(format!("--timeout={timeout_secs}")),
            session,
        ),
        ToastBackend::NotifySend { path } => {
            if session.run_as.is_some() {
                let script = format!(
                    "export DISPLAY={}; export XDG_RUNTIME_DIR={}; notify-send {} {}",
                    sh_quote(session.x.display.as_deref().unwrap_or_default()),
                    sh_quote(session.xdg_runtime_dir.as_deref().unwrap_or_default()),
                    sh_quote(title),
                    sh_quote(caption),
                );
                CommandSpec::new("su").args(["-", session.username.as_str(), "-c"]).arg(script)
            } else {
                CommandSpec::new(path.as_str()).arg(title.as_str()).arg(caption.as_str())
            }
        }
        ToastBackend::KDialog { path } => {
            let (Some(display), Some(xauthority)) = (&session.x.display, &session.x.xauthority)
            else {
                return Err(ShimError::NotDetected(
                    "X display for kdialog (Internal Error)".to_string(),
                ));
            };
            CommandSpec::new(path.as_str())
                .args(["--title", title.as_str(), "--passivepopup", caption.as_str()])
                .arg(timeout_secs.to_string())
                .uid(session.run_as)
                .env("DISPLAY", display)
                .env("XAUTHORITY", xauthority)
                .env(
                    "XDG_RUNTIME_DIR",
                    session.xdg_runtime_dir.clone().unwrap_or_default(),
                )
        }
        ToastBackend::Xmessage { path } => with_display(
            CommandSpec::new(path.as_str())
                .args(["-center", "-title", title.as_str(), "-timeout"])
                .arg(timeout_secs.to_string())
                .args(["-buttons", "OK"])
                .arg(caption.as_str()),
            session,
        ),
    };
    Ok(spec)
}

/// Toaster for Linux and FreeBSD desktops.
pub struct PosixToaster {
    runner: Arc<dyn CommandRunner>,
    sessions: Arc<dyn SessionProvider>,
    timeout_secs: u64,
    root: PathBuf,
}

impl PosixToaster {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        sessions: Arc<dyn SessionProvider>,
        timeout_secs: u64,
    ) -> Self {
        Self::with_root(runner, sessions, timeout_secs, "/")
    }

    /// Looks for D-Bus service files under `root` instead of `/`.
    pub fn with_root(
        runner: Arc<dyn CommandRunner>,
        sessions: Arc<dyn SessionProvider>,
        timeout_secs: u64,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            sessions,
            timeout_secs,
            root: root.into(),
        }
    }

    fn dbus_service_files(&self) -> String {
        let dir = self.root.join("usr/share/dbus-1/services");
        let Ok(entries) = fs::read_dir(&dir) else {
            return String::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "service"))
            .filter_map(|p| fs::read_to_string(p).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn capabilities(&self) -> DesktopCapabilities {
        let runner = self.runner.as_ref();
        let zenity = shell::find_path(runner, "zenity").map(|path| {
            let version = runner
                .output(&path, &["--version"])
                .ok()
                .filter(|o| o.success())
                .and_then(|o| ZenityVersion::parse(&o.stdout));
            Zenity { path, version }
        });

        DesktopCapabilities {
            linux: cfg!(target_os = "linux"),
            zenity,
            notify_send: shell::find_path(runner, "notify-send"),
            kdialog: shell::find_path(runner, "kdialog"),
            xmessage: shell::find_path(runner, "xmessage"),
            notification_service: has_dbus_service(
                &self.dbus_service_files(),
                NOTIFICATIONS_SERVICE,
            ),
        }
    }

    fn session(&self, requested: Option<u32>) -> Result<ToastSession> {
        let uid = match requested {
            Some(uid) => uid,
            None => self.sessions.console_uid()?,
        };
        let run_as = (uid != self.sessions.own_uid()).then_some(uid);
        if run_as.is_some() && !self.sessions.is_root() {
            return Err(ShimError::PermissionDenied(format!(
                "Insufficient permission to display toast as uid: {uid}"
            )));
        }
        Ok(ToastSession {
            uid,
            username: self.sessions.username(uid)?,
            x: self.sessions.x_info(uid)?,
            xdg_runtime_dir: self.sessions.user_env(uid, "XDG_RUNTIME_DIR"),
            run_as,
        })
    }
}

impl Toaster for PosixToaster {
    fn toast(&self, toast: &Toast) -> Result<ToastOutcome> {
        let session = self.session(toast.session)?;
        let backend = select_backend(&self.capabilities())?;
        debug!("Toast backend for uid {}: {:?}", session.uid, backend);

        let spec = backend_command(&backend, toast, &session, self.timeout_secs)?;
        let output = self.runner.run(&spec)?;
        if !output.stderr.trim().is_empty() {
            warn!("{}: {}", spec.program, output.stderr.trim());
        }
        info!("Toast '{}' dismissed", toast.title);
        Ok(ToastOutcome::Dismissed)
    }
}

fn applescript_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Notification Center toasts through `osascript`.
pub struct OsascriptToaster {
    runner: Arc<dyn CommandRunner>,
}

impl OsascriptToaster {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Toaster for OsascriptToaster {
    fn toast(&self, toast: &Toast) -> Result<ToastOutcome> {
        let script = format!(
            "display notification {} with title {}",
            applescript_quote(&toast.caption),
            applescript_quote(&toast.title)
        );
        self.runner
            .run(&CommandSpec::new("osascript").args(["-e", script.as_str()]))?
            .checked_stdout("osascript")?;
        Ok(ToastOutcome::Dismissed)
    }
}

/// Where a Windows toast has to be shown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToastTarget {
    OwnSession,
    UserSession(u32),
}

/// Picks the session for a Windows toast. Only a process in session 0
/// (a service) may reach into another user's session.
pub fn resolve_toast_target(
    requested: Option<u32>,
    console: Result<u32>,
    own_session: u32,
) -> Result<ToastTarget> {
    let target = match requested {
        Some(session) => session,
        None => console.map_err(|_| ShimError::NoUserSession)?,
    };
    if target == own_session {
        return Ok(ToastTarget::OwnSession);
    }
    if requested.is_some() && own_session != 0 {
        return Err(ShimError::PermissionDenied(format!(
            "Insufficient permission to display toast as uid: {target}"
        )));
    }
    Ok(ToastTarget::UserSession(target))
}

/// PowerShell that shows a tray balloon titled `$env:_title` with text
/// `$env:_caption`, then waits for it to close or for `timeout_secs`.
pub fn powershell_balloon_script(timeout_secs: u64) -> String {
    let millis = timeout_secs * 1000;
    format!(
        "[System.Reflection.Assembly]::LoadWithPartialName(\"System.Windows.Forms\") | Out-Null\r\n\
         $objBalloon = New-Object System.Windows.Forms.NotifyIcon\r\n\
         $objBalloon.Icon = [System.Drawing.SystemIcons]::Information\r\n\
         $objBalloon.Visible = $True\r\n\
         Register-ObjectEvent -InputObject $objBalloon -EventName BalloonTipClosed -SourceIdentifier ToastClosed | Out-Null\r\n\
         $objBalloon.ShowBalloonTip({millis}, $env:_title, $env:_caption, 0)\r\n\
         Wait-Event -SourceIdentifier ToastClosed -Timeout {timeout_secs} | Out-Null\r\n\
         $objBalloon.Dispose()\r\n\
         Write-Host \"<DISMISSED>\"\r\n\
         exit\r\n"
    )
}

/// The balloon script with title and caption embedded, for launches that
/// cannot carry our environment into the user's session.
pub fn powershell_balloon_script_inline(toast: &Toast, timeout_secs: u64) -> String {
    let quote = |v: &str| format!("'{}'", v.replace('\'', "''"));
    format!(
        "$env:_title = {}\r\n$env:_caption = {}\r\n{}",
        quote(&toast.title),
        quote(&toast.caption),
        powershell_balloon_script(timeout_secs)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::fake::FakeRunner;

    fn linux_desktop() -> DesktopCapabilities {
        DesktopCapabilities {
            linux: true,
            notification_service: true,
            ..DesktopCapabilities::default()
        }
    }

    fn zenity(version: Option<(u32, u32)>) -> Option<Zenity> {
        Some(Zenity {
            path: "/usr/bin/zenity".to_string(),
            version: version.map(|(major, minor)| ZenityVersion { major, minor }),
        })
    }

    #[test]
    fn title_defaults_to_display_name() {
        assert_eq!(Toast::new("", "hi").with_display_name("Agent").title, "Agent");
        assert_eq!(
            Toast::new(GENERIC_TITLE, "hi").with_display_name("Agent").title,
            "Agent"
        );
        assert_eq!(Toast::new("Backup", "hi").with_display_name("Agent").title, "Backup");
    }

    #[test]
    fn zenity_version_parsing() {
        assert_eq!(
            ZenityVersion::parse("3.32.0\n"),
            Some(ZenityVersion { major: 3, minor: 32 })
        );
        assert!(!ZenityVersion::parse("3.8.0").unwrap().notification_works());
        assert!(ZenityVersion::parse("4.0").unwrap().notification_works());
        assert_eq!(ZenityVersion::parse("garbage"), None);
    }

    #[test]
    fn dbus_service_lookup() {
        let files = "[D-BUS Service]\nName=org.freedesktop.Notifications\nExec=/usr/lib/notify-osd\n";
        assert!(has_dbus_service(files, NOTIFICATIONS_SERVICE));
        assert!(!has_dbus_service("Name=org.freedesktop.Notifications.Extra\n", NOTIFICATIONS_SERVICE));
    }

    #[test]
    fn zenity_info_without_notification_daemon() {
        let caps = DesktopCapabilities {
            zenity: zenity(Some((3, 32))),
            notification_service: false,
            ..linux_desktop()
        };
        assert_eq!(
            select_backend(&caps).unwrap(),
            ToastBackend::ZenityInfo {
                path: "/usr/bin/zenity".to_string(),
                timeout_flag: true
            }
        );
    }

    #[test]
    fn old_zenity_prefers_notify_send() {
        let old = DesktopCapabilities {
            zenity: zenity(Some((3, 8))),
            notify_send: Some("/usr/bin/notify-send".to_string()),
            ..linux_desktop()
        };
        assert!(matches!(select_backend(&old).unwrap(), ToastBackend::NotifySend { .. }));

        let broken = DesktopCapabilities {
            zenity: zenity(None),
            ..linux_desktop()
        };
        assert_eq!(
            select_backend(&broken).unwrap(),
            ToastBackend::ZenityInfo {
                path: "/usr/bin/zenity".to_string(),
                timeout_flag: false
            }
        );
    }

    #[test]
    fn modern_zenity_uses_notification() {
        let caps = DesktopCapabilities {
            zenity: zenity(Some((3, 10))),
            ..linux_desktop()
        };
        assert!(matches!(
            select_backend(&caps).unwrap(),
            ToastBackend::ZenityNotification { .. }
        ));
    }

    #[test]
    fn fallbacks_without_zenity() {
        let mut caps = DesktopCapabilities {
            kdialog: Some("/usr/bin/kdialog".to_string()),
            notify_send: Some("/usr/bin/notify-send".to_string()),
            xmessage: Some("/usr/bin/xmessage".to_string()),
            ..linux_desktop()
        };
        assert!(matches!(select_backend(&caps).unwrap(), ToastBackend::KDialog { .. }));
        caps.kdialog = None;
        assert!(matches!(select_backend(&caps).unwrap(), ToastBackend::NotifySend { .. }));
        caps.notify_send = None;
        assert!(matches!(select_backend(&caps).unwrap(), ToastBackend::Xmessage { .. }));
        caps.xmessage = None;
        assert_eq!(
            select_backend(&caps).unwrap_err().to_string(),
            "Zenity/KDialog/xmessage not found"
        );
    }

    fn session(run_as: Option<u32>) -> ToastSession {
        ToastSession {
            uid: 1000,
            username: "alice".to_string(),
            x: XInfo {
                display: Some(":0".to_string()),
                xauthority: Some("/home/alice/.Xauthority".to_string()),
            },
            xdg_runtime_dir: Some("/run/user/1000".to_string()),
            run_as,
        }
    }

    #[test]
    fn zenity_without_timeout_flag_is_killed() {
        let backend = ToastBackend::ZenityInfo {
            path: "/usr/bin/zenity".to_string(),
            timeout_flag: false,
        };
        let spec = backend_command(&backend, &Toast::new("T", "C"), &session(Some(1000)), 5).unwrap();
        assert_eq!(spec.display(), "/usr/bin/zenity --info --title=T --text=C");
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
        assert_eq!(spec.uid, Some(1000));
        assert!(spec.env.contains(&("DISPLAY".to_string(), ":0".to_string())));
    }

    #[test]
    fn notify_send_as_root_switches_user() {
        let backend = ToastBackend::NotifySend {
            path: "/usr/bin/notify-send".to_string(),
        };
        let spec = backend_command(&backend, &Toast::new("It's", "done"), &session(Some(1000)), 5).unwrap();
        assert_eq!(spec.program, "su");
        assert_eq!(&spec.args[..3], &["-", "alice", "-c"]);
        assert_eq!(
            spec.args[3],
            "export DISPLAY=':0'; export XDG_RUNTIME_DIR='/run/user/1000'; notify-send 'It'\\''s' 'done'"
        );

        let plain = backend_command(&backend, &Toast::new("T", "C"), &session(None), 5).unwrap();
        assert_eq!(plain.display(), "/usr/bin/notify-send T C");
    }

    #[test]
    fn kdialog_needs_display() {
        let backend = ToastBackend::KDialog {
            path: "/usr/bin/kdialog".to_string(),
        };
        let spec = backend_command(&backend, &Toast::new("T", "C"), &session(None), 5).unwrap();
        assert_eq!(spec.display(), "/usr/bin/kdialog --title T --passivepopup C 5");

        let mut headless = session(None);
        headless.x.xauthority = None;
        assert!(backend_command(&backend, &Toast::new("T", "C"), &headless, 5).is_err());
    }

    #[test]
    fn windows_target_rules() {
        assert_eq!(resolve_toast_target(None, Ok(1), 1).unwrap(), ToastTarget::OwnSession);
        assert_eq!(
            resolve_toast_target(None, Ok(2), 0).unwrap(),
            ToastTarget::UserSession(2)
        );
        assert_eq!(
            resolve_toast_target(Some(3), Ok(2), 1).unwrap_err().to_string(),
            "permission denied: Insufficient permission to display toast as uid: 3"
        );
        assert!(matches!(
            resolve_toast_target(None, Err(ShimError::NoUserSession), 0),
            Err(ShimError::NoUserSession)
        ));
    }

    #[test]
    fn balloon_script_reads_environment() {
        let script = powershell_balloon_script(10);
        assert!(script.contains("ShowBalloonTip(10000, $env:_title, $env:_caption, 0)"));
        assert!(script.contains("-Timeout 10"));

        let inline = powershell_balloon_script_inline(&Toast::new("Bob's", "x"), 10);
        assert!(inline.starts_with("$env:_title = 'Bob''s'\r\n"));
    }

    #[test]
    fn osascript_quotes_text() {
        let runner = Arc::new(FakeRunner::default().reply(
            "osascript -e display notification \"say \\\"hi\\\"\" with title \"T\"",
            "",
        ));
        let toaster = OsascriptToaster::new(runner.clone());
        assert_eq!(
            toaster.toast(&Toast::new("T", "say \"hi\"")).unwrap(),
            ToastOutcome::Dismissed
        );
        assert_eq!(runner.calls().len(), 1);
    }
}
