//! Service registration and hosting.
//!
//! [`ServiceManager`] implementations register the binary with systemd,
//! SysV init or launchd; [`PosixServiceHost`] tells a service start from a
//! normal start. Install and uninstall go through [`install_service`] and
//! [`uninstall_service`], which turn repeated calls into logged no-ops.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use log::{debug, info, warn};

use crate::error::{Result, ShimError};
use crate::platform::{ProcessManager, ServiceHost, ServiceManager};
use crate::shell::{CommandRunner, CommandSpec};

/// What the service manager needs to know to register us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceOptions {
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub service_path: String,
    pub args: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionChangeKind {
    Logon,
    Logoff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionChange {
    pub kind: SessionChangeKind,
    pub session_id: u32,
}

/// Lifecycle notifications delivered by a [`ServiceHost`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Started by the service manager.
    Start,
    /// Started from a shell or some other non-service context.
    NormalStart,
    Stop,
    SessionChange(SessionChange),
    PowerEvent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    NotInstalled,
    Unknown,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::NotInstalled => "not installed",
            ServiceState::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyInstalled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UninstallOutcome {
    Uninstalled,
    NotInstalled,
}

/// Installs the service unless it is already registered.
pub fn install_service(manager: &dyn ServiceManager, opts: &ServiceOptions) -> Result<InstallOutcome> {
    if manager.is_installed(&opts.name)? {
        info!("{} is already installed", opts.name);
        return Ok(InstallOutcome::AlreadyInstalled);
    }
    manager.install(opts)?;
    info!("{} installed", opts.name);
    Ok(InstallOutcome::Installed)
}

/// Removes the service if it is registered.
pub fn uninstall_service(
    manager: &dyn ServiceManager,
    opts: &ServiceOptions,
) -> Result<UninstallOutcome> {
    if !manager.is_installed(&opts.name)? {
        info!("{} is not installed", opts.name);
        return Ok(UninstallOutcome::NotInstalled);
    }
    manager.uninstall(opts)?;
    info!("{} uninstalled", opts.name);
    Ok(UninstallOutcome::Uninstalled)
}

/// Init system, as named by PID 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitSystem {
    Systemd,
    SysV,
    Unknown,
}

impl InitSystem {
    pub fn from_proc1_name(name: &str) -> Self {
        match name.trim() {
            "systemd" => InitSystem::Systemd,
            "init" => InitSystem::SysV,
            _ => InitSystem::Unknown,
        }
    }

    /// Reads PID 1's name through the process manager.
    pub fn detect(processes: &dyn ProcessManager) -> Self {
        match processes.process_info(1) {
            Ok(status) => Self::from_proc1_name(status.get("Name").map(String::as_str).unwrap_or("")),
            Err(e) => {
                debug!("Unable to read PID 1: {e}");
                InitSystem::Unknown
            }
        }
    }
}

/// `Main PID: 1234 (agent)` from `systemctl status`.
pub fn parse_systemctl_main_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Main PID:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|pid| pid.parse().ok())
}

/// `service <name> status`: the pid follows a `pid` token
/// (`agent (pid 812) is running...`), else sits in the fourth field
/// (`agent start/running, process 812`).
pub fn parse_init_status_pid(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let line = line.replace(['(', ')', ','], " ");
        let fields: Vec<&str> = line.split_whitespace().collect();
        fields
            .iter()
            .position(|f| *f == "pid")
            .and_then(|i| fields.get(i + 1))
            .or_else(|| fields.get(3))
            .and_then(|pid| pid.parse().ok())
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchdJob {
    pub pid: Option<u32>,
    pub status: String,
    pub label: String,
}

/// `launchctl list`: `PID\tStatus\tLabel`, `-` when a job is not running.
pub fn parse_launchctl_list(output: &str) -> Vec<LaunchdJob> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let pid = fields.next()?.trim();
            let status = fields.next()?.trim().to_string();
            let label = fields.next()?.trim().to_string();
            Some(LaunchdJob {
                pid: pid.parse().ok(),
                status,
                label,
            })
        })
        .collect()
}

fn command_line(opts: &ServiceOptions) -> String {
    std::iter::once(opts.service_path.as_str())
        .chain(opts.args.iter().map(String::as_str))
        .map(|part| {
            if part.contains(char::is_whitespace) {
                format!("\"{part}\"")
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn render_systemd_unit(opts: &ServiceOptions) -> String {
    let description = opts.description.as_deref().unwrap_or(&opts.display_name);
    format!(
        "[Unit]\n\
         Description={description}\n\
         Wants=network-online.target\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={}\n\
         StandardOutput=null\n\
         Restart=on-failure\n\
         RestartSec=3\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        command_line(opts)
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn render_launchd_plist(opts: &ServiceOptions) -> String {
    let arguments: String = std::iter::once(&opts.service_path)
        .chain(opts.args.iter())
        .map(|arg| format!("        <string>{}</string>\n", xml_escape(arg)))
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n\
         <dict>\n\
         \x20   <key>Label</key>\n\
         \x20   <string>{}</string>\n\
         \x20   <key>ProgramArguments</key>\n\
         \x20   <array>\n\
         {arguments}\
         \x20   </array>\n\
         \x20   <key>RunAtLoad</key>\n\
         \x20   <true/>\n\
         \x20   <key>KeepAlive</key>\n\
         \x20   <true/>\n\
         </dict>\n\
         </plist>\n",
        xml_escape(&opts.name)
    )
}

fn run_checked(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<String> {
    runner.output(program, args)?.checked_stdout(program)
}

/// systemd unit management.
pub struct SystemdServiceManager {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
}

impl SystemdServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_root(runner, "/")
    }

    pub fn with_root(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
        }
    }

    fn unit_dirs(&self) -> [PathBuf; 2] {
        [
            self.root.join("lib/systemd/system"),
            self.root.join("etc/systemd/system"),
        ]
    }

    fn unit_path(&self, name: &str) -> Option<PathBuf> {
        self.unit_dirs()
            .into_iter()
            .map(|dir| dir.join(format!("{name}.service")))
            .find(|path| path.exists())
    }

    fn install_dir(&self) -> PathBuf {
        let [lib, etc] = self.unit_dirs();
        if lib.is_dir() { lib } else { etc }
    }
}

impl ServiceManager for SystemdServiceManager {
    fn is_installed(&self, name: &str) -> Result<bool> {
        Ok(self.unit_path(name).is_some())
    }

    fn install(&self, opts: &ServiceOptions) -> Result<()> {
        let dir = self.install_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.service", opts.name));
        info!("Writing unit file {}", path.display());
        fs::write(&path, render_systemd_unit(opts))?;

        run_checked(self.runner.as_ref(), "systemctl", &["daemon-reload"])?;
        let unit = format!("{}.service", opts.name);
        run_checked(self.runner.as_ref(), "systemctl", &["enable", &unit])?;
        Ok(())
    }

    fn uninstall(&self, opts: &ServiceOptions) -> Result<()> {
        let unit = format!("{}.service", opts.name);
        if let Err(e) = run_checked(self.runner.as_ref(), "systemctl", &["stop", &unit]) {
            debug!("systemctl stop: {e}");
        }
        if let Err(e) = run_checked(self.runner.as_ref(), "systemctl", &["disable", &unit]) {
            warn!("Failed to disable {unit}: {e}");
        }
        if let Some(path) = self.unit_path(&opts.name) {
            info!("Removing unit file {}", path.display());
            fs::remove_file(path)?;
        }
        run_checked(self.runner.as_ref(), "systemctl", &["daemon-reload"])?;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        run_checked(self.runner.as_ref(), "systemctl", &["start", name]).map(|_| ())
    }

    fn stop(&self, name: &str) -> Result<()> {
        run_checked(self.runner.as_ref(), "systemctl", &["stop", name]).map(|_| ())
    }

    fn status(&self, name: &str) -> Result<ServiceState> {
        if !self.is_installed(name)? {
            return Ok(ServiceState::NotInstalled);
        }
        // is-active exits non-zero for anything but "active"
        let output = self.runner.output("systemctl", &["is-active", name])?;
        Ok(match output.stdout.trim() {
            "active" | "reloading" | "activating" => ServiceState::Running,
            "inactive" | "failed" | "deactivating" => ServiceState::Stopped,
            _ => ServiceState::Unknown,
        })
    }
}

/// SysV init scripts. Scripts are shipped by packages, so registering one
/// is not supported here.
pub struct SysvServiceManager {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
}

impl SysvServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_root(runner, "/")
    }

    pub fn with_root(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
        }
    }
}

impl ServiceManager for SysvServiceManager {
    fn is_installed(&self, name: &str) -> Result<bool> {
        Ok(self.root.join("etc/init.d").join(name).exists())
    }

    fn install(&self, _opts: &ServiceOptions) -> Result<()> {
        Err(ShimError::unsupported("SysV init service installation"))
    }

    fn uninstall(&self, _opts: &ServiceOptions) -> Result<()> {
        Err(ShimError::unsupported("SysV init service removal"))
    }

    fn start(&self, name: &str) -> Result<()> {
        run_checked(self.runner.as_ref(), "service", &[name, "start"]).map(|_| ())
    }

    fn stop(&self, name: &str) -> Result<()> {
        run_checked(self.runner.as_ref(), "service", &[name, "stop"]).map(|_| ())
    }

    fn status(&self, name: &str) -> Result<ServiceState> {
        if !self.is_installed(name)? {
            return Ok(ServiceState::NotInstalled);
        }
        // LSB: 0 running, 3 stopped
        let output = self.runner.output("service", &[name, "status"])?;
        Ok(match output.code {
            Some(0) => ServiceState::Running,
            Some(3) => ServiceState::Stopped,
            _ => ServiceState::Unknown,
        })
    }
}

/// launchd daemons under `/Library/LaunchDaemons`.
pub struct LaunchdServiceManager {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
}

impl LaunchdServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_root(runner, "/")
    }

    pub fn with_root(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
        }
    }

    fn plist_path(&self, name: &str) -> PathBuf {
        self.root
            .join("Library/LaunchDaemons")
            .join(format!("{name}.plist"))
    }

    fn jobs(&self) -> Result<Vec<LaunchdJob>> {
        let output = run_checked(self.runner.as_ref(), "launchctl", &["list"])?;
        Ok(parse_launchctl_list(&output))
    }
}

impl ServiceManager for LaunchdServiceManager {
    fn is_installed(&self, name: &str) -> Result<bool> {
        Ok(self.plist_path(name).exists())
    }

    fn install(&self, opts: &ServiceOptions) -> Result<()> {
        let path = self.plist_path(&opts.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("Writing launch daemon {}", path.display());
        fs::write(&path, render_launchd_plist(opts))?;
        let path = path.to_string_lossy();
        run_checked(self.runner.as_ref(), "launchctl", &["load", "-w", &path])?;
        Ok(())
    }

    fn uninstall(&self, opts: &ServiceOptions) -> Result<()> {
        let path = self.plist_path(&opts.name);
        let display = path.to_string_lossy().into_owned();
        if let Err(e) = run_checked(self.runner.as_ref(), "launchctl", &["unload", &display]) {
            warn!("Failed to unload {display}: {e}");
        }
        fs::remove_file(&path)?;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        run_checked(self.runner.as_ref(), "launchctl", &["start", name]).map(|_| ())
    }

    fn stop(&self, name: &str) -> Result<()> {
        run_checked(self.runner.as_ref(), "launchctl", &["stop", name]).map(|_| ())
    }

    fn status(&self, name: &str) -> Result<ServiceState> {
        if !self.is_installed(name)? {
            return Ok(ServiceState::NotInstalled);
        }
        let state = match self.jobs()?.into_iter().find(|job| job.label == name) {
            Some(LaunchdJob { pid: Some(_), .. }) => ServiceState::Running,
            Some(_) | None => ServiceState::Stopped,
        };
        Ok(state)
    }
}

/// Which service manager a POSIX host is running under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PosixInit {
    Linux(InitSystem),
    Launchd,
}

/// Tells a service start from a normal start on Linux and macOS. Stop
/// requests arrive through the binary's SIGTERM handler.
pub struct PosixServiceHost {
    runner: Arc<dyn CommandRunner>,
    init: PosixInit,
    own_pid: u32,
}

impl PosixServiceHost {
    pub fn new(runner: Arc<dyn CommandRunner>, init: PosixInit) -> Self {
        Self::with_pid(runner, init, std::process::id())
    }

    pub fn with_pid(runner: Arc<dyn CommandRunner>, init: PosixInit, own_pid: u32) -> Self {
        Self {
            runner,
            init,
            own_pid,
        }
    }

    /// The pid the service manager believes is running `name`.
    fn service_pids(&self, name: &str) -> Result<Vec<u32>> {
        let pids = match self.init {
            PosixInit::Linux(InitSystem::Systemd) => {
                let output = self
                    .runner
                    .run(&CommandSpec::new("systemctl").args(["status", name]))?;
                parse_systemctl_main_pid(&output.stdout).into_iter().collect()
            }
            PosixInit::Linux(InitSystem::SysV) => {
                let output = self
                    .runner
                    .run(&CommandSpec::new("service").args([name, "status"]))?;
                parse_init_status_pid(&output.stdout).into_iter().collect()
            }
            PosixInit::Linux(InitSystem::Unknown) => Vec::new(),
            PosixInit::Launchd => {
                let output = run_checked(self.runner.as_ref(), "launchctl", &["list"])?;
                parse_launchctl_list(&output)
                    .into_iter()
                    .filter_map(|job| job.pid)
                    .collect()
            }
        };
        Ok(pids)
    }

    pub fn start_kind(&self, name: &str) -> ServiceEvent {
        match self.service_pids(name) {
            Ok(pids) if pids.contains(&self.own_pid) => ServiceEvent::Start,
            Ok(_) => ServiceEvent::NormalStart,
            Err(e) => {
                debug!("Unable to query service manager: {e}");
                ServiceEvent::NormalStart
            }
        }
    }
}

impl ServiceHost for PosixServiceHost {
    fn run(&self, opts: &ServiceOptions, events: Sender<ServiceEvent>) -> Result<()> {
        let event = self.start_kind(&opts.name);
        info!("{} started as {:?}", opts.name, event);
        events
            .send(event)
            .map_err(|e| ShimError::Service(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::CommandOutput;
    use crate::shell::fake::FakeRunner;
    use std::sync::mpsc;

    fn options() -> ServiceOptions {
        ServiceOptions {
            name: "hostshim".to_string(),
            display_name: "Host Shim Agent".to_string(),
            description: None,
            service_path: "/usr/local/bin/hostshim".to_string(),
            args: vec!["service".to_string(), "run".to_string()],
        }
    }

    #[test]
    fn init_system_from_pid1() {
        assert_eq!(InitSystem::from_proc1_name("systemd"), InitSystem::Systemd);
        assert_eq!(InitSystem::from_proc1_name("init\n"), InitSystem::SysV);
        assert_eq!(InitSystem::from_proc1_name("runit"), InitSystem::Unknown);
    }

    #[test]
    fn systemctl_main_pid() {
        let output = "\
● hostshim.service - Host Shim Agent
     Loaded: loaded (/lib/systemd/system/hostshim.service; enabled)
     Active: active (running) since Mon 2024-01-01 10:00:00 UTC
   Main PID: 4242 (hostshim)
";
        assert_eq!(parse_systemctl_main_pid(output), Some(4242));
        assert_eq!(parse_systemctl_main_pid("Active: inactive (dead)\n"), None);
    }

    #[test]
    fn init_status_pid() {
        assert_eq!(parse_init_status_pid("hostshim (pid 812) is running...\n"), Some(812));
        assert_eq!(
            parse_init_status_pid("hostshim start/running, process 913\n"),
            Some(913)
        );
        assert_eq!(parse_init_status_pid("hostshim is stopped\n"), None);
    }

    #[test]
    fn launchctl_list_jobs() {
        let output = "PID\tStatus\tLabel\n-\t0\tcom.apple.thing\n311\t0\thostshim\n";
        let jobs = parse_launchctl_list(output);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].pid, None);
        assert_eq!(jobs[1].pid, Some(311));
        assert_eq!(jobs[1].label, "hostshim");
    }

    #[test]
    fn unit_file_runs_configured_command() {
        let unit = render_systemd_unit(&options());
        assert!(unit.contains("ExecStart=/usr/local/bin/hostshim service run\n"));
        assert!(unit.contains("Description=Host Shim Agent\n"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn plist_lists_program_arguments() {
        let plist = render_launchd_plist(&options());
        assert!(plist.contains("<string>hostshim</string>"));
        assert!(plist.contains(
            "        <string>/usr/local/bin/hostshim</string>\n        <string>service</string>\n"
        ));
    }

    #[test]
    fn systemd_install_prefers_lib_dir() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("lib/systemd/system")).unwrap();
        let runner = Arc::new(
            FakeRunner::default()
                .reply("systemctl daemon-reload", "")
                .reply("systemctl enable hostshim.service", ""),
        );
        let manager = SystemdServiceManager::with_root(runner.clone(), root.path());

        manager.install(&options()).unwrap();
        assert!(root.path().join("lib/systemd/system/hostshim.service").exists());
        assert!(manager.is_installed("hostshim").unwrap());
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn systemd_install_falls_back_to_etc() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            FakeRunner::default()
                .reply("systemctl daemon-reload", "")
                .reply("systemctl enable hostshim.service", ""),
        );
        let manager = SystemdServiceManager::with_root(runner, root.path());
        manager.install(&options()).unwrap();
        assert!(root.path().join("etc/systemd/system/hostshim.service").exists());
    }

    #[test]
    fn sysv_cannot_install() {
        let root = tempfile::tempdir().unwrap();
        let manager = SysvServiceManager::with_root(Arc::new(FakeRunner::default()), root.path());
        assert!(matches!(
            manager.install(&options()),
            Err(ShimError::Unsupported { .. })
        ));
    }

    #[test]
    fn host_detects_service_start_from_main_pid() {
        let runner = Arc::new(FakeRunner::default().reply(
            "systemctl status hostshim",
            "   Main PID: 4242 (hostshim)\n",
        ));
        let host = PosixServiceHost::with_pid(runner.clone(), PosixInit::Linux(InitSystem::Systemd), 4242);
        let (tx, rx) = mpsc::channel();
        host.run(&options(), tx).unwrap();
        assert_eq!(rx.recv().unwrap(), ServiceEvent::Start);

        let other = PosixServiceHost::with_pid(runner, PosixInit::Linux(InitSystem::Systemd), 1);
        assert_eq!(other.start_kind("hostshim"), ServiceEvent::NormalStart);
    }

    #[test]
    fn host_on_unknown_init_is_normal_start() {
        let host = PosixServiceHost::with_pid(
            Arc::new(FakeRunner::default()),
            PosixInit::Linux(InitSystem::Unknown),
            7,
        );
        assert_eq!(host.start_kind("hostshim"), ServiceEvent::NormalStart);
    }

    #[test]
    fn host_under_launchd() {
        let runner = Arc::new(FakeRunner::default().reply_with(
            "launchctl list",
            CommandOutput {
                code: Some(0),
                stdout: "PID\tStatus\tLabel\n311\t0\thostshim\n".to_string(),
                ..CommandOutput::default()
            },
        ));
        let host = PosixServiceHost::with_pid(runner, PosixInit::Launchd, 311);
        assert_eq!(host.start_kind("hostshim"), ServiceEvent::Start);
    }
}
