//! Command line shared by every platform binary.
//! Each binary parses [`Cli`], builds its [`Capabilities`] and hands both to
//! [`run`].

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use clap::{Parser, Subcommand};
use log::{debug, info};

use crate::config::Config;
use crate::error::{Result, ShimError};
use crate::platform::{
    ComActivator, ProcessManager, ProxyDetector, ServiceHost, ServiceManager, Toaster,
};
use crate::proxy::AutoProxy;
use crate::service::{
    self, InstallOutcome, ServiceEvent, ServiceOptions, UninstallOutcome,
};
use crate::toast::Toast;

#[derive(Parser, Debug)]
#[command(name = "hostshim", version, about = "OS integration shims for a remote-management agent")]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// WPAD auto-proxy: `1`, or the DNS suffix to search.
    #[arg(long, global = true, value_name = "DOMAIN")]
    pub autoproxy: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List processes
    Ps {
        #[arg(long)]
        json: bool,
    },
    /// Show the status map of a process
    Info { pid: u32 },
    /// Find pids running a command
    Find {
        cmd: String,
        #[arg(long)]
        path: Option<String>,
    },
    /// Detect the system proxy, or test whether a host bypasses it
    Proxy {
        #[arg(long, value_name = "HOST")]
        bypass: Option<String>,
    },
    /// Show a desktop notification
    Toast {
        title: String,
        caption: String,
        #[arg(long)]
        session: Option<u32>,
    },
    /// Create a registered COM object
    Com {
        clsid: String,
        #[arg(long)]
        iid: Option<String>,
    },
    /// Manage or run the background service
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Install,
    Uninstall,
    Start,
    Stop,
    Status,
    Run,
}

/// Forwards the platform's stop requests (SIGTERM, Ctrl-C) as
/// [`ServiceEvent::Stop`].
pub type StopSignals = fn(Sender<ServiceEvent>) -> Result<()>;

/// The platform implementations a binary selected at startup.
pub struct Capabilities {
    pub processes: Arc<dyn ProcessManager>,
    pub proxy: Arc<dyn ProxyDetector>,
    pub services: Arc<dyn ServiceManager>,
    pub host: Box<dyn ServiceHost>,
    pub toaster: Arc<dyn Toaster>,
    pub com: Arc<dyn ComActivator>,
    pub stop_signals: StopSignals,
}

pub fn run(cli: &Cli, caps: &Capabilities, config: &Config, out: &mut dyn Write) -> Result<()> {
    match &cli.command {
        Command::Ps { json } => {
            let table = caps.processes.list_processes()?;
            if *json {
                let rows: Vec<_> = table.values().collect();
                let text = serde_json::to_string_pretty(&rows)
                    .map_err(|e| ShimError::Parse(e.to_string()))?;
                writeln!(out, "{text}")?;
            } else {
                writeln!(out, "{:>7} {:<16} COMMAND", "PID", "USER")?;
                for info in table.values() {
                    writeln!(
                        out,
                        "{:>7} {:<16} {}",
                        info.pid,
                        info.user.as_deref().unwrap_or("-"),
                        info.cmd
                    )?;
                }
            }
        }
        Command::Info { pid } => {
            for (key, value) in caps.processes.process_info(*pid)? {
                writeln!(out, "{key}: {value}")?;
            }
        }
        Command::Find { cmd, path } => {
            for pid in caps.processes.find_by_command(cmd, path.as_deref())? {
                writeln!(out, "{pid}")?;
            }
        }
        Command::Proxy { bypass: Some(host) } => {
            let bypassed = caps.proxy.should_bypass(host)?;
            writeln!(out, "{host}: {}", if bypassed { "bypass" } else { "proxy" })?;
        }
        Command::Proxy { bypass: None } => {
            let auto = AutoProxy::resolve(config.proxy.autoproxy.as_deref(), cli.autoproxy.as_deref());
            match caps.proxy.detect_proxy() {
                Ok(found) => writeln!(out, "{found} ({})", found.source.describe())?,
                Err(e) if auto.enabled() => debug!("{e}"),
                Err(e) => return Err(e),
            }
            if auto.enabled() {
                let state = if auto.available() { "available" } else { "unavailable" };
                writeln!(out, "auto-proxy: {} {state}", auto.wpad_host())?;
            }
        }
        Command::Toast {
            title,
            caption,
            session,
        } => {
            let toast = Toast::new(title.as_str(), caption.as_str())
                .for_session(*session)
                .with_display_name(&config.toast.title);
            caps.toaster.toast(&toast)?;
            writeln!(out, "DISMISSED")?;
        }
        Command::Com { clsid, iid } => {
            caps.com.activate(clsid, iid.as_deref())?;
            writeln!(out, "{clsid}: created")?;
        }
        Command::Service { action } => {
            run_service_action(*action, caps, &config.service_options(), out)?;
        }
    }
    Ok(())
}

fn run_service_action(
    action: ServiceAction,
    caps: &Capabilities,
    opts: &ServiceOptions,
    out: &mut dyn Write,
) -> Result<()> {
    let name = &opts.name;
    match action {
        ServiceAction::Install => match service::install_service(caps.services.as_ref(), opts)? {
            InstallOutcome::Installed => writeln!(out, "{name} installed")?,
            InstallOutcome::AlreadyInstalled => writeln!(out, "{name} already installed")?,
        },
        ServiceAction::Uninstall => {
            match service::uninstall_service(caps.services.as_ref(), opts)? {
                UninstallOutcome::Uninstalled => writeln!(out, "{name} uninstalled")?,
                UninstallOutcome::NotInstalled => writeln!(out, "{name} not installed")?,
            }
        }
        ServiceAction::Start => {
            caps.services.start(name)?;
            writeln!(out, "{name} starting...")?;
        }
        ServiceAction::Stop => {
            caps.services.stop(name)?;
            writeln!(out, "{name} stopping...")?;
        }
        ServiceAction::Status => {
            let state = caps.services.status(name)?;
            writeln!(out, "{name}: {state}")?;
        }
        ServiceAction::Run => {
            let (tx, rx) = mpsc::channel();
            (caps.stop_signals)(tx.clone())?;
            serve(caps.host.as_ref(), opts, tx, rx)?;
        }
    }
    Ok(())
}

/// Runs `host` and logs its lifecycle events until a stop arrives.
pub fn serve(
    host: &dyn ServiceHost,
    opts: &ServiceOptions,
    events: Sender<ServiceEvent>,
    incoming: Receiver<ServiceEvent>,
) -> Result<()> {
    let name = opts.name.clone();
    let watcher = thread::spawn(move || {
        for event in incoming {
            match event {
                ServiceEvent::Start => info!("{name} running as a service"),
                ServiceEvent::NormalStart => info!("{name} running in the foreground"),
                ServiceEvent::SessionChange(change) => {
                    info!("session {} {:?}", change.session_id, change.kind)
                }
                ServiceEvent::PowerEvent => debug!("power state changed"),
                ServiceEvent::Stop => {
                    info!("{name} stopping");
                    break;
                }
            }
        }
    });

    host.run(opts, events)?;
    watcher
        .join()
        .map_err(|_| ShimError::Service("event loop panicked".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_subcommand() {
        let cli = Cli::try_parse_from(["hostshim", "--config", "/tmp/c.toml", "service", "install"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(
            cli.command,
            Command::Service {
                action: ServiceAction::Install
            }
        ));
    }

    #[test]
    fn parses_toast_with_session() {
        let cli = Cli::try_parse_from(["hostshim", "toast", "Title", "Body", "--session", "1000"]).unwrap();
        match cli.command {
            Command::Toast { title, caption, session } => {
                assert_eq!(title, "Title");
                assert_eq!(caption, "Body");
                assert_eq!(session, Some(1000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn global_autoproxy_after_subcommand() {
        let cli = Cli::try_parse_from(["hostshim", "proxy", "--autoproxy", "corp.example"]).unwrap();
        assert_eq!(cli.autoproxy.as_deref(), Some("corp.example"));
    }

    #[test]
    fn rejects_unknown_service_action() {
        assert!(Cli::try_parse_from(["hostshim", "service", "restart"]).is_err());
    }
}
