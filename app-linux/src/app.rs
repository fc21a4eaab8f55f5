use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use hostshim_core::cli::Capabilities;
use hostshim_core::config::{Config, ExplicitPath};
use hostshim_core::error::{Result, ShimError};
use hostshim_core::platform::{AppPaths, NoCom, ServiceManager};
use hostshim_core::process::{PosixFlavor, PosixProcessManager};
use hostshim_core::proxy::PosixProxyDetector;
use hostshim_core::service::{
    InitSystem, PosixInit, PosixServiceHost, ServiceEvent, SystemdServiceManager,
    SysvServiceManager,
};
use hostshim_core::session::ProcSessions;
use hostshim_core::shell::SystemRunner;
use hostshim_core::toast::PosixToaster;
use log::{error, info, warn};

use crate::paths::LinuxPaths;

/// Shared application state for the Linux/FreeBSD shell.
pub struct AppState {
    pub config: Config,
    pub capabilities: Capabilities,
}

impl AppState {
    pub fn new(config_override: Option<PathBuf>) -> Self {
        let paths: Box<dyn AppPaths> = match config_override {
            Some(path) => Box::new(ExplicitPath(path)),
            None => Box::new(LinuxPaths),
        };

        let config = match Config::load_with(paths.as_ref()) {
            Ok(config) => {
                info!("Loaded configuration successfully");
                config
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                warn!("Using default configuration");
                Config::default()
            }
        };

        let runner = Arc::new(SystemRunner::new(config.get_path()));
        let own_uid = unsafe { libc::getuid() };
        let sessions = Arc::new(ProcSessions::new(runner.clone(), own_uid));
        let processes = Arc::new(PosixProcessManager::new(runner.clone(), PosixFlavor::current()));

        let init = InitSystem::detect(processes.as_ref());
        info!("Init system: {:?}", init);
        let services: Arc<dyn ServiceManager> = match init {
            InitSystem::Systemd => Arc::new(SystemdServiceManager::new(runner.clone())),
            InitSystem::SysV | InitSystem::Unknown => {
                Arc::new(SysvServiceManager::new(runner.clone()))
            }
        };

        let capabilities = Capabilities {
            proxy: Arc::new(PosixProxyDetector::new(
                runner.clone(),
                sessions.clone(),
                config.service.installed_by,
            )),
            toaster: Arc::new(PosixToaster::new(
                runner.clone(),
                sessions,
                config.toast.timeout_secs,
            )),
            host: Box::new(PosixServiceHost::new(runner, PosixInit::Linux(init))),
            processes,
            services,
            com: Arc::new(NoCom),
            stop_signals: forward_stop_signals,
        };

        Self {
            config,
            capabilities,
        }
    }
}

/// SIGTERM and Ctrl-C become [`ServiceEvent::Stop`].
fn forward_stop_signals(events: Sender<ServiceEvent>) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("received signal, stopping");
        if let Err(e) = events.send(ServiceEvent::Stop) {
            warn!("service loop already gone: {e}");
        }
    })
    .map_err(|e| ShimError::Service(e.to_string()))
}
