// src/app.rs
//
// Selects the macOS implementation of every capability

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use hostshim_core::cli::Capabilities;
use hostshim_core::config::{Config, ExplicitPath};
use hostshim_core::error::{Result, ShimError};
use hostshim_core::platform::{AppPaths, NoCom};
use hostshim_core::process::{PosixFlavor, PosixProcessManager};
use hostshim_core::proxy::ScutilProxyDetector;
use hostshim_core::service::{LaunchdServiceManager, PosixInit, PosixServiceHost, ServiceEvent};
use hostshim_core::shell::SystemRunner;
use hostshim_core::toast::OsascriptToaster;
use log::{error, info, warn};

use crate::paths::MacPaths;

pub struct AppState {
    pub config: Config,
    pub capabilities: Capabilities,
}

impl AppState {
    pub fn new(config_override: Option<PathBuf>) -> Self {
        let paths: Box<dyn AppPaths> = match config_override {
            Some(path) => Box::new(ExplicitPath(path)),
            None => Box::new(MacPaths),
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
        let capabilities = Capabilities {
            processes: Arc::new(PosixProcessManager::new(runner.clone(), PosixFlavor::MacOs)),
            proxy: Arc::new(ScutilProxyDetector::new(runner.clone())),
            services: Arc::new(LaunchdServiceManager::new(runner.clone())),
            toaster: Arc::new(OsascriptToaster::new(runner.clone())),
            host: Box::new(PosixServiceHost::new(runner, PosixInit::Launchd)),
            com: Arc::new(NoCom),
            stop_signals: forward_stop_signals,
        };

        Self {
            config,
            capabilities,
        }
    }
}

/// launchd stops daemons with SIGTERM.
fn forward_stop_signals(events: Sender<ServiceEvent>) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("received signal, stopping");
        if let Err(e) = events.send(ServiceEvent::Stop) {
            warn!("service loop already gone: {e}");
        }
    })
    .map_err(|e| ShimError::Service(e.to_string()))
}
