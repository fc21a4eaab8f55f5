use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use hostshim_core::cli::Capabilities;
use hostshim_core::config::{Config, ExplicitPath};
use hostshim_core::error::{Result, ShimError};
use hostshim_core::platform::AppPaths;
use hostshim_core::service::ServiceEvent;
use hostshim_core::shell::SystemRunner;
use log::{error, info, warn};

use crate::com::ComObjects;
use crate::paths::WindowsPaths;
use crate::process::ToolhelpProcessManager;
use crate::proxy::RegistryProxyDetector;
use crate::service::{ScmServiceHost, ScmServiceManager};
use crate::toast::BalloonToaster;

/// Shared application state for the Windows shell.
pub struct AppState {
    pub config: Config,
    pub capabilities: Capabilities,
}

impl AppState {
    pub fn new(config_override: Option<PathBuf>) -> Self {
        let paths: Box<dyn AppPaths> = match config_override {
            Some(path) => Box::new(ExplicitPath(path)),
            None => Box::new(WindowsPaths),
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
            processes: Arc::new(ToolhelpProcessManager::new(runner.clone())),
            proxy: Arc::new(RegistryProxyDetector::new(config.service.name.as_str())),
            services: Arc::new(ScmServiceManager),
            host: Box::new(ScmServiceHost),
            toaster: Arc::new(BalloonToaster::new(runner)),
            com: Arc::new(ComObjects),
            stop_signals: forward_stop_signals,
        };

        Self {
            config,
            capabilities,
        }
    }
}

/// Ctrl-C in a console run becomes [`ServiceEvent::Stop`]; under the SCM the
/// control handler sends it instead.
fn forward_stop_signals(events: Sender<ServiceEvent>) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("received Ctrl-C, stopping");
        if let Err(e) = events.send(ServiceEvent::Stop) {
            warn!("service loop already gone: {e}");
        }
    })
    .map_err(|e| ShimError::Service(e.to_string()))
}
