//! Configuration loading and management.
//! Uses injected `AppPaths` so platform shells control where files live.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::error::Result;
use crate::platform::AppPaths;
use crate::service::ServiceOptions;

/// A config file named on the command line, overriding the platform default.
#[derive(Debug, Clone)]
pub struct ExplicitPath(pub PathBuf);

impl AppPaths for ExplicitPath {
    fn config_path(&self) -> PathBuf {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Executable registered with the service manager; defaults to the running binary.
    #[serde(default)]
    pub service_path: Option<String>,
    #[serde(default = "default_service_args")]
    pub args: Vec<String>,
    /// Uid of the user who installed the agent, consulted when probing
    /// per-user settings while running as root.
    #[serde(default)]
    pub installed_by: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `1` to enable WPAD without a domain, or a DNS suffix such as `corp.example`.
    #[serde(default)]
    pub autoproxy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToastConfig {
    pub title: String,
    #[serde(default = "default_toast_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub toast: ToastConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_service_args() -> Vec<String> {
    vec!["service".to_string(), "run".to_string()]
}

fn default_toast_timeout() -> u64 {
    5
}

impl Config {
    /// Load configuration from the provided paths. Creates a default file if missing.
    pub fn load_with(paths: &dyn AppPaths) -> Result<Self> {
        let config_path = paths.config_path();

        if !config_path.exists() {
            info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let default_config = Self::default();
            default_config.save_with(paths)?;
            return Ok(default_config);
        }

        debug!("Loading config from {:?}", config_path);
        let content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&content)?;

        info!("Loaded configuration for service '{}'", config.service.name);
        Ok(config)
    }

    /// Save configuration to the provided paths.
    pub fn save_with(&self, paths: &dyn AppPaths) -> Result<()> {
        let config_path = paths.config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Return configured PATH for spawned tools, if any.
    pub fn get_path(&self) -> Option<String> {
        self.path.clone()
    }

    /// Build the options handed to the service manager.
    pub fn service_options(&self) -> ServiceOptions {
        let service_path = self.service.service_path.clone().or_else(|| {
            std::env::current_exe()
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        });

        ServiceOptions {
            name: self.service.name.clone(),
            display_name: self.service.display_name.clone(),
            description: self.service.description.clone(),
            service_path: service_path.unwrap_or_else(|| self.service.name.clone()),
            args: self.service.args.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "hostshim".to_string(),
                display_name: "Host Shim Agent".to_string(),
                description: Some("OS integration helper for remote management".to_string()),
                service_path: None,
                args: default_service_args(),
                installed_by: None,
            },
            proxy: ProxyConfig::default(),
            toast: ToastConfig {
                title: "Host Shim Agent".to_string(),
                timeout_secs: default_toast_timeout(),
            },
            path: None,
        }
    }
}
