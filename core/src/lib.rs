pub mod cli;
pub mod config;
pub mod error;
pub mod process;
pub mod proxy;
pub mod service;
pub mod session;
pub mod shell;
pub mod toast;

/// Interfaces that platform shells implement to adapt the core library
/// without pulling in platform-specific dependencies.
pub mod platform {
    use std::path::PathBuf;
    use std::sync::mpsc::Sender;

    use crate::error::Result;
    use crate::process::{ProcessStatus, ProcessTable};
    use crate::proxy::ProxyUrl;
    use crate::service::{ServiceEvent, ServiceOptions, ServiceState};
    use crate::session::XInfo;
    use crate::toast::{Toast, ToastOutcome};

    /// Process enumeration and lookup.
    pub trait ProcessManager: Send + Sync {
        fn list_processes(&self) -> Result<ProcessTable>;
        fn process_info(&self, pid: u32) -> Result<ProcessStatus>;
        /// Pids whose command matches `cmd`. `path` additionally pins the
        /// executable image where the platform reports one.
        fn find_by_command(&self, cmd: &str, path: Option<&str>) -> Result<Vec<u32>>;
    }

    /// Proxy discovery from the host's configuration.
    pub trait ProxyDetector: Send + Sync {
        fn detect_proxy(&self) -> Result<ProxyUrl>;
        fn should_bypass(&self, host: &str) -> Result<bool>;
    }

    /// Who is logged in, and what their desktop session looks like.
    pub trait SessionProvider: Send + Sync {
        fn own_uid(&self) -> u32;
        /// Owner of the active console/graphical session.
        fn console_uid(&self) -> Result<u32>;
        fn username(&self, uid: u32) -> Result<String>;
        /// Looks `key` up in the environment of a process owned by `uid`.
        fn user_env(&self, uid: u32, key: &str) -> Option<String>;
        fn x_info(&self, uid: u32) -> Result<XInfo>;

        fn is_root(&self) -> bool {
            self.own_uid() == 0
        }
    }

    /// Registration with the platform's service manager.
    pub trait ServiceManager: Send + Sync {
        fn is_installed(&self, name: &str) -> Result<bool>;
        fn install(&self, opts: &ServiceOptions) -> Result<()>;
        fn uninstall(&self, opts: &ServiceOptions) -> Result<()>;
        fn start(&self, name: &str) -> Result<()>;
        fn stop(&self, name: &str) -> Result<()>;
        fn status(&self, name: &str) -> Result<ServiceState>;
    }

    /// Runs the process under the platform's service manager, forwarding
    /// lifecycle events until the service is told to stop.
    pub trait ServiceHost {
        fn run(&self, opts: &ServiceOptions, events: Sender<ServiceEvent>) -> Result<()>;
    }

    /// Desktop notifications.
    pub trait Toaster: Send + Sync {
        /// Blocks until the notification is dismissed or times out.
        fn toast(&self, toast: &Toast) -> Result<ToastOutcome>;
    }

    /// Creation of registered COM objects.
    pub trait ComActivator: Send + Sync {
        /// Creates `clsid` and asks it for `iid` (default `IUnknown`).
        fn activate(&self, clsid: &str, iid: Option<&str>) -> Result<()>;
    }

    /// Hosts without COM.
    pub struct NoCom;

    impl ComActivator for NoCom {
        fn activate(&self, _clsid: &str, _iid: Option<&str>) -> Result<()> {
            Err(crate::error::ShimError::unsupported("COM"))
        }
    }

    /// Trait for platform-correct config paths.
    pub trait AppPaths {
        fn config_path(&self) -> PathBuf;
    }
}
