use std::path::PathBuf;

use hostshim_core::platform::AppPaths;

use crate::win32;

/// `%APPDATA%\hostshim` for interactive users; a service in session 0 reads
/// the machine-wide `%ProgramData%\hostshim`.
#[derive(Default)]
pub struct WindowsPaths;

impl AppPaths for WindowsPaths {
    fn config_path(&self) -> PathBuf {
        let machine = win32::own_session_id().is_ok_and(|session| session == 0);
        let base = if machine {
            std::env::var_os("ProgramData").map(PathBuf::from)
        } else {
            dirs::config_dir()
        };
        base.unwrap_or_else(|| PathBuf::from("."))
            .join("hostshim")
            .join("config.toml")
    }
}
