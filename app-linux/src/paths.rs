use std::path::PathBuf;

use hostshim_core::platform::AppPaths;

/// `~/.config/hostshim/config.toml` for users, `/etc/hostshim` for root.
#[derive(Default)]
pub struct LinuxPaths;

impl AppPaths for LinuxPaths {
    fn config_path(&self) -> PathBuf {
        let base = if unsafe { libc::getuid() } == 0 {
            PathBuf::from("/etc")
        } else {
            dirs::config_dir().unwrap_or_else(|| PathBuf::from("."))
        };
        base.join("hostshim").join("config.toml")
    }
}
