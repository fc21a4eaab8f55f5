use std::path::PathBuf;

use hostshim_core::platform::AppPaths;

/// macOS implementation of application paths.
/// Root (launchd daemons) reads `/Library/Application Support/hostshim`;
/// users keep the layout under ~/.config/hostshim.
#[derive(Default)]
pub struct MacPaths;

impl AppPaths for MacPaths {
    fn config_path(&self) -> PathBuf {
        let mut base = if unsafe { libc::getuid() } == 0 {
            PathBuf::from("/Library/Application Support")
        } else {
            let mut home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            home.push(".config");
            home
        };
        base.push("hostshim");
        base.push("config.toml");
        base
    }
}
