//! Windows shell for hostshim.
//! Native process, registry, SCM and COM access behind the shared CLI.

#[cfg(windows)]
mod app;
#[cfg(windows)]
mod com;
#[cfg(windows)]
mod paths;
#[cfg(windows)]
mod process;
#[cfg(windows)]
mod proxy;
#[cfg(windows)]
mod registry;
#[cfg(windows)]
mod service;
#[cfg(windows)]
mod toast;
#[cfg(windows)]
mod win32;

#[cfg(windows)]
fn main() {
    use clap::Parser;
    use hostshim_core::cli::{self, Cli};
    use log::{error, info};

    use crate::app::AppState;

    env_logger::init();
    let cli = Cli::parse();
    info!("starting hostshim (windows)");

    let state = AppState::new(cli.config.clone());
    let mut stdout = std::io::stdout();
    if let Err(e) = cli::run(&cli, &state.capabilities, &state.config, &mut stdout) {
        error!("{e}");
        eprintln!("{e}");
        std::process::exit(1);
    }
}

#[cfg(not(windows))]
fn main() {
    eprintln!("hostshim_windows only runs on Windows");
    std::process::exit(1);
}
