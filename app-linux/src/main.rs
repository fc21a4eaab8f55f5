//! Linux and FreeBSD shell for hostshim.
//! Wires the shell-backed core capabilities to the command line.

#[cfg(unix)]
mod app;
#[cfg(unix)]
mod paths;

#[cfg(unix)]
fn main() {
    use clap::Parser;
    use hostshim_core::cli::{self, Cli};
    use log::{error, info};

    use crate::app::AppState;

    env_logger::init();
    let cli = Cli::parse();
    info!("starting hostshim ({})", std::env::consts::OS);

    let state = AppState::new(cli.config.clone());
    let mut stdout = std::io::stdout();
    if let Err(e) = cli::run(&cli, &state.capabilities, &state.config, &mut stdout) {
        error!("{e}");
        eprintln!("{e}");
        std::process::exit(1);
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("hostshim_linux only runs on Linux and FreeBSD");
    std::process::exit(1);
}
