// src/main.rs
//
// Entry point for the macOS shell: unified logging, then the shared CLI

#[cfg(target_os = "macos")]
mod app;
#[cfg(target_os = "macos")]
mod logger;
#[cfg(target_os = "macos")]
mod paths;

#[cfg(target_os = "macos")]
fn main() {
    use clap::Parser;
    use hostshim_core::cli::{self, Cli};
    use log::{error, info};

    logger::init_logger();
    let cli = Cli::parse();
    info!("starting hostshim (macos)");

    let state = app::AppState::new(cli.config.clone());
    let mut stdout = std::io::stdout();
    if let Err(e) = cli::run(&cli, &state.capabilities, &state.config, &mut stdout) {
        error!("{e}");
        eprintln!("{e}");
        std::process::exit(1);
    }
}

#[cfg(not(target_os = "macos"))]
fn main() {
    eprintln!("hostshim_macos only runs on macOS");
    std::process::exit(1);
}
