// src/logger.rs
//
// Single responsibility: setting up the unified logging backend

use log::LevelFilter;
use oslog::OsLogger;

/// Routes `log` records to the macOS unified log.
/// Typically called early in `main()`.
pub fn init_logger() {
    if let Err(e) = OsLogger::new("io.hostshim.agent")
        .level_filter(LevelFilter::Debug)
        .init()
    {
        eprintln!("failed to initialize logger: {e}");
    }
}
