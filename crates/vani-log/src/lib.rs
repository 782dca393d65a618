// ABOUTME: Shared logging setup for vani binaries
// ABOUTME: init() writes to stderr, init_file() appends to a per-app log file

use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

fn filter(default_level: Level) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(default_level.into())
}

/// Level used when RUST_LOG does not say otherwise.
pub fn default_level(verbose: bool) -> Level {
    if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    }
}

/// Logging to stderr. INFO by default, DEBUG with `verbose`, RUST_LOG overrides.
pub fn init(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(default_level(verbose)))
        .with_target(false)
        .init();
}

/// Where `init_file` writes for a given app: `<config dir>/vani/<app>.log`.
pub fn log_path(app_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vani").join(format!("{app_name}.log")))
}

/// File logging for the supervisor daemon, so worker echo on stderr stays readable.
/// If setup fails, prints a warning to stderr and continues without logging.
pub fn init_file(app_name: &str, verbose: bool) {
    if let Err(e) = init_file_inner(app_name, verbose) {
        eprintln!("Warning: failed to set up file logging: {e}");
    }
}

fn init_file_inner(app_name: &str, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = log_path(app_name).ok_or("could not determine config directory")?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(filter(default_level(verbose)))
        .with_ansi(false)
        .init();

    Ok(())
}
