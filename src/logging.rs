//! Logging setup and state directory handling

use anyhow::{Result, anyhow, bail};
use std::{
    fmt,
    fs::{self, OpenOptions},
    path::Path,
    sync::Arc,
};
use tracing::Level;

/// Name of the log file inside the state directory
pub const LOG_FILE_NAME: &str = "ptcontrol.log";

/// parse_level maps a textual level to a tracing level. Empty or unknown
/// input falls back to ERROR
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" | "NOTICE" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        _ => Level::ERROR,
    }
}

/// init installs the global tracing subscriber. With `enable` set the log
/// goes to the state directory, otherwise to stderr
pub fn init(state_dir: &Path, config: &crate::config::LogConfig) -> Result<()> {
    let level = parse_level(&config.level);

    let installed = if config.enable {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(state_dir.join(LOG_FILE_NAME))?;
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init()
    };

    installed.map_err(|e| anyhow!("failed to initialize logging: {e}"))
}

/// prepare_state_dir creates the state directory if needed and checks
/// that it is writable
pub fn prepare_state_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        create_private_dir(path)?;
    }

    if !path.is_dir() {
        bail!("state directory {} is not a directory", path.display());
    }

    // Probe writability
    let probe = path.join(".ptcontrol-writetest");
    fs::write(&probe, b"")
        .map_err(|e| anyhow!("state directory {} is not writable: {e}", path.display()))?;
    fs::remove_file(&probe)?;

    Ok(())
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Scrubbed renders an address for logging, hiding it unless unsafe
/// logging is enabled
pub struct Scrubbed<'a> {
    addr: &'a str,
    reveal: bool,
}

impl<'a> Scrubbed<'a> {
    pub fn new(addr: &'a str, reveal: bool) -> Self {
        Self { addr, reveal }
    }
}

impl fmt::Display for Scrubbed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reveal {
            f.write_str(self.addr)
        } else {
            f.write_str("[scrubbed]")
        }
    }
}
