//! Central path resolution for Companion data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `COMPANION_DATA_DIR` env > `~/.companion`.
//! The env fallback is applied by clap, so callers only pass the parsed value.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

const DEFAULT_DIR_NAME: &str = ".companion";

/// Default data directory under the user's home.
pub fn default_data_dir() -> io::Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_DIR_NAME))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME directory not found"))
}

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => default_data_dir()?,
    };

    let mut guard = DATA_DIR
        .write()
        .map_err(|_| io::Error::other("DATA_DIR lock poisoned"))?;
    *guard = Some(dir.clone());
    Ok(dir)
}

/// Return the current data directory, falling back to the default when
/// `init_data_dir` has not run.
pub fn data_dir() -> io::Result<PathBuf> {
    let current = DATA_DIR
        .read()
        .map_err(|_| io::Error::other("DATA_DIR lock poisoned"))?
        .clone();
    match current {
        Some(dir) => Ok(dir),
        None => default_data_dir(),
    }
}

pub fn log_dir() -> io::Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir()?;
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
