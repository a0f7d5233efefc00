mod cancel;

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;

pub use cancel::CancelToken;

pub const HOME_ENV: &str = "WATCHFIRE_HOME";
pub const DAEMON_FILE_NAME: &str = "daemon.yaml";
pub const DAEMON_BINARY_NAME: &str = "watchfired";

/// Per-user directory shared with the daemon (`~/.watchfire`).
pub fn watchfire_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".watchfire")
    } else {
        PathBuf::from("/tmp/watchfire")
    }
}

pub fn daemon_file_path() -> PathBuf {
    watchfire_dir().join(DAEMON_FILE_NAME)
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    watchfire_dir().join(file_name)
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}
