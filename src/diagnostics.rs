//! Diagnostics helpers: app directories, version info and log rotation.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the rolling log files written by `init_logging`.
pub const LOG_FILE_PREFIX: &str = "mirror";

const APP_DIR_NAME: &str = "app.orderdesk.mirror";

/// Overrides the data directory (database and logs).
pub const ENV_DATA_DIR: &str = "ORDER_DESK_DATA_DIR";

/// Version info for the status command. Release pipelines stamp the build
/// through `ORDER_DESK_BUILD_TIMESTAMP` / `ORDER_DESK_BUILD_SHA` at compile
/// time; local builds report the sha as `unknown`.
pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": option_env!("ORDER_DESK_BUILD_TIMESTAMP"),
        "gitSha": option_env!("ORDER_DESK_BUILD_SHA").unwrap_or("unknown"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

/// Root directory for the mirror database and logs.
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var(ENV_DATA_DIR)
        .ok()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
    {
        return PathBuf::from(dir);
    }

    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

pub fn get_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}

/// Prune old log files in `log_dir`, keeping only the most recent
/// `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
