//! Mirror configuration.
//!
//! Stored under the `mirror` category of the `local_settings` table, with
//! `ORDER_DESK_REMOTE_URL` / `ORDER_DESK_API_KEY` taking precedence when set.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::api::{normalize_remote_url, DEFAULT_TIMEOUT};
use crate::db;
use crate::error::{MirrorError, Result};

const SETTINGS_CATEGORY: &str = "mirror";

const KEY_REMOTE_URL: &str = "remote_url";
const KEY_API_KEY: &str = "api_key";
const KEY_CATALOG_CHECK_PATH: &str = "catalog_check_path";
const KEY_CATALOG_FETCH_PATH: &str = "catalog_fetch_path";
const KEY_CATALOG_ACK_PATH: &str = "catalog_ack_path";
const KEY_STOCK_PATH: &str = "stock_path";
const KEY_REQUEST_TIMEOUT_SECS: &str = "request_timeout_secs";

pub const ENV_REMOTE_URL: &str = "ORDER_DESK_REMOTE_URL";
pub const ENV_API_KEY: &str = "ORDER_DESK_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    #[serde(alias = "remote_url")]
    pub remote_url: String,
    #[serde(default, alias = "api_key")]
    pub api_key: Option<String>,
    #[serde(default = "default_catalog_check_path", alias = "catalog_check_path")]
    pub catalog_check_path: String,
    #[serde(default = "default_catalog_fetch_path", alias = "catalog_fetch_path")]
    pub catalog_fetch_path: String,
    #[serde(default = "default_catalog_ack_path", alias = "catalog_ack_path")]
    pub catalog_ack_path: String,
    #[serde(default = "default_stock_path", alias = "stock_path")]
    pub stock_path: String,
    #[serde(default = "default_timeout_secs", alias = "request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_catalog_check_path() -> String {
    "?action=syncInfo".to_string()
}

fn default_catalog_fetch_path() -> String {
    "?action=items".to_string()
}

fn default_catalog_ack_path() -> String {
    "?action=ackManualSync".to_string()
}

fn default_stock_path() -> String {
    "?action=stock".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            api_key: None,
            catalog_check_path: default_catalog_check_path(),
            catalog_fetch_path: default_catalog_fetch_path(),
            catalog_ack_path: default_catalog_ack_path(),
            stock_path: default_stock_path(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

impl MirrorConfig {
    /// Effective config: the stored values with environment overrides on top.
    pub fn load(conn: &Connection) -> Self {
        let mut config = Self::load_stored(conn);
        config.apply_env_overrides();
        config
    }

    /// Stored values only, defaults for anything missing.
    pub fn load_stored(conn: &Connection) -> Self {
        let get = |key: &str| {
            db::get_setting(conn, SETTINGS_CATEGORY, key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        Self {
            remote_url: get(KEY_REMOTE_URL)
                .map(|u| normalize_remote_url(&u))
                .unwrap_or(defaults.remote_url),
            api_key: get(KEY_API_KEY),
            catalog_check_path: get(KEY_CATALOG_CHECK_PATH)
                .unwrap_or(defaults.catalog_check_path),
            catalog_fetch_path: get(KEY_CATALOG_FETCH_PATH)
                .unwrap_or(defaults.catalog_fetch_path),
            catalog_ack_path: get(KEY_CATALOG_ACK_PATH).unwrap_or(defaults.catalog_ack_path),
            stock_path: get(KEY_STOCK_PATH).unwrap_or(defaults.stock_path),
            request_timeout_secs: get(KEY_REQUEST_TIMEOUT_SECS)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.request_timeout_secs),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = env_value(ENV_REMOTE_URL) {
            self.remote_url = normalize_remote_url(&url);
        }
        if let Some(key) = env_value(ENV_API_KEY) {
            self.api_key = Some(key);
        }
    }

    /// Persist every field. An absent API key clears the stored one.
    pub fn save(&self, conn: &Connection) -> Result<()> {
        self.validate()?;
        let set = |key: &str, value: &str| db::set_setting(conn, SETTINGS_CATEGORY, key, value);
        set(KEY_REMOTE_URL, &normalize_remote_url(&self.remote_url))?;
        set(KEY_API_KEY, self.api_key.as_deref().unwrap_or(""))?;
        set(KEY_CATALOG_CHECK_PATH, &self.catalog_check_path)?;
        set(KEY_CATALOG_FETCH_PATH, &self.catalog_fetch_path)?;
        set(KEY_CATALOG_ACK_PATH, &self.catalog_ack_path)?;
        set(KEY_STOCK_PATH, &self.stock_path)?;
        set(
            KEY_REQUEST_TIMEOUT_SECS,
            &self.request_timeout_secs.to_string(),
        )?;
        info!(remote_url = %normalize_remote_url(&self.remote_url), "mirror config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_url.trim().is_empty() {
            return Err(MirrorError::config("missing remote service URL"));
        }
        if self.request_timeout_secs == 0 {
            return Err(MirrorError::config("request timeout must be positive"));
        }
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
