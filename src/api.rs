//! Remote service HTTP client.
//!
//! Thin wrapper over `reqwest` used by the catalog, stock and asset sources.
//! Every transport problem becomes [`MirrorError::NetworkFailure`]; a body
//! that is not the JSON we asked for becomes [`MirrorError::MalformedPayload`].

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::assets::FetchedAsset;
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote service URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Join a base URL and a path. Absolute paths (full URLs) are used as is.
fn join_url(base: &str, path: &str) -> String {
    let path = path.trim();
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    if path.is_empty() {
        return base.to_string();
    }
    if path.starts_with('/') || path.starts_with('?') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> MirrorError {
    if err.is_connect() {
        return MirrorError::network(format!("Cannot reach remote service at {url}"));
    }
    if err.is_timeout() {
        return MirrorError::network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return MirrorError::config(format!("Invalid remote service URL: {url}"));
    }
    MirrorError::network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Access to the remote service was denied".to_string(),
        404 => "Remote service endpoint not found".to_string(),
        s if s >= 500 => "Remote service error".to_string(),
        _ => "Unexpected response from remote service".to_string(),
    }
}

/// Pull an error message out of a JSON error body, if it has one.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let message = serde_json::from_str::<Value>(body_text).ok().and_then(|json| {
        json.get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    match message {
        Some(message) => format!("{message} (HTTP {})", status.as_u16()),
        None if !body_text.trim().is_empty() && body_text.len() <= 200 => format!(
            "{} (HTTP {}): {}",
            status_error(status),
            status.as_u16(),
            body_text.trim()
        ),
        None => format!("{} (HTTP {})", status_error(status), status.as_u16()),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RemoteClient {
    pub fn new(config: &MirrorConfig) -> Result<Self> {
        config.validate()?;
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| MirrorError::config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: normalize_remote_url(&config.remote_url),
            api_key: config
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Send a request and return the parsed JSON body, or `Value::Null` for
    /// an empty body.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let full_url = self.url_for(path);
        let mut req = self
            .http
            .request(method.clone(), &full_url)
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            req = req.header("X-Api-Key", key);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        debug!(method = %method, url = %full_url, "remote request");
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        if !status.is_success() {
            let detail = error_detail(status, &body_text);
            warn!(url = %full_url, status = status.as_u16(), "remote request failed");
            return Err(MirrorError::network(detail));
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| MirrorError::malformed(format!("Invalid JSON from {full_url}: {e}")))
    }

    pub async fn get_json(&self, path: &str) -> Result<Value> {
        self.request_json(Method::GET, path, None).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        self.request_json(Method::POST, path, Some(body)).await
    }

    /// Raw bytes from `url` (absolute, or relative to the base URL).
    pub async fn get_bytes(&self, url: &str) -> Result<FetchedAsset> {
        let full_url = self.url_for(url);
        let resp = self
            .http
            .get(&full_url)
            .send()
            .await
            .map_err(|e| friendly_error(&full_url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MirrorError::network(format!(
                "{} (HTTP {}) for {full_url}",
                status_error(status),
                status.as_u16()
            )));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty());
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| friendly_error(&full_url, &e))?;
        Ok(FetchedAsset {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
