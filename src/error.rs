//! Error types for the local mirror.
//!
//! None of these are fatal to the host process: sync paths degrade to the
//! locally mirrored data and surface the error as a notice instead.

use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// Remote unreachable, timed out, non-success status or `success=false`.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// The platform refused durable storage (permissions, quota, bad path).
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The remote answered but the payload is unusable.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MirrorError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload(message.into())
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::NetworkFailure(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedPayload(_))
    }

    /// Short text for the non-blocking notice shown next to cached data.
    ///
    /// "Did not answer" and "answered with garbage" read differently so an
    /// operator can tell them apart.
    pub fn notice_text(&self) -> String {
        match self {
            Self::NetworkFailure(_) => "Remote unreachable, showing cached data".to_string(),
            Self::MalformedPayload(_) => {
                "Remote returned unusable data, showing cached data".to_string()
            }
            Self::StorageUnavailable(_) => {
                "Local storage unavailable, offline data will not persist".to_string()
            }
            Self::Storage(_) | Self::Serialization(_) => {
                "Local cache error, data may be stale".to_string()
            }
            Self::Config(msg) => format!("Mirror not configured: {msg}"),
        }
    }
}
