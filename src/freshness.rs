//! Freshness tokens, sync markers and the staleness comparator.
//!
//! The catalog service reports an upload-date string that must match exactly,
//! the stock service a numeric timestamp where only a newer value counts.
//! Both are expressed through [`Freshness`], chosen per dataset.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque freshness value reported by a remote source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FreshnessToken(String);

impl FreshnessToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    /// Accept either a JSON string or a JSON number. Blank strings, nulls and
    /// structured values are not tokens.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(Self::new(s.as_str())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric reading of the token: a plain number, or an RFC 3339 date as
    /// epoch milliseconds.
    pub fn as_number(&self) -> Option<f64> {
        if let Ok(n) = self.0.parse::<f64>() {
            return n.is_finite().then_some(n);
        }
        DateTime::parse_from_rfc3339(&self.0)
            .ok()
            .map(|dt| dt.timestamp_millis() as f64)
    }
}

impl fmt::Display for FreshnessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a remote token is compared against the locally stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Any difference means the local copy is stale.
    Exact,
    /// Stale only when the remote token is numerically greater. Tokens that
    /// cannot be read as numbers fall back to [`Freshness::Exact`].
    Newer,
}

impl Freshness {
    pub fn remote_is_fresher(self, local: &FreshnessToken, remote: &FreshnessToken) -> bool {
        match self {
            Freshness::Exact => local != remote,
            Freshness::Newer => match (local.as_number(), remote.as_number()) {
                (Some(l), Some(r)) => r > l,
                _ => local != remote,
            },
        }
    }

    /// Full staleness decision: no local marker, a fresher remote token, or a
    /// force flag on either side.
    pub fn needs_sync(self, local: Option<&SyncMarker>, remote: &RemoteMarker) -> bool {
        match local {
            None => true,
            Some(marker) => {
                remote.force_flag
                    || marker.force_flag
                    || self.remote_is_fresher(&marker.freshness_token, &remote.freshness_token)
            }
        }
    }
}

/// The single synchronization record kept per mirrored dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub namespace: String,
    pub freshness_token: FreshnessToken,
    pub force_flag: bool,
    pub synced_at: String,
}

/// What the remote reported during the freshness check.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMarker {
    pub freshness_token: FreshnessToken,
    pub force_flag: bool,
    /// Raw payload, for services that answer the check with the full
    /// dataset. Belongs to this check only.
    pub bundled: Option<Vec<Value>>,
}

impl RemoteMarker {
    pub fn new(token: FreshnessToken, force_flag: bool) -> Self {
        Self {
            freshness_token: token,
            force_flag,
            bundled: None,
        }
    }

    pub fn with_bundled(mut self, payload: Option<Vec<Value>>) -> Self {
        self.bundled = payload;
        self
    }
}

/// Read a remote force flag. The catalog service sends `"Y"`/`"N"`, other
/// endpoints send booleans or 0/1.
pub fn parse_force_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => {
            let lower = s.trim().to_ascii_lowercase();
            lower == "y" || lower == "yes" || lower == "true" || lower == "1"
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn marker(token: &str, force: bool) -> SyncMarker {
        SyncMarker {
            namespace: "items".into(),
            freshness_token: FreshnessToken::new(token),
            force_flag: force,
            synced_at: String::new(),
        }
    }

    #[test]
    fn exact_mode_compares_by_equality() {
        let local = FreshnessToken::new("2024-01-01T00:00:00Z");
        assert!(!Freshness::Exact
            .remote_is_fresher(&local, &FreshnessToken::new("2024-01-01T00:00:00Z")));
        assert!(Freshness::Exact
            .remote_is_fresher(&local, &FreshnessToken::new("2024-01-02T00:00:00Z")));
        // Exact mode does not care about direction.
        assert!(Freshness::Exact
            .remote_is_fresher(&local, &FreshnessToken::new("2023-12-31T00:00:00Z")));
    }

    #[test]
    fn newer_mode_requires_greater_number() {
        let local = FreshnessToken::new("100");
        assert!(!Freshness::Newer.remote_is_fresher(&local, &FreshnessToken::new("90")));
        assert!(!Freshness::Newer.remote_is_fresher(&local, &FreshnessToken::new("100")));
        assert!(Freshness::Newer.remote_is_fresher(&local, &FreshnessToken::new("150")));
    }

    #[test]
    fn newer_mode_reads_rfc3339_dates() {
        let local = FreshnessToken::new("2024-01-01T00:00:00Z");
        let later = FreshnessToken::new("2024-01-01T00:00:01Z");
        assert!(Freshness::Newer.remote_is_fresher(&local, &later));
        assert!(!Freshness::Newer.remote_is_fresher(&later, &local));
    }

    #[test]
    fn newer_mode_falls_back_to_inequality() {
        let local = FreshnessToken::new("batch-a");
        assert!(Freshness::Newer.remote_is_fresher(&local, &FreshnessToken::new("batch-b")));
        assert!(!Freshness::Newer.remote_is_fresher(&local, &FreshnessToken::new("batch-a")));
    }

    #[test]
    fn needs_sync_without_local_marker() {
        let remote = RemoteMarker::new(FreshnessToken::new("1"), false);
        assert!(Freshness::Exact.needs_sync(None, &remote));
        assert!(Freshness::Newer.needs_sync(None, &remote));
    }

    #[test]
    fn force_flags_override_matching_tokens() {
        let remote = RemoteMarker::new(FreshnessToken::new("7"), true);
        assert!(Freshness::Exact.needs_sync(Some(&marker("7", false)), &remote));

        let remote = RemoteMarker::new(FreshnessToken::new("7"), false);
        assert!(Freshness::Exact.needs_sync(Some(&marker("7", true)), &remote));
        assert!(!Freshness::Exact.needs_sync(Some(&marker("7", false)), &remote));
    }

    #[test]
    fn tokens_from_json() {
        assert_eq!(
            FreshnessToken::from_value(&json!(1700000000)).map(|t| t.to_string()),
            Some("1700000000".to_string())
        );
        assert_eq!(
            FreshnessToken::from_value(&json!("  2024-03-01 ")).map(|t| t.to_string()),
            Some("2024-03-01".to_string())
        );
        assert!(FreshnessToken::from_value(&json!("   ")).is_none());
        assert!(FreshnessToken::from_value(&Value::Null).is_none());
        assert!(FreshnessToken::from_value(&json!({"a": 1})).is_none());
    }

    #[test]
    fn force_flag_spellings() {
        assert!(parse_force_flag(Some(&json!("Y"))));
        assert!(parse_force_flag(Some(&json!(true))));
        assert!(parse_force_flag(Some(&json!(1))));
        assert!(!parse_force_flag(Some(&json!("N"))));
        assert!(!parse_force_flag(Some(&json!(0))));
        assert!(!parse_force_flag(None));
    }
}
