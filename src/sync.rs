//! Dataset synchronization.
//!
//! One algorithm for every mirrored dataset: compare the remote freshness
//! marker with the local one, refetch and replace the whole dataset when it
//! is stale, and always hand back whatever is in the local store. Network
//! and payload failures never escape; they come back as
//! [`SyncStatus::ServedLocal`] so the caller can show a notice.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{MirrorError, Result};
use crate::freshness::RemoteMarker;
use crate::mirror::MirrorStore;
use crate::notices::{NoticeLevel, SyncNotice};
use crate::records::{Dataset, MirrorRecord};

/// Remote side of a mirrored dataset.
#[async_trait]
pub trait RemoteSource<R>: Send + Sync {
    /// Current freshness marker.
    async fn check(&self) -> Result<RemoteMarker>;

    /// Full payload. `bundled` is whatever raw payload the preceding check
    /// of the same pass returned.
    async fn fetch(&self, bundled: Option<Vec<Value>>) -> Result<Vec<R>>;

    /// Tell the remote its force flag was honoured.
    async fn acknowledge_force(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub enum SyncStatus {
    /// Local marker matched the remote one; nothing written.
    UpToDate,
    /// Dataset replaced with a fresh snapshot.
    Updated {
        previous: usize,
        current: usize,
        forced: bool,
    },
    /// The remote could not be used; local data served as is.
    ServedLocal { reason: MirrorError },
}

#[derive(Debug)]
pub struct SyncReport<R> {
    pub namespace: &'static str,
    pub records: Vec<R>,
    pub status: SyncStatus,
}

impl<R> SyncReport<R> {
    pub fn updated(&self) -> bool {
        matches!(self.status, SyncStatus::Updated { .. })
    }

    /// Non-blocking notice for the UI, if this outcome warrants one.
    pub fn notice(&self) -> Option<SyncNotice> {
        match &self.status {
            SyncStatus::UpToDate => None,
            SyncStatus::Updated { current, .. } => Some(SyncNotice::new(
                self.namespace,
                NoticeLevel::Info,
                format!("{} updated ({current} records)", self.namespace),
            )),
            SyncStatus::ServedLocal { reason } => Some(SyncNotice::new(
                self.namespace,
                if reason.is_malformed() {
                    NoticeLevel::Error
                } else {
                    NoticeLevel::Warning
                },
                reason.notice_text(),
            )),
        }
    }
}

/// Type-erased report handed to the UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub namespace: String,
    /// `up_to_date`, `updated` or `served_local`.
    pub status: &'static str,
    pub updated: bool,
    pub forced: bool,
    pub record_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<SyncNotice>,
    #[serde(skip)]
    pub records: Vec<Value>,
}

impl<R: Serialize> From<SyncReport<R>> for SyncSummary {
    fn from(report: SyncReport<R>) -> Self {
        let notice = report.notice();
        let (status, forced, error) = match &report.status {
            SyncStatus::UpToDate => ("up_to_date", false, None),
            SyncStatus::Updated { forced, .. } => ("updated", *forced, None),
            SyncStatus::ServedLocal { reason } => ("served_local", false, Some(reason.to_string())),
        };
        let records: Vec<Value> = report
            .records
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        Self {
            namespace: report.namespace.to_string(),
            status,
            updated: status == "updated",
            forced,
            record_count: records.len(),
            error,
            notice,
            records,
        }
    }
}

/// Bring `dataset` up to date with `source` if needed and return the local
/// records.
pub async fn sync_dataset<R: MirrorRecord>(
    store: &MirrorStore,
    dataset: &Dataset<R>,
    source: &dyn RemoteSource<R>,
) -> SyncReport<R> {
    let namespace = dataset.namespace;
    let local_marker = store.read_sync_marker(namespace).unwrap_or_else(|e| {
        warn!(namespace, error = %e, "sync: local marker unreadable, treating as absent");
        None
    });

    let mut remote = match source.check().await {
        Ok(marker) => marker,
        Err(e) => return served_local(store, dataset, e),
    };

    if !dataset.freshness.needs_sync(local_marker.as_ref(), &remote) {
        debug!(namespace, token = %remote.freshness_token, "sync: already up to date");
        return SyncReport {
            namespace,
            records: read_local(store, dataset),
            status: SyncStatus::UpToDate,
        };
    }

    let bundled = remote.bundled.take();
    let payload = match source.fetch(bundled).await {
        Ok(records) if records.is_empty() => {
            return served_local(
                store,
                dataset,
                MirrorError::malformed(format!("{namespace}: remote returned an empty dataset")),
            )
        }
        Ok(records) => records,
        Err(e) => return served_local(store, dataset, e),
    };

    let previous = store.dataset_len(namespace).unwrap_or(0);
    if let Err(e) = store.apply_snapshot(dataset, &payload, &remote.freshness_token) {
        return served_local(store, dataset, e);
    }

    if remote.force_flag {
        match source.acknowledge_force().await {
            Ok(()) => debug!(namespace, "sync: forced sync acknowledged"),
            Err(e) => warn!(namespace, error = %e, "sync: could not acknowledge forced sync"),
        }
    }

    info!(
        namespace,
        previous,
        current = payload.len(),
        forced = remote.force_flag,
        token = %remote.freshness_token,
        "sync: dataset refreshed"
    );

    SyncReport {
        namespace,
        records: read_local(store, dataset),
        status: SyncStatus::Updated {
            previous,
            current: payload.len(),
            forced: remote.force_flag,
        },
    }
}

fn served_local<R: MirrorRecord>(
    store: &MirrorStore,
    dataset: &Dataset<R>,
    reason: MirrorError,
) -> SyncReport<R> {
    let records = read_local(store, dataset);
    if reason.is_malformed() {
        warn!(
            namespace = dataset.namespace,
            error = %reason,
            local_records = records.len(),
            "sync: remote payload rejected, keeping local data"
        );
    } else {
        debug!(
            namespace = dataset.namespace,
            error = %reason,
            local_records = records.len(),
            "sync: remote unavailable, serving local data"
        );
    }
    SyncReport {
        namespace: dataset.namespace,
        records,
        status: SyncStatus::ServedLocal { reason },
    }
}

fn read_local<R: MirrorRecord>(store: &MirrorStore, dataset: &Dataset<R>) -> Vec<R> {
    store.read_dataset(dataset).unwrap_or_else(|e| {
        warn!(namespace = dataset.namespace, error = %e, "sync: local read failed");
        Vec::new()
    })
}
