//! Local mirror store.
//!
//! Durable persistence for the mirrored datasets, their sync markers and the
//! binary asset cache, on top of the SQLite layer in [`crate::db`]. Every
//! dataset replacement runs in a single transaction, so readers see either
//! the previous snapshot or the new one.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::assets::CachedAsset;
use crate::db::{self, DbState};
use crate::error::{MirrorError, Result};
use crate::freshness::{FreshnessToken, SyncMarker};
use crate::records::{Dataset, MirrorRecord};

pub struct MirrorStore {
    db: DbState,
}

/// Per-namespace snapshot for the status command.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStatus {
    pub namespace: String,
    pub records: usize,
    pub marker: Option<SyncMarker>,
}

impl MirrorStore {
    /// Open or create the durable store under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = db::init(data_dir)?;
        Ok(Self { db })
    }

    /// Session-only store with the same schema.
    pub fn open_in_memory() -> Result<Self> {
        let db = db::init_in_memory()?;
        Ok(Self { db })
    }

    pub fn is_durable(&self) -> bool {
        self.db.db_path.is_some()
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .conn
            .lock()
            .map_err(|e| MirrorError::storage_unavailable(format!("mirror db lock poisoned: {e}")))
    }

    // -----------------------------------------------------------------------
    // Datasets
    // -----------------------------------------------------------------------

    /// Discard every record in the dataset's namespace and insert `records`,
    /// all or nothing.
    pub fn replace_dataset<R: MirrorRecord>(
        &self,
        dataset: &Dataset<R>,
        records: &[R],
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let written = replace_in_tx(&tx, dataset, records)?;
        tx.commit()?;
        debug!(namespace = dataset.namespace, records = written, "mirror: dataset replaced");
        Ok(written)
    }

    /// Replace the dataset and upsert its marker in one transaction.
    pub fn apply_snapshot<R: MirrorRecord>(
        &self,
        dataset: &Dataset<R>,
        records: &[R],
        token: &FreshnessToken,
    ) -> Result<SyncMarker> {
        let marker = SyncMarker {
            namespace: dataset.namespace.to_string(),
            freshness_token: token.clone(),
            force_flag: false,
            synced_at: Utc::now().to_rfc3339(),
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let written = replace_in_tx(&tx, dataset, records)?;
        upsert_marker(&tx, &marker)?;
        tx.commit()?;

        info!(
            namespace = dataset.namespace,
            records = written,
            token = %token,
            "mirror: snapshot applied"
        );
        Ok(marker)
    }

    /// All records in the namespace, in the order they were received. Rows
    /// that no longer deserialize are skipped.
    pub fn read_dataset<R: MirrorRecord>(&self, dataset: &Dataset<R>) -> Result<Vec<R>> {
        let raw = self.read_raw(dataset.namespace)?;
        let mut records = Vec::with_capacity(raw.len());
        for (key, json) in raw {
            match serde_json::from_str::<R>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    namespace = dataset.namespace,
                    record_key = %key,
                    "mirror: skipping unreadable record: {e}"
                ),
            }
        }
        Ok(records)
    }

    /// Untyped read used by the UI commands.
    pub fn read_dataset_json(&self, namespace: &str) -> Result<Vec<Value>> {
        let raw = self.read_raw(namespace)?;
        Ok(raw
            .into_iter()
            .filter_map(|(key, json)| match serde_json::from_str::<Value>(&json) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(namespace, record_key = %key, "mirror: skipping unreadable record: {e}");
                    None
                }
            })
            .collect())
    }

    fn read_raw(&self, namespace: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_key, data FROM mirror_records
             WHERE namespace = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![namespace], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn dataset_len(&self, namespace: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mirror_records WHERE namespace = ?1",
            params![namespace],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    // -----------------------------------------------------------------------
    // Sync markers
    // -----------------------------------------------------------------------

    /// `None` when the namespace has never been synced.
    pub fn read_sync_marker(&self, namespace: &str) -> Result<Option<SyncMarker>> {
        let conn = self.conn()?;
        let marker = conn
            .query_row(
                "SELECT namespace, freshness_token, force_flag, synced_at
                 FROM sync_markers WHERE namespace = ?1",
                params![namespace],
                |row| {
                    Ok(SyncMarker {
                        namespace: row.get(0)?,
                        freshness_token: FreshnessToken::new(row.get::<_, String>(1)?),
                        force_flag: row.get::<_, i64>(2)? != 0,
                        synced_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(marker)
    }

    pub fn write_sync_marker(&self, marker: &SyncMarker) -> Result<()> {
        let conn = self.conn()?;
        upsert_marker(&conn, marker)
    }

    /// Flag the local marker so the next sync refetches regardless of the
    /// remote token. A namespace without a marker is already due for a sync.
    pub fn request_force_resync(&self, namespace: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sync_markers SET force_flag = 1 WHERE namespace = ?1",
            params![namespace],
        )?;
        Ok(changed > 0)
    }

    /// Marker and record count for every namespace that has either.
    pub fn namespaces(&self) -> Result<Vec<NamespaceStatus>> {
        let names: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT namespace FROM sync_markers
                 UNION SELECT DISTINCT namespace FROM mirror_records
                 ORDER BY 1",
            )?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        names
            .into_iter()
            .map(|namespace| {
                Ok(NamespaceStatus {
                    records: self.dataset_len(&namespace)?,
                    marker: self.read_sync_marker(&namespace)?,
                    namespace,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Binary assets
    // -----------------------------------------------------------------------

    pub fn read_cached_asset(&self, id: &str) -> Result<Option<CachedAsset>> {
        let conn = self.conn()?;
        let asset = conn
            .query_row(
                "SELECT id, blob, source_url, content_type, updated_at
                 FROM asset_cache WHERE id = ?1",
                params![id],
                |row| {
                    Ok(CachedAsset {
                        id: row.get(0)?,
                        blob: row.get(1)?,
                        source_url: row.get(2)?,
                        content_type: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(asset)
    }

    pub fn write_cached_asset(
        &self,
        id: &str,
        blob: &[u8],
        source_url: &str,
        content_type: Option<&str>,
    ) -> Result<CachedAsset> {
        let asset = CachedAsset {
            id: id.to_string(),
            blob: blob.to_vec(),
            source_url: source_url.to_string(),
            content_type: content_type.map(str::to_string),
            updated_at: Utc::now().to_rfc3339(),
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO asset_cache (id, blob, source_url, content_type, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                blob = excluded.blob,
                source_url = excluded.source_url,
                content_type = excluded.content_type,
                updated_at = excluded.updated_at",
            params![
                asset.id,
                asset.blob,
                asset.source_url,
                asset.content_type,
                asset.updated_at
            ],
        )?;
        Ok(asset)
    }
}

fn replace_in_tx<R: MirrorRecord>(
    tx: &Transaction<'_>,
    dataset: &Dataset<R>,
    records: &[R],
) -> Result<usize> {
    let namespace = dataset.namespace;
    tx.execute(
        "DELETE FROM mirror_records WHERE namespace = ?1",
        params![namespace],
    )?;

    let synced_at = Utc::now().to_rfc3339();
    let mut stmt = tx.prepare(
        "INSERT INTO mirror_records (namespace, record_key, position, data, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;

    for (position, record) in records.iter().enumerate() {
        let key = dataset.key_of(record);
        if key.is_empty() {
            return Err(MirrorError::malformed(format!(
                "{namespace}: record {position} has an empty key"
            )));
        }
        let data = serde_json::to_string(record)?;
        stmt.execute(params![namespace, key, position as i64, data, synced_at])
            .map_err(|e| match e.sqlite_error_code() {
                Some(ErrorCode::ConstraintViolation) => {
                    MirrorError::malformed(format!("{namespace}: duplicate record key {key}"))
                }
                _ => MirrorError::from(e),
            })?;
    }

    Ok(records.len())
}

fn upsert_marker(conn: &Connection, marker: &SyncMarker) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_markers (namespace, freshness_token, force_flag, synced_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(namespace) DO UPDATE SET
            freshness_token = excluded.freshness_token,
            force_flag = excluded.force_flag,
            synced_at = excluded.synced_at",
        params![
            marker.namespace,
            marker.freshness_token.as_str(),
            marker.force_flag as i64,
            marker.synced_at
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Process-wide store
// ---------------------------------------------------------------------------

static SHARED_STORE: OnceCell<Arc<MirrorStore>> = OnceCell::const_new();

/// Open the durable store under `data_dir`, or a session-only one when the
/// platform refuses durable storage.
pub fn open_or_fallback(data_dir: &Path) -> Result<MirrorStore> {
    match MirrorStore::open(data_dir) {
        Ok(store) => Ok(store),
        Err(e) => {
            warn!(
                data_dir = %data_dir.display(),
                error = %e,
                "mirror: durable storage unavailable, caching in memory for this session"
            );
            MirrorStore::open_in_memory()
        }
    }
}

/// Lazily opened process-wide store. The first caller's `data_dir` wins and
/// concurrent callers await the same initialisation.
pub async fn shared_store(data_dir: &Path) -> Result<Arc<MirrorStore>> {
    let dir = data_dir.to_path_buf();
    SHARED_STORE
        .get_or_try_init(|| async move { open_or_fallback(&dir).map(Arc::new) })
        .await
        .cloned()
}
