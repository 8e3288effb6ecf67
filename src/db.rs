//! Local SQLite database layer for the Order Desk mirror.
//!
//! Uses rusqlite with WAL mode. Provides open-or-create, schema migrations
//! and the `local_settings` helpers the config layer is built on.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{MirrorError, Result};

/// Database connection plus where it lives. `db_path` is `None` for the
/// in-memory fallback.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: Option<PathBuf>,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "mirror.db";

/// Open or create the database at `{data_dir}/mirror.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once. Safe to call repeatedly.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir).map_err(|e| {
        MirrorError::storage_unavailable(format!(
            "Failed to create data dir {}: {e}",
            data_dir.display()
        ))
    })?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening mirror database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path).map_err(|e| {
                MirrorError::storage_unavailable(format!("Database open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)
        .map_err(|e| MirrorError::storage_unavailable(format!("migrations: {e}")))?;

    info!("Mirror database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: Some(db_path),
    })
}

/// In-memory database with the same schema. Used when durable storage is
/// refused; contents live for the session only.
pub fn init_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: None,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> std::result::Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, mirrored records and sync markers.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;

        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- one row per record per mirrored namespace
        CREATE TABLE IF NOT EXISTS mirror_records (
            namespace TEXT NOT NULL,
            record_key TEXT NOT NULL,
            position INTEGER NOT NULL,
            data TEXT NOT NULL,
            synced_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (namespace, record_key)
        );
        CREATE INDEX IF NOT EXISTS idx_mirror_records_position
            ON mirror_records(namespace, position);

        -- exactly one marker per namespace
        CREATE TABLE IF NOT EXISTS sync_markers (
            namespace TEXT PRIMARY KEY,
            freshness_token TEXT NOT NULL,
            force_flag INTEGER NOT NULL DEFAULT 0,
            synced_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        MirrorError::from(e)
    })?;

    info!("Applied migration v1 (settings, mirror_records, sync_markers)");
    Ok(())
}

/// Migration v2: binary asset cache.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS asset_cache (
            id TEXT PRIMARY KEY,
            blob BLOB NOT NULL,
            source_url TEXT NOT NULL,
            content_type TEXT,
            updated_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        MirrorError::from(e)
    })?;

    info!("Applied migration v2 (asset_cache table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
