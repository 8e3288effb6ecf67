use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::assets::AssetOrigin;
use crate::config::MirrorConfig;
use crate::diagnostics;
use crate::notices::{NoticeLevel, SyncNotice};
use crate::records::DatasetKind;
use crate::sync::SyncSummary;
use crate::MirrorRuntime;

const ASSETS_NOTICE_NAMESPACE: &str = "assets";

fn resolve_dataset(namespace: &str) -> Result<DatasetKind, String> {
    DatasetKind::from_namespace(namespace)
        .ok_or_else(|| format!("Unknown mirrored dataset: {namespace}"))
}

fn summary_to_json(summary: SyncSummary) -> Result<Value, String> {
    let offline = summary.status == "served_local";
    let records = Value::Array(summary.records.clone());
    let mut out = serde_json::to_value(&summary).map_err(|e| e.to_string())?;
    if let Value::Object(map) = &mut out {
        map.insert("success".into(), Value::Bool(!offline));
        map.insert("offline".into(), Value::Bool(offline));
        map.insert("records".into(), records);
        map.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
    }
    Ok(out)
}

/// Read-through: answer from the local mirror right away and refresh it in
/// the background. Staleness is reported later through the notice bus.
pub async fn get_mirrored_data(
    runtime: &MirrorRuntime,
    namespace: &str,
) -> Result<Vec<Value>, String> {
    let kind = resolve_dataset(namespace)?;
    let records = runtime.read_local(kind).map_err(|e| e.to_string())?;
    info!(namespace = kind.namespace(), count = records.len(), "get_mirrored_data");
    drop(runtime.spawn_sync(kind));
    Ok(records)
}

/// Run a sync now and return its outcome together with the records.
pub async fn sync_mirrored_data(runtime: &MirrorRuntime, namespace: &str) -> Result<Value, String> {
    let kind = resolve_dataset(namespace)?;
    let summary = runtime.sync(kind).await;
    info!(
        namespace = kind.namespace(),
        status = summary.status,
        count = summary.record_count,
        "sync_mirrored_data"
    );
    summary_to_json(summary)
}

pub async fn force_resync(runtime: &MirrorRuntime, namespace: &str) -> Result<Value, String> {
    let kind = resolve_dataset(namespace)?;
    let flagged = runtime
        .store()
        .request_force_resync(kind.namespace())
        .map_err(|e| e.to_string())?;
    info!(namespace = kind.namespace(), flagged, "force_resync");

    let summary = runtime.sync(kind).await;
    let mut out = summary_to_json(summary)?;
    if let Value::Object(map) = &mut out {
        map.insert("forceRequested".into(), Value::Bool(flagged));
    }
    Ok(out)
}

/// Branding image as a `data:` URL.
pub async fn get_branding_image(
    runtime: &MirrorRuntime,
    id: &str,
    url: &str,
) -> Result<Value, String> {
    let id = id.trim();
    let url = url.trim();
    if id.is_empty() || url.is_empty() {
        return Err("Missing image id or url".into());
    }

    let lookup = runtime.load_asset(id, url).await.map_err(|e| {
        warn!(asset_id = id, error = %e, "get_branding_image failed");
        e.notice_text()
    })?;

    if let AssetOrigin::StaleCache(reason) = &lookup.origin {
        runtime.notices().publish(SyncNotice::new(
            ASSETS_NOTICE_NAMESPACE,
            NoticeLevel::Warning,
            reason.clone(),
        ));
    }

    let mut out = json!({
        "id": lookup.asset.id,
        "dataUrl": lookup.asset.data_url(),
        "sourceUrl": lookup.asset.source_url,
        "contentType": lookup.asset.content_type,
        "updatedAt": lookup.asset.updated_at,
    });
    if let (Value::Object(map), Ok(Value::Object(origin))) =
        (&mut out, serde_json::to_value(&lookup.origin))
    {
        map.extend(origin);
    }
    Ok(out)
}

/// Counts and markers for every known dataset, plus app info.
pub async fn mirror_status(runtime: &MirrorRuntime) -> Result<Value, String> {
    let store = runtime.store();
    let known = store.namespaces().map_err(|e| e.to_string())?;

    let datasets: Vec<Value> = DatasetKind::ALL
        .iter()
        .map(|kind| {
            let ns = kind.namespace();
            let status = known.iter().find(|s| s.namespace == ns);
            json!({
                "namespace": ns,
                "records": status.map(|s| s.records).unwrap_or(0),
                "marker": status.and_then(|s| s.marker.clone()),
            })
        })
        .collect();

    Ok(json!({
        "about": diagnostics::get_about_info(),
        "durable": store.is_durable(),
        "datasets": datasets,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Partial update from the settings screen. Absent fields keep their stored
/// value; a blank `apiKey` clears the key.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MirrorConfigPayload {
    #[serde(default, alias = "remote_url", alias = "url")]
    remote_url: Option<String>,
    #[serde(default, alias = "api_key")]
    api_key: Option<String>,
    #[serde(default, alias = "catalog_check_path")]
    catalog_check_path: Option<String>,
    #[serde(default, alias = "catalog_fetch_path")]
    catalog_fetch_path: Option<String>,
    #[serde(default, alias = "catalog_ack_path")]
    catalog_ack_path: Option<String>,
    #[serde(default, alias = "stock_path")]
    stock_path: Option<String>,
    #[serde(default, alias = "request_timeout_secs")]
    request_timeout_secs: Option<u64>,
}

impl MirrorConfigPayload {
    fn apply_to(self, config: &mut MirrorConfig) {
        let non_blank = |v: String| {
            let v = v.trim().to_string();
            (!v.is_empty()).then_some(v)
        };
        if let Some(url) = self.remote_url {
            config.remote_url = url.trim().to_string();
        }
        if let Some(key) = self.api_key {
            config.api_key = non_blank(key);
        }
        if let Some(path) = self.catalog_check_path.and_then(non_blank) {
            config.catalog_check_path = path;
        }
        if let Some(path) = self.catalog_fetch_path.and_then(non_blank) {
            config.catalog_fetch_path = path;
        }
        if let Some(path) = self.catalog_ack_path.and_then(non_blank) {
            config.catalog_ack_path = path;
        }
        if let Some(path) = self.stock_path.and_then(non_blank) {
            config.stock_path = path;
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout_secs = secs;
        }
    }
}

fn config_to_json(config: &MirrorConfig) -> Value {
    json!({
        "remoteUrl": config.remote_url,
        "hasApiKey": config.api_key.is_some(),
        "catalogCheckPath": config.catalog_check_path,
        "catalogFetchPath": config.catalog_fetch_path,
        "catalogAckPath": config.catalog_ack_path,
        "stockPath": config.stock_path,
        "requestTimeoutSecs": config.request_timeout_secs,
        "configured": config.is_configured(),
    })
}

/// Effective mirror config (environment overrides applied). The API key
/// itself is never returned.
pub async fn get_mirror_config(runtime: &MirrorRuntime) -> Result<Value, String> {
    let conn = runtime.store().conn().map_err(|e| e.to_string())?;
    Ok(config_to_json(&MirrorConfig::load(&conn)))
}

/// Save a config update and rewire the remote sources with it.
pub async fn set_mirror_config(runtime: &MirrorRuntime, payload: Value) -> Result<Value, String> {
    let patch: MirrorConfigPayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid mirror config: {e}"))?;

    let effective = {
        let conn = runtime.store().conn().map_err(|e| e.to_string())?;
        let mut stored = MirrorConfig::load_stored(&conn);
        patch.apply_to(&mut stored);
        stored.save(&conn).map_err(|e| e.to_string())?;
        MirrorConfig::load(&conn)
    };

    runtime.reconfigure(&effective);
    info!(
        remote_url = %effective.remote_url,
        configured = effective.is_configured(),
        "set_mirror_config"
    );
    let mut out = config_to_json(&effective);
    if let Value::Object(map) = &mut out {
        map.insert("success".into(), Value::Bool(true));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AssetFetcher, FetchedAsset};
    use crate::error::{MirrorError, Result};
    use crate::freshness::{FreshnessToken, RemoteMarker};
    use crate::mirror::MirrorStore;
    use crate::records::{CatalogItem, StockLevel};
    use crate::sync::RemoteSource;
    use async_trait::async_trait;
    use serial_test::serial;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedRemote<R> {
        token: &'static str,
        payload: Vec<R>,
    }

    #[async_trait]
    impl<R: Clone + Send + Sync> RemoteSource<R> for FixedRemote<R> {
        async fn check(&self) -> Result<RemoteMarker> {
            Ok(RemoteMarker::new(FreshnessToken::new(self.token), false))
        }

        async fn fetch(&self, _bundled: Option<Vec<Value>>) -> Result<Vec<R>> {
            Ok(self.payload.clone())
        }
    }

    struct DownRemote;

    #[async_trait]
    impl<R: Send + Sync + 'static> RemoteSource<R> for DownRemote {
        async fn check(&self) -> Result<RemoteMarker> {
            Err(MirrorError::network("connection refused"))
        }

        async fn fetch(&self, _bundled: Option<Vec<Value>>) -> Result<Vec<R>> {
            Err(MirrorError::network("connection refused"))
        }
    }

    #[async_trait]
    impl AssetFetcher for DownRemote {
        async fn fetch_asset(&self, _url: &str) -> Result<FetchedAsset> {
            Err(MirrorError::network("connection refused"))
        }
    }

    struct PngFetcher;

    #[async_trait]
    impl AssetFetcher for PngFetcher {
        async fn fetch_asset(&self, _url: &str) -> Result<FetchedAsset> {
            Ok(FetchedAsset {
                bytes: vec![0x89, b'P', b'N', b'G', 1, 2, 3],
                content_type: None,
            })
        }
    }

    fn item(barcode: &str) -> CatalogItem {
        serde_json::from_value(json!({ "barcode": barcode, "style": "KU-1" })).expect("item")
    }

    fn level(size: &str) -> StockLevel {
        serde_json::from_value(json!({ "style": "KU-1", "color": "Red", "size": size, "qty": 2 }))
            .expect("level")
    }

    fn online_runtime() -> MirrorRuntime {
        let store = Arc::new(MirrorStore::open_in_memory().expect("store"));
        MirrorRuntime::new(
            store,
            Arc::new(FixedRemote {
                token: "2024-05-01",
                payload: vec![item("1"), item("2")],
            }),
            Arc::new(FixedRemote {
                token: "1000",
                payload: vec![level("S"), level("M"), level("L")],
            }),
            Arc::new(PngFetcher),
        )
    }

    fn offline_runtime() -> MirrorRuntime {
        let store = Arc::new(MirrorStore::open_in_memory().expect("store"));
        MirrorRuntime::new(
            store,
            Arc::new(DownRemote),
            Arc::new(DownRemote),
            Arc::new(DownRemote),
        )
    }

    #[tokio::test]
    async fn unknown_namespace_is_rejected() {
        let runtime = online_runtime();
        let err = get_mirrored_data(&runtime, "orders").await.expect_err("unknown");
        assert_eq!(err, "Unknown mirrored dataset: orders");
        assert!(sync_mirrored_data(&runtime, "").await.is_err());
        assert!(force_resync(&runtime, "customers").await.is_err());
    }

    #[tokio::test]
    async fn read_through_returns_local_then_refreshes_in_background() {
        let runtime = online_runtime();
        let mut rx = runtime.notices().subscribe();

        let first = get_mirrored_data(&runtime, "items").await.expect("read");
        assert!(first.is_empty());

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("background sync finished")
            .expect("notice");
        assert_eq!(notice.namespace, "items");
        assert_eq!(notice.level, NoticeLevel::Info);

        let second = get_mirrored_data(&runtime, "catalog").await.expect("read");
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn sync_command_reports_records_and_status() {
        let runtime = online_runtime();

        let out = sync_mirrored_data(&runtime, "stock").await.expect("sync");
        assert_eq!(out["status"], "updated");
        assert_eq!(out["success"], true);
        assert_eq!(out["recordCount"], 3);
        assert_eq!(out["records"].as_array().map(Vec::len), Some(3));

        let again = sync_mirrored_data(&runtime, "stock").await.expect("sync");
        assert_eq!(again["status"], "up_to_date");
        assert_eq!(again["updated"], false);
    }

    #[tokio::test]
    async fn offline_sync_is_not_an_error() {
        let runtime = offline_runtime();
        let out = sync_mirrored_data(&runtime, "items").await.expect("served local");
        assert_eq!(out["status"], "served_local");
        assert_eq!(out["offline"], true);
        assert_eq!(out["recordCount"], 0);
        assert!(out["error"].is_string());
    }

    #[tokio::test]
    async fn force_resync_refetches_unchanged_dataset() {
        let runtime = online_runtime();
        sync_mirrored_data(&runtime, "items").await.expect("initial");

        let out = force_resync(&runtime, "items").await.expect("forced");
        assert_eq!(out["forceRequested"], true);
        assert_eq!(out["status"], "updated");

        let marker = runtime
            .store()
            .read_sync_marker("items")
            .expect("read")
            .expect("marker");
        assert!(!marker.force_flag);
    }

    #[tokio::test]
    async fn branding_image_is_served_as_data_url() {
        let runtime = online_runtime();
        let out = get_branding_image(&runtime, "logo", "https://cdn.example.com/logo.png")
            .await
            .expect("image");
        assert_eq!(out["id"], "logo");
        assert_eq!(out["origin"], "network");
        assert!(out["dataUrl"]
            .as_str()
            .expect("data url")
            .starts_with("data:image/png;base64,"));

        assert!(get_branding_image(&runtime, " ", "https://cdn/x.png").await.is_err());
    }

    #[tokio::test]
    async fn branding_image_offline_without_cache_fails() {
        let runtime = offline_runtime();
        let err = get_branding_image(&runtime, "logo", "https://cdn.example.com/logo.png")
            .await
            .expect_err("no cache, no network");
        assert!(!err.is_empty());
    }

    #[tokio::test]
    async fn status_lists_every_dataset() {
        let runtime = online_runtime();
        sync_mirrored_data(&runtime, "items").await.expect("sync");

        let out = mirror_status(&runtime).await.expect("status");
        assert_eq!(out["durable"], false);
        let datasets = out["datasets"].as_array().expect("datasets");
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0]["namespace"], "items");
        assert_eq!(datasets[0]["records"], 2);
        assert_eq!(datasets[0]["marker"]["freshness_token"], "2024-05-01");
        assert_eq!(datasets[1]["records"], 0);
        assert!(datasets[1]["marker"].is_null());
    }

    fn clear_config_env() {
        std::env::remove_var(crate::config::ENV_REMOTE_URL);
        std::env::remove_var(crate::config::ENV_API_KEY);
    }

    fn unconfigured_runtime() -> MirrorRuntime {
        let store = Arc::new(MirrorStore::open_in_memory().expect("store"));
        MirrorRuntime::from_config(store, &MirrorConfig::default())
    }

    #[tokio::test]
    #[serial]
    async fn config_starts_unconfigured() {
        clear_config_env();
        let runtime = unconfigured_runtime();
        let out = get_mirror_config(&runtime).await.expect("config");
        assert_eq!(out["configured"], false);
        assert_eq!(out["remoteUrl"], "");
        assert_eq!(out["hasApiKey"], false);
        assert_eq!(out["stockPath"], "?action=stock");
    }

    #[tokio::test]
    #[serial]
    async fn saved_config_is_persisted_and_rewires_remotes() {
        clear_config_env();
        let runtime = unconfigured_runtime();

        let before = sync_mirrored_data(&runtime, "items").await.expect("sync");
        assert!(before["error"]
            .as_str()
            .is_some_and(|e| e.starts_with("Configuration error")));

        let out = set_mirror_config(
            &runtime,
            json!({
                "remoteUrl": "127.0.0.1:9/exec/",
                "apiKey": "secret",
                "requestTimeoutSecs": 2
            }),
        )
        .await
        .expect("save");
        assert_eq!(out["success"], true);
        assert_eq!(out["configured"], true);
        assert_eq!(out["remoteUrl"], "http://127.0.0.1:9/exec");

        let read_back = get_mirror_config(&runtime).await.expect("config");
        assert_eq!(read_back["hasApiKey"], true);
        assert_eq!(read_back["requestTimeoutSecs"], 2);
        assert!(read_back.get("apiKey").is_none());

        // Nothing listens on the discard port, so the rewired HTTP source
        // reports a network failure instead of a configuration error.
        let after = sync_mirrored_data(&runtime, "items").await.expect("sync");
        assert_eq!(after["status"], "served_local");
        assert!(after["error"]
            .as_str()
            .is_some_and(|e| e.starts_with("Network failure")));
    }

    #[tokio::test]
    #[serial]
    async fn partial_update_keeps_other_fields_and_blank_key_clears() {
        clear_config_env();
        let runtime = unconfigured_runtime();
        set_mirror_config(
            &runtime,
            json!({ "remote_url": "https://svc.example.com", "api_key": "k" }),
        )
        .await
        .expect("first save");

        let out = set_mirror_config(&runtime, json!({ "apiKey": "  " }))
            .await
            .expect("second save");
        assert_eq!(out["remoteUrl"], "https://svc.example.com");
        assert_eq!(out["hasApiKey"], false);
    }

    #[tokio::test]
    #[serial]
    async fn invalid_config_is_rejected_and_not_saved() {
        clear_config_env();
        let runtime = unconfigured_runtime();

        let err = set_mirror_config(
            &runtime,
            json!({ "remoteUrl": "https://svc.example.com", "requestTimeoutSecs": 0 }),
        )
        .await
        .expect_err("zero timeout");
        assert!(err.contains("timeout"));
        assert!(set_mirror_config(&runtime, json!({ "requestTimeoutSecs": "soon" }))
            .await
            .is_err());

        let out = get_mirror_config(&runtime).await.expect("config");
        assert_eq!(out["configured"], false);
    }
}
