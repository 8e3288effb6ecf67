//! HTTP remote sources for the mirrored datasets.
//!
//! Catalog service contract:
//!   check  -> `{ uploadDate, manualSync: "Y" | "N" }`
//!   fetch  -> `[ {...}, ... ]` or `{ success, data: [...] }`
//!   ack    -> POST `{ manualSync: "N" }`
//!
//! Stock service contract (check and payload in one response):
//!   `{ success, timestamp, data: [...] }`

use async_trait::async_trait;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::{debug, trace};

use crate::api::RemoteClient;
use crate::assets::{AssetFetcher, FetchedAsset};
use crate::error::{MirrorError, Result};
use crate::freshness::{parse_force_flag, FreshnessToken, RemoteMarker};
use crate::records::{CatalogItem, MirrorRecord, StockLevel};
use crate::sync::RemoteSource;

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// `success: false` means the service did not do its job; treat it like an
/// unreachable remote. A missing flag is fine.
fn ensure_success(resp: &Value) -> Result<()> {
    match resp.get("success") {
        Some(Value::Bool(false)) => {
            let message = resp
                .get("error")
                .or_else(|| resp.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("remote reported success=false");
            Err(MirrorError::network(message.to_string()))
        }
        _ => Ok(()),
    }
}

/// Unwrap the `{ data: {...} }` envelope some endpoints use.
fn unwrap_data(resp: &Value) -> &Value {
    match resp.get("data") {
        Some(inner @ Value::Object(_)) => inner,
        _ => resp,
    }
}

fn first_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(*k))
}

/// Locate the record array in a payload response.
fn extract_records(resp: &Value, context: &str) -> Result<Vec<Value>> {
    let array = match resp {
        Value::Array(arr) => Some(arr),
        Value::Object(_) => first_field(resp, &["data", "items", "records", "stock"])
            .and_then(Value::as_array),
        _ => None,
    };
    array
        .cloned()
        .ok_or_else(|| MirrorError::malformed(format!("{context}: response has no record array")))
}

/// Convert every raw record; one bad record rejects the whole payload.
fn parse_records<R: MirrorRecord>(raw: Vec<Value>, context: &str) -> Result<Vec<R>> {
    raw.into_iter()
        .enumerate()
        .map(|(i, value)| {
            serde_json::from_value::<R>(value)
                .map_err(|e| MirrorError::malformed(format!("{context}: record {i}: {e}")))
        })
        .collect()
}

fn parse_catalog_marker(resp: &Value) -> Result<RemoteMarker> {
    ensure_success(resp)?;
    let body = unwrap_data(resp);
    let token = first_field(body, &["uploadDate", "upload_date", "lastUpdated"])
        .and_then(FreshnessToken::from_value)
        .ok_or_else(|| MirrorError::malformed("catalog sync info is missing uploadDate"))?;
    let force = parse_force_flag(first_field(body, &["manualSync", "manual_sync"]));
    Ok(RemoteMarker::new(token, force))
}

fn parse_stock_response(resp: &Value) -> Result<(RemoteMarker, Option<Vec<Value>>)> {
    ensure_success(resp)?;
    let token = first_field(resp, &["timestamp", "lastUpdated", "date"])
        .and_then(FreshnessToken::from_value)
        .ok_or_else(|| MirrorError::malformed("stock response is missing timestamp"))?;
    let force = parse_force_flag(first_field(resp, &["manualSync", "forceSync"]));
    let data = resp.get("data").and_then(Value::as_array).cloned();
    Ok((RemoteMarker::new(token, force), data))
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

pub struct CatalogSource {
    client: RemoteClient,
    check_path: String,
    fetch_path: String,
    ack_path: String,
}

impl CatalogSource {
    pub fn new(
        client: RemoteClient,
        check_path: impl Into<String>,
        fetch_path: impl Into<String>,
        ack_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            check_path: check_path.into(),
            fetch_path: fetch_path.into(),
            ack_path: ack_path.into(),
        }
    }
}

#[async_trait]
impl RemoteSource<CatalogItem> for CatalogSource {
    async fn check(&self) -> Result<RemoteMarker> {
        let resp = self.client.get_json(&self.check_path).await?;
        let marker = parse_catalog_marker(&resp)?;
        trace!(token = %marker.freshness_token, force = marker.force_flag, "catalog check");
        Ok(marker)
    }

    async fn fetch(&self, _bundled: Option<Vec<Value>>) -> Result<Vec<CatalogItem>> {
        let resp = self.client.get_json(&self.fetch_path).await?;
        ensure_success(&resp)?;
        let raw = extract_records(&resp, "catalog")?;
        parse_records(raw, "catalog")
    }

    async fn acknowledge_force(&self) -> Result<()> {
        let resp = self
            .client
            .post_json(&self.ack_path, &serde_json::json!({ "manualSync": "N" }))
            .await?;
        ensure_success(&resp)
    }
}

// ---------------------------------------------------------------------------
// Stock
// ---------------------------------------------------------------------------

/// Stock source. The payload arrives with the check and travels to `fetch`
/// on the marker of the same pass.
pub struct StockSource<R = StockLevel> {
    client: RemoteClient,
    path: String,
    _record: PhantomData<fn() -> R>,
}

impl<R> StockSource<R> {
    pub fn new(client: RemoteClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<R: MirrorRecord> RemoteSource<R> for StockSource<R> {
    async fn check(&self) -> Result<RemoteMarker> {
        let resp = self.client.get_json(&self.path).await?;
        let (marker, data) = parse_stock_response(&resp)?;
        Ok(marker.with_bundled(data))
    }

    async fn fetch(&self, bundled: Option<Vec<Value>>) -> Result<Vec<R>> {
        let raw = match bundled {
            Some(raw) => raw,
            None => {
                debug!("stock payload not bundled with check, requesting again");
                let resp = self.client.get_json(&self.path).await?;
                let (_, data) = parse_stock_response(&resp)?;
                data.ok_or_else(|| MirrorError::malformed("stock response has no data array"))?
            }
        };
        parse_records(raw, "stock")
    }
}

// ---------------------------------------------------------------------------
// Assets
// ---------------------------------------------------------------------------

pub struct HttpAssetFetcher {
    client: RemoteClient,
}

impl HttpAssetFetcher {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch_asset(&self, url: &str) -> Result<FetchedAsset> {
        self.client.get_bytes(url).await
    }
}

// ---------------------------------------------------------------------------
// Unconfigured
// ---------------------------------------------------------------------------

/// Stand-in used until a remote URL is configured: every call fails with
/// [`MirrorError::Config`], so syncs serve local data.
pub struct UnconfiguredRemote {
    reason: String,
}

impl UnconfiguredRemote {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> MirrorError {
        MirrorError::config(self.reason.clone())
    }
}

#[async_trait]
impl<R: MirrorRecord> RemoteSource<R> for UnconfiguredRemote {
    async fn check(&self) -> Result<RemoteMarker> {
        Err(self.error())
    }

    async fn fetch(&self, _bundled: Option<Vec<Value>>) -> Result<Vec<R>> {
        Err(self.error())
    }
}

#[async_trait]
impl AssetFetcher for UnconfiguredRemote {
    async fn fetch_asset(&self, _url: &str) -> Result<FetchedAsset> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn catalog_marker_from_sync_info() {
        let marker = parse_catalog_marker(&json!({
            "uploadDate": "2024-01-02T00:00:00Z",
            "manualSync": "Y"
        }))
        .expect("marker");
        assert_eq!(marker.freshness_token.as_str(), "2024-01-02T00:00:00Z");
        assert!(marker.force_flag);
    }

    #[test]
    fn catalog_marker_inside_data_envelope() {
        let marker = parse_catalog_marker(&json!({
            "success": true,
            "data": { "uploadDate": "2024-03-01", "manualSync": "N" }
        }))
        .expect("marker");
        assert_eq!(marker.freshness_token.as_str(), "2024-03-01");
        assert!(!marker.force_flag);
    }

    #[test]
    fn catalog_marker_without_date_is_malformed() {
        let err = parse_catalog_marker(&json!({ "manualSync": "N" })).expect_err("no date");
        assert!(err.is_malformed());
    }

    #[test]
    fn success_false_is_network_failure() {
        let err = parse_stock_response(&json!({ "success": false, "error": "quota" }))
            .expect_err("failure");
        assert!(err.is_network());
        assert!(err.to_string().contains("quota"));
    }

    #[test]
    fn stock_response_carries_bundled_payload() {
        let (marker, data) = parse_stock_response(&json!({
            "success": true,
            "timestamp": 1714000000000u64,
            "data": [{ "style": "KU-1", "color": "Red", "size": "M", "qty": 3 }]
        }))
        .expect("parse");
        assert_eq!(marker.freshness_token.as_str(), "1714000000000");
        assert!(!marker.force_flag);
        let levels: Vec<StockLevel> = parse_records(data.expect("data"), "stock").expect("records");
        assert_eq!(levels[0].quantity, Some(3.0));
    }

    #[test]
    fn records_found_in_array_or_envelope() {
        assert_eq!(extract_records(&json!([{"barcode": "1"}]), "t").expect("array").len(), 1);
        assert_eq!(
            extract_records(&json!({"items": [{"barcode": "1"}, {"barcode": "2"}]}), "t")
                .expect("items")
                .len(),
            2
        );
        assert!(extract_records(&json!({"rows": []}), "t")
            .expect_err("no array")
            .is_malformed());
        assert!(extract_records(&Value::Null, "t").is_err());
    }

    #[test]
    fn one_bad_record_rejects_payload() {
        let raw = vec![json!({"barcode": "1"}), json!({"style": "no barcode"})];
        let err = parse_records::<CatalogItem>(raw, "catalog").expect_err("bad record");
        assert!(err.is_malformed());
        assert!(err.to_string().contains("record 1"));
    }

    #[tokio::test]
    async fn unconfigured_remote_always_fails_with_config_error() {
        let remote = UnconfiguredRemote::new("missing remote service URL");
        let err = RemoteSource::<CatalogItem>::check(&remote)
            .await
            .expect_err("unconfigured");
        assert!(matches!(err, MirrorError::Config(_)));
        assert!(remote.fetch_asset("https://cdn/logo.png").await.is_err());
    }

    /// Answer exactly one HTTP request on a local port with `body`, and hand
    /// back the raw request text.
    async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            while !request_complete(&request) {
                let n = socket.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}/exec"), handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..head_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        raw.len() >= head_end + 4 + content_length
    }

    fn client_for(base_url: &str) -> RemoteClient {
        let config = crate::config::MirrorConfig {
            remote_url: base_url.to_string(),
            api_key: Some("k1".into()),
            ..Default::default()
        };
        RemoteClient::new(&config).expect("client")
    }

    #[tokio::test]
    async fn catalog_ack_posts_manual_sync_reset() {
        let (base, server) = serve_once(r#"{"success":true}"#).await;
        let source = CatalogSource::new(
            client_for(&base),
            "?action=syncInfo",
            "?action=items",
            "?action=ackManualSync",
        );

        source.acknowledge_force().await.expect("ack");

        let request = server.await.expect("server");
        assert!(request.starts_with("POST /exec?action=ackManualSync HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("x-api-key: k1"));
        let body = &request[request.find("\r\n\r\n").expect("body") + 4..];
        let sent: Value = serde_json::from_str(body).expect("json body");
        assert_eq!(sent, json!({ "manualSync": "N" }));
    }

    #[tokio::test]
    async fn catalog_ack_rejected_by_remote_is_network_failure() {
        let (base, server) = serve_once(r#"{"success":false,"error":"sheet locked"}"#).await;
        let source = CatalogSource::new(client_for(&base), "a", "b", "?action=ackManualSync");

        let err = source.acknowledge_force().await.expect_err("rejected");
        assert!(err.is_network());
        assert!(err.to_string().contains("sheet locked"));
        server.await.expect("server");
    }

    #[tokio::test]
    async fn stock_check_carries_its_own_payload() {
        let (base, server) = serve_once(
            r#"{"success":true,"timestamp":150,"data":[{"style":"A","color":"B","size":"S"},{"style":"A","color":"B","size":"M"}]}"#,
        )
        .await;
        let source: StockSource = StockSource::new(client_for(&base), "?action=stock");

        let mut marker = RemoteSource::<StockLevel>::check(&source).await.expect("check");
        server.await.expect("server");
        assert_eq!(marker.freshness_token.as_str(), "150");
        assert_eq!(marker.bundled.as_ref().map(Vec::len), Some(2));

        // No second request: the listener is gone, so this only passes when
        // the bundled payload is used.
        let levels: Vec<StockLevel> = source.fetch(marker.bundled.take()).await.expect("fetch");
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[1].size, "M");
    }
}
