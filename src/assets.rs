//! Binary asset cache (branding images).
//!
//! A cached asset is only a hit when it was fetched from the URL currently
//! wanted; otherwise it is refetched and overwritten. Without a local store
//! every lookup goes to the network.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{MirrorError, Result};
use crate::mirror::MirrorStore;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedAsset {
    pub id: String,
    pub blob: Vec<u8>,
    pub source_url: String,
    pub content_type: Option<String>,
    pub updated_at: String,
}

impl CachedAsset {
    /// `data:` URL the UI can drop straight into an `<img>`.
    pub fn data_url(&self) -> String {
        let mime = self
            .content_type
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| sniff_content_type(&self.blob));
        format!("data:{mime};base64,{}", BASE64_STANDARD.encode(&self.blob))
    }
}

fn sniff_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

/// Bytes as they came off the wire.
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch_asset(&self, url: &str) -> Result<FetchedAsset>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "origin", content = "reason", rename_all = "snake_case")]
pub enum AssetOrigin {
    Cache,
    Network,
    /// The refetch failed and the blob served is the one cached for a
    /// different `source_url`: it is not the image at the requested URL.
    /// Carries the notice text of the fetch error.
    StaleCache(String),
}

#[derive(Debug, Clone)]
pub struct AssetLookup {
    pub asset: CachedAsset,
    pub origin: AssetOrigin,
}

/// Resolve asset `id` as fetched from `url`.
pub async fn load_asset(
    store: Option<&MirrorStore>,
    id: &str,
    url: &str,
    fetcher: &dyn AssetFetcher,
) -> Result<AssetLookup> {
    let cached = match store {
        Some(store) => store.read_cached_asset(id).unwrap_or_else(|e| {
            warn!(asset_id = id, error = %e, "asset cache read failed, treating as miss");
            None
        }),
        None => None,
    };

    if let Some(asset) = cached.as_ref().filter(|a| a.source_url == url) {
        debug!(asset_id = id, "asset cache hit");
        return Ok(AssetLookup {
            asset: asset.clone(),
            origin: AssetOrigin::Cache,
        });
    }

    let fetched = match fetch_checked(fetcher, url).await {
        Ok(f) => f,
        Err(e) => {
            return match cached {
                Some(stale) => {
                    warn!(asset_id = id, error = %e, "asset refetch failed, serving stale copy");
                    Ok(AssetLookup {
                        asset: stale,
                        origin: AssetOrigin::StaleCache(e.notice_text()),
                    })
                }
                None => Err(e),
            };
        }
    };

    let asset = match store {
        Some(store) => store
            .write_cached_asset(id, &fetched.bytes, url, fetched.content_type.as_deref())
            .unwrap_or_else(|e| {
                warn!(asset_id = id, error = %e, "asset cache write failed");
                transient_asset(id, url, &fetched)
            }),
        None => transient_asset(id, url, &fetched),
    };

    debug!(asset_id = id, bytes = asset.blob.len(), "asset fetched from network");
    Ok(AssetLookup {
        asset,
        origin: AssetOrigin::Network,
    })
}

async fn fetch_checked(fetcher: &dyn AssetFetcher, url: &str) -> Result<FetchedAsset> {
    let fetched = fetcher.fetch_asset(url).await?;
    if fetched.bytes.is_empty() {
        return Err(MirrorError::malformed(format!("empty asset body from {url}")));
    }
    Ok(fetched)
}

fn transient_asset(id: &str, url: &str, fetched: &FetchedAsset) -> CachedAsset {
    CachedAsset {
        id: id.to_string(),
        blob: fetched.bytes.clone(),
        source_url: url.to_string(),
        content_type: fetched.content_type.clone(),
        updated_at: Utc::now().to_rfc3339(),
    }
}
