//! Order Desk - local mirror backend
//!
//! Mirrors the remote item catalog, stock levels and branding images into a
//! local SQLite store so the order desk keeps working from cached data when
//! the remote service is slow or unreachable. The UI layer talks to the
//! functions in [`commands`]; everything else is plumbing for them.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod assets;
pub mod commands;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod freshness;
pub mod mirror;
pub mod notices;
pub mod records;
pub mod remote;
pub mod sync;

use crate::api::RemoteClient;
use crate::assets::{AssetFetcher, AssetLookup};
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::mirror::MirrorStore;
use crate::notices::NoticeBus;
use crate::records::{CatalogItem, DatasetKind, StockLevel, CATALOG, STOCK};
use crate::remote::{CatalogSource, HttpAssetFetcher, StockSource, UnconfiguredRemote};
use crate::sync::{sync_dataset, RemoteSource, SyncSummary};

// ============================================================================
// Logging
// ============================================================================

/// Install structured logging (console + daily rolling file in the log dir).
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging() -> bool {
    let log_dir = diagnostics::get_log_dir();
    let log_dir = log_dir.as_path();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,order_desk_lib=debug"));

    diagnostics::prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    // Dropping the guard stops the writer thread; the process keeps logging
    // until exit.
    std::mem::forget(guard);

    if installed {
        info!("Starting Order Desk mirror v{}", env!("CARGO_PKG_VERSION"));
    }
    installed
}

// ============================================================================
// Runtime
// ============================================================================

/// Remote side of the runtime, swapped as a whole when the config changes.
#[derive(Clone)]
struct Remotes {
    catalog: Arc<dyn RemoteSource<CatalogItem>>,
    stock: Arc<dyn RemoteSource<StockLevel>>,
    assets: Arc<dyn AssetFetcher>,
}

impl Remotes {
    /// HTTP sources for `config`. Without a usable config every remote call
    /// fails with a configuration error and syncs serve local data.
    fn from_config(config: &MirrorConfig) -> Self {
        match RemoteClient::new(config) {
            Ok(client) => Self {
                catalog: Arc::new(CatalogSource::new(
                    client.clone(),
                    config.catalog_check_path.clone(),
                    config.catalog_fetch_path.clone(),
                    config.catalog_ack_path.clone(),
                )),
                stock: Arc::new(StockSource::<StockLevel>::new(
                    client.clone(),
                    config.stock_path.clone(),
                )),
                assets: Arc::new(HttpAssetFetcher::new(client)),
            },
            Err(e) => {
                warn!(error = %e, "mirror: remote not configured, serving local data only");
                let reason = match e {
                    MirrorError::Config(msg) => msg,
                    other => other.to_string(),
                };
                let unconfigured = Arc::new(UnconfiguredRemote::new(reason));
                Self {
                    catalog: unconfigured.clone(),
                    stock: unconfigured.clone(),
                    assets: unconfigured,
                }
            }
        }
    }
}

/// Everything the UI commands need: the store, one remote per dataset, the
/// asset fetcher and the notice bus. Cheap to clone.
#[derive(Clone)]
pub struct MirrorRuntime {
    store: Arc<MirrorStore>,
    remotes: Arc<RwLock<Remotes>>,
    notices: Arc<NoticeBus>,
}

impl MirrorRuntime {
    pub fn new(
        store: Arc<MirrorStore>,
        catalog: Arc<dyn RemoteSource<CatalogItem>>,
        stock: Arc<dyn RemoteSource<StockLevel>>,
        assets: Arc<dyn AssetFetcher>,
    ) -> Self {
        Self::with_remotes(
            store,
            Remotes {
                catalog,
                stock,
                assets,
            },
        )
    }

    pub fn from_config(store: Arc<MirrorStore>, config: &MirrorConfig) -> Self {
        Self::with_remotes(store, Remotes::from_config(config))
    }

    fn with_remotes(store: Arc<MirrorStore>, remotes: Remotes) -> Self {
        Self {
            store,
            remotes: Arc::new(RwLock::new(remotes)),
            notices: Arc::new(NoticeBus::new()),
        }
    }

    /// Open the shared store under `data_dir`, load the stored config and
    /// wire the remote sources.
    pub async fn start(data_dir: &Path) -> Result<Self> {
        let store = mirror::shared_store(data_dir).await?;
        if !store.is_durable() {
            warn!("mirror: running without durable storage; cached data will not survive a restart");
        }
        let config = {
            let conn = store.conn()?;
            MirrorConfig::load(&conn)
        };
        Ok(Self::from_config(store, &config))
    }

    /// Rewire the remote sources. Passes already running finish against the
    /// previous ones.
    pub fn reconfigure(&self, config: &MirrorConfig) {
        let remotes = Remotes::from_config(config);
        let mut guard = self.remotes.write().unwrap_or_else(PoisonError::into_inner);
        *guard = remotes;
        info!(remote_url = %config.remote_url, "mirror: remote sources reconfigured");
    }

    fn remotes(&self) -> Remotes {
        self.remotes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    pub fn notices(&self) -> &NoticeBus {
        &self.notices
    }

    /// Local records of a dataset as JSON, without touching the network.
    pub fn read_local(&self, kind: DatasetKind) -> Result<Vec<serde_json::Value>> {
        self.store.read_dataset_json(kind.namespace())
    }

    /// Run one sync pass for `kind` and publish its notice, if any.
    pub async fn sync(&self, kind: DatasetKind) -> SyncSummary {
        let remotes = self.remotes();
        let summary: SyncSummary = match kind {
            DatasetKind::Catalog => sync_dataset(&self.store, &CATALOG, &*remotes.catalog)
                .await
                .into(),
            DatasetKind::Stock => sync_dataset(&self.store, &STOCK, &*remotes.stock)
                .await
                .into(),
        };
        if let Some(notice) = summary.notice.clone() {
            self.notices.publish(notice);
        }
        summary
    }

    /// Sync in the background; the caller does not wait.
    pub fn spawn_sync(&self, kind: DatasetKind) -> tokio::task::JoinHandle<SyncSummary> {
        let runtime = self.clone();
        tokio::spawn(async move { runtime.sync(kind).await })
    }

    /// Branding image lookup. Without durable storage every lookup is fetched
    /// from the network.
    pub async fn load_asset(&self, id: &str, url: &str) -> Result<AssetLookup> {
        let fetcher = self.remotes().assets;
        let store = self.store.is_durable().then_some(&*self.store);
        assets::load_asset(store, id, url, &*fetcher).await
    }
}
