//! Assembles the components [`pha_engine::PolicyEngine`] needs from an
//! [`AgentConfig`] (spec §2 component table, SPEC_FULL §2).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pha_catalog::{Catalog, CatalogWatcher};
use pha_engine::{DriftMonitor, DriftMonitorConfig, LiveSystemProbe, PolicyEngine, SystemProbe};
use pha_executors::ExecutorRegistry;
use pha_restore::RestorePointManager;
use pha_store::Store;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;

/// How often the catalog-watch task polls for debounced file-system events.
/// Short enough that a reload feels immediate, long enough not to spin.
const CATALOG_WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Coalesces a burst of edits (an editor's save-as-temp-then-rename dance)
/// into a single reload.
const CATALOG_WATCH_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("failed to load policy catalog from {dir}: {source}")]
    Catalog {
        dir: String,
        #[source]
        source: pha_catalog::LoadError,
    },
    #[error("failed to open change-log store at {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: pha_store::StoreError,
    },
}

/// Everything a running `phagentd` owns for the lifetime of the process.
pub struct Agent {
    pub engine: Arc<PolicyEngine>,
    pub drift_monitor: DriftMonitor,
    catalog_watch_shutdown: CancellationToken,
    catalog_watch_handle: JoinHandle<()>,
}

impl Agent {
    /// Loads the catalog, opens the store, and wires the engine. Does not
    /// start the IPC listener or the drift monitor's background task --
    /// callers (normally `main`) decide when those go live.
    #[tracing::instrument(skip(config))]
    pub fn start(config: &AgentConfig) -> Result<Self, WiringError> {
        let catalog = Catalog::load(config.catalog_dir.clone()).map_err(|source| {
            WiringError::Catalog {
                dir: config.catalog_dir.display().to_string(),
                source,
            }
        })?;
        tracing::info!(
            catalog_dir = %config.catalog_dir.display(),
            policy_count = catalog.snapshot().policies().len(),
            "policy catalog loaded"
        );

        if let Some(parent) = config.store_db_path.parent() {
            // Best-effort: `Store::open` will surface a clearer error if
            // this directory genuinely can't be created.
            let _ = std::fs::create_dir_all(parent);
        }
        let store = Store::open(&config.store_db_path).map_err(|source| WiringError::Store {
            path: config.store_db_path.display().to_string(),
            source,
        })?;

        let executors = ExecutorRegistry::with_default_executors();
        let restore = RestorePointManager::new();
        let probe: Arc<dyn SystemProbe> = Arc::new(LiveSystemProbe);

        let engine = Arc::new(PolicyEngine::new(
            Arc::new(catalog),
            Arc::new(executors),
            Arc::new(store),
            Arc::new(restore),
            probe,
        ));

        let drift_monitor = DriftMonitor::spawn(
            engine.clone(),
            DriftMonitorConfig {
                interval: std::time::Duration::from_secs(config.drift_interval_secs),
                auto_remediate: config.drift_auto_remediate,
            },
        );

        let catalog_watch_shutdown = CancellationToken::new();
        let catalog_watch_handle = spawn_catalog_watch(
            engine.catalog().clone(),
            config.catalog_dir.clone(),
            catalog_watch_shutdown.clone(),
        );

        Ok(Self {
            engine,
            drift_monitor,
            catalog_watch_shutdown,
            catalog_watch_handle,
        })
    }

    /// Applies a config reload to the drift monitor (interval/remediation
    /// only -- catalog/store paths are fixed for the process lifetime,
    /// spec §3 ownership/lifecycle). Takes effect at the monitor's next
    /// tick boundary (spec §4.7, §9).
    pub fn apply_drift_config(&self, config: &AgentConfig) {
        self.drift_monitor.update_config(DriftMonitorConfig {
            interval: std::time::Duration::from_secs(config.drift_interval_secs),
            auto_remediate: config.drift_auto_remediate,
        });
    }

    pub async fn shutdown(self) {
        self.drift_monitor.shutdown().await;
        self.catalog_watch_shutdown.cancel();
        let _ = self.catalog_watch_handle.await;
    }
}

/// Watches `dir` for `*.toml` changes and reloads `catalog` whenever the
/// debounce window settles (spec §4.1: file-watch triggers reload the same
/// as the manual `ReloadCatalog` command does). If the watcher can't be
/// created (e.g. the directory disappeared), this logs once and exits --
/// `ReloadCatalog` remains available as a manual fallback.
fn spawn_catalog_watch(catalog: Arc<Catalog>, dir: PathBuf, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut watcher = match CatalogWatcher::new(&dir, CATALOG_WATCH_DEBOUNCE) {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    dir = %dir.display(),
                    "catalog file watcher unavailable; automatic reload disabled, use ReloadCatalog"
                );
                return;
            }
        };

        let mut ticker = tokio::time::interval(CATALOG_WATCH_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if watcher.poll().is_some() {
                        match catalog.reload() {
                            Ok(count) => tracing::info!(policy_count = count, "catalog reloaded after file-system change"),
                            Err(e) => tracing::warn!(error = %e, "catalog reload failed after file-system change; keeping previous snapshot"),
                        }
                    }
                }
            }
        }
    })
}
