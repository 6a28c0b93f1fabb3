use std::path::PathBuf;

use snafu::Snafu;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::application::RuntimeConfig;
use crate::config::{ConfigError, TrackerConfig};
use crate::filesystem::observation::AuditPrinter;
use crate::fingerprints::FingerprintStore;
use crate::notify::{MountWatcher, WatchError};

pub struct Application;

impl Application {
    pub async fn run(runtime_config: impl Into<RuntimeConfig>) -> Result<(), ApplicationError> {
        let runtime_config: RuntimeConfig = runtime_config.into();
        let config = TrackerConfig::read(runtime_config.config.as_deref())
            .await
            .context(ConfigSnafu)?;
        debug!("Loaded config: {:?}", config);

        let mut watcher = MountWatcher::start(
            &runtime_config.mountpoint,
            &config,
            Box::new(AuditPrinter::stdout()),
        )
        .context(StartupSnafu)?;

        let mut store = match &config.store {
            Some(path) => Some(PersistedStore::open(path.clone(), &watcher).await),
            None => None,
        };
        let result = Self::track(&mut watcher, store.as_mut()).await;
        watcher.shutdown();
        result
    }

    async fn track(
        watcher: &mut MountWatcher,
        mut store: Option<&mut PersistedStore>,
    ) -> Result<(), ApplicationError> {
        watcher.baseline().context(TrackingSnafu)?;
        if let Some(store) = store.as_deref_mut() {
            store.absorb_touched(watcher).await;
        }

        loop {
            let batch = watcher.next_batch().await.context(TrackingSnafu)?;
            let summary = watcher.process_batch(batch).context(TrackingSnafu)?;
            if summary.changed() {
                info!(
                    "Applied batch: {} linked, {} unlinked",
                    summary.linked, summary.unlinked
                );
            }
            match store.as_deref_mut() {
                Some(store) => store.absorb_touched(watcher).await,
                None => {
                    watcher.tree_mut().take_touched();
                }
            }
        }
    }
}

/// Fingerprint store together with the file it is persisted to.
struct PersistedStore {
    path: PathBuf,
    store: FingerprintStore,
}

impl PersistedStore {
    async fn open(path: PathBuf, watcher: &MountWatcher) -> Self {
        let mut store = FingerprintStore::read(&path).await;
        let flipped = store.verify(watcher.filesystem());
        info!(
            "Fingerprint store holds {} rows, {flipped} changed while unwatched",
            store.len()
        );
        Self { path, store }
    }

    /// Absorbs the records linked since the last call and persists the store
    /// if any row changed. Write failures are logged and retried next time.
    async fn absorb_touched(&mut self, watcher: &mut MountWatcher) {
        let touched = watcher.tree_mut().take_touched();
        let tree = watcher.tree();
        let changed = touched
            .into_iter()
            .filter_map(|inode| tree.record(inode))
            .filter(|record| self.store.absorb(record))
            .count();
        if changed == 0 {
            return;
        }
        debug!(
            "{changed} fingerprint rows changed, {} pending in total",
            self.store.pending().count()
        );
        if let Err(e) = self.store.write(&self.path).await {
            warn!("Failed to persist fingerprint store: {e}");
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ApplicationError {
    #[snafu(display("Critical failure encountered during configuration stage"))]
    ConfigError { source: ConfigError },
    #[snafu(display("Critical failure encountered while starting the watcher"))]
    StartupError { source: WatchError },
    #[snafu(display("Critical failure encountered while tracking changes"))]
    TrackingError { source: WatchError },
}
