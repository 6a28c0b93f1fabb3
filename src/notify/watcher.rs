//! The notification loop: owns the tree, the mount root and the subscription
//! and turns every notification batch into directory scans.

use std::path::Path;
use std::time::{Duration, Instant};

use snafu::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::ext::BestEffortPathExt;
use crate::filesystem::Filesystem;
use crate::filesystem::observation::ObservationSink;
use crate::filesystem::scanner::{ScanError, ScanSummary, Scanner};
use crate::filesystem::sys::{MountFs, is_mountpoint};
use crate::filesystem::tree::Tree;
use crate::notify::fanotify::{
    Batch, FANOTIFY_METADATA_VERSION, Fanotify, FanotifyError, Notification, NotificationKind,
};
use crate::notify::source::NotificationSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchSettings {
    pub strict: bool,
    pub reclaim_grace: Duration,
}

impl From<&TrackerConfig> for WatchSettings {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            strict: config.strict,
            reclaim_grace: config.reclaim_grace,
        }
    }
}

pub struct Watcher<F: Filesystem, S> {
    fs: F,
    tree: Tree,
    settings: WatchSettings,
    source: S,
}

/// The watcher over a real mount.
pub type MountWatcher = Watcher<MountFs, Fanotify>;

impl MountWatcher {
    /// Opens `mountpoint` and subscribes to directory changes on its mount.
    ///
    /// Notifications start queueing in the kernel immediately; run
    /// [`Watcher::baseline`] before processing them.
    pub fn start(
        mountpoint: &Path,
        config: &TrackerConfig,
        sink: Box<dyn ObservationSink>,
    ) -> Result<Self, WatchError> {
        let path = mountpoint.best_effort_path_display();
        let is_mount = is_mountpoint(mountpoint).context(OpenRootSnafu { path: &path })?;
        ensure!(is_mount, NotAMountpointSnafu { path: &path });

        let fs = MountFs::open(mountpoint).context(OpenRootSnafu { path: &path })?;
        let fanotify = Fanotify::init(config.unlimited_queue, config.read_buffer_size)
            .context(SubscribeSnafu)?;
        fanotify.mark_mount(fs.root_fd()).context(SubscribeSnafu)?;
        info!("Watching {path}");

        Ok(Self::new(fs, WatchSettings::from(config), sink, fanotify))
    }
}

impl<F, S> Watcher<F, S>
where
    F: Filesystem,
    S: NotificationSource<Object = F::Object>,
{
    pub fn new(fs: F, settings: WatchSettings, sink: Box<dyn ObservationSink>, source: S) -> Self {
        Self {
            fs,
            tree: Tree::new(settings.reclaim_grace, sink),
            settings,
            source,
        }
    }

    pub fn filesystem(&self) -> &F {
        &self.fs
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// Full recursive scan establishing the state incremental updates
    /// build on.
    pub fn baseline(&mut self) -> Result<ScanSummary, WatchError> {
        let summary = self.rescan_roots().context(BaselineSnafu)?;
        info!(
            "Baseline scan finished: {} directories, {} records, {} entries",
            summary.directories,
            self.tree.len(),
            self.tree.entry_count()
        );
        if let Err(e) = self.tree.check_consistency() {
            error!("Tree is inconsistent after the baseline scan: {e}");
        }
        Ok(summary)
    }

    /// Waits for the next batch. Records not read yet stay queued in the
    /// kernel.
    pub async fn next_batch(&mut self) -> Result<Batch<F::Object>, WatchError> {
        match self.source.next_batch().await.context(NotificationsSnafu)? {
            Some(batch) => Ok(batch),
            None => NotificationStreamClosedSnafu.fail(),
        }
    }

    /// Applies every notification of a batch, then reclaims orphans.
    pub fn process_batch(&mut self, batch: Batch<F::Object>) -> Result<ScanSummary, WatchError> {
        let mut summary = ScanSummary::default();
        for notification in batch {
            summary += self.handle(notification)?;
        }
        let reclaimed = self.tree.reclaim_orphans(Instant::now());
        if reclaimed > 0 {
            debug!("Reclaimed {reclaimed} orphaned records");
        }
        Ok(summary)
    }

    fn handle(&mut self, notification: Notification<F::Object>) -> Result<ScanSummary, WatchError> {
        ensure!(
            notification.version == FANOTIFY_METADATA_VERSION,
            VersionMismatchSnafu {
                found: notification.version,
                expected: FANOTIFY_METADATA_VERSION,
            }
        );
        match (notification.kind(), notification.object) {
            (NotificationKind::DirectoryModified, Some(directory)) => {
                Scanner::new(&self.fs, &mut self.tree, self.settings.strict)
                    .scan(directory, false)
                    .context(ScanSnafu)
            }
            (NotificationKind::Overflow, _) => {
                warn!("Notification queue overflowed, rescanning the whole mount");
                self.rescan_roots().context(QueueOverflowSnafu)
            }
            (kind, _) => {
                debug!(
                    "Ignoring {kind:?} notification with mask {:#x}",
                    notification.mask
                );
                Ok(ScanSummary::default())
            }
        }
    }

    /// Rescans the mount from its root, recursively.
    pub fn rescan_roots(&mut self) -> Result<ScanSummary, ScanError> {
        let summary = Scanner::new(&self.fs, &mut self.tree, self.settings.strict).scan_root()?;
        self.tree.reclaim_orphans(Instant::now());
        Ok(summary)
    }

    /// Closes the subscription and releases the root handle.
    pub fn shutdown(self) {
        debug!("Watcher shut down with {} records", self.tree.len());
    }
}

#[derive(Debug, Snafu)]
pub enum WatchError {
    #[snafu(display("Failed to open the mount root {}", path))]
    OpenRoot {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("{} is not a mount point", path))]
    NotAMountpoint { path: String },
    #[snafu(display("Failed to subscribe to mount notifications"))]
    Subscribe { source: FanotifyError },
    #[snafu(display(
        "Notification record has version {}, expected {}",
        found,
        expected
    ))]
    VersionMismatch { found: u8, expected: u8 },
    #[snafu(display("Failed to receive notifications"))]
    Notifications { source: FanotifyError },
    #[snafu(display("Notification stream ended"))]
    NotificationStreamClosed,
    #[snafu(display("Failed to scan a modified directory"))]
    Scan { source: ScanError },
    #[snafu(display("Failed to resynchronise after a queue overflow"))]
    QueueOverflow { source: ScanError },
    #[snafu(display("Baseline scan failed"))]
    Baseline { source: ScanError },
}
