//! Where the watcher pulls notification batches from.

use std::future::Future;
use std::os::fd::OwnedFd;

use crate::notify::fanotify::{Batch, Fanotify, FanotifyError};

pub trait NotificationSource {
    type Object;

    /// Waits for the next batch. `Ok(None)` means the source is exhausted.
    fn next_batch(
        &mut self,
    ) -> impl Future<Output = Result<Option<Batch<Self::Object>>, FanotifyError>>;
}

impl NotificationSource for Fanotify {
    type Object = OwnedFd;

    async fn next_batch(&mut self) -> Result<Option<Batch<OwnedFd>>, FanotifyError> {
        self.read_batch().await.map(Some)
    }
}
