use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::WatcherError;

/// Dependency watcher. Reports the ids of templates whose data changed.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Sends triggered template ids on `notify` until `cancel` fires or the
    /// watch fails.
    async fn watch(
        &self,
        cancel: CancellationToken,
        notify: mpsc::Sender<String>,
    ) -> Result<(), WatcherError>;

    /// Resolves with an error as soon as a dependency watch fails, or with
    /// `Ok` once there is nothing left to wait on.
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), WatcherError>;

    /// Number of dependencies being watched.
    fn size(&self) -> usize;
}
