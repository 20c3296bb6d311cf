//! Change watcher adapter
//!
//! Wraps the controller's long-poll notification primitives as
//! channel-backed watchers, one per entity kind. Each wake delivers the
//! identifiers whose state may have changed (at-least-once: duplicates and
//! no-op wakes are expected). On establishment the transport delivers an
//! initial wake naming every entity currently in scope. Channel close
//! signals scope termination; re-establishment after controller-initiated
//! drops is the transport's concern, not the engine's.

use crate::domain::tags::{AttachmentId, Tag};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A long-lived watcher delivering batches of changed identifiers.
#[derive(Debug)]
pub struct BatchWatcher<T> {
    rx: mpsc::Receiver<Vec<T>>,
}

/// Watcher over changed storage entity tags.
pub type StringsWatcher = BatchWatcher<Tag>;

/// Watcher over changed (machine, storage entity) pairs.
pub type AttachmentIdsWatcher = BatchWatcher<AttachmentId>;

impl<T> BatchWatcher<T> {
    /// Create a watcher and the sender half the transport feeds it from.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Vec<T>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    /// Wait for the next wake. `None` means the watcher closed and the
    /// scope must terminate.
    pub async fn next(&mut self) -> Option<Vec<T>> {
        self.rx.recv().await
    }

    /// Collect a wake that is already ready, without blocking. Used by the
    /// drain step to merge every ready wake into the pending sets before a
    /// pass starts.
    pub fn try_next(&mut self) -> Option<Vec<T>> {
        self.rx.try_recv().ok()
    }
}

/// A notify-only watcher: each wake means "something in a fixed scope
/// changed", with no payload.
#[derive(Debug)]
pub struct NotifyWatcher {
    rx: mpsc::Receiver<()>,
}

impl NotifyWatcher {
    pub fn channel(buffer: usize) -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    pub async fn next(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<()> {
        self.rx.try_recv().ok()
    }
}

/// Port for establishing the per-kind watchers of one scope.
///
/// No ordering is guaranteed across distinct kinds' wake-ups.
#[async_trait]
pub trait WatchConnection: Send + Sync {
    async fn watch_volumes(&self) -> Result<StringsWatcher>;

    async fn watch_filesystems(&self) -> Result<StringsWatcher>;

    async fn watch_volume_attachments(&self) -> Result<AttachmentIdsWatcher>;

    async fn watch_filesystem_attachments(&self) -> Result<AttachmentIdsWatcher>;

    /// Machine-scoped only: wakes when the machine's block devices change.
    async fn watch_block_devices(&self, machine: &Tag) -> Result<NotifyWatcher>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_next_and_close() {
        let (tx, mut watcher) = StringsWatcher::channel(4);
        tx.send(vec![Tag::volume("100")]).await.unwrap();
        assert_eq!(watcher.next().await, Some(vec![Tag::volume("100")]));

        drop(tx);
        assert_eq!(watcher.next().await, None);
    }

    #[tokio::test]
    async fn test_try_next_does_not_block() {
        let (tx, mut watcher) = NotifyWatcher::channel(4);
        assert_eq!(watcher.try_next(), None);
        tx.send(()).await.unwrap();
        assert_eq!(watcher.try_next(), Some(()));
    }
}
