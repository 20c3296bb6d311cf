//! Pending work sets
//!
//! Identifiers offered by watcher wakes, deduplicated and ordered, waiting
//! for the next reconciliation pass. Sets, not queues: a wake names an
//! identifier whose state may have changed, and offering it twice owes it
//! one look, not two.

use crate::domain::tags::{AttachmentId, StorageKind, Tag};
use std::collections::BTreeSet;

/// The identifiers owed a look on the next pass, one set per entity kind.
#[derive(Debug, Default)]
pub struct PendingSets {
    volumes: BTreeSet<Tag>,
    filesystems: BTreeSet<Tag>,
    volume_attachments: BTreeSet<AttachmentId>,
    filesystem_attachments: BTreeSet<AttachmentId>,
}

impl PendingSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_storage(&mut self, kind: StorageKind, tags: impl IntoIterator<Item = Tag>) {
        let set = match kind {
            StorageKind::Volume => &mut self.volumes,
            StorageKind::Filesystem => &mut self.filesystems,
        };
        set.extend(tags);
    }

    pub fn add_attachments(
        &mut self,
        kind: StorageKind,
        ids: impl IntoIterator<Item = AttachmentId>,
    ) {
        let set = match kind {
            StorageKind::Volume => &mut self.volume_attachments,
            StorageKind::Filesystem => &mut self.filesystem_attachments,
        };
        set.extend(ids);
    }

    /// Take the pending storage tags of one kind, leaving the set empty.
    pub fn take_storage(&mut self, kind: StorageKind) -> Vec<Tag> {
        let set = match kind {
            StorageKind::Volume => &mut self.volumes,
            StorageKind::Filesystem => &mut self.filesystems,
        };
        std::mem::take(set).into_iter().collect()
    }

    /// Take the pending attachment ids of one kind, leaving the set empty.
    pub fn take_attachments(&mut self, kind: StorageKind) -> Vec<AttachmentId> {
        let set = match kind {
            StorageKind::Volume => &mut self.volume_attachments,
            StorageKind::Filesystem => &mut self.filesystem_attachments,
        };
        std::mem::take(set).into_iter().collect()
    }

    /// Whether a storage entity is still waiting for a look. Used by the
    /// destroy gate: a departing entity's backend resource is not destroyed
    /// while a sibling attachment may still be draining.
    pub fn contains_storage(&self, tag: &Tag) -> bool {
        self.volumes.contains(tag) || self.filesystems.contains(tag)
    }

    /// Whether an attachment is still waiting for a look.
    pub fn contains_attachment(&self, id: &AttachmentId) -> bool {
        self.volume_attachments.contains(id) || self.filesystem_attachments.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
            && self.filesystems.is_empty()
            && self.volume_attachments.is_empty()
            && self.filesystem_attachments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_offers_collapse() {
        let mut pending = PendingSets::new();
        pending.add_storage(StorageKind::Volume, [Tag::volume("1"), Tag::volume("1")]);
        pending.add_storage(StorageKind::Volume, [Tag::volume("1"), Tag::volume("2")]);

        assert_eq!(
            pending.take_storage(StorageKind::Volume),
            vec![Tag::volume("1"), Tag::volume("2")]
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn test_kinds_are_disjoint() {
        let mut pending = PendingSets::new();
        pending.add_storage(StorageKind::Volume, [Tag::volume("1")]);
        pending.add_storage(StorageKind::Filesystem, [Tag::filesystem("1")]);

        assert!(pending.take_storage(StorageKind::Filesystem).len() == 1);
        assert!(!pending.is_empty());
        assert!(pending.contains_storage(&Tag::volume("1")));
        assert!(!pending.contains_storage(&Tag::filesystem("1")));
    }

    #[test]
    fn test_take_attachments_drains() {
        let mut pending = PendingSets::new();
        let id = AttachmentId::new(Tag::machine("0"), Tag::volume("1"));
        pending.add_attachments(StorageKind::Volume, [id.clone(), id.clone()]);

        assert_eq!(pending.take_attachments(StorageKind::Volume), vec![id]);
        assert!(pending.take_attachments(StorageKind::Volume).is_empty());
    }
}
