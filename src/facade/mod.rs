//! Batched facade client
//!
//! Issues array-batched read/write calls against the controller-side store
//! over a raw [`Caller`]. Every call takes N identifiers (or value records)
//! and returns N independently-succeeding-or-failing results in input
//! order. A whole-call transport failure aborts the entire batch and is a
//! different error from a per-element one: the former is retried wholesale,
//! the latter is isolated to its identifier.

pub mod watch;
pub mod wire;

pub use watch::{AttachmentIdsWatcher, NotifyWatcher, StringsWatcher, WatchConnection};
pub use wire::{AckResult, BatchResults, ElementResult, Request, FACADE_NAME, FACADE_VERSION};

use crate::domain::model::{
    AttachmentInfoRecord, AttachmentParams, AttachmentRecord, BlockDevice, StatusRecord,
    StorageInfoRecord, StorageParams, StorageRecord,
};
use crate::domain::tags::{AttachmentId, Life, Scope, StorageKind, Tag};
use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use wire::{decode_batch, Entities, MachineStorageIds, Records};

// =============================================================================
// Raw Caller
// =============================================================================

/// Port for the request/response transport behind the facade client.
///
/// Implementations return `Err` only for whole-call failures (connection
/// reset, timeout before the controller answered); per-element errors
/// travel inside the value payload.
#[async_trait]
pub trait Caller: Send + Sync {
    async fn call(&self, request: Request<'_>, args: serde_json::Value)
        -> Result<serde_json::Value>;
}

// =============================================================================
// Storage Client
// =============================================================================

/// The batched facade client for one provisioning scope.
pub struct StorageClient {
    caller: Arc<dyn Caller>,
    scope_tag: String,
}

impl StorageClient {
    pub fn new(caller: Arc<dyn Caller>, scope: &Scope) -> Self {
        Self {
            caller,
            scope_tag: scope.to_string(),
        }
    }

    async fn call<A, T>(
        &self,
        operation: &'static str,
        args: &A,
        expected: usize,
    ) -> Result<Vec<ElementResult<T>>>
    where
        A: Serialize,
        T: DeserializeOwned,
    {
        let request = Request {
            object: FACADE_NAME,
            version: FACADE_VERSION,
            scope: &self.scope_tag,
            operation,
        };
        let reply = self
            .caller
            .call(request, serde_json::to_value(args)?)
            .await?;
        decode_batch(reply, expected, operation)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Lifecycle state of storage entities.
    pub async fn life(&self, tags: &[Tag]) -> Result<Vec<ElementResult<Life>>> {
        self.call("Life", &Entities::from_tags(tags), tags.len())
            .await
    }

    /// Lifecycle state of attachments.
    pub async fn attachment_life(
        &self,
        ids: &[AttachmentId],
    ) -> Result<Vec<ElementResult<Life>>> {
        self.call("AttachmentLife", &MachineStorageIds::from_ids(ids), ids.len())
            .await
    }

    /// Storage entities with their provisioning info, where it exists.
    pub async fn storage(
        &self,
        kind: StorageKind,
        tags: &[Tag],
    ) -> Result<Vec<ElementResult<StorageRecord>>> {
        let op = match kind {
            StorageKind::Volume => "Volumes",
            StorageKind::Filesystem => "Filesystems",
        };
        self.call(op, &Entities::from_tags(tags), tags.len()).await
    }

    /// Creation parameters of storage entities.
    pub async fn storage_params(
        &self,
        kind: StorageKind,
        tags: &[Tag],
    ) -> Result<Vec<ElementResult<StorageParams>>> {
        let op = match kind {
            StorageKind::Volume => "VolumeParams",
            StorageKind::Filesystem => "FilesystemParams",
        };
        self.call(op, &Entities::from_tags(tags), tags.len()).await
    }

    /// Attachments with their attachment info, where it exists.
    pub async fn attachments(
        &self,
        kind: StorageKind,
        ids: &[AttachmentId],
    ) -> Result<Vec<ElementResult<AttachmentRecord>>> {
        let op = match kind {
            StorageKind::Volume => "VolumeAttachments",
            StorageKind::Filesystem => "FilesystemAttachments",
        };
        self.call(op, &MachineStorageIds::from_ids(ids), ids.len())
            .await
    }

    /// Attachment parameters, available once the storage entity has info.
    pub async fn attachment_params(
        &self,
        kind: StorageKind,
        ids: &[AttachmentId],
    ) -> Result<Vec<ElementResult<AttachmentParams>>> {
        let op = match kind {
            StorageKind::Volume => "VolumeAttachmentParams",
            StorageKind::Filesystem => "FilesystemAttachmentParams",
        };
        self.call(op, &MachineStorageIds::from_ids(ids), ids.len())
            .await
    }

    /// The controller's view of the block device backing each volume
    /// attachment, as observed on the machine.
    pub async fn volume_block_devices(
        &self,
        ids: &[AttachmentId],
    ) -> Result<Vec<ElementResult<BlockDevice>>> {
        self.call(
            "VolumeBlockDevices",
            &MachineStorageIds::from_ids(ids),
            ids.len(),
        )
        .await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Publish provisioning info for newly-created storage entities.
    pub async fn set_storage_info(
        &self,
        kind: StorageKind,
        records: &[StorageInfoRecord],
    ) -> Result<Vec<AckResult>> {
        let op = match kind {
            StorageKind::Volume => "SetVolumeInfo",
            StorageKind::Filesystem => "SetFilesystemInfo",
        };
        self.call(op, &Records::new(records), records.len()).await
    }

    /// Publish attachment info for newly-attached entities.
    pub async fn set_attachment_info(
        &self,
        kind: StorageKind,
        records: &[AttachmentInfoRecord],
    ) -> Result<Vec<AckResult>> {
        let op = match kind {
            StorageKind::Volume => "SetVolumeAttachmentInfo",
            StorageKind::Filesystem => "SetFilesystemAttachmentInfo",
        };
        self.call(op, &Records::new(records), records.len()).await
    }

    /// Advance entities to Dead after their backend resource is gone.
    pub async fn ensure_dead(&self, tags: &[Tag]) -> Result<Vec<AckResult>> {
        self.call("EnsureDead", &Entities::from_tags(tags), tags.len())
            .await
    }

    /// Remove entities from the store. The terminal action, issued only
    /// after a successful destroy (or when nothing was ever created).
    pub async fn remove(&self, tags: &[Tag]) -> Result<Vec<AckResult>> {
        self.call("Remove", &Entities::from_tags(tags), tags.len())
            .await
    }

    /// Remove attachment records after a successful detach.
    pub async fn remove_attachments(&self, ids: &[AttachmentId]) -> Result<Vec<AckResult>> {
        self.call(
            "RemoveAttachments",
            &MachineStorageIds::from_ids(ids),
            ids.len(),
        )
        .await
    }

    /// Surface terminal provisioning failures in the entities'
    /// controller-visible error slots.
    pub async fn set_status(&self, records: &[StatusRecord]) -> Result<Vec<AckResult>> {
        self.call("SetStatus", &Records::new(records), records.len())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::StorageInfo;
    use crate::error::{codes, ApiError, Error};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    /// Test double mirroring the transport seam: a closure inspecting the
    /// request and fabricating the reply.
    struct CallerFn<F>(F);

    #[async_trait]
    impl<F> Caller for CallerFn<F>
    where
        F: Fn(&Request<'_>, &serde_json::Value) -> Result<serde_json::Value> + Send + Sync,
    {
        async fn call(
            &self,
            request: Request<'_>,
            args: serde_json::Value,
        ) -> Result<serde_json::Value> {
            (self.0)(&request, &args)
        }
    }

    fn client<F>(f: F) -> StorageClient
    where
        F: Fn(&Request<'_>, &serde_json::Value) -> Result<serde_json::Value>
            + Send
            + Sync
            + 'static,
    {
        StorageClient::new(
            Arc::new(CallerFn(f)),
            &Scope::Machine(Tag::machine("123")),
        )
    }

    #[tokio::test]
    async fn test_life_request_shape() {
        let client = client(|request, args| {
            assert_eq!(request.object, "StorageProvisioner");
            assert_eq!(request.version, FACADE_VERSION);
            assert_eq!(request.scope, "machine-123");
            assert_eq!(request.operation, "Life");
            assert_eq!(args["entities"][0]["tag"], "volume-100");
            Ok(serde_json::json!({ "results": [ { "result": "alive" } ] }))
        });

        let results = client.life(&[Tag::volume("100")]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].clone().into_value().unwrap(), Life::Alive);
    }

    #[tokio::test]
    async fn test_volumes_returns_info() {
        let client = client(|request, args| {
            assert_eq!(request.operation, "Volumes");
            assert_eq!(args["entities"][0]["tag"], "volume-100");
            Ok(serde_json::json!({
                "results": [{
                    "result": {
                        "tag": "volume-100",
                        "info": { "storage-id": "volume-id", "size-mib": 1024 },
                    }
                }]
            }))
        });

        let results = client
            .storage(StorageKind::Volume, &[Tag::volume("100")])
            .await
            .unwrap();
        let record = results[0].clone().into_value().unwrap();
        assert_eq!(record.tag, Tag::volume("100"));
        assert_eq!(record.info.unwrap().storage_id, "volume-id");
    }

    #[tokio::test]
    async fn test_filesystem_ops_dispatch_by_kind() {
        let client = client(|request, _args| {
            assert_eq!(request.operation, "FilesystemParams");
            Ok(serde_json::json!({
                "results": [{
                    "result": {
                        "tag": "filesystem-100",
                        "size-mib": 1024,
                        "provider": "tmpfs",
                    }
                }]
            }))
        });

        let results = client
            .storage_params(StorageKind::Filesystem, &[Tag::filesystem("100")])
            .await
            .unwrap();
        let params = results[0].clone().into_value().unwrap();
        assert_eq!(params.provider, "tmpfs");
        assert_eq!(params.size_mib, 1024);
    }

    #[tokio::test]
    async fn test_set_volume_info_payload() {
        let client = client(|request, args| {
            assert_eq!(request.operation, "SetVolumeInfo");
            assert_eq!(args["records"][0]["tag"], "volume-100");
            assert_eq!(args["records"][0]["info"]["storage-id"], "123");
            assert_eq!(args["records"][0]["info"]["persistent"], true);
            Ok(serde_json::json!({ "results": [ {} ] }))
        });

        let records = [StorageInfoRecord {
            tag: Tag::volume("100"),
            info: StorageInfo {
                storage_id: "123".into(),
                size_mib: 1024,
                persistent: true,
                attributes: BTreeMap::new(),
            },
        }];
        let results = client
            .set_storage_info(StorageKind::Volume, &records)
            .await
            .unwrap();
        assert!(results[0].clone().into_ack().is_ok());
    }

    #[tokio::test]
    async fn test_attachment_params_request_shape() {
        let client = client(|request, args| {
            assert_eq!(request.operation, "VolumeAttachmentParams");
            assert_eq!(args["ids"][0]["machine-tag"], "machine-100");
            assert_eq!(args["ids"][0]["attachment-tag"], "volume-100");
            Ok(serde_json::json!({
                "results": [{
                    "result": {
                        "id": {
                            "machine-tag": "machine-100",
                            "attachment-tag": "volume-100",
                        },
                        "provider": "loop",
                        "instance-id": "inst-ance",
                    }
                }]
            }))
        });

        let ids = [AttachmentId::new(Tag::machine("100"), Tag::volume("100"))];
        let results = client
            .attachment_params(StorageKind::Volume, &ids)
            .await
            .unwrap();
        let params = results[0].clone().into_value().unwrap();
        assert_eq!(params.instance_id, "inst-ance");
        assert!(params.machine_ready());
    }

    #[tokio::test]
    async fn test_per_element_error_is_isolated() {
        let client = client(|_, _| {
            Ok(serde_json::json!({
                "results": [
                    {},
                    { "error": { "code": "621", "message": "MSG" } },
                ]
            }))
        });

        let results = client
            .remove(&[Tag::volume("1"), Tag::volume("2")])
            .await
            .unwrap();
        assert!(results[0].clone().into_ack().is_ok());
        let err = results[1].clone().into_ack().unwrap_err();
        assert_eq!(err.message, "MSG");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_transport_error_aborts_whole_batch() {
        let client = client(|request, _| {
            Err(Error::Transport {
                operation: request.operation.to_string(),
                reason: "connection reset".into(),
            })
        });

        let err = client
            .life(&[Tag::volume("1"), Tag::volume("2")])
            .await
            .unwrap_err();
        assert_matches!(err, Error::Transport { .. });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_reply_length_mismatch_rejected() {
        let client = client(|_, _| Ok(serde_json::json!({ "results": [] })));

        let err = client.ensure_dead(&[Tag::volume("1")]).await.unwrap_err();
        assert_matches!(err, Error::BatchShape { expected: 1, got: 0, .. });
    }

    #[tokio::test]
    async fn test_not_provisioned_error_code() {
        let client = client(|_, _| {
            Ok(serde_json::json!({
                "results": [
                    { "error": { "code": codes::NOT_PROVISIONED, "message": "volume-100 not provisioned" } },
                ]
            }))
        });

        let results = client
            .storage(StorageKind::Volume, &[Tag::volume("100")])
            .await
            .unwrap();
        let err = results[0].clone().into_value().unwrap_err();
        assert!(err.is_not_provisioned());
        assert_eq!(err, ApiError::new(codes::NOT_PROVISIONED, err.message.clone()));
    }
}
