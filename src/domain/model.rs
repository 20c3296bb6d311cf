//! Storage entity records
//!
//! Plain data carried between the controller-side store, the engine, and
//! the backend adapters. Parameters are set once at creation-request time
//! and are immutable; provisioning info appears only once provisioning has
//! succeeded and is immutable thereafter. Those invariants are enforced by
//! the engine (re-provisioning is never attempted once info exists), not by
//! these types.

use crate::domain::tags::{AttachmentId, Tag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Storage Entity Records
// =============================================================================

/// Requested creation parameters for a volume or filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageParams {
    pub tag: Tag,
    /// Requested size in MiB.
    pub size_mib: u64,
    /// Backend type the entity must be provisioned with.
    pub provider: String,
    /// Backend-specific options.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// Backend-assigned attributes proving a storage resource exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageInfo {
    /// Identifier assigned by the backend.
    pub storage_id: String,
    /// Actual size in MiB.
    pub size_mib: u64,
    /// Whether the resource outlives its attachments.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// One element of a bulk storage-entity read: the entity and, when it has
/// been provisioned, its info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageRecord {
    pub tag: Tag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<StorageInfo>,
}

/// One element of a bulk provisioning-info write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageInfoRecord {
    pub tag: Tag,
    pub info: StorageInfo,
}

// =============================================================================
// Attachment Records
// =============================================================================

/// Parameters for attaching a storage entity to a machine. Available once
/// the storage entity's provisioning info exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AttachmentParams {
    pub id: AttachmentId,
    pub provider: String,
    /// Backend identifier of the machine's instance. Empty until the
    /// machine itself has been provisioned.
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub read_only: bool,
    /// Requested mount point (filesystems only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
}

impl AttachmentParams {
    /// The owning machine is ready once it has a backend instance.
    pub fn machine_ready(&self) -> bool {
        !self.instance_id.is_empty()
    }
}

/// Backend-assigned attributes proving a storage entity is attached to a
/// machine: a device name for volumes, a mount point for filesystems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AttachmentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// One element of a bulk attachment read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AttachmentRecord {
    pub id: AttachmentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<AttachmentInfo>,
}

/// One element of a bulk attachment-info write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AttachmentInfoRecord {
    pub id: AttachmentId,
    pub info: AttachmentInfo,
}

// =============================================================================
// Block Devices
// =============================================================================

/// A block device observed on a machine, as reported by the controller.
/// Machine-scoped reconciliation uses these to resolve device names for
/// volume attachments the backend cannot name itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockDevice {
    pub device_name: String,
    #[serde(default)]
    pub hardware_id: String,
    pub size_mib: u64,
}

// =============================================================================
// Status Writes
// =============================================================================

/// One element of a bulk status write, surfacing a terminal provisioning
/// failure in the entity's controller-visible error slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusRecord {
    pub tag: Tag,
    pub status: String,
    pub message: String,
}

impl StatusRecord {
    pub fn error(tag: Tag, message: impl Into<String>) -> Self {
        Self {
            tag,
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_record_optional_info() {
        let bare = StorageRecord {
            tag: Tag::volume("100"),
            info: None,
        };
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("info").is_none());

        let provisioned = StorageRecord {
            tag: Tag::volume("100"),
            info: Some(StorageInfo {
                storage_id: "volume-id".into(),
                size_mib: 1024,
                persistent: true,
                attributes: BTreeMap::new(),
            }),
        };
        let json = serde_json::to_value(&provisioned).unwrap();
        assert_eq!(json["info"]["storage-id"], "volume-id");
        assert_eq!(json["info"]["size-mib"], 1024);
    }

    #[test]
    fn test_attachment_params_machine_ready() {
        let mut params = AttachmentParams {
            id: AttachmentId::new(Tag::machine("100"), Tag::volume("100")),
            provider: "loop".into(),
            instance_id: String::new(),
            read_only: false,
            mount_point: None,
        };
        assert!(!params.machine_ready());
        params.instance_id = "inst-ance".into();
        assert!(params.machine_ready());
    }

    #[test]
    fn test_status_record_error() {
        let record = StatusRecord::error(Tag::volume("100"), "MSG");
        assert_eq!(record.status, "error");
        assert_eq!(record.message, "MSG");
    }
}
