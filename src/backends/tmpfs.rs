//! Tmpfs backend
//!
//! Machine-local filesystem provisioning over tmpfs mounts. Filesystems
//! are keyed by entity tag; the mount point comes from the attachment
//! parameters, falling back to a path derived from the backend identifier.

use crate::domain::model::{AttachmentInfo, AttachmentParams, StorageInfo, StorageParams};
use crate::domain::ports::StorageBackend;
use crate::domain::tags::{StorageKind, Tag};
use crate::error::ProvisionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

const PROVIDER: &str = "tmpfs";

#[derive(Debug, Clone)]
struct TmpfsMount {
    storage_id: String,
    size_mib: u64,
    attached: BTreeSet<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TmpfsState {
    /// Filesystems keyed by the owning entity's tag.
    mounts: BTreeMap<String, TmpfsMount>,
    next_index: u64,
}

/// Filesystem backend backed by tmpfs mounts.
#[derive(Default)]
pub struct TmpfsBackend {
    state: RwLock<TmpfsState>,
}

impl TmpfsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn find_by_storage_id(&self, storage_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .mounts
            .iter()
            .find(|(_, mount)| mount.storage_id == storage_id)
            .map(|(tag, _)| tag.clone())
    }
}

#[async_trait]
impl StorageBackend for TmpfsBackend {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn supported_kinds(&self) -> &[StorageKind] {
        &[StorageKind::Filesystem]
    }

    async fn create(
        &self,
        _kind: StorageKind,
        params: &StorageParams,
    ) -> Result<StorageInfo, ProvisionError> {
        if params.size_mib == 0 {
            return Err(ProvisionError::terminal("requested size is zero"));
        }

        let mut state = self.state.write().await;
        let key = params.tag.to_string();

        if let Some(existing) = state.mounts.get(&key) {
            debug!(tag = %params.tag, storage_id = %existing.storage_id, "filesystem already exists");
            return Ok(StorageInfo {
                storage_id: existing.storage_id.clone(),
                size_mib: existing.size_mib,
                persistent: false,
                attributes: BTreeMap::new(),
            });
        }

        let index = state.next_index;
        state.next_index += 1;
        let mount = TmpfsMount {
            storage_id: format!("tmpfs-{index}"),
            size_mib: params.size_mib,
            attached: BTreeSet::new(),
            created_at: Utc::now(),
        };
        info!(tag = %params.tag, storage_id = %mount.storage_id, size_mib = params.size_mib,
            "created tmpfs filesystem");

        let info = StorageInfo {
            storage_id: mount.storage_id.clone(),
            size_mib: mount.size_mib,
            persistent: false,
            attributes: BTreeMap::new(),
        };
        state.mounts.insert(key, mount);
        Ok(info)
    }

    async fn destroy(
        &self,
        _kind: StorageKind,
        params: &StorageParams,
        info: &StorageInfo,
    ) -> Result<(), ProvisionError> {
        let mut state = self.state.write().await;
        match state.mounts.remove(&params.tag.to_string()) {
            Some(mount) => {
                info!(tag = %params.tag, storage_id = %mount.storage_id,
                    created_at = %mount.created_at, "destroyed tmpfs filesystem");
            }
            None => {
                debug!(tag = %params.tag, storage_id = %info.storage_id, "tmpfs filesystem already gone");
            }
        }
        Ok(())
    }

    async fn attach(
        &self,
        machine: &Tag,
        info: &StorageInfo,
        params: &AttachmentParams,
    ) -> Result<AttachmentInfo, ProvisionError> {
        let mut state = self.state.write().await;
        let key = params.id.attachment_tag.to_string();
        let mount = state.mounts.get_mut(&key).ok_or_else(|| {
            ProvisionError::terminal(format!("no tmpfs filesystem for {}", info.storage_id))
        })?;

        mount.attached.insert(machine.to_string());
        let mount_point = params
            .mount_point
            .clone()
            .unwrap_or_else(|| format!("/mnt/{}", mount.storage_id));
        debug!(machine = %machine, storage_id = %mount.storage_id, mount_point = %mount_point,
            "mounted tmpfs filesystem");
        Ok(AttachmentInfo {
            device_name: None,
            mount_point: Some(mount_point),
            read_only: params.read_only,
        })
    }

    async fn detach(
        &self,
        machine: &Tag,
        info: &StorageInfo,
        _attachment: &AttachmentInfo,
    ) -> Result<(), ProvisionError> {
        if let Some(key) = self.find_by_storage_id(&info.storage_id).await {
            let mut state = self.state.write().await;
            if let Some(mount) = state.mounts.get_mut(&key) {
                mount.attached.remove(&machine.to_string());
                debug!(machine = %machine, storage_id = %info.storage_id, "unmounted tmpfs filesystem");
            }
        }
        Ok(())
    }
}
