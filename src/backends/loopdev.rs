//! Loop device backend
//!
//! Machine-local volume provisioning over loop block devices. A bounded
//! pool of devices is handed out in creation order; the pool filling up is
//! a transient condition (devices free up as other volumes are destroyed),
//! so it reports as retryable rather than failing the volume outright.

use crate::domain::model::{AttachmentInfo, AttachmentParams, StorageInfo, StorageParams};
use crate::domain::ports::StorageBackend;
use crate::domain::tags::{StorageKind, Tag};
use crate::error::ProvisionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default loop device pool size, matching the kernel module default.
pub const DEFAULT_MAX_DEVICES: usize = 8;

const PROVIDER: &str = "loop";

/// One provisioned loop device.
#[derive(Debug, Clone)]
struct LoopDevice {
    storage_id: String,
    device_path: String,
    size_mib: u64,
    /// Machines the device is currently attached to, by tag.
    attached: BTreeSet<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LoopState {
    /// Devices keyed by the owning entity's tag.
    devices: BTreeMap<String, LoopDevice>,
    next_index: u64,
}

/// Volume backend backed by a bounded loop device pool.
pub struct LoopBackend {
    max_devices: usize,
    state: RwLock<LoopState>,
}

impl LoopBackend {
    pub fn new(max_devices: usize) -> Self {
        Self {
            max_devices,
            state: RwLock::new(LoopState::default()),
        }
    }

    async fn find_by_storage_id(&self, storage_id: &str) -> Option<(String, LoopDevice)> {
        let state = self.state.read().await;
        state
            .devices
            .iter()
            .find(|(_, device)| device.storage_id == storage_id)
            .map(|(tag, device)| (tag.clone(), device.clone()))
    }
}

#[async_trait]
impl StorageBackend for LoopBackend {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn supported_kinds(&self) -> &[StorageKind] {
        &[StorageKind::Volume]
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

        // Re-creation after a crash-restart collapses to the existing device.
        if let Some(existing) = state.devices.get(&key) {
            debug!(tag = %params.tag, storage_id = %existing.storage_id, "volume already exists");
            return Ok(StorageInfo {
                storage_id: existing.storage_id.clone(),
                size_mib: existing.size_mib,
                persistent: false,
                attributes: BTreeMap::new(),
            });
        }

        if state.devices.len() >= self.max_devices {
            return Err(ProvisionError::transient(format!(
                "loop device pool exhausted ({} in use)",
                state.devices.len()
            )));
        }

        let index = state.next_index;
        state.next_index += 1;
        let device = LoopDevice {
            storage_id: format!("loop-{index}"),
            device_path: format!("/dev/loop{index}"),
            size_mib: params.size_mib,
            attached: BTreeSet::new(),
            created_at: Utc::now(),
        };
        info!(tag = %params.tag, storage_id = %device.storage_id, size_mib = params.size_mib,
            "created loop device");

        let info = StorageInfo {
            storage_id: device.storage_id.clone(),
            size_mib: device.size_mib,
            persistent: false,
            attributes: BTreeMap::new(),
        };
        state.devices.insert(key, device);
        Ok(info)
    }

    async fn destroy(
        &self,
        _kind: StorageKind,
        params: &StorageParams,
        info: &StorageInfo,
    ) -> Result<(), ProvisionError> {
        let mut state = self.state.write().await;
        match state.devices.remove(&params.tag.to_string()) {
            Some(device) => {
                info!(tag = %params.tag, storage_id = %device.storage_id,
                    created_at = %device.created_at, "destroyed loop device");
            }
            None => {
                debug!(tag = %params.tag, storage_id = %info.storage_id, "loop device already gone");
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
        let device = state.devices.get_mut(&key).ok_or_else(|| {
            ProvisionError::terminal(format!("no loop device for {}", info.storage_id))
        })?;

        device.attached.insert(machine.to_string());
        debug!(machine = %machine, storage_id = %device.storage_id, "attached loop device");
        Ok(AttachmentInfo {
            device_name: Some(device.device_path.clone()),
            mount_point: None,
            read_only: params.read_only,
        })
    }

    async fn detach(
        &self,
        machine: &Tag,
        info: &StorageInfo,
        _attachment: &AttachmentInfo,
    ) -> Result<(), ProvisionError> {
        if let Some((key, _)) = self.find_by_storage_id(&info.storage_id).await {
            let mut state = self.state.write().await;
            if let Some(device) = state.devices.get_mut(&key) {
                device.attached.remove(&machine.to_string());
                debug!(machine = %machine, storage_id = %info.storage_id, "detached loop device");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(id: &str, size_mib: u64) -> StorageParams {
        StorageParams {
            tag: Tag::volume(id),
            size_mib,
            provider: PROVIDER.into(),
            attributes: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_devices() {
        let backend = LoopBackend::new(DEFAULT_MAX_DEVICES);

        let first = backend
            .create(StorageKind::Volume, &params("1", 512))
            .await
            .unwrap();
        let second = backend
            .create(StorageKind::Volume, &params("2", 1024))
            .await
            .unwrap();

        assert_eq!(first.storage_id, "loop-0");
        assert_eq!(second.storage_id, "loop-1");
        assert_eq!(second.size_mib, 1024);
        assert!(!second.persistent);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let backend = LoopBackend::new(DEFAULT_MAX_DEVICES);

        let first = backend
            .create(StorageKind::Volume, &params("1", 512))
            .await
            .unwrap();
        let again = backend
            .create(StorageKind::Volume, &params("1", 512))
            .await
            .unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_zero_size_is_terminal() {
        let backend = LoopBackend::new(DEFAULT_MAX_DEVICES);
        let err = backend
            .create(StorageKind::Volume, &params("1", 0))
            .await
            .unwrap_err();
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_transient() {
        let backend = LoopBackend::new(1);
        backend
            .create(StorageKind::Volume, &params("1", 512))
            .await
            .unwrap();

        let err = backend
            .create(StorageKind::Volume, &params("2", 512))
            .await
            .unwrap_err();
        assert!(err.transient);

        // Destroying frees a slot.
        let info = backend
            .create(StorageKind::Volume, &params("1", 512))
            .await
            .unwrap();
        backend
            .destroy(StorageKind::Volume, &params("1", 512), &info)
            .await
            .unwrap();
        backend
            .create(StorageKind::Volume, &params("2", 512))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attach_reports_device_path() {
        let backend = LoopBackend::new(DEFAULT_MAX_DEVICES);
        let storage_params = params("1", 512);
        let info = backend
            .create(StorageKind::Volume, &storage_params)
            .await
            .unwrap();

        let machine = Tag::machine("0");
        let attachment_params = AttachmentParams {
            id: crate::domain::tags::AttachmentId::new(machine.clone(), Tag::volume("1")),
            provider: PROVIDER.into(),
            instance_id: "inst-0".into(),
            read_only: true,
            mount_point: None,
        };
        let attachment = backend
            .attach(&machine, &info, &attachment_params)
            .await
            .unwrap();
        assert_eq!(attachment.device_name.as_deref(), Some("/dev/loop0"));
        assert!(attachment.read_only);

        backend.detach(&machine, &info, &attachment).await.unwrap();
        // Detaching again, or destroying twice, is a no-op.
        backend.detach(&machine, &info, &attachment).await.unwrap();
        backend
            .destroy(StorageKind::Volume, &storage_params, &info)
            .await
            .unwrap();
        backend
            .destroy(StorageKind::Volume, &storage_params, &info)
            .await
            .unwrap();
    }
}
