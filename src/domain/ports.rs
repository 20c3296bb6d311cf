//! Domain Ports - backend adapter trait
//!
//! The seam between the reconciliation engine and the pluggable per-backend
//! drivers. Adapters implement [`StorageBackend`]; the engine resolves one
//! per operation through the backend registry, keyed by the provider string
//! inside the entity's parameters.

use crate::domain::model::{AttachmentInfo, AttachmentParams, StorageInfo, StorageParams};
use crate::domain::tags::{StorageKind, Tag};
use crate::error::ProvisionError;
use async_trait::async_trait;
use std::sync::Arc;

/// Port for per-backend provisioning operations.
///
/// All operations must be idempotent under at-least-once invocation:
/// creating the same logical resource twice (e.g. after a crash-restart
/// before its info was published) must be a no-op or collapse to the same
/// backend resource, and destroying or detaching something already gone
/// must succeed. Errors carry an explicit transient/terminal severity that
/// the engine trusts for its retry decision.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Provider name this backend registers under.
    fn provider(&self) -> &str;

    /// Storage kinds the backend can provision.
    fn supported_kinds(&self) -> &[StorageKind];

    /// Create the backend resource for a storage entity, returning its
    /// provisioning info.
    async fn create(
        &self,
        kind: StorageKind,
        params: &StorageParams,
    ) -> Result<StorageInfo, ProvisionError>;

    /// Destroy the backend resource. Never invoked while an attachment of
    /// the entity still carries attachment info.
    async fn destroy(
        &self,
        kind: StorageKind,
        params: &StorageParams,
        info: &StorageInfo,
    ) -> Result<(), ProvisionError>;

    /// Attach a provisioned storage entity to a machine.
    async fn attach(
        &self,
        machine: &Tag,
        info: &StorageInfo,
        params: &AttachmentParams,
    ) -> Result<AttachmentInfo, ProvisionError>;

    /// Detach a storage entity from a machine.
    async fn detach(
        &self,
        machine: &Tag,
        info: &StorageInfo,
        attachment: &AttachmentInfo,
    ) -> Result<(), ProvisionError>;
}

pub type BackendRef = Arc<dyn StorageBackend>;
