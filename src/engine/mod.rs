//! Reconciler Core
//!
//! One reconciliation loop per scope. On startup the loop consumes the
//! initial wake of every watcher before its first pass, then idles on a
//! select over the per-kind watchers, due retries, and shutdown; a wake
//! drains every ready notification into the pending sets and runs passes
//! until they are empty.
//! Each pass reconciles storage entities first (volumes, then filesystems),
//! then attachments, so attachment state stays strictly downstream of its
//! storage entity within a pass.
//!
//! Failure semantics: a per-entity failure never blocks its siblings, a
//! whole-batch transport failure leaves every identifier of that batch
//! unresolved and re-queued, and the loop itself only stops on shutdown or
//! a watcher closing.

pub mod classifier;
pub mod pending;
pub mod retry;

mod attachments;

pub use classifier::{classify, Decision};
pub use pending::PendingSets;
pub use retry::{RetryPolicy, RetryQueue, WorkItem};

use crate::backends::BackendRegistry;
use crate::domain::model::{StatusRecord, StorageInfo, StorageInfoRecord};
use crate::domain::tags::{AttachmentId, Scope, StorageKind, Tag};
use crate::error::{ApiError, Error, Result};
use crate::facade::watch::NotifyWatcher;
use crate::facade::{Caller, StorageClient, WatchConnection};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Tuning knobs for one scope's loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded fan-out for backend calls within one pass.
    pub max_concurrent_ops: usize,
    /// Backoff shape for transient failures.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 8,
            retry: RetryPolicy::default(),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The reconciliation engine for one provisioning scope.
pub struct Engine {
    config: EngineConfig,
    scope: Scope,
    client: StorageClient,
    watch: Arc<dyn WatchConnection>,
    registry: Arc<BackendRegistry>,
    shutdown: CancellationToken,
    pending: PendingSets,
    retry: RetryQueue,
    /// Known attachments and whether they hold attachment info. `None`
    /// means the attachment has been offered but not yet observed; the
    /// destroy gate treats unknown as blocking.
    attachment_state: BTreeMap<AttachmentId, Option<bool>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        scope: Scope,
        caller: Arc<dyn Caller>,
        watch: Arc<dyn WatchConnection>,
        registry: Arc<BackendRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        let client = StorageClient::new(caller, &scope);
        let retry = RetryQueue::new(config.retry.clone());
        Self {
            config,
            scope,
            client,
            watch,
            registry,
            shutdown,
            pending: PendingSets::new(),
            retry,
            attachment_state: BTreeMap::new(),
        }
    }

    /// Run the scope's loop until shutdown (Ok) or a watcher closes (Err).
    pub async fn run(mut self) -> Result<()> {
        info!(scope = %self.scope, "storage reconciliation scope starting");

        let mut volumes = self.watch.watch_volumes().await?;
        let mut filesystems = self.watch.watch_filesystems().await?;
        let mut volume_attachments = self.watch.watch_volume_attachments().await?;
        let mut filesystem_attachments = self.watch.watch_filesystem_attachments().await?;
        let mut block_devices = match self.scope.machine() {
            Some(machine) => Some(self.watch.watch_block_devices(machine).await?),
            None => None,
        };

        // Each watcher delivers an initial wake naming every entity
        // currently in scope. Consume all of them before the first pass, so
        // the destroy gate already knows every attachment that exists; wake
        // ordering across kinds is otherwise unguaranteed.
        let wake = volumes.next().await;
        self.on_storage_wake(StorageKind::Volume, wake)?;
        let wake = filesystems.next().await;
        self.on_storage_wake(StorageKind::Filesystem, wake)?;
        let wake = volume_attachments.next().await;
        self.on_attachment_wake(StorageKind::Volume, wake)?;
        let wake = filesystem_attachments.next().await;
        self.on_attachment_wake(StorageKind::Filesystem, wake)?;
        if let Some(watcher) = block_devices.as_mut() {
            let wake = watcher.next().await;
            self.on_block_device_wake(wake)?;
        }

        let shutdown = self.shutdown.clone();
        loop {
            // Merge every already-ready wake before starting a pass.
            loop {
                let mut progressed = false;
                if let Some(tags) = volumes.try_next() {
                    self.note_storage_wake(StorageKind::Volume, tags);
                    progressed = true;
                }
                if let Some(tags) = filesystems.try_next() {
                    self.note_storage_wake(StorageKind::Filesystem, tags);
                    progressed = true;
                }
                if let Some(ids) = volume_attachments.try_next() {
                    self.note_attachment_wake(StorageKind::Volume, ids);
                    progressed = true;
                }
                if let Some(ids) = filesystem_attachments.try_next() {
                    self.note_attachment_wake(StorageKind::Filesystem, ids);
                    progressed = true;
                }
                if let Some(()) = block_devices.as_mut().and_then(NotifyWatcher::try_next) {
                    self.note_block_device_wake();
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }

            while !self.pending.is_empty() {
                if shutdown.is_cancelled() {
                    info!(scope = %self.scope, "scope shut down");
                    return Ok(());
                }
                self.pass().await?;
            }

            let retry_due = self.retry.next_due();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(scope = %self.scope, "scope shut down");
                    return Ok(());
                }
                wake = volumes.next() => {
                    self.on_storage_wake(StorageKind::Volume, wake)?;
                }
                wake = filesystems.next() => {
                    self.on_storage_wake(StorageKind::Filesystem, wake)?;
                }
                wake = volume_attachments.next() => {
                    self.on_attachment_wake(StorageKind::Volume, wake)?;
                }
                wake = filesystem_attachments.next() => {
                    self.on_attachment_wake(StorageKind::Filesystem, wake)?;
                }
                wake = notify_next(block_devices.as_mut()) => {
                    self.on_block_device_wake(wake)?;
                }
                _ = retry_tick(retry_due) => {
                    self.on_retries_due();
                }
            }
        }
    }

    // =========================================================================
    // Wake Handling
    // =========================================================================

    fn on_storage_wake(&mut self, kind: StorageKind, wake: Option<Vec<Tag>>) -> Result<()> {
        match wake {
            Some(tags) => {
                self.note_storage_wake(kind, tags);
                Ok(())
            }
            None => Err(Error::WatcherClosed {
                kind: kind.to_string(),
            }),
        }
    }

    fn on_attachment_wake(
        &mut self,
        kind: StorageKind,
        wake: Option<Vec<AttachmentId>>,
    ) -> Result<()> {
        match wake {
            Some(ids) => {
                self.note_attachment_wake(kind, ids);
                Ok(())
            }
            None => Err(Error::WatcherClosed {
                kind: format!("{kind}-attachment"),
            }),
        }
    }

    fn on_block_device_wake(&mut self, wake: Option<()>) -> Result<()> {
        match wake {
            Some(()) => {
                self.note_block_device_wake();
                Ok(())
            }
            None => Err(Error::WatcherClosed {
                kind: "block-device".to_string(),
            }),
        }
    }

    fn note_storage_wake(&mut self, kind: StorageKind, tags: Vec<Tag>) {
        debug!(%kind, count = tags.len(), "storage wake");
        self.pending.add_storage(kind, tags);
    }

    fn note_attachment_wake(&mut self, kind: StorageKind, ids: Vec<AttachmentId>) {
        debug!(%kind, count = ids.len(), "attachment wake");
        for id in &ids {
            self.attachment_state.entry(id.clone()).or_insert(None);
        }
        self.pending.add_attachments(kind, ids);
    }

    /// A block-device change may have made a device visible for a volume
    /// attachment that was waiting on one; re-offer every known volume
    /// attachment.
    fn note_block_device_wake(&mut self) {
        let ids: Vec<AttachmentId> = self
            .attachment_state
            .keys()
            .filter(|id| id.storage_kind() == Some(StorageKind::Volume))
            .cloned()
            .collect();
        debug!(count = ids.len(), "block device wake");
        self.pending.add_attachments(StorageKind::Volume, ids);
    }

    fn on_retries_due(&mut self) {
        for item in self.retry.take_due(Instant::now()) {
            debug!(%item, "retry due");
            match item {
                WorkItem::Storage(kind, tag) => self.pending.add_storage(kind, [tag]),
                WorkItem::Attachment(kind, id) => self.pending.add_attachments(kind, [id]),
            }
        }
    }

    // =========================================================================
    // Reconciliation Pass
    // =========================================================================

    /// One pass: storage kinds first, then attachments. Storage entities
    /// acted on this pass defer their attachments to the next one, since
    /// attachment state is strictly downstream.
    async fn pass(&mut self) -> Result<()> {
        let mut acted: BTreeSet<Tag> = BTreeSet::new();

        for kind in [StorageKind::Volume, StorageKind::Filesystem] {
            let tags = self.pending.take_storage(kind);
            if tags.is_empty() {
                continue;
            }
            debug!(%kind, count = tags.len(), "reconciling storage entities");
            if let Err(err) = self.reconcile_storage(kind, &tags, &mut acted).await {
                self.requeue_batch(err, tags.into_iter().map(|tag| WorkItem::Storage(kind, tag)))?;
            }
        }

        for kind in [StorageKind::Volume, StorageKind::Filesystem] {
            let ids = self.pending.take_attachments(kind);
            if ids.is_empty() {
                continue;
            }
            debug!(%kind, count = ids.len(), "reconciling attachments");
            if let Err(err) = self.reconcile_attachments(kind, &ids, &acted).await {
                self.requeue_batch(err, ids.into_iter().map(|id| WorkItem::Attachment(kind, id)))?;
            }
        }

        Ok(())
    }

    /// A whole-batch failure leaves every identifier unresolved: re-queue
    /// them all under backoff. Anything non-transient stops the scope.
    fn requeue_batch(&mut self, err: Error, items: impl Iterator<Item = WorkItem>) -> Result<()> {
        if !err.is_transient() {
            return Err(err);
        }
        warn!(error = %err, "batch unresolved; re-queueing");
        let now = Instant::now();
        for item in items {
            self.retry.schedule(item, now);
        }
        Ok(())
    }

    // =========================================================================
    // Storage Reconciliation
    // =========================================================================

    async fn reconcile_storage(
        &mut self,
        kind: StorageKind,
        tags: &[Tag],
        acted: &mut BTreeSet<Tag>,
    ) -> Result<()> {
        let life_results = self.client.life(tags).await?;
        let records = self.client.storage(kind, tags).await?;

        let mut to_provision: Vec<Tag> = Vec::new();
        let mut to_destroy: Vec<(Tag, StorageInfo)> = Vec::new();
        let mut to_remove: Vec<Tag> = Vec::new();

        for ((tag, life_el), record_el) in tags.iter().zip(life_results).zip(records) {
            let item = WorkItem::Storage(kind, tag.clone());
            let life = match life_el.into_value() {
                Ok(life) => life,
                Err(err) => {
                    self.handle_entity_error(item, &err);
                    continue;
                }
            };
            let info = match record_el.into_value() {
                Ok(record) => record.info,
                Err(err) => {
                    self.handle_entity_error(item, &err);
                    continue;
                }
            };

            match classify(life, info.is_some(), true) {
                Decision::Provision => to_provision.push(tag.clone()),
                Decision::Deprovision => {
                    if self.destroy_gated(tag) {
                        debug!(%tag, "sibling attachments still draining; deferring destroy");
                    } else if let Some(info) = info {
                        to_destroy.push((tag.clone(), info));
                    }
                }
                Decision::Remove => to_remove.push(tag.clone()),
                Decision::NoAction => {
                    debug!(%tag, "already provisioned; nothing to do");
                    self.retry.clear(&item);
                }
                Decision::Defer => {}
            }
        }

        self.provision_storage(kind, to_provision, acted).await?;
        self.deprovision_storage(kind, to_destroy, to_remove, acted)
            .await?;
        Ok(())
    }

    /// Whether a departing entity's destroy must wait: any sibling
    /// attachment that is pending, unobserved, or still holding attachment
    /// info blocks it.
    fn destroy_gated(&self, tag: &Tag) -> bool {
        self.attachment_state.iter().any(|(id, has_info)| {
            id.attachment_tag == *tag
                && (self.pending.contains_attachment(id) || *has_info != Some(false))
        })
    }

    async fn provision_storage(
        &mut self,
        kind: StorageKind,
        tags: Vec<Tag>,
        acted: &mut BTreeSet<Tag>,
    ) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let params_results = self.client.storage_params(kind, &tags).await?;

        let mut statuses: Vec<StatusRecord> = Vec::new();
        let mut jobs = Vec::new();
        for (tag, el) in tags.iter().zip(params_results) {
            let item = WorkItem::Storage(kind, tag.clone());
            match el.into_value() {
                Ok(params) => match self.registry.lookup(&params.provider, kind) {
                    Ok(backend) => jobs.push((tag.clone(), backend, params)),
                    Err(err) => {
                        error!(%tag, error = %err, "no backend can provision this entity");
                        statuses.push(StatusRecord::error(tag.clone(), err.to_string()));
                        self.retry.clear(&item);
                    }
                },
                Err(err) => self.handle_entity_error(item, &err),
            }
        }

        let creates: Vec<_> = jobs
            .into_iter()
            .map(|(tag, backend, params)| async move {
                let result = backend.create(kind, &params).await;
                (tag, result)
            })
            .collect();
        let mut results: Vec<(Tag, std::result::Result<StorageInfo, crate::error::ProvisionError>)> =
            stream::iter(creates)
                .buffer_unordered(self.config.max_concurrent_ops)
                .collect()
                .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut records: Vec<StorageInfoRecord> = Vec::new();
        for (tag, result) in results {
            let item = WorkItem::Storage(kind, tag.clone());
            match result {
                Ok(info) => records.push(StorageInfoRecord { tag, info }),
                Err(err) if err.transient => {
                    let delay = self.retry.schedule(item, Instant::now());
                    warn!(%tag, error = %err, ?delay, "create failed transiently");
                }
                Err(err) => {
                    error!(%tag, error = %err, "create failed");
                    statuses.push(StatusRecord::error(tag, err.message));
                    self.retry.clear(&item);
                }
            }
        }

        if !records.is_empty() {
            let acks = self.client.set_storage_info(kind, &records).await?;
            for (record, ack) in records.iter().zip(acks) {
                match ack.into_ack() {
                    Ok(()) => {
                        info!(tag = %record.tag, storage_id = %record.info.storage_id, "provisioned");
                        acted.insert(record.tag.clone());
                        self.retry.clear(&WorkItem::Storage(kind, record.tag.clone()));
                        self.offer_sibling_attachments(&record.tag);
                    }
                    Err(err) => {
                        self.handle_entity_error(WorkItem::Storage(kind, record.tag.clone()), &err)
                    }
                }
            }
        }

        self.write_statuses(statuses).await
    }

    async fn deprovision_storage(
        &mut self,
        kind: StorageKind,
        to_destroy: Vec<(Tag, StorageInfo)>,
        to_remove: Vec<Tag>,
        acted: &mut BTreeSet<Tag>,
    ) -> Result<()> {
        // Entities that were never provisioned skip destroy entirely.
        let mut removals: Vec<Tag> = to_remove;
        let mut statuses: Vec<StatusRecord> = Vec::new();

        if !to_destroy.is_empty() {
            let tags: Vec<Tag> = to_destroy.iter().map(|(tag, _)| tag.clone()).collect();
            let params_results = self.client.storage_params(kind, &tags).await?;

            let mut jobs = Vec::new();
            for ((tag, info), el) in to_destroy.into_iter().zip(params_results) {
                let item = WorkItem::Storage(kind, tag.clone());
                match el.into_value() {
                    Ok(params) => match self.registry.lookup(&params.provider, kind) {
                        Ok(backend) => jobs.push((tag, backend, params, info)),
                        Err(err) => {
                            error!(%tag, error = %err, "no backend can deprovision this entity");
                            statuses.push(StatusRecord::error(tag, err.to_string()));
                            self.retry.clear(&item);
                        }
                    },
                    Err(err) => self.handle_entity_error(item, &err),
                }
            }

            let destroys: Vec<_> = jobs
                .into_iter()
                .map(|(tag, backend, params, info)| async move {
                    let result = backend.destroy(kind, &params, &info).await;
                    (tag, result)
                })
                .collect();
            let mut results: Vec<(Tag, std::result::Result<(), crate::error::ProvisionError>)> =
                stream::iter(destroys)
                    .buffer_unordered(self.config.max_concurrent_ops)
                    .collect()
                    .await;
            results.sort_by(|a, b| a.0.cmp(&b.0));

            for (tag, result) in results {
                let item = WorkItem::Storage(kind, tag.clone());
                match result {
                    Ok(()) => {
                        info!(%tag, "deprovisioned");
                        removals.push(tag);
                    }
                    Err(err) if err.transient => {
                        let delay = self.retry.schedule(item, Instant::now());
                        warn!(%tag, error = %err, ?delay, "destroy failed transiently");
                    }
                    Err(err) => {
                        error!(%tag, error = %err, "destroy failed");
                        statuses.push(StatusRecord::error(tag, err.message));
                        self.retry.clear(&item);
                    }
                }
            }
        }

        if !removals.is_empty() {
            removals.sort();
            let acks = self.client.ensure_dead(&removals).await?;
            let mut dead: Vec<Tag> = Vec::new();
            for (tag, ack) in removals.into_iter().zip(acks) {
                match ack.into_ack() {
                    Ok(()) => dead.push(tag),
                    Err(err) => self.handle_entity_error(WorkItem::Storage(kind, tag), &err),
                }
            }

            if !dead.is_empty() {
                let acks = self.client.remove(&dead).await?;
                for (tag, ack) in dead.into_iter().zip(acks) {
                    match ack.into_ack() {
                        Ok(()) => {
                            info!(%tag, "removed");
                            acted.insert(tag.clone());
                            self.retry.clear(&WorkItem::Storage(kind, tag));
                        }
                        Err(err) => self.handle_entity_error(WorkItem::Storage(kind, tag), &err),
                    }
                }
            }
        }

        self.write_statuses(statuses).await
    }

    // =========================================================================
    // Shared Bookkeeping
    // =========================================================================

    /// The entity's provisioning info just landed: its attachments became
    /// satisfiable, so re-offer them.
    fn offer_sibling_attachments(&mut self, tag: &Tag) {
        let Some(kind) = tag.storage_kind() else {
            return;
        };
        let siblings: Vec<AttachmentId> = self
            .attachment_state
            .keys()
            .filter(|id| id.attachment_tag == *tag)
            .cloned()
            .collect();
        if siblings.is_empty() {
            return;
        }
        debug!(%tag, count = siblings.len(), "re-offering sibling attachments");
        self.pending.add_attachments(kind, siblings);
    }

    /// Route a per-element controller error: not-found drops the entity
    /// (it was removed under us), transient codes re-queue under backoff,
    /// anything else is terminal and waits for an external state change.
    fn handle_entity_error(&mut self, item: WorkItem, err: &ApiError) {
        if err.is_not_found() {
            debug!(%item, "entity already removed");
            self.forget(&item);
        } else if err.is_transient() {
            let delay = self.retry.schedule(item.clone(), Instant::now());
            debug!(%item, code = %err.code, ?delay, "transient controller error");
        } else {
            warn!(%item, code = %err.code, message = %err.message, "terminal controller error");
            self.retry.clear(&item);
        }
    }

    fn forget(&mut self, item: &WorkItem) {
        self.retry.clear(item);
        if let WorkItem::Attachment(kind, id) = item {
            self.attachment_state.remove(id);
            // The destroy gate for the owning entity may just have opened.
            self.pending.add_storage(*kind, [id.attachment_tag.clone()]);
        }
    }

    /// Surface terminal failures in the entities' controller-visible error
    /// slots. Best-effort per element; a rejected status write is only
    /// logged.
    pub(crate) async fn write_statuses(&mut self, statuses: Vec<StatusRecord>) -> Result<()> {
        if statuses.is_empty() {
            return Ok(());
        }
        let acks = self.client.set_status(&statuses).await?;
        for (record, ack) in statuses.iter().zip(acks) {
            if let Err(err) = ack.into_ack() {
                warn!(tag = %record.tag, code = %err.code, "failed to record entity status");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Select Helpers
// =============================================================================

/// Sleep until the retry deadline, or forever when nothing is scheduled.
async fn retry_tick(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Next block-device wake, or never for model scope.
async fn notify_next(watcher: Option<&mut NotifyWatcher>) -> Option<()> {
    match watcher {
        Some(watcher) => watcher.next().await,
        None => std::future::pending().await,
    }
}
