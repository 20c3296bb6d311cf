//! Attachment reconciliation
//!
//! Drives the (machine, storage entity) cross-product: attach once both the
//! owning entity's provisioning info and the machine's backend instance
//! exist, detach-then-remove when departing. Missing dependencies are
//! deferrals, never failures; the dependency's own change re-offers the
//! pair.

use super::{classify, Decision, Engine, WorkItem};
use crate::domain::model::{
    AttachmentInfo, AttachmentInfoRecord, AttachmentParams, StatusRecord, StorageInfo,
};
use crate::domain::ports::BackendRef;
use crate::domain::tags::{AttachmentId, StorageKind, Tag};
use crate::error::{ProvisionError, Result};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

impl Engine {
    pub(super) async fn reconcile_attachments(
        &mut self,
        kind: StorageKind,
        ids: &[AttachmentId],
        acted: &BTreeSet<Tag>,
    ) -> Result<()> {
        // Attachment state is strictly downstream of the owning entity: a
        // pair whose entity was acted on this pass waits for the next one.
        let (deferred, ids): (Vec<AttachmentId>, Vec<AttachmentId>) = ids
            .iter()
            .cloned()
            .partition(|id| acted.contains(&id.attachment_tag));
        if !deferred.is_empty() {
            debug!(count = deferred.len(), "storage acted on this pass; deferring attachments");
            self.pending.add_attachments(kind, deferred);
        }
        if ids.is_empty() {
            return Ok(());
        }

        let life_results = self.client.attachment_life(&ids).await?;
        let records = self.client.attachments(kind, &ids).await?;

        let mut to_attach: Vec<AttachmentId> = Vec::new();
        let mut to_detach: Vec<(AttachmentId, AttachmentInfo)> = Vec::new();
        let mut to_remove: Vec<AttachmentId> = Vec::new();

        for ((id, life_el), record_el) in ids.iter().zip(life_results).zip(records) {
            let item = WorkItem::Attachment(kind, id.clone());
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
            self.attachment_state.insert(id.clone(), Some(info.is_some()));

            // Dependency readiness is resolved during the attach phase,
            // where the params and owning entity's info are in hand.
            match classify(life, info.is_some(), true) {
                Decision::Provision => to_attach.push(id.clone()),
                Decision::Deprovision => {
                    if let Some(info) = info {
                        to_detach.push((id.clone(), info));
                    }
                }
                Decision::Remove => to_remove.push(id.clone()),
                Decision::NoAction => {
                    debug!(%id, "already attached; nothing to do");
                    self.retry.clear(&item);
                }
                Decision::Defer => {}
            }
        }

        self.attach_batch(kind, to_attach).await?;
        self.detach_batch(kind, to_detach).await?;
        self.remove_attachment_records(kind, to_remove).await?;
        Ok(())
    }

    async fn attach_batch(&mut self, kind: StorageKind, ids: Vec<AttachmentId>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let params_results = self.client.attachment_params(kind, &ids).await?;

        let mut candidates = Vec::new();
        for (id, el) in ids.iter().zip(params_results) {
            match el.into_value() {
                Ok(params) if params.machine_ready() => candidates.push((id.clone(), params)),
                Ok(_) => {
                    debug!(%id, "machine has no instance yet; deferring attach");
                }
                Err(err) if err.is_not_provisioned() => {
                    debug!(%id, "storage entity not provisioned yet; deferring attach");
                }
                Err(err) => {
                    self.handle_entity_error(WorkItem::Attachment(kind, id.clone()), &err)
                }
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let storage_infos = self
            .storage_info_for(kind, candidates.iter().map(|(id, _)| &id.attachment_tag))
            .await?;

        let mut statuses: Vec<StatusRecord> = Vec::new();
        let mut jobs: Vec<(AttachmentId, BackendRef, StorageInfo, AttachmentParams)> = Vec::new();
        for (id, params) in candidates {
            let Some(info) = storage_infos.get(&id.attachment_tag).cloned() else {
                debug!(%id, "storage entity not provisioned yet; deferring attach");
                continue;
            };
            match self.registry.lookup(&params.provider, kind) {
                Ok(backend) => jobs.push((id, backend, info, params)),
                Err(err) => {
                    error!(%id, error = %err, "no backend can attach this entity");
                    statuses.push(StatusRecord::error(id.attachment_tag.clone(), err.to_string()));
                    self.retry.clear(&WorkItem::Attachment(kind, id));
                }
            }
        }

        let attaches: Vec<_> = jobs
            .into_iter()
            .map(|(id, backend, info, params)| async move {
                let machine = id.machine_tag.clone();
                let result = backend.attach(&machine, &info, &params).await;
                (id, result)
            })
            .collect();
        let mut results: Vec<(AttachmentId, std::result::Result<AttachmentInfo, ProvisionError>)> =
            stream::iter(attaches)
                .buffer_unordered(self.config.max_concurrent_ops)
                .collect()
                .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut records: Vec<AttachmentInfoRecord> = Vec::new();
        for (id, result) in results {
            let item = WorkItem::Attachment(kind, id.clone());
            match result {
                Ok(info) => records.push(AttachmentInfoRecord { id, info }),
                Err(err) if err.transient => {
                    let delay = self.retry.schedule(item, Instant::now());
                    warn!(%id, error = %err, ?delay, "attach failed transiently");
                }
                Err(err) => {
                    error!(%id, error = %err, "attach failed");
                    statuses.push(StatusRecord::error(id.attachment_tag.clone(), err.message));
                    self.retry.clear(&item);
                }
            }
        }

        if kind == StorageKind::Volume {
            self.fill_device_names(&mut records).await?;
        }

        if !records.is_empty() {
            let acks = self.client.set_attachment_info(kind, &records).await?;
            for (record, ack) in records.iter().zip(acks) {
                match ack.into_ack() {
                    Ok(()) => {
                        info!(id = %record.id, "attached");
                        self.attachment_state.insert(record.id.clone(), Some(true));
                        self.retry.clear(&WorkItem::Attachment(kind, record.id.clone()));
                    }
                    Err(err) => self
                        .handle_entity_error(WorkItem::Attachment(kind, record.id.clone()), &err),
                }
            }
        }

        self.write_statuses(statuses).await
    }

    /// A volume attachment without a device name is published only once a
    /// device is observable: fall back to the controller's block-device
    /// view, and defer the pair when even that has nothing yet (the
    /// machine's block-device wake re-offers it).
    async fn fill_device_names(&mut self, records: &mut Vec<AttachmentInfoRecord>) -> Result<()> {
        let missing: Vec<AttachmentId> = records
            .iter()
            .filter(|record| record.info.device_name.is_none())
            .map(|record| record.id.clone())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let devices = self.client.volume_block_devices(&missing).await?;
        let observed: BTreeMap<AttachmentId, String> = missing
            .iter()
            .zip(devices)
            .filter_map(|(id, el)| {
                el.into_value()
                    .ok()
                    .map(|device| (id.clone(), device.device_name))
            })
            .collect();

        records.retain_mut(|record| {
            if record.info.device_name.is_some() {
                return true;
            }
            match observed.get(&record.id) {
                Some(device_name) => {
                    record.info.device_name = Some(device_name.clone());
                    true
                }
                None => {
                    debug!(id = %record.id, "no block device observed yet; deferring publish");
                    false
                }
            }
        });
        Ok(())
    }

    async fn detach_batch(
        &mut self,
        kind: StorageKind,
        items: Vec<(AttachmentId, AttachmentInfo)>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let ids: Vec<AttachmentId> = items.iter().map(|(id, _)| id.clone()).collect();
        let params_results = self.client.attachment_params(kind, &ids).await?;
        let storage_infos = self
            .storage_info_for(kind, ids.iter().map(|id| &id.attachment_tag))
            .await?;

        let mut statuses: Vec<StatusRecord> = Vec::new();
        let mut detached: Vec<AttachmentId> = Vec::new();
        let mut jobs = Vec::new();
        for ((id, attachment_info), el) in items.into_iter().zip(params_results) {
            let storage_info = match storage_infos.get(&id.attachment_tag) {
                Some(info) => info.clone(),
                None => {
                    // The backend resource is already gone; only the record
                    // remains.
                    detached.push(id);
                    continue;
                }
            };
            match el.into_value() {
                Ok(params) => match self.registry.lookup(&params.provider, kind) {
                    Ok(backend) => jobs.push((id, backend, storage_info, attachment_info)),
                    Err(err) => {
                        error!(%id, error = %err, "no backend can detach this entity");
                        statuses.push(StatusRecord::error(id.attachment_tag.clone(), err.to_string()));
                        self.retry.clear(&WorkItem::Attachment(kind, id));
                    }
                },
                Err(err) => self.handle_entity_error(WorkItem::Attachment(kind, id), &err),
            }
        }

        let detaches: Vec<_> = jobs
            .into_iter()
            .map(|(id, backend, storage_info, attachment_info)| async move {
                let machine = id.machine_tag.clone();
                let result = backend
                    .detach(&machine, &storage_info, &attachment_info)
                    .await;
                (id, result)
            })
            .collect();
        let mut results: Vec<(AttachmentId, std::result::Result<(), ProvisionError>)> =
            stream::iter(detaches)
                .buffer_unordered(self.config.max_concurrent_ops)
                .collect()
                .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, result) in results {
            let item = WorkItem::Attachment(kind, id.clone());
            match result {
                Ok(()) => {
                    info!(%id, "detached");
                    detached.push(id);
                }
                Err(err) if err.transient => {
                    let delay = self.retry.schedule(item, Instant::now());
                    warn!(%id, error = %err, ?delay, "detach failed transiently");
                }
                Err(err) => {
                    error!(%id, error = %err, "detach failed");
                    statuses.push(StatusRecord::error(id.attachment_tag.clone(), err.message));
                    self.retry.clear(&item);
                }
            }
        }

        detached.sort();
        self.remove_attachment_records(kind, detached).await?;
        self.write_statuses(statuses).await
    }

    async fn remove_attachment_records(
        &mut self,
        kind: StorageKind,
        ids: Vec<AttachmentId>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let acks = self.client.remove_attachments(&ids).await?;
        for (id, ack) in ids.into_iter().zip(acks) {
            match ack.into_ack() {
                Ok(()) => {
                    info!(%id, "attachment removed");
                    self.forget(&WorkItem::Attachment(kind, id));
                }
                Err(err) => self.handle_entity_error(WorkItem::Attachment(kind, id), &err),
            }
        }
        Ok(())
    }

    /// Provisioning info for the given storage tags, skipping entities that
    /// have none.
    async fn storage_info_for<'a>(
        &self,
        kind: StorageKind,
        tags: impl Iterator<Item = &'a Tag>,
    ) -> Result<BTreeMap<Tag, StorageInfo>> {
        let tags: Vec<Tag> = tags.cloned().collect::<BTreeSet<Tag>>().into_iter().collect();
        let results = self.client.storage(kind, &tags).await?;
        let mut infos = BTreeMap::new();
        for (tag, el) in tags.into_iter().zip(results) {
            if let Ok(record) = el.into_value() {
                if let Some(info) = record.info {
                    infos.insert(tag, info);
                }
            }
        }
        Ok(infos)
    }
}
