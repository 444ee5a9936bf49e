//! InstanceMergeEngine: folds source instances into one finalized target.
//!
//! Per source, in caller order:
//! 1. unknown ids, already merged sources and the target itself are skipped;
//! 2. descriptors whose (key, content) pair is new are staged;
//! 3. each sample drops its non-mergeable labels and tag links, then moves to
//!    the target under a freshly generated id (old ids are never reused);
//! 4. source tags left without links are deleted, the remaining ones get a
//!    same-named tag on the target and their links are re-pointed to it;
//! 5. the source is marked `merged_into = target`.
//!
//! Staged descriptors are written once at the end. Dedup runs against the
//! target's descriptors as loaded at the start plus everything staged in the
//! same call.
//!
//! The target and every permitted source are row-locked up front in id order.
//! The whole call is one store transaction. Blob writes cannot roll back, so
//! blobs written for a failed call are deleted again, and blobs of purged
//! labels are only deleted after commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::AppError;
use crate::middleware::rbac::{evaluate_in, require_in};
use crate::models::access::ScopeRef;
use crate::models::catalog::{BlobHandle, Descriptor, Instance, Tag};
use crate::models::role::{Capability, InstanceCapability};
use crate::store::blob::BlobStore;
use crate::store::{Store, Tx};

/// Capabilities the actor needs on the target and on every source.
pub const MERGE_CAPABILITIES: [Capability; 2] = [
    Capability::Instance(InstanceCapability::CanSee),
    Capability::Instance(InstanceCapability::Edit),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub target: Uuid,
    /// Sources folded into the target, in processing order.
    pub merged: Vec<Uuid>,
    /// Requested ids that were not processed.
    pub skipped: Vec<Uuid>,
    pub samples_moved: usize,
    pub descriptors_added: usize,
    pub labels_purged: usize,
    pub tag_links_purged: u64,
}

/// Work carried across sources within one call.
struct Staging {
    /// (key, content) pairs on the target or already staged.
    known: HashSet<(String, Vec<u8>)>,
    /// New pairs, in staging order.
    staged: Vec<(String, Vec<u8>)>,
    /// Blobs of purged labels, deleted after commit.
    purged: Vec<BlobHandle>,
}

impl Staging {
    fn stage(&mut self, key: String, content: Vec<u8>) -> bool {
        let pair = (key, content);
        if self.known.contains(&pair) {
            return false;
        }
        self.known.insert(pair.clone());
        self.staged.push(pair);
        true
    }
}

pub struct InstanceMergeEngine {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
}

impl InstanceMergeEngine {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            blobs,
            clock,
        }
    }

    /// Merge `sources` into `target` on behalf of `actor`.
    ///
    /// The actor needs `can_see_instance` and `edit_instance` on the target.
    /// Sources the actor lacks those capabilities on are skipped like unknown ids.
    pub async fn merge(
        &self,
        actor: Uuid,
        target: Uuid,
        sources: &[Uuid],
    ) -> Result<MergeReport, AppError> {
        let mut tx = self.store.begin().await?;

        if tx.get_instance(target).await?.is_none() {
            return Err(AppError::NotFound(format!("instance {}", target)));
        }
        require_in(tx.as_mut(), actor, ScopeRef::Instance(target), &MERGE_CAPABILITIES).await?;

        let mut permitted = Vec::with_capacity(sources.len());
        let mut denied = Vec::new();
        for &source in sources {
            if evaluate_in(tx.as_mut(), actor, ScopeRef::Instance(source), &MERGE_CAPABILITIES).await? {
                permitted.push(source);
            } else {
                denied.push(source);
            }
        }

        // rows are locked in id order so two merges naming each other's
        // target cannot deadlock
        let mut locked = HashMap::new();
        for id in lock_order(target, &permitted) {
            if let Some(instance) = tx.lock_instance(id).await? {
                locked.insert(id, instance);
            }
        }
        let target_instance = locked
            .remove(&target)
            .ok_or_else(|| AppError::NotFound(format!("instance {}", target)))?;

        let mut written: Vec<BlobHandle> = Vec::new();
        let result = self
            .merge_in(tx.as_mut(), target_instance, &permitted, &mut locked, &mut written)
            .await;

        let (mut report, purged) = match result {
            Ok(done) => done,
            Err(e) => {
                drop(tx);
                self.discard(&written).await;
                return Err(e);
            }
        };
        if let Err(e) = tx.commit().await {
            self.discard(&written).await;
            return Err(e.into());
        }

        report.skipped.extend(denied);
        for handle in &purged {
            if let Err(e) = self.blobs.delete(handle).await {
                tracing::warn!(handle = %handle, "failed to delete purged label blob: {}", e);
            }
        }

        tracing::info!(
            target = %target,
            merged = report.merged.len(),
            skipped = report.skipped.len(),
            samples_moved = report.samples_moved,
            descriptors_added = report.descriptors_added,
            "instances merged"
        );
        Ok(report)
    }

    /// The merge proper, inside the caller's transaction. `locked` holds the
    /// source rows already locked by the caller; each is consumed once. Handles
    /// of blobs written along the way are pushed to `written`.
    async fn merge_in(
        &self,
        tx: &mut dyn Tx,
        mut target: Instance,
        sources: &[Uuid],
        locked: &mut HashMap<Uuid, Instance>,
        written: &mut Vec<BlobHandle>,
    ) -> Result<(MergeReport, Vec<BlobHandle>), AppError> {
        if !target.finalized {
            return Err(AppError::Forbidden(format!(
                "merge target {} is not finalized",
                target.id
            )));
        }

        let mut report = MergeReport {
            target: target.id,
            ..Default::default()
        };
        let mut staging = Staging {
            known: self.load_descriptor_pairs(tx, target.id).await?,
            staged: Vec::new(),
            purged: Vec::new(),
        };
        let now = self.clock.now();

        for &source_id in sources {
            let source = match locked.remove(&source_id) {
                Some(source) if source.merged_into.is_none() && source.id != target.id => source,
                _ => {
                    tracing::debug!(source = %source_id, "merge source skipped");
                    report.skipped.push(source_id);
                    continue;
                }
            };

            self.stage_descriptors(tx, &source, &mut staging).await?;
            self.transfer_samples(tx, &source, target.id, &mut staging, &mut report)
                .await?;
            transfer_tags(tx, source.id, target.id).await?;

            let mut source = source;
            source.merged_into = Some(target.id);
            source.last_modified = now;
            tx.update_instance(&source).await?;

            report.merged.push(source.id);
        }

        for (key, content) in std::mem::take(&mut staging.staged) {
            let handle = self.blobs.put(content).await?;
            written.push(handle.clone());
            tx.insert_descriptor(&Descriptor {
                id: Uuid::new_v4(),
                instance_id: target.id,
                key,
                file: Some(handle),
            })
            .await?;
            report.descriptors_added += 1;
        }

        if !report.merged.is_empty() {
            target.last_modified = now;
            tx.update_instance(&target).await?;
        }

        Ok((report, staging.purged))
    }

    /// Every (key, content) pair of the instance's file-backed descriptors.
    async fn load_descriptor_pairs(
        &self,
        tx: &mut dyn Tx,
        instance_id: Uuid,
    ) -> Result<HashSet<(String, Vec<u8>)>, AppError> {
        let mut pairs = HashSet::new();
        for descriptor in tx.list_descriptors(instance_id).await? {
            if let Some(handle) = &descriptor.file {
                pairs.insert((descriptor.key.clone(), self.blobs.get(handle).await?));
            }
        }
        Ok(pairs)
    }

    async fn stage_descriptors(
        &self,
        tx: &mut dyn Tx,
        source: &Instance,
        staging: &mut Staging,
    ) -> Result<(), AppError> {
        for descriptor in tx.list_descriptors(source.id).await? {
            let Some(handle) = &descriptor.file else {
                continue;
            };
            let content = self.blobs.get(handle).await?;
            if staging.stage(descriptor.key.clone(), content) {
                tracing::debug!(source = %source.id, key = %descriptor.key, "descriptor staged");
            }
        }
        Ok(())
    }

    async fn transfer_samples(
        &self,
        tx: &mut dyn Tx,
        source: &Instance,
        target_id: Uuid,
        staging: &mut Staging,
        report: &mut MergeReport,
    ) -> Result<(), AppError> {
        for sample in tx.list_samples(source.id).await? {
            let labels = tx.delete_unmergeable_labels(sample.id).await?;
            report.labels_purged += labels.len();
            staging
                .purged
                .extend(labels.into_iter().filter_map(|l| l.file));
            report.tag_links_purged += tx.delete_unmergeable_sample_tags(sample.id).await?;

            // identity is re-rolled on every transfer
            let new_id = Uuid::new_v4();
            tx.transfer_sample(sample.id, new_id, target_id).await?;
            report.samples_moved += 1;
        }

        let orphans = tx.delete_orphan_tags(source.id).await?;
        if orphans > 0 {
            tracing::debug!(source = %source.id, orphans, "orphaned source tags deleted");
        }
        Ok(())
    }
}

/// Target and sources, deduplicated and sorted: the order rows are locked in.
fn lock_order(target: Uuid, sources: &[Uuid]) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = sources.iter().copied().chain([target]).collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Make sure the target has a tag for every remaining source tag name and
/// re-point the source's mergeable links onto those tags.
async fn transfer_tags(tx: &mut dyn Tx, source_id: Uuid, target_id: Uuid) -> Result<(), AppError> {
    let source_tags = tx.list_tags(source_id).await?;
    if source_tags.is_empty() {
        return Ok(());
    }

    let mut target_by_name: HashMap<String, Uuid> = tx
        .list_tags(target_id)
        .await?
        .into_iter()
        .map(|t| (t.name, t.id))
        .collect();

    let mut mapping: HashMap<Uuid, Uuid> = HashMap::new();
    for tag in &source_tags {
        let target_tag = match target_by_name.get(&tag.name) {
            Some(id) => *id,
            None => {
                let created = Tag {
                    id: Uuid::new_v4(),
                    instance_id: target_id,
                    name: tag.name.clone(),
                };
                tx.insert_tag(&created).await?;
                target_by_name.insert(created.name.clone(), created.id);
                created.id
            }
        };
        mapping.insert(tag.id, target_tag);
    }

    for link in tx.list_mergeable_tag_links(source_id).await? {
        if let Some(&to) = mapping.get(&link.tag_id) {
            tx.retarget_sample_tag(link.sample_id, link.tag_id, to).await?;
        }
    }
    Ok(())
}

impl InstanceMergeEngine {
    async fn discard(&self, written: &[BlobHandle]) {
        for handle in written {
            if let Err(e) = self.blobs.delete(handle).await {
                tracing::warn!(handle = %handle, "failed to discard blob of aborted merge: {}", e);
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
