//! Source side of a volume migration.
//!
//! One round per (volume, destination):
//! 1. block commits, snapshot the catalog, turn forwarding on, capture open
//!    transactions (`with_commits_blocked`)
//! 2. send the captured transaction state
//! 3. diff the snapshot against the destination's initial filter set
//! 4. stream delete descriptors, then update descriptors and object lists
//! 5. keep forwarding commits until the round is finished, then send the
//!    end-of-forwarding marker

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::diff::{diff_blob_versions, DiffResult};
use crate::error::{MigrationError, MigrationResult};
use crate::lock;
use crate::stats::MigrationMetrics;
use crate::types::{
    BlobDataBatch, BlobDataDelta, BlobDescBatch, BlobDescDelta, Catalog, ForwardEntry,
    InitialFilterSet, Messenger, MigrationMessage, NodeId, SnapshotId, TxStateMsg, VolumeId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    SnapshotTaken,
    Diffing,
    StreamingDeltas,
    Forwarding,
    Done,
    Failed,
}

impl SourceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SourceState::Done | SourceState::Failed)
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SourceLimits {
    pub max_blobs_per_batch: usize,
    pub max_descs_per_batch: usize,
}

struct SourceInner {
    state: SourceState,
    forwarding: bool,
    /// Finish was requested before streaming completed.
    finish_requested: bool,
    /// A placement version newer than ours has been published.
    cutover_seen: bool,
}

pub struct MigrationSource {
    volume_id: VolumeId,
    destination: NodeId,
    placement_version: u64,
    limits: SourceLimits,
    catalog: Arc<dyn Catalog>,
    messenger: Arc<dyn Messenger>,
    metrics: Arc<MigrationMetrics>,
    inner: Mutex<SourceInner>,
}

impl MigrationSource {
    pub(crate) fn new(
        volume_id: VolumeId,
        destination: NodeId,
        placement_version: u64,
        limits: SourceLimits,
        catalog: Arc<dyn Catalog>,
        messenger: Arc<dyn Messenger>,
        metrics: Arc<MigrationMetrics>,
    ) -> Self {
        Self {
            volume_id,
            destination,
            placement_version,
            limits: SourceLimits {
                max_blobs_per_batch: limits.max_blobs_per_batch.max(1),
                max_descs_per_batch: limits.max_descs_per_batch.max(1),
            },
            catalog,
            messenger,
            metrics,
            inner: Mutex::new(SourceInner {
                state: SourceState::Idle,
                forwarding: false,
                finish_requested: false,
                cutover_seen: false,
            }),
        }
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    pub fn destination(&self) -> NodeId {
        self.destination
    }

    pub fn placement_version(&self) -> u64 {
        self.placement_version
    }

    pub fn state(&self) -> SourceState {
        lock(&self.inner).state
    }

    /// Run the static part of the round, up to and including the switch to
    /// `Forwarding`. Blocks on catalog calls; run it off the async workers.
    pub fn run(&self, filter: &InitialFilterSet) -> MigrationResult<()> {
        let snapshot = self.begin(filter)?;
        self.stream(snapshot, filter)
    }

    /// Snapshot the volume with forwarding switched on and send the captured
    /// transaction state. The snapshot stays open until [`Self::stream`]
    /// returns.
    pub fn begin(&self, filter: &InitialFilterSet) -> MigrationResult<SnapshotId> {
        self.metrics
            .source_rounds_started
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            volume_id = self.volume_id,
            destination = self.destination,
            placement_version = self.placement_version,
            destination_blobs = filter.blobs.len(),
            "starting migration source round"
        );
        self.take_snapshot().map_err(|err| self.fail(err))
    }

    /// Diff and stream the deltas taken in [`Self::begin`], release the
    /// snapshot and switch to `Forwarding`. Stops with `Aborted` once the
    /// round was aborted.
    pub fn stream(&self, snapshot: SnapshotId, filter: &InitialFilterSet) -> MigrationResult<()> {
        let streamed = self.stream_from_snapshot(snapshot, filter);
        self.release_snapshot(snapshot);
        if let Err(err) = streamed {
            return Err(self.fail(err));
        }

        let outstanding = self.outstanding_transactions();
        let mut inner = lock(&self.inner);
        if inner.state.is_terminal() {
            return Ok(());
        }
        inner.state = SourceState::Forwarding;
        let finish_now = inner.finish_requested || (inner.cutover_seen && !outstanding);
        if finish_now {
            self.send_finish_locked(&mut inner)?;
        }
        Ok(())
    }

    fn release_snapshot(&self, snapshot: SnapshotId) {
        if let Err(err) = self.catalog.release_snapshot(self.volume_id, snapshot) {
            tracing::warn!(
                volume_id = self.volume_id,
                snapshot,
                error = ?err,
                "failed to release migration snapshot"
            );
        }
    }

    fn take_snapshot(&self) -> MigrationResult<SnapshotId> {
        let mut snapshot = None;
        let mut active_txs = Vec::new();
        let blocked = self.catalog.with_commits_blocked(self.volume_id, &mut || {
            let taken = self.catalog.take_snapshot(self.volume_id)?;
            snapshot = Some(taken);
            self.start_forwarding();
            active_txs = self.catalog.snapshot_outstanding_transactions(self.volume_id)?;
            Ok(())
        });
        if let Err(err) = blocked {
            if let Some(taken) = snapshot {
                self.release_snapshot(taken);
            }
            return Err(MigrationError::catalog(err));
        }
        let Some(snapshot) = snapshot else {
            return Err(MigrationError::Catalog(format!(
                "no snapshot taken for volume {}",
                self.volume_id
            )));
        };

        tracing::debug!(
            volume_id = self.volume_id,
            snapshot,
            active_txs = active_txs.len(),
            "migration snapshot taken"
        );
        self.send(MigrationMessage::TxState(TxStateMsg {
            volume_id: self.volume_id,
            txs: active_txs,
        }))
        .map_err(|err| {
            self.release_snapshot(snapshot);
            err
        })?;
        Ok(snapshot)
    }

    fn start_forwarding(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == SourceState::Failed {
            return;
        }
        inner.state = SourceState::SnapshotTaken;
        inner.forwarding = true;
    }

    fn stream_from_snapshot(
        &self,
        snapshot: SnapshotId,
        filter: &InitialFilterSet,
    ) -> MigrationResult<()> {
        self.set_state(SourceState::Diffing)?;
        let source_blobs = self
            .catalog
            .all_blobs_with_sequence(self.volume_id, Some(snapshot))
            .map_err(MigrationError::catalog)?;
        let diff = diff_blob_versions(self.volume_id, &filter.blobs, &source_blobs);
        tracing::info!(
            volume_id = self.volume_id,
            destination = self.destination,
            updates = diff.update_list.len(),
            deletes = diff.delete_list.len(),
            "computed migration diff"
        );

        self.set_state(SourceState::StreamingDeltas)?;
        self.stream_deltas(snapshot, &diff)
    }

    /// Delete descriptors go out first; the final descriptor batch and then
    /// the final data batch carry the last markers.
    fn stream_deltas(&self, snapshot: SnapshotId, diff: &DiffResult) -> MigrationResult<()> {
        let mut desc_seq = 0u64;
        let mut data_seq = 0u64;

        for chunk in diff.delete_list.chunks(self.limits.max_descs_per_batch) {
            self.ensure_running()?;
            let descs = chunk.iter().map(BlobDescDelta::delete).collect();
            self.send_desc_batch(&mut desc_seq, false, descs)?;
        }

        let mut descs = Vec::with_capacity(self.limits.max_descs_per_batch);
        let mut blobs = Vec::with_capacity(self.limits.max_blobs_per_batch);
        for blob_name in &diff.update_list {
            self.ensure_running()?;
            let data = self
                .catalog
                .blob_snapshot_data(self.volume_id, blob_name, snapshot)
                .map_err(MigrationError::catalog)?;
            descs.push(BlobDescDelta {
                blob_name: blob_name.clone(),
                descriptor: Some(data.descriptor),
            });
            blobs.push(BlobDataDelta {
                blob_name: blob_name.clone(),
                objects: data.objects,
            });

            if blobs.len() >= self.limits.max_blobs_per_batch {
                let full = std::mem::replace(
                    &mut blobs,
                    Vec::with_capacity(self.limits.max_blobs_per_batch),
                );
                self.send_data_batch(&mut data_seq, false, full)?;
            }
            if descs.len() >= self.limits.max_descs_per_batch {
                let full = std::mem::replace(
                    &mut descs,
                    Vec::with_capacity(self.limits.max_descs_per_batch),
                );
                self.send_desc_batch(&mut desc_seq, false, full)?;
            }
        }

        self.send_desc_batch(&mut desc_seq, true, descs)?;
        self.send_data_batch(&mut data_seq, true, blobs)?;
        tracing::debug!(
            volume_id = self.volume_id,
            desc_batches = desc_seq,
            data_batches = data_seq,
            "finished streaming migration deltas"
        );
        Ok(())
    }

    fn send_desc_batch(
        &self,
        seq: &mut u64,
        last_batch: bool,
        descs: Vec<BlobDescDelta>,
    ) -> MigrationResult<()> {
        let batch = BlobDescBatch {
            volume_id: self.volume_id,
            seq: *seq,
            last_batch,
            descs,
        };
        *seq += 1;
        self.ensure_running()?;
        self.send(MigrationMessage::DeltaBlobDescs(batch))?;
        self.metrics
            .source_batches_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_data_batch(
        &self,
        seq: &mut u64,
        last_batch: bool,
        blobs: Vec<BlobDataDelta>,
    ) -> MigrationResult<()> {
        let batch = BlobDataBatch {
            volume_id: self.volume_id,
            seq: *seq,
            last_batch,
            blobs,
        };
        *seq += 1;
        self.ensure_running()?;
        self.send(MigrationMessage::DeltaBlobs(batch))?;
        self.metrics
            .source_batches_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send(&self, msg: MigrationMessage) -> MigrationResult<()> {
        self.messenger
            .send_oneway(self.destination, msg)
            .map_err(MigrationError::transport)
    }

    fn ensure_running(&self) -> MigrationResult<()> {
        if lock(&self.inner).state == SourceState::Failed {
            return Err(MigrationError::Aborted);
        }
        Ok(())
    }

    fn set_state(&self, next: SourceState) -> MigrationResult<()> {
        let mut inner = lock(&self.inner);
        if inner.state == SourceState::Failed {
            return Err(MigrationError::Aborted);
        }
        inner.state = next;
        Ok(())
    }

    fn fail(&self, err: MigrationError) -> MigrationError {
        let mut inner = lock(&self.inner);
        inner.forwarding = false;
        if inner.state != SourceState::Failed {
            inner.state = SourceState::Failed;
            self.metrics
                .source_rounds_failed
                .fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                volume_id = self.volume_id,
                destination = self.destination,
                error = %err,
                "migration source round failed"
            );
        }
        err
    }

    /// Whether a commit accepted under `placement_version` must be forwarded.
    pub fn should_forward(&self, placement_version: u64) -> bool {
        lock(&self.inner).forwarding && placement_version == self.placement_version
    }

    /// Queue a live commit for the destination. Called with the volume's
    /// commit lock held, so the snapshot boundary cannot move under it.
    pub fn forward_commit(&self, entry: &ForwardEntry) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.forwarding || entry.placement_version != self.placement_version {
            return false;
        }
        match self
            .messenger
            .send_oneway(self.destination, MigrationMessage::Forward(entry.clone()))
        {
            Ok(()) => {
                self.metrics
                    .source_forwards_sent
                    .fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                inner.forwarding = false;
                inner.state = SourceState::Failed;
                self.metrics
                    .source_rounds_failed
                    .fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    volume_id = self.volume_id,
                    destination = self.destination,
                    blob = %entry.blob_name,
                    error = ?err,
                    "failed to forward commit; migration source failed"
                );
                false
            }
        }
    }

    /// Stop forwarding and send the end-of-forwarding marker. If streaming is
    /// still running the marker goes out as soon as it finishes. Returns true
    /// when the marker was sent by this call.
    pub fn finish_forwarding(&self) -> MigrationResult<bool> {
        let mut inner = lock(&self.inner);
        match inner.state {
            SourceState::Forwarding => {
                self.send_finish_locked(&mut inner)?;
                Ok(true)
            }
            SourceState::Idle
            | SourceState::SnapshotTaken
            | SourceState::Diffing
            | SourceState::StreamingDeltas => {
                inner.finish_requested = true;
                Ok(false)
            }
            SourceState::Done | SourceState::Failed => Ok(false),
        }
    }

    /// A newer placement version was published: commits now reach the
    /// destination directly. Finish once no transaction opened under our
    /// version is still outstanding.
    pub fn on_placement_version(&self, version: u64) -> MigrationResult<bool> {
        if version <= self.placement_version {
            return Ok(false);
        }
        let outstanding = self.outstanding_transactions();
        let mut inner = lock(&self.inner);
        inner.cutover_seen = true;
        if inner.state != SourceState::Forwarding {
            return Ok(false);
        }
        if outstanding {
            tracing::debug!(
                volume_id = self.volume_id,
                placement_version = self.placement_version,
                "waiting for outstanding transactions before finishing forwarding"
            );
            return Ok(false);
        }
        self.send_finish_locked(&mut inner)?;
        Ok(true)
    }

    fn outstanding_transactions(&self) -> bool {
        match self
            .catalog
            .has_outstanding_transactions(self.volume_id, self.placement_version)
        {
            Ok(outstanding) => outstanding,
            Err(err) => {
                tracing::warn!(
                    volume_id = self.volume_id,
                    error = ?err,
                    "failed to check outstanding transactions; assuming some remain"
                );
                true
            }
        }
    }

    fn send_finish_locked(&self, inner: &mut SourceInner) -> MigrationResult<()> {
        inner.forwarding = false;
        let finish = ForwardEntry::finish(self.volume_id, self.placement_version);
        if let Err(err) = self
            .messenger
            .send_oneway(self.destination, MigrationMessage::Forward(finish))
        {
            inner.state = SourceState::Failed;
            self.metrics
                .source_rounds_failed
                .fetch_add(1, Ordering::Relaxed);
            return Err(MigrationError::transport(err));
        }
        inner.state = SourceState::Done;
        tracing::info!(
            volume_id = self.volume_id,
            destination = self.destination,
            "finished forwarding to migration destination"
        );
        Ok(())
    }

    /// Stop forwarding without a marker. The destination will time out or be
    /// aborted by its own coordinator.
    pub fn abort(&self) {
        let mut inner = lock(&self.inner);
        if inner.state.is_terminal() {
            return;
        }
        inner.forwarding = false;
        inner.state = SourceState::Failed;
        tracing::warn!(
            volume_id = self.volume_id,
            destination = self.destination,
            "migration source aborted"
        );
    }
}
