//! Destination side of a volume migration.
//!
//! `Init -> StaticMigrationInProgress -> ApplyingForwardsInProgress -> Complete`,
//! with `Aborted` reachable from every non-terminal state.
//!
//! While static migration runs, descriptor batches wait until the data stream
//! is complete and forwards wait until static migration is complete. The
//! handoff to live forwarding drains buffered forwards in arrival order
//! before any new forward is applied.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};
use crate::lock;
use crate::sequence::SequenceTracker;
use crate::stats::MigrationMetrics;
use crate::types::{
    BlobDataBatch, BlobDescBatch, ForwardEntry, InitialFilterSet, MigrationMessage,
    MigrationServices, NodeId, TxStateMsg, VolumeId, VolumeState,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorState {
    Init,
    StaticMigrationInProgress,
    ApplyingForwardsInProgress,
    Complete,
    Aborted,
}

impl ExecutorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutorState::Complete | ExecutorState::Aborted)
    }
}

/// Notifications delivered to the owner after the executor lock is released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DestinationEvent {
    /// Static migration finished (handoff to live forwarding) or failed.
    /// Sent exactly once.
    Done(MigrationResult<()>),
    /// The executor reached `Complete` or `Aborted` and can be reaped.
    Retired,
}

pub(crate) type EventSink = Box<dyn Fn(VolumeId, DestinationEvent) + Send + Sync>;

#[derive(Default)]
struct Effects {
    done: Option<MigrationResult<()>>,
    retired: bool,
}

struct DestinationInner {
    state: ExecutorState,
    tx_state_applied: bool,
    queue_stopped: bool,
    buffered_descs: VecDeque<BlobDescBatch>,
    buffered_forwards: Vec<ForwardEntry>,
    done_reported: bool,
    last_progress: Instant,
}

pub struct MigrationDestination {
    volume_id: VolumeId,
    source: NodeId,
    placement_version: u64,
    auto_increment: bool,
    rpc_timeout: Duration,
    idle_timeout: Duration,
    services: MigrationServices,
    metrics: Arc<MigrationMetrics>,
    data_seq: SequenceTracker,
    desc_seq: SequenceTracker,
    inner: Mutex<DestinationInner>,
    events: EventSink,
}

impl MigrationDestination {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        volume_id: VolumeId,
        source: NodeId,
        placement_version: u64,
        auto_increment: bool,
        config: &MigrationConfig,
        services: MigrationServices,
        metrics: Arc<MigrationMetrics>,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let stalled = move |weak: Weak<Self>, stream: &'static str| {
                move || {
                    if let Some(dest) = weak.upgrade() {
                        tracing::warn!(
                            volume_id,
                            stream,
                            "migration delta stream stalled"
                        );
                        dest.abort_migration(MigrationError::Stalled { volume_id });
                    }
                }
            };
            Self {
                volume_id,
                source,
                placement_version,
                auto_increment,
                rpc_timeout: config.rpc_timeout,
                idle_timeout: config.idle_timeout,
                services,
                metrics,
                data_seq: SequenceTracker::with_idle_timeout(
                    config.sequence_timeout,
                    stalled(weak.clone(), "data"),
                ),
                desc_seq: SequenceTracker::with_idle_timeout(
                    config.sequence_timeout,
                    stalled(weak.clone(), "descriptor"),
                ),
                inner: Mutex::new(DestinationInner {
                    state: ExecutorState::Init,
                    tx_state_applied: false,
                    queue_stopped: false,
                    buffered_descs: VecDeque::new(),
                    buffered_forwards: Vec::new(),
                    done_reported: false,
                    last_progress: Instant::now(),
                }),
                events,
            }
        })
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn placement_version(&self) -> u64 {
        self.placement_version
    }

    pub fn state(&self) -> ExecutorState {
        lock(&self.inner).state
    }

    pub fn buffered_desc_batches(&self) -> usize {
        lock(&self.inner).buffered_descs.len()
    }

    pub fn buffered_forwards(&self) -> usize {
        lock(&self.inner).buffered_forwards.len()
    }

    /// Stop the volume's queue, then pull from the source by sending the
    /// initial filter set. Failures abort the volume.
    pub async fn start_migration(&self) -> MigrationResult<()> {
        let filter = {
            let mut effects = Effects::default();
            let mut inner = lock(&self.inner);
            if inner.state != ExecutorState::Init {
                tracing::warn!(
                    volume_id = self.volume_id,
                    state = ?inner.state,
                    "ignoring start for a migration that already started"
                );
                return Ok(());
            }
            let prepared = self.prepare_locked(&mut inner);
            match prepared {
                Ok(filter) => filter,
                Err(err) => {
                    self.abort_locked(&mut inner, err.clone(), &mut effects);
                    drop(inner);
                    self.emit(effects);
                    return Err(err);
                }
            }
        };

        tracing::info!(
            volume_id = self.volume_id,
            source = self.source,
            blobs = filter.blobs.len(),
            "sending initial filter set to migration source"
        );
        let request = self
            .services
            .messenger
            .request(
                self.source,
                MigrationMessage::InitialFilterSet(filter),
                self.rpc_timeout,
            )
            .await;
        if let Err(err) = request {
            let err = MigrationError::transport(err);
            tracing::error!(
                volume_id = self.volume_id,
                source = self.source,
                error = %err,
                "initial filter set request failed"
            );
            self.abort_migration(err.clone());
            return Err(err);
        }
        Ok(())
    }

    fn prepare_locked(&self, inner: &mut DestinationInner) -> MigrationResult<InitialFilterSet> {
        self.services
            .queues
            .stop_dequeue(self.volume_id)
            .map_err(MigrationError::catalog)?;
        inner.queue_stopped = true;
        inner.state = ExecutorState::StaticMigrationInProgress;
        inner.last_progress = Instant::now();

        self.services
            .catalog
            .ensure_volume(self.volume_id)
            .map_err(MigrationError::catalog)?;
        self.services.volume_states.set_volume_state(
            self.volume_id,
            VolumeState::Syncing,
            "replica migration in progress",
        );
        let blobs = self
            .services
            .catalog
            .all_blobs_with_sequence(self.volume_id, None)
            .map_err(MigrationError::catalog)?;
        Ok(InitialFilterSet {
            volume_id: self.volume_id,
            placement_version: self.placement_version,
            blobs,
        })
    }

    pub fn apply_delta_blobs(&self, batch: BlobDataBatch) -> MigrationResult<()> {
        self.dispatch(|this, inner, effects| {
            if !this.accepts_static(inner, "delta_blobs")? {
                return Ok(());
            }
            this.services
                .catalog
                .apply_object_diffs(this.volume_id, &batch.blobs)
                .map_err(MigrationError::catalog)?;
            let objects: usize = batch.blobs.iter().map(|b| b.objects.len()).sum();
            let bytes: usize = batch
                .blobs
                .iter()
                .flat_map(|b| b.objects.iter())
                .map(|o| o.object_id.len())
                .sum();
            this.metrics
                .data_batches_applied
                .fetch_add(1, Ordering::Relaxed);
            this.metrics
                .objects_applied
                .fetch_add(objects as u64, Ordering::Relaxed);
            this.metrics
                .object_bytes_applied
                .fetch_add(bytes as u64, Ordering::Relaxed);
            inner.last_progress = Instant::now();
            tracing::debug!(
                volume_id = this.volume_id,
                seq = batch.seq,
                last = batch.last_batch,
                blobs = batch.blobs.len(),
                "applied data delta batch"
            );

            if this.data_seq.observe(batch.seq, batch.last_batch) {
                while let Some(descs) = inner.buffered_descs.pop_front() {
                    this.apply_descs_locked(inner, descs)?;
                }
            }
            this.test_static_complete_locked(inner, effects)
        })
    }

    pub fn apply_delta_blob_descs(&self, batch: BlobDescBatch) -> MigrationResult<()> {
        self.dispatch(|this, inner, effects| {
            if !this.accepts_static(inner, "delta_blob_descs")? {
                return Ok(());
            }
            if !this.data_seq.is_complete() {
                tracing::debug!(
                    volume_id = this.volume_id,
                    seq = batch.seq,
                    "buffering descriptor batch until object data is complete"
                );
                inner.buffered_descs.push_back(batch);
                this.metrics
                    .desc_batches_buffered
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            this.apply_descs_locked(inner, batch)?;
            this.test_static_complete_locked(inner, effects)
        })
    }

    pub fn apply_tx_state(&self, msg: TxStateMsg) -> MigrationResult<()> {
        self.dispatch(|this, inner, effects| {
            if !this.accepts_static(inner, "tx_state")? {
                return Ok(());
            }
            this.services
                .catalog
                .apply_active_tx_state(this.volume_id, &msg.txs)
                .map_err(MigrationError::catalog)?;
            inner.tx_state_applied = true;
            inner.last_progress = Instant::now();
            tracing::debug!(
                volume_id = this.volume_id,
                txs = msg.txs.len(),
                "applied migrated transaction state"
            );
            this.test_static_complete_locked(inner, effects)
        })
    }

    pub fn apply_forward_entry(&self, entry: ForwardEntry) -> MigrationResult<()> {
        let mut effects = Effects::default();
        let mut inner = lock(&self.inner);
        let result = match inner.state {
            ExecutorState::StaticMigrationInProgress => {
                inner.buffered_forwards.push(entry);
                self.metrics
                    .forwards_buffered
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            ExecutorState::ApplyingForwardsInProgress => {
                match self.apply_forward_locked(&mut inner, entry, &mut effects) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        self.abort_locked(&mut inner, err.clone(), &mut effects);
                        Err(err)
                    }
                }
            }
            ExecutorState::Aborted => {
                self.metrics
                    .forwards_dropped
                    .fetch_add(1, Ordering::Relaxed);
                Err(MigrationError::Aborted)
            }
            ExecutorState::Complete | ExecutorState::Init => {
                self.metrics
                    .forwards_dropped
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    volume_id = self.volume_id,
                    state = ?inner.state,
                    blob = %entry.blob_name,
                    "dropping forwarded commit"
                );
                Ok(())
            }
        };
        drop(inner);
        self.emit(effects);
        result
    }

    /// Abort from any non-terminal state. Resumes the queue if this executor
    /// stopped it and reports `err` if nothing was reported yet.
    pub fn abort_migration(&self, err: MigrationError) {
        let mut effects = Effects::default();
        {
            let mut inner = lock(&self.inner);
            self.abort_locked(&mut inner, err, &mut effects);
        }
        self.emit(effects);
    }

    /// Static migration made no progress for longer than the idle timeout.
    pub fn is_migration_idle(&self, now: Instant) -> bool {
        let inner = lock(&self.inner);
        inner.state == ExecutorState::StaticMigrationInProgress
            && !self.idle_timeout.is_zero()
            && now.saturating_duration_since(inner.last_progress) > self.idle_timeout
    }

    /// Whether finishing this volume should start the next queued one.
    pub fn should_auto_execute_next(&self) -> bool {
        self.auto_increment && lock(&self.inner).state != ExecutorState::Aborted
    }

    fn dispatch<F>(&self, f: F) -> MigrationResult<()>
    where
        F: FnOnce(&Self, &mut DestinationInner, &mut Effects) -> MigrationResult<()>,
    {
        let mut effects = Effects::default();
        let mut inner = lock(&self.inner);
        let result = f(self, &mut inner, &mut effects);
        if let Err(err) = &result {
            if *err != MigrationError::Aborted {
                self.abort_locked(&mut inner, err.clone(), &mut effects);
            }
        }
        drop(inner);
        self.emit(effects);
        result
    }

    /// Static-phase messages are only valid during static migration. Late
    /// copies after the handoff are dropped.
    fn accepts_static(&self, inner: &DestinationInner, kind: &str) -> MigrationResult<bool> {
        match inner.state {
            ExecutorState::StaticMigrationInProgress => Ok(true),
            ExecutorState::Aborted => Err(MigrationError::Aborted),
            ExecutorState::Init
            | ExecutorState::ApplyingForwardsInProgress
            | ExecutorState::Complete => {
                tracing::warn!(
                    volume_id = self.volume_id,
                    state = ?inner.state,
                    kind,
                    "dropping late static migration message"
                );
                Ok(false)
            }
        }
    }

    fn apply_descs_locked(
        &self,
        inner: &mut DestinationInner,
        batch: BlobDescBatch,
    ) -> MigrationResult<()> {
        for desc in &batch.descs {
            self.services
                .catalog
                .apply_blob_descriptor(self.volume_id, &desc.blob_name, desc.descriptor.as_ref())
                .map_err(MigrationError::catalog)?;
        }
        self.metrics
            .desc_batches_applied
            .fetch_add(1, Ordering::Relaxed);
        inner.last_progress = Instant::now();
        tracing::debug!(
            volume_id = self.volume_id,
            seq = batch.seq,
            last = batch.last_batch,
            descs = batch.descs.len(),
            "applied descriptor delta batch"
        );
        self.desc_seq.observe(batch.seq, batch.last_batch);
        Ok(())
    }

    fn test_static_complete_locked(
        &self,
        inner: &mut DestinationInner,
        effects: &mut Effects,
    ) -> MigrationResult<()> {
        if inner.state != ExecutorState::StaticMigrationInProgress
            || !self.desc_seq.is_complete()
            || !inner.tx_state_applied
        {
            return Ok(());
        }

        inner.state = ExecutorState::ApplyingForwardsInProgress;
        let buffered = std::mem::take(&mut inner.buffered_forwards);
        tracing::info!(
            volume_id = self.volume_id,
            source = self.source,
            buffered_forwards = buffered.len(),
            "static migration complete; applying forwarded commits"
        );
        // The handoff is only reported once the buffered commits are in; a
        // failed replay goes through the abort path and reports that error.
        for entry in buffered {
            if inner.state != ExecutorState::ApplyingForwardsInProgress {
                break;
            }
            self.apply_forward_locked(inner, entry, effects)?;
        }
        if !inner.done_reported {
            inner.done_reported = true;
            self.metrics
                .volumes_handed_off
                .fetch_add(1, Ordering::Relaxed);
            effects.done = Some(Ok(()));
        }
        Ok(())
    }

    fn apply_forward_locked(
        &self,
        inner: &mut DestinationInner,
        entry: ForwardEntry,
        effects: &mut Effects,
    ) -> MigrationResult<()> {
        if entry.is_terminator() {
            self.finalize_locked(inner, effects);
            return Ok(());
        }
        self.services
            .catalog
            .apply_forward(&entry)
            .map_err(MigrationError::catalog)?;
        self.metrics
            .forwards_applied
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finalize_locked(&self, inner: &mut DestinationInner, effects: &mut Effects) {
        inner.state = ExecutorState::Complete;
        self.resume_queue_locked(inner);
        self.services.volume_states.set_volume_state(
            self.volume_id,
            VolumeState::Active,
            "replica migration complete",
        );
        self.data_seq.reset();
        self.desc_seq.reset();
        self.metrics
            .volumes_finalized
            .fetch_add(1, Ordering::Relaxed);
        effects.retired = true;
        tracing::info!(
            volume_id = self.volume_id,
            source = self.source,
            placement_version = self.placement_version,
            "volume migration finalized"
        );
    }

    fn abort_locked(&self, inner: &mut DestinationInner, err: MigrationError, effects: &mut Effects) {
        match inner.state {
            ExecutorState::Aborted => return,
            ExecutorState::Complete => {
                tracing::warn!(
                    volume_id = self.volume_id,
                    error = %err,
                    "ignoring abort for a finalized migration"
                );
                return;
            }
            ExecutorState::Init
            | ExecutorState::StaticMigrationInProgress
            | ExecutorState::ApplyingForwardsInProgress => {}
        }

        tracing::error!(
            volume_id = self.volume_id,
            source = self.source,
            state = ?inner.state,
            error = %err,
            "aborting volume migration"
        );
        inner.state = ExecutorState::Aborted;
        inner.buffered_descs.clear();
        inner.buffered_forwards.clear();
        self.resume_queue_locked(inner);
        self.services.volume_states.set_volume_state(
            self.volume_id,
            VolumeState::Error,
            &format!("replica migration aborted: {err}"),
        );
        self.data_seq.reset();
        self.desc_seq.reset();
        self.metrics
            .volumes_aborted
            .fetch_add(1, Ordering::Relaxed);
        if !inner.done_reported {
            inner.done_reported = true;
            effects.done = Some(Err(err));
        }
        effects.retired = true;
    }

    fn resume_queue_locked(&self, inner: &mut DestinationInner) {
        if !inner.queue_stopped {
            return;
        }
        inner.queue_stopped = false;
        if let Err(err) = self.services.queues.resume_dequeue(self.volume_id) {
            tracing::warn!(
                volume_id = self.volume_id,
                error = ?err,
                "failed to resume volume queue"
            );
        }
    }

    fn emit(&self, effects: Effects) {
        if let Some(result) = effects.done {
            (self.events)(self.volume_id, DestinationEvent::Done(result));
        }
        if effects.retired {
            (self.events)(self.volume_id, DestinationEvent::Retired);
        }
    }
}
