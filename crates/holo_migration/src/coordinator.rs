//! Per-node migration coordinator.
//!
//! As destination it admits a batch of volumes grouped by source node, runs
//! at most `max_concurrent_migrations` of them at once, and chains the rest:
//! every volume except the last `budget` ones starts its successor when it
//! reaches the live-forwarding handoff. The batch is acknowledged once every
//! volume handed off, or once the running ones settled after a failure.
//!
//! As source it owns one [`MigrationSource`] per volume being pulled by
//! another node, and routes live commits to it through [`CommitForwarder`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MigrationConfig;
use crate::destination::{DestinationEvent, ExecutorState, MigrationDestination};
use crate::error::{MigrationError, MigrationResult};
use crate::lock;
use crate::sequence::NestedSequenceTracker;
use crate::source::{MigrationSource, SourceLimits, SourceState};
use crate::stats::{MigrationMetrics, MigrationStats};
use crate::types::{
    CommitForwarder, ForwardEntry, InitialFilterSet, MessageHandler, MigrationMessage,
    MigrationObserver, MigrationServices, NodeId, StartMigrationRequest, VolumeDescriptor,
    VolumeId,
};

const STATE_IDLE: u8 = 0;
const STATE_IN_PROGRESS: u8 = 1;
const STATE_ABORTED: u8 = 2;

/// Coordinator-wide migration state. A batch can only start from `Idle`;
/// `Aborted` means a failed batch is still settling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    InProgress,
    Aborted,
}

impl CoordinatorState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_IN_PROGRESS => CoordinatorState::InProgress,
            STATE_ABORTED => CoordinatorState::Aborted,
            _ => CoordinatorState::Idle,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PlannedVolume {
    source: NodeId,
    volume: VolumeDescriptor,
    auto_increment: bool,
    group_seq: u64,
    group_last: bool,
    volume_seq: u64,
    volume_last: bool,
}

struct BatchProgress {
    placement_version: u64,
    pending: VecDeque<PlannedVolume>,
    started: HashMap<VolumeId, PlannedVolume>,
    tracker: NestedSequenceTracker,
    first_error: Option<MigrationError>,
    sweeper: Option<JoinHandle<()>>,
}

/// Expand a request into admission order, skipping empty groups. All but the
/// last `budget` volumes start a successor when they finish.
fn plan_batch(request: &StartMigrationRequest, budget: usize) -> Vec<PlannedVolume> {
    let groups: Vec<_> = request
        .groups
        .iter()
        .filter(|group| !group.volumes.is_empty())
        .collect();
    let total = request.volume_count();
    let mut planned = Vec::with_capacity(total);
    for (group_idx, group) in groups.iter().enumerate() {
        for (volume_idx, volume) in group.volumes.iter().enumerate() {
            let index = planned.len();
            planned.push(PlannedVolume {
                source: group.source,
                volume: volume.clone(),
                auto_increment: index + budget < total,
                group_seq: group_idx as u64,
                group_last: group_idx + 1 == groups.len(),
                volume_seq: volume_idx as u64,
                volume_last: volume_idx + 1 == group.volumes.len(),
            });
        }
    }
    planned
}

pub(crate) struct CoordinatorCore {
    node_id: NodeId,
    config: MigrationConfig,
    services: MigrationServices,
    observer: Arc<dyn MigrationObserver>,
    metrics: Arc<MigrationMetrics>,
    state: AtomicU8,
    destinations: RwLock<HashMap<VolumeId, Arc<MigrationDestination>>>,
    sources: RwLock<HashMap<VolumeId, Arc<MigrationSource>>>,
    batch: Mutex<Option<BatchProgress>>,
    watermarks: RwLock<HashMap<VolumeId, u64>>,
    self_ref: Weak<CoordinatorCore>,
}

/// Cloneable handle to a node's migration coordinator.
#[derive(Clone)]
pub struct MigrationCoordinator {
    core: Arc<CoordinatorCore>,
}

impl MigrationCoordinator {
    pub fn new(
        node_id: NodeId,
        config: MigrationConfig,
        services: MigrationServices,
        observer: Arc<dyn MigrationObserver>,
    ) -> Self {
        let core = Arc::new_cyclic(|self_ref| CoordinatorCore {
            node_id,
            config,
            services,
            observer,
            metrics: Arc::new(MigrationMetrics::default()),
            state: AtomicU8::new(STATE_IDLE),
            destinations: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            batch: Mutex::new(None),
            watermarks: RwLock::new(HashMap::new()),
            self_ref: self_ref.clone(),
        });
        Self { core }
    }

    pub fn node_id(&self) -> NodeId {
        self.core.node_id
    }

    /// Inbound message entry point for a transport.
    pub fn message_handler(&self) -> Weak<dyn MessageHandler> {
        let handler: Arc<dyn MessageHandler> = self.core.clone();
        Arc::downgrade(&handler)
    }

    /// Hook for the catalog commit path.
    pub fn commit_forwarder(&self) -> Weak<dyn CommitForwarder> {
        let forwarder: Arc<dyn CommitForwarder> = self.core.clone();
        Arc::downgrade(&forwarder)
    }

    /// Admit a batch of volumes to pull. Must be called from a tokio runtime.
    pub fn start_migration(&self, request: StartMigrationRequest) -> MigrationResult<()> {
        self.core.start_migration(request)
    }

    pub async fn handle_message(&self, from: NodeId, msg: MigrationMessage) -> MigrationResult<()> {
        self.core.handle_message(from, msg).await
    }

    /// Abort the active batch, every running destination and every source.
    pub fn abort_migration(&self) {
        self.core.abort_migration();
    }

    /// Abort destinations stuck in static migration. Returns how many.
    pub fn check_idle_migrations(&self) -> usize {
        self.core.check_idle_migrations(Instant::now())
    }

    pub fn finish_forwarding(&self, volume_id: VolumeId) -> MigrationResult<bool> {
        self.core.finish_forwarding(volume_id)
    }

    /// A new placement version was published; sources for older versions
    /// finish forwarding once their transactions drained. Returns how many
    /// sources finished.
    pub fn notify_placement_version(&self, version: u64) -> usize {
        self.core.notify_placement_version(version)
    }

    pub fn should_forward(&self, volume_id: VolumeId, placement_version: u64) -> bool {
        self.core
            .source(volume_id)
            .is_some_and(|source| source.should_forward(placement_version))
    }

    pub fn forward_commit(&self, entry: &ForwardEntry) -> bool {
        self.core.route_commit(entry)
    }

    pub fn state(&self) -> CoordinatorState {
        self.core.state()
    }

    pub fn destination_state(&self, volume_id: VolumeId) -> Option<ExecutorState> {
        self.core.destination(volume_id).map(|dest| dest.state())
    }

    pub fn source_state(&self, volume_id: VolumeId) -> Option<SourceState> {
        self.core.source(volume_id).map(|source| source.state())
    }

    /// Placement version recorded when the volume's migration finalized.
    pub fn placement_watermark(&self, volume_id: VolumeId) -> Option<u64> {
        self.core
            .watermarks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&volume_id)
            .copied()
    }

    pub fn stats(&self) -> MigrationStats {
        let destinations = self.core.read_destinations().len();
        let sources = self.core.read_sources().len();
        self.core.metrics.snapshot(destinations, sources)
    }
}

impl CoordinatorCore {
    fn state(&self) -> CoordinatorState {
        CoordinatorState::from_raw(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn read_destinations(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<VolumeId, Arc<MigrationDestination>>> {
        self.destinations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_destinations(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<VolumeId, Arc<MigrationDestination>>> {
        self.destinations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_sources(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<VolumeId, Arc<MigrationSource>>> {
        self.sources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_sources(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<VolumeId, Arc<MigrationSource>>> {
        self.sources
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn destination(&self, volume_id: VolumeId) -> Option<Arc<MigrationDestination>> {
        self.read_destinations().get(&volume_id).cloned()
    }

    fn source(&self, volume_id: VolumeId) -> Option<Arc<MigrationSource>> {
        self.read_sources().get(&volume_id).cloned()
    }

    fn start_migration(&self, request: StartMigrationRequest) -> MigrationResult<()> {
        if !self.config.enabled {
            tracing::info!(
                node_id = self.node_id,
                volumes = request.volume_count(),
                "volume migration disabled; acknowledging batch"
            );
            self.observer.on_migration_batch_done(&Ok(()));
            return Ok(());
        }

        if !self.transition(STATE_IDLE, STATE_IN_PROGRESS) {
            return Err(match self.state() {
                CoordinatorState::Aborted => MigrationError::NotReady,
                CoordinatorState::InProgress | CoordinatorState::Idle => {
                    MigrationError::AlreadyInProgress
                }
            });
        }

        if let Err(err) = self.check_duplicates(&request) {
            self.state.store(STATE_IDLE, Ordering::SeqCst);
            return Err(err);
        }

        let total = request.volume_count();
        if total == 0 {
            self.state.store(STATE_IDLE, Ordering::SeqCst);
            self.observer.on_migration_batch_done(&Ok(()));
            return Ok(());
        }

        let budget = self.config.concurrency_budget().min(total);
        let mut pending: VecDeque<_> = plan_batch(&request, budget).into();
        let initial: Vec<_> = pending.drain(..budget).collect();
        tracing::info!(
            node_id = self.node_id,
            volumes = total,
            budget,
            placement_version = request.placement_version,
            "starting migration batch"
        );
        self.metrics
            .batches_started
            .fetch_add(1, Ordering::Relaxed);

        {
            let mut batch = lock(&self.batch);
            *batch = Some(BatchProgress {
                placement_version: request.placement_version,
                pending,
                started: initial
                    .iter()
                    .map(|planned| (planned.volume.volume_id, planned.clone()))
                    .collect(),
                tracker: NestedSequenceTracker::new(),
                first_error: None,
                sweeper: self.spawn_idle_sweeper(),
            });
        }

        for planned in initial {
            self.launch(request.placement_version, planned);
        }
        Ok(())
    }

    fn check_duplicates(&self, request: &StartMigrationRequest) -> MigrationResult<()> {
        let destinations = self.read_destinations();
        let mut seen = HashSet::new();
        for volume in request.groups.iter().flat_map(|group| group.volumes.iter()) {
            if destinations.contains_key(&volume.volume_id) || !seen.insert(volume.volume_id) {
                tracing::warn!(
                    node_id = self.node_id,
                    volume_id = volume.volume_id,
                    "rejecting migration for volume with an active migration"
                );
                return Err(MigrationError::Duplicate {
                    volume_id: volume.volume_id,
                });
            }
        }
        Ok(())
    }

    fn spawn_idle_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.idle_check_interval;
        if interval.is_zero() {
            return None;
        }
        let core = self.self_ref.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(core) = core.upgrade() else {
                    return;
                };
                core.check_idle_migrations(Instant::now());
            }
        }))
    }

    fn launch(&self, placement_version: u64, planned: PlannedVolume) {
        let volume_id = planned.volume.volume_id;
        let core = self.self_ref.clone();
        let dest = MigrationDestination::new(
            volume_id,
            planned.source,
            placement_version,
            planned.auto_increment,
            &self.config,
            self.services.clone(),
            self.metrics.clone(),
            Box::new(move |volume_id: VolumeId, event: DestinationEvent| {
                if let Some(core) = core.upgrade() {
                    core.on_destination_event(volume_id, event);
                }
            }),
        );
        self.write_destinations().insert(volume_id, dest.clone());
        // An abort that ran after the candidate was admitted but before the
        // insert above could not see this executor.
        if self.state() != CoordinatorState::InProgress {
            tracing::warn!(
                node_id = self.node_id,
                volume_id,
                "batch aborted before volume migration started"
            );
            dest.abort_migration(MigrationError::Aborted);
            return;
        }
        tracing::info!(
            node_id = self.node_id,
            volume_id,
            volume = %planned.volume.name,
            source = planned.source,
            "starting volume migration"
        );
        tokio::spawn(async move {
            // Failures are reported through the destination's events.
            let _ = dest.start_migration().await;
        });
    }

    fn on_destination_event(&self, volume_id: VolumeId, event: DestinationEvent) {
        match event {
            DestinationEvent::Done(result) => self.on_volume_done(volume_id, result),
            DestinationEvent::Retired => self.reap_destination(volume_id),
        }
    }

    fn on_volume_done(&self, volume_id: VolumeId, result: MigrationResult<()>) {
        let mut next = None;
        let mut finished = None;
        let planned = {
            let mut guard = lock(&self.batch);
            let Some(batch) = guard.as_mut() else {
                tracing::warn!(volume_id, "volume migration finished with no active batch");
                return;
            };
            let Some(planned) = batch.started.remove(&volume_id) else {
                tracing::warn!(volume_id, "volume migration finished but was not started by this batch");
                return;
            };

            match &result {
                Ok(()) => {
                    batch.tracker.observe(
                        planned.group_seq,
                        planned.group_last,
                        planned.volume_seq,
                        planned.volume_last,
                    );
                    let auto_next = self
                        .destination(volume_id)
                        .map_or(planned.auto_increment, |dest| dest.should_auto_execute_next());
                    if auto_next && self.state() == CoordinatorState::InProgress {
                        if let Some(candidate) = batch.pending.pop_front() {
                            batch
                                .started
                                .insert(candidate.volume.volume_id, candidate.clone());
                            next = Some((batch.placement_version, candidate));
                        }
                    }
                }
                Err(err) => {
                    if self.transition(STATE_IN_PROGRESS, STATE_ABORTED) {
                        tracing::warn!(
                            node_id = self.node_id,
                            volume_id,
                            error = %err,
                            dropped = batch.pending.len(),
                            "volume migration failed; aborting batch"
                        );
                    }
                    batch.first_error.get_or_insert_with(|| err.clone());
                    batch.pending.clear();
                }
            }

            let settled = batch.tracker.is_complete()
                || (self.state() == CoordinatorState::Aborted && batch.started.is_empty());
            if settled {
                finished = guard.take();
            }
            planned
        };

        self.observer
            .on_volume_migration_done(planned.source, volume_id, &result);
        if let Some((placement_version, candidate)) = next {
            self.launch(placement_version, candidate);
        }
        if let Some(batch) = finished {
            self.finish_batch(batch);
        }
    }

    fn finish_batch(&self, batch: BatchProgress) {
        if let Some(sweeper) = batch.sweeper {
            sweeper.abort();
        }
        let result = match batch.first_error {
            Some(err) => Err(err),
            None => Ok(()),
        };
        match &result {
            Ok(()) => self
                .metrics
                .batches_completed
                .fetch_add(1, Ordering::Relaxed),
            Err(_) => self.metrics.batches_aborted.fetch_add(1, Ordering::Relaxed),
        };
        self.write_destinations()
            .retain(|_, dest| !dest.state().is_terminal());
        self.state.store(STATE_IDLE, Ordering::SeqCst);
        tracing::info!(
            node_id = self.node_id,
            result = ?result,
            "migration batch settled"
        );
        self.observer.on_migration_batch_done(&result);
    }

    fn reap_destination(&self, volume_id: VolumeId) {
        let mut destinations = self.write_destinations();
        let Some(dest) = destinations.get(&volume_id) else {
            return;
        };
        match dest.state() {
            ExecutorState::Complete => {
                self.watermarks
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(volume_id, dest.placement_version());
                destinations.remove(&volume_id);
            }
            ExecutorState::Aborted => {
                destinations.remove(&volume_id);
            }
            ExecutorState::Init
            | ExecutorState::StaticMigrationInProgress
            | ExecutorState::ApplyingForwardsInProgress => {}
        }
    }

    fn abort_migration(&self) {
        let was_running = self.transition(STATE_IN_PROGRESS, STATE_ABORTED);
        tracing::warn!(node_id = self.node_id, was_running, "aborting all migrations");

        let finished = {
            let mut guard = lock(&self.batch);
            match guard.as_mut() {
                Some(batch) => {
                    batch.pending.clear();
                    batch.first_error.get_or_insert(MigrationError::Aborted);
                    if batch.started.is_empty() {
                        guard.take()
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        let destinations: Vec<_> = self.read_destinations().values().cloned().collect();
        for dest in destinations {
            dest.abort_migration(MigrationError::Aborted);
        }

        let sources: Vec<_> = self.write_sources().drain().map(|(_, s)| s).collect();
        for source in sources {
            source.abort();
        }

        if let Some(batch) = finished {
            self.finish_batch(batch);
        }
    }

    fn check_idle_migrations(&self, now: Instant) -> usize {
        let idle: Vec<_> = self
            .read_destinations()
            .values()
            .filter(|dest| dest.is_migration_idle(now))
            .cloned()
            .collect();
        for dest in &idle {
            tracing::warn!(
                node_id = self.node_id,
                volume_id = dest.volume_id(),
                source = dest.source(),
                "static migration idle for too long"
            );
            dest.abort_migration(MigrationError::Stalled {
                volume_id: dest.volume_id(),
            });
        }
        idle.len()
    }

    fn routed_destination(
        &self,
        from: NodeId,
        volume_id: VolumeId,
        kind: &'static str,
    ) -> MigrationResult<Arc<MigrationDestination>> {
        match self.destination(volume_id) {
            Some(dest) if dest.source() == from => Ok(dest),
            Some(dest) => {
                tracing::warn!(
                    node_id = self.node_id,
                    volume_id,
                    from,
                    expected = dest.source(),
                    kind,
                    "dropping migration message from unexpected node"
                );
                Err(MigrationError::UnknownVolume { volume_id })
            }
            None => {
                tracing::warn!(
                    node_id = self.node_id,
                    volume_id,
                    from,
                    kind,
                    "dropping migration message for unknown volume"
                );
                Err(MigrationError::UnknownVolume { volume_id })
            }
        }
    }

    async fn handle_initial_filter_set(
        &self,
        from: NodeId,
        filter: InitialFilterSet,
    ) -> MigrationResult<()> {
        let volume_id = filter.volume_id;
        if !self.config.enabled {
            tracing::warn!(
                node_id = self.node_id,
                volume_id,
                destination = from,
                "volume migration disabled; refusing to serve as source"
            );
            return Err(MigrationError::Disabled);
        }
        let source = {
            let mut sources = self.write_sources();
            if sources.contains_key(&volume_id) {
                tracing::warn!(
                    node_id = self.node_id,
                    volume_id,
                    destination = from,
                    "rejecting duplicate migration source"
                );
                return Err(MigrationError::Duplicate { volume_id });
            }
            let source = Arc::new(MigrationSource::new(
                volume_id,
                from,
                filter.placement_version,
                SourceLimits {
                    max_blobs_per_batch: self.config.max_blobs_per_batch,
                    max_descs_per_batch: self.config.max_descs_per_batch,
                },
                self.services.catalog.clone(),
                self.services.messenger.clone(),
                self.metrics.clone(),
            ));
            sources.insert(volume_id, source.clone());
            source
        };

        // The request is answered once the snapshot is taken. Streaming runs
        // detached; if it fails the destination sees the stream stall.
        let filter = Arc::new(filter);
        let runner = source.clone();
        let begin_filter = filter.clone();
        let begun = tokio::task::spawn_blocking(move || runner.begin(&begin_filter))
            .await
            .unwrap_or_else(|err| Err(source_task_failed(err)));
        let snapshot = match begun {
            Ok(snapshot) => snapshot,
            Err(err) => {
                source.abort();
                self.reap_source(&source);
                return Err(err);
            }
        };

        let core = self.self_ref.clone();
        tokio::spawn(async move {
            let runner = source.clone();
            let streamed =
                tokio::task::spawn_blocking(move || runner.stream(snapshot, &filter)).await;
            if let Err(err) = streamed {
                tracing::error!(
                    volume_id = source.volume_id(),
                    error = %source_task_failed(err),
                    "migration source stream did not complete"
                );
                source.abort();
            }
            if let Some(core) = core.upgrade() {
                core.reap_source(&source);
            }
        });
        Ok(())
    }

    fn reap_source(&self, source: &Arc<MigrationSource>) {
        if !source.state().is_terminal() {
            return;
        }
        let mut sources = self.write_sources();
        if sources
            .get(&source.volume_id())
            .is_some_and(|current| Arc::ptr_eq(current, source))
        {
            sources.remove(&source.volume_id());
        }
    }

    fn finish_forwarding(&self, volume_id: VolumeId) -> MigrationResult<bool> {
        let source = self
            .source(volume_id)
            .ok_or(MigrationError::UnknownVolume { volume_id })?;
        let result = source.finish_forwarding();
        self.reap_source(&source);
        result
    }

    fn notify_placement_version(&self, version: u64) -> usize {
        let sources: Vec<_> = self.read_sources().values().cloned().collect();
        let mut finished = 0;
        for source in sources {
            match source.on_placement_version(version) {
                Ok(true) => finished += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(
                    node_id = self.node_id,
                    volume_id = source.volume_id(),
                    error = %err,
                    "failed to finish forwarding"
                ),
            }
            self.reap_source(&source);
        }
        finished
    }

    fn route_commit(&self, entry: &ForwardEntry) -> bool {
        let Some(source) = self.source(entry.volume_id) else {
            return false;
        };
        let forwarded = source.forward_commit(entry);
        if !forwarded {
            self.reap_source(&source);
        }
        forwarded
    }
}

fn source_task_failed(err: tokio::task::JoinError) -> MigrationError {
    MigrationError::Catalog(format!("migration source task failed: {err}"))
}

#[async_trait]
impl MessageHandler for CoordinatorCore {
    async fn handle_message(&self, from: NodeId, msg: MigrationMessage) -> MigrationResult<()> {
        let volume_id = msg.volume_id();
        let kind = msg.kind();
        match msg {
            MigrationMessage::InitialFilterSet(filter) => {
                self.handle_initial_filter_set(from, filter).await
            }
            MigrationMessage::TxState(tx_state) => self
                .routed_destination(from, volume_id, kind)?
                .apply_tx_state(tx_state),
            MigrationMessage::DeltaBlobs(batch) => self
                .routed_destination(from, volume_id, kind)?
                .apply_delta_blobs(batch),
            MigrationMessage::DeltaBlobDescs(batch) => self
                .routed_destination(from, volume_id, kind)?
                .apply_delta_blob_descs(batch),
            MigrationMessage::Forward(entry) => self
                .routed_destination(from, volume_id, kind)?
                .apply_forward_entry(entry),
        }
    }
}

impl CommitForwarder for CoordinatorCore {
    fn forward_commit(&self, entry: &ForwardEntry) -> bool {
        self.route_commit(entry)
    }
}
