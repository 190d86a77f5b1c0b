//! Migration data model, wire messages and collaborator contracts.
//!
//! Everything that crosses a node boundary derives serde so any transport can
//! carry it; the byte encoding itself belongs to the transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::MigrationResult;

pub type NodeId = u64;
pub type VolumeId = u64;
pub type SnapshotId = u64;
pub type TxId = u64;

/// Blob name to per-blob sequence number, scoped to one volume.
pub type BlobVersionSet = BTreeMap<String, u64>;

/// One offset to object-id mapping of a blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobObject {
    pub offset: u64,
    pub object_id: Bytes,
}

/// Object list of one blob inside a data delta batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDataDelta {
    pub blob_name: String,
    pub objects: Vec<BlobObject>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDataBatch {
    pub volume_id: VolumeId,
    pub seq: u64,
    pub last_batch: bool,
    pub blobs: Vec<BlobDataDelta>,
}

/// Descriptor of one blob inside a descriptor delta batch. `None` deletes the
/// blob on the receiver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescDelta {
    pub blob_name: String,
    pub descriptor: Option<Bytes>,
}

impl BlobDescDelta {
    pub fn delete(blob_name: impl Into<String>) -> Self {
        Self {
            blob_name: blob_name.into(),
            descriptor: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.descriptor.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescBatch {
    pub volume_id: VolumeId,
    pub seq: u64,
    pub last_batch: bool,
    pub descs: Vec<BlobDescDelta>,
}

/// Live commit captured on the source while a migration is in flight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardEntry {
    pub volume_id: VolumeId,
    /// Placement-table version the commit was accepted under.
    pub placement_version: u64,
    pub blob_name: String,
    pub blob_version: u64,
    pub objects: Vec<BlobObject>,
    pub metadata: Vec<(String, String)>,
    pub last_forward: bool,
}

impl ForwardEntry {
    /// End-of-forwarding marker: `last_forward` with an empty blob name.
    pub fn finish(volume_id: VolumeId, placement_version: u64) -> Self {
        Self {
            volume_id,
            placement_version,
            blob_name: String::new(),
            blob_version: 0,
            objects: Vec::new(),
            metadata: Vec::new(),
            last_forward: true,
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.last_forward && self.blob_name.is_empty()
    }
}

/// Transaction open on the source at snapshot time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTx {
    pub tx_id: TxId,
    pub blob_name: String,
    pub placement_version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStateMsg {
    pub volume_id: VolumeId,
    pub txs: Vec<ActiveTx>,
}

/// Destination's view of a volume, sent to the source to start a round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialFilterSet {
    pub volume_id: VolumeId,
    pub placement_version: u64,
    pub blobs: BlobVersionSet,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationMessage {
    InitialFilterSet(InitialFilterSet),
    TxState(TxStateMsg),
    DeltaBlobs(BlobDataBatch),
    DeltaBlobDescs(BlobDescBatch),
    Forward(ForwardEntry),
}

impl MigrationMessage {
    pub fn volume_id(&self) -> VolumeId {
        match self {
            MigrationMessage::InitialFilterSet(msg) => msg.volume_id,
            MigrationMessage::TxState(msg) => msg.volume_id,
            MigrationMessage::DeltaBlobs(batch) => batch.volume_id,
            MigrationMessage::DeltaBlobDescs(batch) => batch.volume_id,
            MigrationMessage::Forward(entry) => entry.volume_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MigrationMessage::InitialFilterSet(_) => "initial_filter_set",
            MigrationMessage::TxState(_) => "tx_state",
            MigrationMessage::DeltaBlobs(_) => "delta_blobs",
            MigrationMessage::DeltaBlobDescs(_) => "delta_blob_descs",
            MigrationMessage::Forward(_) => "forward",
        }
    }
}

/// Externally visible state of a volume replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    Loading,
    Syncing,
    Active,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub volume_id: VolumeId,
    pub name: String,
}

/// Volumes to pull from one source node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationGroup {
    pub source: NodeId,
    pub volumes: Vec<VolumeDescriptor>,
}

/// Batch handed to a node by the cluster orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMigrationRequest {
    pub placement_version: u64,
    pub groups: Vec<MigrationGroup>,
}

impl StartMigrationRequest {
    pub fn volume_count(&self) -> usize {
        self.groups.iter().map(|g| g.volumes.len()).sum()
    }
}

/// Descriptor and object list of a blob as of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobSnapshotData {
    pub descriptor: Bytes,
    pub objects: Vec<BlobObject>,
}

/// Metadata catalog of the local node.
pub trait Catalog: Send + Sync + 'static {
    /// Create the volume if it does not exist yet. Existing volumes are fine.
    fn ensure_volume(&self, volume_id: VolumeId) -> anyhow::Result<()>;

    fn all_blobs_with_sequence(
        &self,
        volume_id: VolumeId,
        snapshot: Option<SnapshotId>,
    ) -> anyhow::Result<BlobVersionSet>;

    fn blob_snapshot_data(
        &self,
        volume_id: VolumeId,
        blob_name: &str,
        snapshot: SnapshotId,
    ) -> anyhow::Result<BlobSnapshotData>;

    /// Apply the object lists of a whole data batch. Either every blob is
    /// applied or none is.
    fn apply_object_diffs(&self, volume_id: VolumeId, blobs: &[BlobDataDelta])
        -> anyhow::Result<()>;

    /// Apply a serialized descriptor; `None` deletes the blob.
    fn apply_blob_descriptor(
        &self,
        volume_id: VolumeId,
        blob_name: &str,
        descriptor: Option<&Bytes>,
    ) -> anyhow::Result<()>;

    fn apply_forward(&self, entry: &ForwardEntry) -> anyhow::Result<()>;

    fn apply_active_tx_state(&self, volume_id: VolumeId, txs: &[ActiveTx]) -> anyhow::Result<()>;

    /// Run `f` while new commits on the volume are blocked.
    fn with_commits_blocked(
        &self,
        volume_id: VolumeId,
        f: &mut dyn FnMut() -> anyhow::Result<()>,
    ) -> anyhow::Result<()>;

    fn take_snapshot(&self, volume_id: VolumeId) -> anyhow::Result<SnapshotId>;

    fn release_snapshot(&self, volume_id: VolumeId, snapshot: SnapshotId) -> anyhow::Result<()>;

    fn snapshot_outstanding_transactions(&self, volume_id: VolumeId)
        -> anyhow::Result<Vec<ActiveTx>>;

    fn has_outstanding_transactions(
        &self,
        volume_id: VolumeId,
        placement_version: u64,
    ) -> anyhow::Result<bool>;
}

/// Per-volume request queue of the local node.
pub trait QueueControl: Send + Sync + 'static {
    fn stop_dequeue(&self, volume_id: VolumeId) -> anyhow::Result<()>;
    fn resume_dequeue(&self, volume_id: VolumeId) -> anyhow::Result<()>;
}

pub trait VolumeStateSink: Send + Sync + 'static {
    fn set_volume_state(&self, volume_id: VolumeId, state: VolumeState, reason: &str);
}

/// Node-to-node messaging.
///
/// `send_oneway` only enqueues; messages sent to the same target from the
/// same task are delivered in submission order.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    fn send_oneway(&self, target: NodeId, msg: MigrationMessage) -> anyhow::Result<()>;

    async fn request(
        &self,
        target: NodeId,
        msg: MigrationMessage,
        timeout: Duration,
    ) -> anyhow::Result<()>;
}

/// Local collaborators shared by every migration on a node.
#[derive(Clone)]
pub struct MigrationServices {
    pub catalog: Arc<dyn Catalog>,
    pub queues: Arc<dyn QueueControl>,
    pub volume_states: Arc<dyn VolumeStateSink>,
    pub messenger: Arc<dyn Messenger>,
}

/// Inbound side of [`Messenger`]: one call per delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_message(&self, from: NodeId, msg: MigrationMessage) -> MigrationResult<()>;
}

/// Receives terminal results from the coordinator.
pub trait MigrationObserver: Send + Sync + 'static {
    /// Called once per started volume, at the live-forwarding handoff or on
    /// abort.
    fn on_volume_migration_done(
        &self,
        source: NodeId,
        volume_id: VolumeId,
        result: &MigrationResult<()>,
    );

    fn on_migration_batch_done(&self, result: &MigrationResult<()>);
}

/// Hook called by the catalog commit path while it holds the volume's commit
/// lock. Returns true when the commit was queued for a destination.
pub trait CommitForwarder: Send + Sync + 'static {
    fn forward_commit(&self, entry: &ForwardEntry) -> bool;
}
