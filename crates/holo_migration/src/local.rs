//! In-process collaborators: a memory catalog, queue control, volume state
//! registry, and a loopback network between coordinators.
//!
//! Used by the integration tests and the simulator. The network keeps one
//! ordered queue per (sender, receiver) pair, matching the ordering contract
//! of [`Messenger`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::lock;
use crate::types::{
    ActiveTx, BlobDataDelta, BlobObject, BlobSnapshotData, BlobVersionSet, Catalog,
    CommitForwarder, ForwardEntry, MessageHandler, Messenger, MigrationMessage, NodeId,
    QueueControl, SnapshotId, TxId, VolumeId, VolumeState, VolumeStateSink,
};

/// Capacity of each per-link delivery queue.
const LINK_QUEUE_CAPACITY: usize = 65_536;

/// One blob as stored by [`MemCatalog`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobRecord {
    pub sequence: u64,
    pub metadata: BTreeMap<String, String>,
    pub objects: BTreeMap<u64, Bytes>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDescriptor {
    sequence: u64,
    metadata: BTreeMap<String, String>,
    object_count: u64,
}

#[derive(Default)]
struct VolumeData {
    blobs: BTreeMap<String, BlobRecord>,
    snapshots: HashMap<SnapshotId, BTreeMap<String, BlobRecord>>,
    open_txs: Vec<ActiveTx>,
    imported_txs: Vec<ActiveTx>,
}

/// Memory catalog with a single commit lock. Commits stamp the current
/// placement version and are offered to the registered forwarder while the
/// commit lock is held.
pub struct MemCatalog {
    commit_lock: Mutex<()>,
    volumes: Mutex<HashMap<VolumeId, VolumeData>>,
    forwarder: RwLock<Option<Weak<dyn CommitForwarder>>>,
    placement_version: AtomicU64,
    next_snapshot: AtomicU64,
    next_tx: AtomicU64,
    fail_snapshots: AtomicBool,
    fail_applies: AtomicBool,
}

impl Default for MemCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCatalog {
    pub fn new() -> Self {
        Self {
            commit_lock: Mutex::new(()),
            volumes: Mutex::new(HashMap::new()),
            forwarder: RwLock::new(None),
            placement_version: AtomicU64::new(1),
            next_snapshot: AtomicU64::new(1),
            next_tx: AtomicU64::new(1),
            fail_snapshots: AtomicBool::new(false),
            fail_applies: AtomicBool::new(false),
        }
    }

    pub fn set_forwarder(&self, forwarder: Weak<dyn CommitForwarder>) {
        let mut slot = self
            .forwarder
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(forwarder);
    }

    /// Serialized form of a blob descriptor as carried in descriptor batches.
    pub fn encode_descriptor(
        sequence: u64,
        metadata: &BTreeMap<String, String>,
        object_count: u64,
    ) -> Result<Bytes> {
        let stored = StoredDescriptor {
            sequence,
            metadata: metadata.clone(),
            object_count,
        };
        let encoded = serde_json::to_vec(&stored).context("encode blob descriptor")?;
        Ok(Bytes::from(encoded))
    }

    fn decode_descriptor(raw: &[u8]) -> Result<StoredDescriptor> {
        serde_json::from_slice(raw).context("decode blob descriptor")
    }

    pub fn placement_version(&self) -> u64 {
        self.placement_version.load(Ordering::SeqCst)
    }

    /// Publish a new placement version. Serialized with commits so every
    /// commit is stamped with exactly one version.
    pub fn set_placement_version(&self, version: u64) {
        let _commit = lock(&self.commit_lock);
        self.placement_version.store(version, Ordering::SeqCst);
    }

    /// Replace a blob's contents, bumping its sequence number. Returns the new
    /// sequence number.
    pub fn commit_blob(
        &self,
        volume_id: VolumeId,
        blob_name: &str,
        metadata: BTreeMap<String, String>,
        objects: Vec<Bytes>,
    ) -> Result<u64> {
        let _commit = lock(&self.commit_lock);
        let entry = {
            let mut volumes = lock(&self.volumes);
            let volume = volumes
                .get_mut(&volume_id)
                .with_context(|| format!("unknown volume {volume_id}"))?;
            let record = volume.blobs.entry(blob_name.to_string()).or_default();
            record.sequence += 1;
            record.metadata = metadata;
            record.objects = objects
                .into_iter()
                .enumerate()
                .map(|(offset, id)| (offset as u64, id))
                .collect();
            ForwardEntry {
                volume_id,
                placement_version: self.placement_version.load(Ordering::SeqCst),
                blob_name: blob_name.to_string(),
                blob_version: record.sequence,
                objects: record
                    .objects
                    .iter()
                    .map(|(offset, id)| BlobObject {
                        offset: *offset,
                        object_id: id.clone(),
                    })
                    .collect(),
                metadata: record
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                last_forward: false,
            }
        };

        let forwarder = self
            .forwarder
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(forwarder) = forwarder {
            forwarder.forward_commit(&entry);
        }
        Ok(entry.blob_version)
    }

    pub fn begin_transaction(&self, volume_id: VolumeId, blob_name: &str) -> Result<TxId> {
        let _commit = lock(&self.commit_lock);
        let tx_id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        let mut volumes = lock(&self.volumes);
        let volume = volumes
            .get_mut(&volume_id)
            .with_context(|| format!("unknown volume {volume_id}"))?;
        volume.open_txs.push(ActiveTx {
            tx_id,
            blob_name: blob_name.to_string(),
            placement_version: self.placement_version.load(Ordering::SeqCst),
        });
        Ok(tx_id)
    }

    pub fn end_transaction(&self, volume_id: VolumeId, tx_id: TxId) {
        let mut volumes = lock(&self.volumes);
        if let Some(volume) = volumes.get_mut(&volume_id) {
            volume.open_txs.retain(|tx| tx.tx_id != tx_id);
        }
    }

    pub fn blob(&self, volume_id: VolumeId, blob_name: &str) -> Option<BlobRecord> {
        lock(&self.volumes)
            .get(&volume_id)
            .and_then(|volume| volume.blobs.get(blob_name).cloned())
    }

    pub fn blobs(&self, volume_id: VolumeId) -> BTreeMap<String, BlobRecord> {
        lock(&self.volumes)
            .get(&volume_id)
            .map(|volume| volume.blobs.clone())
            .unwrap_or_default()
    }

    pub fn open_snapshots(&self, volume_id: VolumeId) -> usize {
        lock(&self.volumes)
            .get(&volume_id)
            .map(|volume| volume.snapshots.len())
            .unwrap_or(0)
    }

    pub fn imported_transactions(&self, volume_id: VolumeId) -> Vec<ActiveTx> {
        lock(&self.volumes)
            .get(&volume_id)
            .map(|volume| volume.imported_txs.clone())
            .unwrap_or_default()
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    pub fn fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    fn check_applies(&self) -> Result<()> {
        if self.fail_applies.load(Ordering::SeqCst) {
            anyhow::bail!("catalog apply failure injected");
        }
        Ok(())
    }

    fn with_volume<T>(
        &self,
        volume_id: VolumeId,
        f: impl FnOnce(&mut VolumeData) -> Result<T>,
    ) -> Result<T> {
        let mut volumes = lock(&self.volumes);
        let volume = volumes
            .get_mut(&volume_id)
            .with_context(|| format!("unknown volume {volume_id}"))?;
        f(volume)
    }
}

impl Catalog for MemCatalog {
    fn ensure_volume(&self, volume_id: VolumeId) -> Result<()> {
        lock(&self.volumes).entry(volume_id).or_default();
        Ok(())
    }

    fn all_blobs_with_sequence(
        &self,
        volume_id: VolumeId,
        snapshot: Option<SnapshotId>,
    ) -> Result<BlobVersionSet> {
        self.with_volume(volume_id, |volume| {
            let blobs = match snapshot {
                Some(id) => volume
                    .snapshots
                    .get(&id)
                    .with_context(|| format!("unknown snapshot {id}"))?,
                None => &volume.blobs,
            };
            Ok(blobs
                .iter()
                .map(|(name, record)| (name.clone(), record.sequence))
                .collect())
        })
    }

    fn blob_snapshot_data(
        &self,
        volume_id: VolumeId,
        blob_name: &str,
        snapshot: SnapshotId,
    ) -> Result<BlobSnapshotData> {
        self.with_volume(volume_id, |volume| {
            let record = volume
                .snapshots
                .get(&snapshot)
                .with_context(|| format!("unknown snapshot {snapshot}"))?
                .get(blob_name)
                .with_context(|| format!("blob {blob_name} not in snapshot {snapshot}"))?;
            Ok(BlobSnapshotData {
                descriptor: Self::encode_descriptor(
                    record.sequence,
                    &record.metadata,
                    record.objects.len() as u64,
                )?,
                objects: record
                    .objects
                    .iter()
                    .map(|(offset, id)| BlobObject {
                        offset: *offset,
                        object_id: id.clone(),
                    })
                    .collect(),
            })
        })
    }

    fn apply_object_diffs(&self, volume_id: VolumeId, blobs: &[BlobDataDelta]) -> Result<()> {
        self.check_applies()?;
        self.with_volume(volume_id, |volume| {
            for blob in blobs {
                let record = volume.blobs.entry(blob.blob_name.clone()).or_default();
                for object in &blob.objects {
                    record.objects.insert(object.offset, object.object_id.clone());
                }
            }
            Ok(())
        })
    }

    fn apply_blob_descriptor(
        &self,
        volume_id: VolumeId,
        blob_name: &str,
        descriptor: Option<&Bytes>,
    ) -> Result<()> {
        self.check_applies()?;
        let decoded = descriptor
            .map(|raw| Self::decode_descriptor(raw))
            .transpose()?;
        self.with_volume(volume_id, |volume| {
            match decoded {
                Some(desc) => {
                    let record = volume.blobs.entry(blob_name.to_string()).or_default();
                    record.sequence = desc.sequence;
                    record.metadata = desc.metadata;
                    record.objects.retain(|offset, _| *offset < desc.object_count);
                }
                None => {
                    volume.blobs.remove(blob_name);
                }
            }
            Ok(())
        })
    }

    fn apply_forward(&self, entry: &ForwardEntry) -> Result<()> {
        self.check_applies()?;
        self.with_volume(entry.volume_id, |volume| {
            let record = volume.blobs.entry(entry.blob_name.clone()).or_default();
            record.sequence = entry.blob_version;
            record.metadata = entry.metadata.iter().cloned().collect();
            record.objects = entry
                .objects
                .iter()
                .map(|object| (object.offset, object.object_id.clone()))
                .collect();
            Ok(())
        })
    }

    fn apply_active_tx_state(&self, volume_id: VolumeId, txs: &[ActiveTx]) -> Result<()> {
        self.check_applies()?;
        self.with_volume(volume_id, |volume| {
            volume.imported_txs = txs.to_vec();
            Ok(())
        })
    }

    fn with_commits_blocked(
        &self,
        _volume_id: VolumeId,
        f: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        let _commit = lock(&self.commit_lock);
        f()
    }

    fn take_snapshot(&self, volume_id: VolumeId) -> Result<SnapshotId> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            anyhow::bail!("snapshot failure injected for volume {volume_id}");
        }
        let id = self.next_snapshot.fetch_add(1, Ordering::Relaxed);
        self.with_volume(volume_id, |volume| {
            let copy = volume.blobs.clone();
            volume.snapshots.insert(id, copy);
            Ok(id)
        })
    }

    fn release_snapshot(&self, volume_id: VolumeId, snapshot: SnapshotId) -> Result<()> {
        self.with_volume(volume_id, |volume| {
            volume
                .snapshots
                .remove(&snapshot)
                .map(|_| ())
                .with_context(|| format!("unknown snapshot {snapshot}"))
        })
    }

    fn snapshot_outstanding_transactions(&self, volume_id: VolumeId) -> Result<Vec<ActiveTx>> {
        self.with_volume(volume_id, |volume| Ok(volume.open_txs.clone()))
    }

    fn has_outstanding_transactions(
        &self,
        volume_id: VolumeId,
        placement_version: u64,
    ) -> Result<bool> {
        self.with_volume(volume_id, |volume| {
            Ok(volume
                .open_txs
                .iter()
                .any(|tx| tx.placement_version <= placement_version))
        })
    }
}

#[derive(Default)]
struct QueueCounters {
    stops: u64,
    resumes: u64,
}

/// Queue control that only counts stop/resume calls.
#[derive(Default)]
pub struct MemQueues {
    volumes: Mutex<HashMap<VolumeId, QueueCounters>>,
}

impl MemQueues {
    pub fn stops(&self, volume_id: VolumeId) -> u64 {
        lock(&self.volumes).get(&volume_id).map_or(0, |c| c.stops)
    }

    pub fn resumes(&self, volume_id: VolumeId) -> u64 {
        lock(&self.volumes).get(&volume_id).map_or(0, |c| c.resumes)
    }

    pub fn is_stopped(&self, volume_id: VolumeId) -> bool {
        lock(&self.volumes)
            .get(&volume_id)
            .is_some_and(|c| c.stops > c.resumes)
    }
}

impl QueueControl for MemQueues {
    fn stop_dequeue(&self, volume_id: VolumeId) -> Result<()> {
        lock(&self.volumes).entry(volume_id).or_default().stops += 1;
        Ok(())
    }

    fn resume_dequeue(&self, volume_id: VolumeId) -> Result<()> {
        lock(&self.volumes).entry(volume_id).or_default().resumes += 1;
        Ok(())
    }
}

/// Latest reported state and reason per volume.
#[derive(Default)]
pub struct MemVolumeStates {
    volumes: Mutex<HashMap<VolumeId, (VolumeState, String)>>,
}

impl MemVolumeStates {
    pub fn state(&self, volume_id: VolumeId) -> Option<VolumeState> {
        lock(&self.volumes).get(&volume_id).map(|(state, _)| *state)
    }

    pub fn reason(&self, volume_id: VolumeId) -> Option<String> {
        lock(&self.volumes)
            .get(&volume_id)
            .map(|(_, reason)| reason.clone())
    }
}

impl VolumeStateSink for MemVolumeStates {
    fn set_volume_state(&self, volume_id: VolumeId, state: VolumeState, reason: &str) {
        tracing::debug!(volume_id, ?state, reason, "volume state changed");
        lock(&self.volumes).insert(volume_id, (state, reason.to_string()));
    }
}

/// Fault injected on a directed link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkFault {
    /// Messages vanish; sends still succeed.
    Drop,
    /// Sends fail immediately.
    Reject,
}

struct NetworkInner {
    nodes: RwLock<HashMap<NodeId, Weak<dyn MessageHandler>>>,
    links: Mutex<HashMap<(NodeId, NodeId), mpsc::Sender<MigrationMessage>>>,
    faults: RwLock<HashMap<(NodeId, NodeId), LinkFault>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Loopback network between coordinators in one process.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                nodes: RwLock::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                faults: RwLock::new(HashMap::new()),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn register(&self, node_id: NodeId, handler: Weak<dyn MessageHandler>) {
        let mut nodes = self
            .inner
            .nodes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        nodes.insert(node_id, handler);
    }

    pub fn messenger(&self, node_id: NodeId) -> LocalMessenger {
        LocalMessenger {
            node_id,
            network: self.clone(),
        }
    }

    /// Inject `fault` on messages from `from` to `to`; `None` heals the link.
    pub fn set_fault(&self, from: NodeId, to: NodeId, fault: Option<LinkFault>) {
        let mut faults = self
            .inner
            .faults
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match fault {
            Some(fault) => faults.insert((from, to), fault),
            None => faults.remove(&(from, to)),
        };
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn fault(&self, from: NodeId, to: NodeId) -> Option<LinkFault> {
        self.inner
            .faults
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(from, to))
            .copied()
    }

    fn handler(&self, node_id: NodeId) -> Option<Arc<dyn MessageHandler>> {
        self.inner
            .nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&node_id)
            .and_then(Weak::upgrade)
    }

    fn enqueue(&self, from: NodeId, to: NodeId, msg: MigrationMessage) -> Result<()> {
        match self.fault(from, to) {
            Some(LinkFault::Reject) => anyhow::bail!("link {from}->{to} rejected message"),
            Some(LinkFault::Drop) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            None => {}
        }

        let mut links = lock(&self.inner.links);
        let tx = match links.get(&(from, to)) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let tx = self.spawn_link(from, to)?;
                links.insert((from, to), tx.clone());
                tx
            }
        };
        drop(links);
        tx.try_send(msg)
            .map_err(|err| anyhow::anyhow!("link {from}->{to} send failed: {err}"))
    }

    fn spawn_link(&self, from: NodeId, to: NodeId) -> Result<mpsc::Sender<MigrationMessage>> {
        let runtime =
            tokio::runtime::Handle::try_current().context("local network needs a tokio runtime")?;
        let (tx, mut rx) = mpsc::channel::<MigrationMessage>(LINK_QUEUE_CAPACITY);
        let network = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(inner) = network.upgrade() else {
                    return;
                };
                let net = LocalNetwork { inner };
                // Faults injected after enqueue still apply to queued messages.
                if net.fault(from, to) == Some(LinkFault::Drop) {
                    net.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let Some(handler) = net.handler(to) else {
                    tracing::warn!(from, to, kind = msg.kind(), "no handler for node; dropping message");
                    net.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                let kind = msg.kind();
                let volume_id = msg.volume_id();
                net.inner.delivered.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = handler.handle_message(from, msg).await {
                    tracing::debug!(from, to, kind, volume_id, error = %err, "message handler returned error");
                }
            }
        });
        Ok(tx)
    }
}

/// [`Messenger`] for one node on a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalMessenger {
    node_id: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Messenger for LocalMessenger {
    fn send_oneway(&self, target: NodeId, msg: MigrationMessage) -> Result<()> {
        self.network.enqueue(self.node_id, target, msg)
    }

    async fn request(&self, target: NodeId, msg: MigrationMessage, timeout: Duration) -> Result<()> {
        match self.network.fault(self.node_id, target) {
            Some(LinkFault::Reject) => {
                anyhow::bail!("link {}->{target} rejected request", self.node_id)
            }
            Some(LinkFault::Drop) => {
                tokio::time::sleep(timeout).await;
                anyhow::bail!("request to node {target} timed out after {timeout:?}");
            }
            None => {}
        }
        let handler = self
            .network
            .handler(target)
            .with_context(|| format!("node {target} is not registered"))?;
        match tokio::time::timeout(timeout, handler.handle_message(self.node_id, msg)).await {
            Ok(result) => result.with_context(|| format!("request to node {target} failed")),
            Err(_) => anyhow::bail!("request to node {target} timed out after {timeout:?}"),
        }
    }
}
