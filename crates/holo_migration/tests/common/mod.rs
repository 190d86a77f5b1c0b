//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use holo_migration::local::{LocalNetwork, MemCatalog, MemQueues, MemVolumeStates};
use holo_migration::{
    Catalog, MigrationConfig, MigrationCoordinator, MigrationGroup, MigrationObserver,
    MigrationResult, MigrationServices, NodeId, StartMigrationRequest, VolumeDescriptor,
    VolumeId,
};

/// Upper bound for any condition a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Records coordinator callbacks in arrival order.
#[derive(Default)]
pub struct EventLog {
    volumes: Mutex<Vec<(NodeId, VolumeId, MigrationResult<()>)>>,
    batches: Mutex<Vec<MigrationResult<()>>>,
}

impl EventLog {
    pub fn volumes(&self) -> Vec<(NodeId, VolumeId, MigrationResult<()>)> {
        self.volumes.lock().expect("volumes lock").clone()
    }

    pub fn batches(&self) -> Vec<MigrationResult<()>> {
        self.batches.lock().expect("batches lock").clone()
    }

    pub fn result_for(&self, volume_id: VolumeId) -> Option<MigrationResult<()>> {
        self.volumes()
            .into_iter()
            .find(|(_, id, _)| *id == volume_id)
            .map(|(_, _, result)| result)
    }
}

impl MigrationObserver for EventLog {
    fn on_volume_migration_done(
        &self,
        source: NodeId,
        volume_id: VolumeId,
        result: &MigrationResult<()>,
    ) {
        self.volumes
            .lock()
            .expect("volumes lock")
            .push((source, volume_id, result.clone()));
    }

    fn on_migration_batch_done(&self, result: &MigrationResult<()>) {
        self.batches
            .lock()
            .expect("batches lock")
            .push(result.clone());
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub catalog: Arc<MemCatalog>,
    pub queues: Arc<MemQueues>,
    pub states: Arc<MemVolumeStates>,
    pub events: Arc<EventLog>,
    pub coordinator: MigrationCoordinator,
}

pub struct TestCluster {
    pub network: LocalNetwork,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn new(node_ids: &[NodeId], config: MigrationConfig) -> Self {
        let network = LocalNetwork::new();
        let nodes = node_ids
            .iter()
            .map(|id| {
                let catalog = Arc::new(MemCatalog::new());
                let queues = Arc::new(MemQueues::default());
                let states = Arc::new(MemVolumeStates::default());
                let events = Arc::new(EventLog::default());
                let services = MigrationServices {
                    catalog: catalog.clone(),
                    queues: queues.clone(),
                    volume_states: states.clone(),
                    messenger: Arc::new(network.messenger(*id)),
                };
                let coordinator =
                    MigrationCoordinator::new(*id, config.clone(), services, events.clone());
                catalog.set_forwarder(coordinator.commit_forwarder());
                network.register(*id, coordinator.message_handler());
                TestNode {
                    id: *id,
                    catalog,
                    queues,
                    states,
                    events,
                    coordinator,
                }
            })
            .collect();
        Self { network, nodes }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .unwrap_or_else(|| panic!("no node {id}"))
    }
}

/// Small batches and short timeouts so every path is exercised quickly.
pub fn test_config() -> MigrationConfig {
    MigrationConfig {
        max_blobs_per_batch: 4,
        max_descs_per_batch: 3,
        sequence_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(5),
        idle_check_interval: Duration::from_millis(100),
        rpc_timeout: Duration::from_secs(5),
        ..MigrationConfig::default()
    }
}

pub fn group(source: NodeId, volumes: &[VolumeId]) -> MigrationGroup {
    MigrationGroup {
        source,
        volumes: volumes
            .iter()
            .map(|id| VolumeDescriptor {
                volume_id: *id,
                name: format!("volume-{id}"),
            })
            .collect(),
    }
}

pub fn request(placement_version: u64, groups: Vec<MigrationGroup>) -> StartMigrationRequest {
    StartMigrationRequest {
        placement_version,
        groups,
    }
}

pub fn blob_objects(name: &str, version: u64, count: usize) -> Vec<Bytes> {
    (0..count)
        .map(|i| Bytes::from(format!("{name}/v{version}/obj-{i}")))
        .collect()
}

pub fn commit(catalog: &MemCatalog, volume_id: VolumeId, name: &str, version_hint: u64, objects: usize) {
    let mut metadata = BTreeMap::new();
    metadata.insert("writer".to_string(), format!("{version_hint}"));
    catalog
        .commit_blob(volume_id, name, metadata, blob_objects(name, version_hint, objects))
        .expect("commit blob");
}

/// Fill `volume_id` with `blobs` blobs of one to four objects each.
pub fn seed_volume(catalog: &MemCatalog, volume_id: VolumeId, blobs: usize) {
    catalog.ensure_volume(volume_id).expect("ensure volume");
    for i in 0..blobs {
        commit(catalog, volume_id, &format!("blob-{i:04}"), 0, i % 4 + 1);
    }
}

/// Poll `cond` until it holds or `WAIT_TIMEOUT` passes.
pub async fn wait_until<F>(what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn assert_parity(source: &MemCatalog, destination: &MemCatalog, volume_id: VolumeId) {
    let src = source.blobs(volume_id);
    let dst = destination.blobs(volume_id);
    let missing: Vec<_> = src.keys().filter(|k| !dst.contains_key(*k)).collect();
    let extra: Vec<_> = dst.keys().filter(|k| !src.contains_key(*k)).collect();
    let differing: Vec<_> = src
        .iter()
        .filter(|(k, v)| dst.get(*k).is_some_and(|d| d != *v))
        .map(|(k, _)| k)
        .collect();
    assert!(
        missing.is_empty() && extra.is_empty() && differing.is_empty(),
        "volume {volume_id} diverged: missing={missing:?} extra={extra:?} differing={differing:?}"
    );
}
