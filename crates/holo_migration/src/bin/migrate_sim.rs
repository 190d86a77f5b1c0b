//! In-process migration simulator.
//!
//! Builds one destination and several source nodes on a loopback network,
//! keeps writers committing to the source replicas while a migration batch
//! runs, cuts placement over, and checks that every destination replica ends
//! up identical to its source.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use holo_migration::local::{LocalNetwork, MemCatalog, MemQueues, MemVolumeStates};
use holo_migration::{
    Catalog, MigrationConfig, MigrationCoordinator, MigrationGroup, MigrationObserver,
    MigrationResult, MigrationServices, MigrationStats, NodeId, SourceState,
    StartMigrationRequest, VolumeDescriptor, VolumeId,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time;

/// Node id of the destination; sources follow it.
const DEST_NODE: NodeId = 1;
/// First simulated volume id.
const FIRST_VOLUME: VolumeId = 100;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-migrate-sim")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for one simulated migration batch.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of volumes migrated in the batch.
    #[arg(long, default_value_t = 4)]
    volumes: usize,

    /// Number of source nodes; volumes are spread round-robin.
    #[arg(long, default_value_t = 2)]
    sources: usize,

    /// Blobs seeded into each source volume.
    #[arg(long, default_value_t = 200)]
    blobs: usize,

    /// Concurrent writers committing to source volumes during the batch.
    #[arg(long, default_value_t = 2)]
    writers: usize,

    /// Pause between commits of a single writer.
    #[arg(long, default_value = "1ms")]
    commit_interval: humantime::Duration,

    /// Overall deadline for the batch and the cutover.
    #[arg(long, default_value = "60s")]
    timeout: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Overrides HOLO_MIGRATION_MAX_CONCURRENCY.
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Overrides HOLO_MIGRATION_MAX_DELTA_BLOBS.
    #[arg(long)]
    max_delta_blobs: Option<usize>,

    /// Overrides HOLO_MIGRATION_MAX_DELTA_BLOB_DESCS.
    #[arg(long)]
    max_delta_blob_descs: Option<usize>,

    /// Write the JSON report here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Summary written at the end of a run.
#[derive(serde::Serialize, Debug)]
struct Report {
    seed: u64,
    volumes: usize,
    sources: usize,
    commits: u64,
    batch_result: String,
    elapsed_ms: u64,
    destination: MigrationStats,
    source_nodes: BTreeMap<NodeId, MigrationStats>,
}

/// Forwards coordinator callbacks into the run loop.
struct BatchObserver {
    batches: mpsc::UnboundedSender<MigrationResult<()>>,
}

impl MigrationObserver for BatchObserver {
    fn on_volume_migration_done(
        &self,
        source: NodeId,
        volume_id: VolumeId,
        result: &MigrationResult<()>,
    ) {
        tracing::info!(source, volume_id, result = ?result, "volume migration done");
    }

    fn on_migration_batch_done(&self, result: &MigrationResult<()>) {
        let _ = self.batches.send(result.clone());
    }
}

/// Observer for source nodes, which never run batches of their own.
struct Quiet;

impl MigrationObserver for Quiet {
    fn on_volume_migration_done(&self, _: NodeId, _: VolumeId, _: &MigrationResult<()>) {}

    fn on_migration_batch_done(&self, _: &MigrationResult<()>) {}
}

/// One simulated node.
struct SimNode {
    catalog: Arc<MemCatalog>,
    coordinator: MigrationCoordinator,
}

impl SimNode {
    fn new(
        node_id: NodeId,
        config: &MigrationConfig,
        network: &LocalNetwork,
        observer: Arc<dyn MigrationObserver>,
    ) -> Self {
        let catalog = Arc::new(MemCatalog::new());
        let services = MigrationServices {
            catalog: catalog.clone(),
            queues: Arc::new(MemQueues::default()),
            volume_states: Arc::new(MemVolumeStates::default()),
            messenger: Arc::new(network.messenger(node_id)),
        };
        let coordinator = MigrationCoordinator::new(node_id, config.clone(), services, observer);
        catalog.set_forwarder(coordinator.commit_forwarder());
        network.register(node_id, coordinator.message_handler());
        Self {
            catalog,
            coordinator,
        }
    }
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.volumes > 0, "--volumes must be > 0");
    anyhow::ensure!(args.sources > 0, "--sources must be > 0");

    let mut config = MigrationConfig::from_env().context("load migration config")?;
    if let Some(value) = args.max_concurrent {
        config.max_concurrent_migrations = value;
    }
    if let Some(value) = args.max_delta_blobs {
        config.max_blobs_per_batch = value;
    }
    if let Some(value) = args.max_delta_blob_descs {
        config.max_descs_per_batch = value;
    }

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);
    tracing::info!(seed, volumes = args.volumes, sources = args.sources, "starting simulation");

    let network = LocalNetwork::new();
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let dest = SimNode::new(
        DEST_NODE,
        &config,
        &network,
        Arc::new(BatchObserver { batches: batch_tx }),
    );
    let sources: BTreeMap<NodeId, SimNode> = (0..args.sources)
        .map(|i| {
            let node_id = DEST_NODE + 1 + i as NodeId;
            (node_id, SimNode::new(node_id, &config, &network, Arc::new(Quiet)))
        })
        .collect();

    let placement: Vec<(VolumeId, NodeId)> = (0..args.volumes)
        .map(|i| {
            let volume_id = FIRST_VOLUME + i as VolumeId;
            let source = DEST_NODE + 1 + (i % args.sources) as NodeId;
            (volume_id, source)
        })
        .collect();

    for (volume_id, source) in &placement {
        let source = &sources[source];
        seed_volume(&source.catalog, &dest.catalog, *volume_id, args.blobs, &mut rng)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let commits = Arc::new(AtomicU64::new(0));
    let mut writers = Vec::with_capacity(args.writers);
    for writer_id in 0..args.writers {
        let targets: Vec<_> = placement
            .iter()
            .map(|(volume_id, source)| (*volume_id, sources[source].catalog.clone()))
            .collect();
        let stop = stop.clone();
        let commits = commits.clone();
        let interval: Duration = args.commit_interval.into();
        let blobs = args.blobs.max(1);
        // Mix the base seed with the writer id for deterministic per-writer RNG.
        let seed = seed ^ (writer_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        writers.push(tokio::spawn(async move {
            let mut rng = SmallRng::seed_from_u64(seed);
            while !stop.load(Ordering::Relaxed) {
                let (volume_id, catalog) = &targets[rng.gen_range(0..targets.len())];
                let blob = format!("blob-{:05}", rng.gen_range(0..blobs + blobs / 4));
                let objects = random_objects(&mut rng, &blob);
                catalog
                    .commit_blob(*volume_id, &blob, writer_metadata(writer_id), objects)
                    .with_context(|| format!("commit {blob} to volume {volume_id}"))?;
                commits.fetch_add(1, Ordering::Relaxed);
                time::sleep(interval).await;
            }
            anyhow::Ok(())
        }));
    }

    let started = time::Instant::now();
    let deadline = started + Duration::from(args.timeout);
    dest.coordinator
        .start_migration(build_request(1, &placement))
        .context("start migration batch")?;

    let batch_result = time::timeout_at(deadline, batch_rx.recv())
        .await
        .context("timed out waiting for migration batch")?
        .context("observer channel closed")?;
    tracing::info!(result = ?batch_result, "migration batch settled");

    stop.store(true, Ordering::Relaxed);
    for writer in writers {
        writer.await.context("writer task panicked")??;
    }

    if batch_result.is_ok() {
        cut_over(&dest, &sources, &placement, deadline).await?;
        for (volume_id, source) in &placement {
            check_parity(&sources[source].catalog, &dest.catalog, *volume_id)?;
        }
        tracing::info!(volumes = placement.len(), "all replicas match their sources");
    }

    let report = Report {
        seed,
        volumes: args.volumes,
        sources: args.sources,
        commits: commits.load(Ordering::Relaxed),
        batch_result: match &batch_result {
            Ok(()) => "ok".to_string(),
            Err(err) => err.to_string(),
        },
        elapsed_ms: started.elapsed().as_millis() as u64,
        destination: dest.coordinator.stats(),
        source_nodes: sources
            .iter()
            .map(|(node_id, node)| (*node_id, node.coordinator.stats()))
            .collect(),
    };
    let encoded = serde_json::to_string_pretty(&report).context("encode report")?;
    match &args.out {
        Some(path) => {
            std::fs::write(path, encoded)
                .with_context(|| format!("write report to {}", path.display()))?;
            eprintln!("wrote report: {}", path.display());
        }
        None => println!("{encoded}"),
    }

    batch_result.context("migration batch failed")
}

/// Publish a newer placement on every source and wait for each destination
/// replica to finalize.
async fn cut_over(
    dest: &SimNode,
    sources: &BTreeMap<NodeId, SimNode>,
    placement: &[(VolumeId, NodeId)],
    deadline: time::Instant,
) -> anyhow::Result<()> {
    loop {
        let forwarding = placement.iter().all(|(volume_id, source)| {
            sources[source].coordinator.source_state(*volume_id) == Some(SourceState::Forwarding)
        });
        if forwarding {
            break;
        }
        anyhow::ensure!(
            time::Instant::now() < deadline,
            "timed out waiting for sources to start forwarding"
        );
        time::sleep(Duration::from_millis(5)).await;
    }

    for (node_id, node) in sources {
        node.catalog.set_placement_version(2);
        let finished = node.coordinator.notify_placement_version(2);
        tracing::info!(node_id, finished, "published placement version 2");
    }

    while placement
        .iter()
        .any(|(volume_id, _)| dest.coordinator.destination_state(*volume_id).is_some())
    {
        anyhow::ensure!(
            time::Instant::now() < deadline,
            "timed out waiting for replicas to finalize"
        );
        time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Seed the source replica and leave a stale, partial copy on the destination.
fn seed_volume(
    source: &MemCatalog,
    dest: &MemCatalog,
    volume_id: VolumeId,
    blobs: usize,
    rng: &mut SmallRng,
) -> anyhow::Result<()> {
    source.ensure_volume(volume_id)?;
    dest.ensure_volume(volume_id)?;
    for i in 0..blobs {
        let blob = format!("blob-{i:05}");
        let commits = rng.gen_range(1..=3);
        for _ in 0..commits {
            source.commit_blob(volume_id, &blob, writer_metadata(0), random_objects(rng, &blob))?;
        }
        // Equal sequence numbers mean equal contents, so stale copies lag.
        if commits > 1 && rng.gen_bool(0.5) {
            dest.commit_blob(volume_id, &blob, writer_metadata(0), random_objects(rng, &blob))?;
        }
    }
    for i in 0..blobs / 10 {
        let blob = format!("orphan-{i:05}");
        dest.commit_blob(volume_id, &blob, writer_metadata(0), random_objects(rng, &blob))?;
    }
    Ok(())
}

fn random_objects(rng: &mut SmallRng, blob: &str) -> Vec<Bytes> {
    let count = rng.gen_range(1..=6);
    let tag: u32 = rng.gen();
    (0..count)
        .map(|i| Bytes::from(format!("{blob}/{tag:08x}/{i}")))
        .collect()
}

fn writer_metadata(writer_id: usize) -> BTreeMap<String, String> {
    BTreeMap::from([("writer".to_string(), writer_id.to_string())])
}

fn build_request(placement_version: u64, placement: &[(VolumeId, NodeId)]) -> StartMigrationRequest {
    let mut groups: BTreeMap<NodeId, Vec<VolumeDescriptor>> = BTreeMap::new();
    for (volume_id, source) in placement {
        groups.entry(*source).or_default().push(VolumeDescriptor {
            volume_id: *volume_id,
            name: format!("sim-volume-{volume_id}"),
        });
    }
    StartMigrationRequest {
        placement_version,
        groups: groups
            .into_iter()
            .map(|(source, volumes)| MigrationGroup { source, volumes })
            .collect(),
    }
}

fn check_parity(source: &MemCatalog, dest: &MemCatalog, volume_id: VolumeId) -> anyhow::Result<()> {
    let expected = source.blobs(volume_id);
    let actual = dest.blobs(volume_id);
    let mismatched: Vec<_> = expected
        .keys()
        .chain(actual.keys())
        .filter(|name| expected.get(*name) != actual.get(*name))
        .collect();
    anyhow::ensure!(
        mismatched.is_empty(),
        "volume {volume_id} diverged on {} blobs, first {:?}",
        mismatched.len(),
        mismatched.first()
    );
    Ok(())
}
