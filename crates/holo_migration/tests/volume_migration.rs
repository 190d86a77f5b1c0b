mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{assert_parity, commit, group, request, seed_volume, test_config, wait_until, TestCluster};
use holo_migration::{Catalog, CoordinatorState, ExecutorState, SourceState, VolumeState};

const SOURCE: u64 = 1;
const DEST: u64 = 2;
const VOLUME: u64 = 100;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn migrates_volume_to_parity_and_finalizes() {
    let cluster = TestCluster::new(&[SOURCE, DEST], test_config());
    let source = cluster.node(SOURCE);
    let dest = cluster.node(DEST);

    seed_volume(&source.catalog, VOLUME, 37);
    commit(&source.catalog, VOLUME, "blob-0005", 1, 2);
    // Stale replica: one deleted upstream, one behind, one ahead of the source.
    dest.catalog.ensure_volume(VOLUME).expect("ensure volume");
    commit(&dest.catalog, VOLUME, "gone-upstream", 0, 2);
    commit(&dest.catalog, VOLUME, "blob-0005", 7, 1);
    for _ in 0..3 {
        commit(&dest.catalog, VOLUME, "blob-0009", 9, 4);
    }

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE, &[VOLUME])]))
        .expect("start migration");

    wait_until("batch completion", || dest.events.batches().len() == 1).await;
    assert_eq!(dest.events.batches(), vec![Ok(())]);
    assert_eq!(dest.events.result_for(VOLUME), Some(Ok(())));
    assert_eq!(dest.coordinator.state(), CoordinatorState::Idle);
    assert_eq!(
        dest.coordinator.destination_state(VOLUME),
        Some(ExecutorState::ApplyingForwardsInProgress)
    );
    wait_until("source forwarding", || {
        source.coordinator.source_state(VOLUME) == Some(SourceState::Forwarding)
    })
    .await;
    assert!(dest.queues.is_stopped(VOLUME));
    assert_eq!(dest.states.state(VOLUME), Some(VolumeState::Syncing));
    assert_eq!(source.catalog.open_snapshots(VOLUME), 0);

    // Commits after handoff reach the destination as forwards.
    commit(&source.catalog, VOLUME, "blob-0001", 1, 3);
    commit(&source.catalog, VOLUME, "fresh", 1, 1);
    assert!(source.coordinator.should_forward(VOLUME, 1));
    assert!(!source.coordinator.should_forward(VOLUME, 2));

    source.catalog.set_placement_version(2);
    assert_eq!(source.coordinator.notify_placement_version(2), 1);

    wait_until("finalization", || {
        dest.coordinator.destination_state(VOLUME).is_none()
    })
    .await;
    assert_parity(&source.catalog, &dest.catalog, VOLUME);
    assert_eq!(dest.coordinator.placement_watermark(VOLUME), Some(1));
    assert_eq!(dest.states.state(VOLUME), Some(VolumeState::Active));
    assert_eq!(dest.queues.stops(VOLUME), 1);
    assert_eq!(dest.queues.resumes(VOLUME), 1);
    assert_eq!(source.coordinator.source_state(VOLUME), None);

    let stats = dest.coordinator.stats();
    assert_eq!(stats.batches_completed, 1);
    assert_eq!(stats.volumes_handed_off, 1);
    assert_eq!(stats.volumes_finalized, 1);
    assert!(stats.forwards_applied >= 2);
    assert_eq!(stats.active_destinations, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commits_are_not_lost() {
    let cluster = TestCluster::new(&[SOURCE, DEST], test_config());
    let source = cluster.node(SOURCE);
    let dest = cluster.node(DEST);
    seed_volume(&source.catalog, VOLUME, 64);

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let catalog = source.catalog.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut round: u64 = 1;
            while !stop.load(Ordering::SeqCst) {
                for i in (0..80).step_by(7) {
                    commit(&catalog, VOLUME, &format!("blob-{i:04}"), round, (round % 3 + 1) as usize);
                }
                round += 1;
                tokio::task::yield_now().await;
            }
        })
    };

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE, &[VOLUME])]))
        .expect("start migration");
    wait_until("batch completion", || dest.events.batches().len() == 1).await;
    assert_eq!(dest.events.batches(), vec![Ok(())]);

    stop.store(true, Ordering::SeqCst);
    writer.await.expect("writer task");
    wait_until("source forwarding", || {
        source.coordinator.source_state(VOLUME) == Some(SourceState::Forwarding)
    })
    .await;

    source.catalog.set_placement_version(2);
    assert_eq!(source.coordinator.notify_placement_version(2), 1);
    wait_until("finalization", || {
        dest.coordinator.destination_state(VOLUME).is_none()
    })
    .await;

    assert_parity(&source.catalog, &dest.catalog, VOLUME);
    assert_eq!(dest.coordinator.stats().forwards_dropped, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outstanding_transactions_hold_forwarding_open() {
    let cluster = TestCluster::new(&[SOURCE, DEST], test_config());
    let source = cluster.node(SOURCE);
    let dest = cluster.node(DEST);
    seed_volume(&source.catalog, VOLUME, 5);
    let tx = source
        .catalog
        .begin_transaction(VOLUME, "blob-0002")
        .expect("begin transaction");

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE, &[VOLUME])]))
        .expect("start migration");
    wait_until("batch completion", || dest.events.batches().len() == 1).await;
    wait_until("source forwarding", || {
        source.coordinator.source_state(VOLUME) == Some(SourceState::Forwarding)
    })
    .await;

    let imported = dest.catalog.imported_transactions(VOLUME);
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].tx_id, tx);
    assert_eq!(imported[0].blob_name, "blob-0002");

    // The transaction's write lands under the old version and is forwarded.
    commit(&source.catalog, VOLUME, "blob-0002", 5, 2);
    source.catalog.set_placement_version(2);
    assert_eq!(source.coordinator.notify_placement_version(2), 0);
    assert_eq!(
        source.coordinator.source_state(VOLUME),
        Some(SourceState::Forwarding)
    );

    source.catalog.end_transaction(VOLUME, tx);
    assert_eq!(source.coordinator.notify_placement_version(2), 1);
    wait_until("finalization", || {
        dest.coordinator.destination_state(VOLUME).is_none()
    })
    .await;
    assert_parity(&source.catalog, &dest.catalog, VOLUME);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn explicit_finish_ends_forwarding_without_cutover() {
    let cluster = TestCluster::new(&[SOURCE, DEST], test_config());
    let source = cluster.node(SOURCE);
    let dest = cluster.node(DEST);
    seed_volume(&source.catalog, VOLUME, 3);

    assert!(source.coordinator.finish_forwarding(VOLUME).is_err());

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE, &[VOLUME])]))
        .expect("start migration");
    wait_until("batch completion", || dest.events.batches().len() == 1).await;
    wait_until("source forwarding", || {
        source.coordinator.source_state(VOLUME) == Some(SourceState::Forwarding)
    })
    .await;

    let finished = match source.coordinator.finish_forwarding(VOLUME) {
        Ok(finished) => finished,
        Err(err) => panic!("unexpected finish error: {err:?}"),
    };
    assert!(finished);
    wait_until("finalization", || {
        dest.coordinator.destination_state(VOLUME).is_none()
    })
    .await;
    assert_parity(&source.catalog, &dest.catalog, VOLUME);
    assert_eq!(dest.states.state(VOLUME), Some(VolumeState::Active));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_feature_acknowledges_without_work() {
    let config = holo_migration::MigrationConfig {
        enabled: false,
        ..test_config()
    };
    let cluster = TestCluster::new(&[SOURCE, DEST], config);
    let dest = cluster.node(DEST);

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE, &[VOLUME])]))
        .expect("start migration");
    assert_eq!(dest.events.batches(), vec![Ok(())]);
    assert!(dest.events.volumes().is_empty());
    assert_eq!(dest.queues.stops(VOLUME), 0);
    assert_eq!(cluster.network.delivered(), 0);
}
