mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{assert_parity, group, request, seed_volume, test_config, wait_until, TestCluster};
use holo_migration::local::LinkFault;
use holo_migration::{
    BlobDataBatch, BlobDataDelta, BlobObject, CoordinatorState, ExecutorState, ForwardEntry,
    InitialFilterSet, MigrationConfig, MigrationError, MigrationMessage, SourceState,
    VolumeState,
};

const SOURCE_A: u64 = 1;
const DEST: u64 = 2;
const SOURCE_B: u64 = 3;

fn budget(max_concurrent_migrations: usize) -> MigrationConfig {
    MigrationConfig {
        max_concurrent_migrations,
        ..test_config()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipelines_volumes_from_several_sources() {
    let cluster = TestCluster::new(&[SOURCE_A, DEST, SOURCE_B], budget(2));
    let dest = cluster.node(DEST);
    let a_volumes = [10, 11, 12];
    let b_volumes = [20, 21];
    for (i, volume) in a_volumes.iter().enumerate() {
        seed_volume(&cluster.node(SOURCE_A).catalog, *volume, 5 + i * 6);
    }
    for (i, volume) in b_volumes.iter().enumerate() {
        seed_volume(&cluster.node(SOURCE_B).catalog, *volume, 9 + i);
    }

    dest.coordinator
        .start_migration(request(
            1,
            vec![
                group(SOURCE_A, &a_volumes),
                group(SOURCE_B, &[]),
                group(SOURCE_B, &b_volumes),
            ],
        ))
        .expect("start migration");
    wait_until("batch completion", || dest.events.batches().len() == 1).await;
    assert_eq!(dest.events.batches(), vec![Ok(())]);

    let mut reported: Vec<_> = dest
        .events
        .volumes()
        .into_iter()
        .map(|(source, volume, result)| {
            assert_eq!(result, Ok(()), "volume {volume}");
            (source, volume)
        })
        .collect();
    reported.sort_unstable();
    assert_eq!(
        reported,
        vec![(1, 10), (1, 11), (1, 12), (3, 20), (3, 21)]
    );
    assert_eq!(dest.coordinator.state(), CoordinatorState::Idle);

    for (node, volumes) in [(SOURCE_A, &a_volumes[..]), (SOURCE_B, &b_volumes[..])] {
        let source = cluster.node(node);
        wait_until("sources forwarding", || {
            volumes
                .iter()
                .all(|v| source.coordinator.source_state(*v) == Some(SourceState::Forwarding))
        })
        .await;
        source.catalog.set_placement_version(2);
        assert_eq!(source.coordinator.notify_placement_version(2), volumes.len());
    }

    wait_until("all volumes finalized", || {
        a_volumes
            .iter()
            .chain(b_volumes.iter())
            .all(|v| dest.coordinator.destination_state(*v).is_none())
    })
    .await;
    for volume in a_volumes {
        assert_parity(&cluster.node(SOURCE_A).catalog, &dest.catalog, volume);
        assert_eq!(dest.coordinator.placement_watermark(volume), Some(1));
    }
    for volume in b_volumes {
        assert_parity(&cluster.node(SOURCE_B).catalog, &dest.catalog, volume);
    }

    // A fresh batch is accepted once the previous one settled.
    dest.coordinator
        .start_migration(request(2, Vec::new()))
        .expect("start empty batch");
    assert_eq!(dest.events.batches(), vec![Ok(()), Ok(())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admits_at_most_budget_volumes() {
    let cluster = TestCluster::new(&[SOURCE_A, DEST], budget(2));
    let dest = cluster.node(DEST);
    let volumes = [10, 11, 12, 13, 14];
    for volume in volumes {
        seed_volume(&cluster.node(SOURCE_A).catalog, volume, 4);
    }
    // Delta batches never arrive, so no volume can finish.
    cluster.network.set_fault(SOURCE_A, DEST, Some(LinkFault::Drop));

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE_A, &volumes)]))
        .expect("start migration");
    wait_until("first volumes started", || {
        dest.queues.stops(10) == 1 && dest.queues.stops(11) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for volume in [12, 13, 14] {
        assert_eq!(dest.queues.stops(volume), 0, "volume {volume}");
        assert_eq!(dest.coordinator.destination_state(volume), None);
    }
    assert_eq!(
        dest.coordinator.start_migration(request(1, vec![group(SOURCE_A, &[15])])),
        Err(MigrationError::AlreadyInProgress)
    );

    dest.coordinator.abort_migration();
    wait_until("batch aborted", || dest.events.batches().len() == 1).await;
    assert_eq!(dest.events.batches(), vec![Err(MigrationError::Aborted)]);
    let mut reported: Vec<_> = dest
        .events
        .volumes()
        .into_iter()
        .map(|(_, volume, result)| (volume, result))
        .collect();
    reported.sort_unstable_by_key(|(volume, _)| *volume);
    assert_eq!(
        reported,
        vec![(10, Err(MigrationError::Aborted)), (11, Err(MigrationError::Aborted))]
    );
    for volume in [10, 11] {
        assert_eq!(dest.queues.resumes(volume), 1);
        assert_eq!(dest.states.state(volume), Some(VolumeState::Error));
    }
    assert_eq!(dest.coordinator.state(), CoordinatorState::Idle);

    // Repeated aborts are harmless.
    dest.coordinator.abort_migration();
    assert_eq!(dest.events.batches().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_volume_aborts_the_batch() {
    let cluster = TestCluster::new(&[SOURCE_A, DEST], budget(2));
    let dest = cluster.node(DEST);
    // Volume 10 does not exist on the source, so its round fails.
    for volume in [11, 12, 13] {
        seed_volume(&cluster.node(SOURCE_A).catalog, volume, 6);
    }

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE_A, &[10, 11, 12, 13])]))
        .expect("start migration");
    wait_until("batch settled", || dest.events.batches().len() == 1).await;

    match &dest.events.batches()[0] {
        Err(MigrationError::Transport(reason)) => {
            assert!(reason.contains("unknown volume 10"), "{reason}")
        }
        other => panic!("unexpected batch result: {other:?}"),
    }
    assert!(matches!(
        dest.events.result_for(10),
        Some(Err(MigrationError::Transport(_)))
    ));
    for (_, volume, result) in dest.events.volumes() {
        if volume != 10 {
            assert_eq!(result, Ok(()), "volume {volume}");
        }
    }
    assert_eq!(dest.queues.stops(13), 0);
    assert_eq!(dest.queues.resumes(10), 1);
    assert_eq!(dest.coordinator.destination_state(10), None);
    assert_eq!(dest.coordinator.state(), CoordinatorState::Idle);
    assert_eq!(dest.coordinator.stats().batches_aborted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_request_fails_volume() {
    let cluster = TestCluster::new(&[SOURCE_A, DEST], budget(1));
    let dest = cluster.node(DEST);
    seed_volume(&cluster.node(SOURCE_A).catalog, 10, 3);
    cluster.network.set_fault(DEST, SOURCE_A, Some(LinkFault::Reject));

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE_A, &[10, 11])]))
        .expect("start migration");
    wait_until("batch settled", || dest.events.batches().len() == 1).await;

    assert!(matches!(
        dest.events.batches()[0],
        Err(MigrationError::Transport(_))
    ));
    assert_eq!(dest.events.volumes().len(), 1);
    assert_eq!(dest.queues.stops(11), 0);
    assert_eq!(cluster.node(SOURCE_A).coordinator.source_state(10), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_source_is_reported_stalled() {
    let config = MigrationConfig {
        idle_timeout: Duration::from_millis(300),
        idle_check_interval: Duration::from_millis(50),
        ..test_config()
    };
    let cluster = TestCluster::new(&[SOURCE_A, DEST], config);
    let dest = cluster.node(DEST);
    seed_volume(&cluster.node(SOURCE_A).catalog, 10, 8);
    cluster.network.set_fault(SOURCE_A, DEST, Some(LinkFault::Drop));

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE_A, &[10])]))
        .expect("start migration");
    wait_until("batch settled", || dest.events.batches().len() == 1).await;

    assert_eq!(
        dest.events.batches(),
        vec![Err(MigrationError::Stalled { volume_id: 10 })]
    );
    assert_eq!(dest.queues.resumes(10), 1);
    assert!(dest
        .states
        .reason(10)
        .is_some_and(|reason| reason.contains("stalled")));
    assert!(cluster.network.dropped() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stray_and_late_messages_are_dropped() {
    let cluster = TestCluster::new(&[SOURCE_A, DEST, SOURCE_B], budget(1));
    let source = cluster.node(SOURCE_A);
    let dest = cluster.node(DEST);
    seed_volume(&source.catalog, 10, 4);

    dest.coordinator
        .start_migration(request(1, vec![group(SOURCE_A, &[10])]))
        .expect("start migration");
    wait_until("batch completion", || dest.events.batches().len() == 1).await;

    let late = MigrationMessage::DeltaBlobs(BlobDataBatch {
        volume_id: 10,
        seq: 0,
        last_batch: false,
        blobs: vec![BlobDataDelta {
            blob_name: "blob-0000".to_string(),
            objects: vec![BlobObject {
                offset: 0,
                object_id: Bytes::from_static(b"stale"),
            }],
        }],
    });
    assert_eq!(dest.coordinator.handle_message(SOURCE_A, late.clone()).await, Ok(()));
    assert_eq!(
        dest.coordinator.handle_message(SOURCE_B, late).await,
        Err(MigrationError::UnknownVolume { volume_id: 10 })
    );
    assert_eq!(
        dest.coordinator.destination_state(10),
        Some(ExecutorState::ApplyingForwardsInProgress)
    );

    wait_until("source forwarding", || {
        source.coordinator.source_state(10) == Some(SourceState::Forwarding)
    })
    .await;
    assert_eq!(source.coordinator.finish_forwarding(10), Ok(true));
    wait_until("finalization", || {
        dest.coordinator.destination_state(10).is_none()
    })
    .await;
    assert_parity(&source.catalog, &dest.catalog, 10);

    // Forwards after completion find no migration.
    let stray = MigrationMessage::Forward(ForwardEntry::finish(10, 1));
    assert_eq!(
        dest.coordinator.handle_message(SOURCE_A, stray).await,
        Err(MigrationError::UnknownVolume { volume_id: 10 })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_source_round_for_volume_is_rejected() {
    let cluster = TestCluster::new(&[SOURCE_A, DEST, SOURCE_B], test_config());
    let source = cluster.node(SOURCE_A);
    seed_volume(&source.catalog, 10, 2);
    let filter = || {
        MigrationMessage::InitialFilterSet(InitialFilterSet {
            volume_id: 10,
            placement_version: 1,
            blobs: Default::default(),
        })
    };

    // No destination is waiting on node 2, so the round parks in forwarding.
    assert_eq!(source.coordinator.handle_message(DEST, filter()).await, Ok(()));
    wait_until("source forwarding", || {
        source.coordinator.source_state(10) == Some(SourceState::Forwarding)
    })
    .await;
    assert_eq!(
        source.coordinator.handle_message(SOURCE_B, filter()).await,
        Err(MigrationError::Duplicate { volume_id: 10 })
    );

    source.coordinator.abort_migration();
    assert_eq!(source.coordinator.source_state(10), None);
    assert_eq!(source.catalog.open_snapshots(10), 0);
}
