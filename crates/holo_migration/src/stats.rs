//! Migration counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomically updated counters for `MigrationStats`.
#[derive(Default)]
pub(crate) struct MigrationMetrics {
    pub(crate) batches_started: AtomicU64,
    pub(crate) batches_completed: AtomicU64,
    pub(crate) batches_aborted: AtomicU64,
    pub(crate) volumes_handed_off: AtomicU64,
    pub(crate) volumes_finalized: AtomicU64,
    pub(crate) volumes_aborted: AtomicU64,
    pub(crate) data_batches_applied: AtomicU64,
    pub(crate) desc_batches_applied: AtomicU64,
    pub(crate) desc_batches_buffered: AtomicU64,
    pub(crate) objects_applied: AtomicU64,
    pub(crate) object_bytes_applied: AtomicU64,
    pub(crate) forwards_applied: AtomicU64,
    pub(crate) forwards_buffered: AtomicU64,
    pub(crate) forwards_dropped: AtomicU64,
    pub(crate) source_rounds_started: AtomicU64,
    pub(crate) source_rounds_failed: AtomicU64,
    pub(crate) source_batches_sent: AtomicU64,
    pub(crate) source_forwards_sent: AtomicU64,
}

impl MigrationMetrics {
    pub(crate) fn snapshot(&self, active_destinations: usize, active_sources: usize) -> MigrationStats {
        MigrationStats {
            batches_started: self.batches_started.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_aborted: self.batches_aborted.load(Ordering::Relaxed),
            volumes_handed_off: self.volumes_handed_off.load(Ordering::Relaxed),
            volumes_finalized: self.volumes_finalized.load(Ordering::Relaxed),
            volumes_aborted: self.volumes_aborted.load(Ordering::Relaxed),
            data_batches_applied: self.data_batches_applied.load(Ordering::Relaxed),
            desc_batches_applied: self.desc_batches_applied.load(Ordering::Relaxed),
            desc_batches_buffered: self.desc_batches_buffered.load(Ordering::Relaxed),
            objects_applied: self.objects_applied.load(Ordering::Relaxed),
            object_bytes_applied: self.object_bytes_applied.load(Ordering::Relaxed),
            forwards_applied: self.forwards_applied.load(Ordering::Relaxed),
            forwards_buffered: self.forwards_buffered.load(Ordering::Relaxed),
            forwards_dropped: self.forwards_dropped.load(Ordering::Relaxed),
            source_rounds_started: self.source_rounds_started.load(Ordering::Relaxed),
            source_rounds_failed: self.source_rounds_failed.load(Ordering::Relaxed),
            source_batches_sent: self.source_batches_sent.load(Ordering::Relaxed),
            source_forwards_sent: self.source_forwards_sent.load(Ordering::Relaxed),
            active_destinations: active_destinations as u64,
            active_sources: active_sources as u64,
        }
    }
}

/// Point-in-time view of a node's migration counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    pub batches_started: u64,
    pub batches_completed: u64,
    pub batches_aborted: u64,
    /// Volumes that reached the live-forwarding handoff.
    pub volumes_handed_off: u64,
    /// Volumes that applied the end-of-forwarding marker.
    pub volumes_finalized: u64,
    pub volumes_aborted: u64,
    pub data_batches_applied: u64,
    pub desc_batches_applied: u64,
    pub desc_batches_buffered: u64,
    pub objects_applied: u64,
    pub object_bytes_applied: u64,
    pub forwards_applied: u64,
    pub forwards_buffered: u64,
    pub forwards_dropped: u64,
    pub source_rounds_started: u64,
    pub source_rounds_failed: u64,
    /// Data and descriptor batches sent while acting as source.
    pub source_batches_sent: u64,
    pub source_forwards_sent: u64,
    pub active_destinations: u64,
    pub active_sources: u64,
}
