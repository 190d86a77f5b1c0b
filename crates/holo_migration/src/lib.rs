//! Volume replica migration.
//!
//! A destination node catches a volume replica up to a live source replica
//! while the volume keeps accepting writes:
//! - the destination stops its volume queue and sends its blob version set
//! - the source snapshots its catalog with commit forwarding switched on,
//!   diffs, and streams bounded delta batches
//! - the destination applies object data, then descriptors, then the buffered
//!   forwarded commits, and keeps applying forwards until the source sends the
//!   end-of-forwarding marker
//!
//! Storage, queueing and transport are collaborators behind the traits in
//! [`types`]; [`local`] has in-process versions of all of them.

pub mod config;
pub mod coordinator;
pub mod destination;
pub mod diff;
pub mod error;
pub mod local;
pub mod sequence;
pub mod source;
pub mod stats;
pub mod types;

use std::sync::{Mutex, MutexGuard};

pub use config::MigrationConfig;
pub use coordinator::{CoordinatorState, MigrationCoordinator};
pub use destination::{ExecutorState, MigrationDestination};
pub use diff::{diff_blob_versions, DiffResult};
pub use error::{MigrationError, MigrationResult};
pub use sequence::{NestedSequenceTracker, SequenceTracker, SequenceWindow};
pub use source::{MigrationSource, SourceState};
pub use stats::MigrationStats;
pub use types::*;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
