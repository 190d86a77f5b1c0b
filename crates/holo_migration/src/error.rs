//! Terminal errors reported for a volume migration or a migration batch.

use thiserror::Error;

use crate::types::VolumeId;

/// Error carried by every migration completion callback.
///
/// Collaborator failures arrive as `anyhow::Error` and are flattened into a
/// string at the seam so the error stays cheap to clone into callbacks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("migration aborted")]
    Aborted,
    #[error("migration of volume {volume_id} stalled")]
    Stalled { volume_id: VolumeId },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("volume {volume_id} already has an active migration")]
    Duplicate { volume_id: VolumeId },
    #[error("migration manager is cleaning up a previous batch")]
    NotReady,
    #[error("a migration batch is already in progress")]
    AlreadyInProgress,
    #[error("no active migration for volume {volume_id}")]
    UnknownVolume { volume_id: VolumeId },
    #[error("volume migration is disabled")]
    Disabled,
}

impl MigrationError {
    pub fn catalog(err: anyhow::Error) -> Self {
        MigrationError::Catalog(format!("{err:#}"))
    }

    pub fn transport(err: anyhow::Error) -> Self {
        MigrationError::Transport(format!("{err:#}"))
    }
}

pub type MigrationResult<T> = std::result::Result<T, MigrationError>;
