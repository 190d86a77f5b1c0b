//! Runtime configuration for the migration core.

use std::time::Duration;

use anyhow::{Context, Result};

/// Tunables shared by the coordinator, sources and destinations on a node.
#[derive(Clone, Debug)]
pub struct MigrationConfig {
    /// When false, migration requests are acknowledged without doing work.
    pub enabled: bool,
    /// Number of volumes a node migrates concurrently as destination.
    pub max_concurrent_migrations: usize,
    /// Upper bound on blobs packed into one data delta batch.
    pub max_blobs_per_batch: usize,
    /// Upper bound on descriptors packed into one descriptor delta batch.
    pub max_descs_per_batch: usize,
    /// A delta stream that makes no progress for this long aborts the volume.
    pub sequence_timeout: Duration,
    /// A destination stuck in static migration without applying anything for
    /// this long is considered stalled.
    pub idle_timeout: Duration,
    /// Period of the stall sweep while a batch is active. Zero disables it.
    pub idle_check_interval: Duration,
    /// Timeout for request/response messages (initial filter set).
    pub rpc_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_migrations: 1,
            max_blobs_per_batch: 64,
            max_descs_per_batch: 64,
            sequence_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            idle_check_interval: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(15),
        }
    }
}

impl MigrationConfig {
    /// Build a config from `HOLO_MIGRATION_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let enabled = parse_bool(
            std::env::var("HOLO_MIGRATION_ENABLED").ok(),
            defaults.enabled,
        )?;
        let max_concurrent_migrations = parse_usize(
            std::env::var("HOLO_MIGRATION_MAX_CONCURRENCY").ok(),
            defaults.max_concurrent_migrations,
        )?
        .max(1);
        let max_blobs_per_batch = parse_usize(
            std::env::var("HOLO_MIGRATION_MAX_DELTA_BLOBS").ok(),
            defaults.max_blobs_per_batch,
        )?
        .max(1);
        let max_descs_per_batch = parse_usize(
            std::env::var("HOLO_MIGRATION_MAX_DELTA_BLOB_DESCS").ok(),
            defaults.max_descs_per_batch,
        )?
        .max(1);
        let sequence_timeout_ms = parse_u64(
            std::env::var("HOLO_MIGRATION_SEQUENCE_TIMEOUT_MS").ok(),
            duration_ms(defaults.sequence_timeout),
        )?;
        let idle_timeout_ms = parse_u64(
            std::env::var("HOLO_MIGRATION_IDLE_TIMEOUT_MS").ok(),
            duration_ms(defaults.idle_timeout),
        )?;
        let idle_check_interval_ms = parse_u64(
            std::env::var("HOLO_MIGRATION_IDLE_CHECK_INTERVAL_MS").ok(),
            duration_ms(defaults.idle_check_interval),
        )?;
        let rpc_timeout_ms = parse_u64(
            std::env::var("HOLO_MIGRATION_RPC_TIMEOUT_MS").ok(),
            duration_ms(defaults.rpc_timeout),
        )?;

        Ok(Self {
            enabled,
            max_concurrent_migrations,
            max_blobs_per_batch,
            max_descs_per_batch,
            sequence_timeout: Duration::from_millis(sequence_timeout_ms),
            idle_timeout: Duration::from_millis(idle_timeout_ms),
            idle_check_interval: Duration::from_millis(idle_check_interval_ms),
            rpc_timeout: Duration::from_millis(rpc_timeout_ms),
        })
    }

    /// Concurrency budget actually used for admission.
    pub fn concurrency_budget(&self) -> usize {
        self.max_concurrent_migrations.max(1)
    }
}

fn duration_ms(value: Duration) -> u64 {
    value.as_millis().min(u128::from(u64::MAX)) as u64
}

fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    match value {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("invalid bool value: {raw}"),
        },
        None => Ok(default_value),
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}
