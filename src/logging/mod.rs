//! Logging initialization using `tracing` and `tracing-subscriber`.

use tracing::{info, warn};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Totals of one `backup-push`, emitted once the sentinel is uploaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackupPushSnapshot {
    pub files: usize,
    pub skipped: usize,
    pub incremented: usize,
    pub full: usize,
    pub tars: usize,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub corrupt_blocks: usize,
}

/// Outcome of unwrapping one link of a backup chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreLinkSnapshot {
    pub tars: usize,
    pub completed: usize,
    pub created_from_increment: usize,
    pub written_from_increment: usize,
    pub remaining: usize,
}

/// What a delta flush did with the groups recorded during this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaFlushSnapshot {
    pub completed: usize,
    pub saved: usize,
    pub canceled: usize,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

pub fn log_backup_push(backup: &str, snapshot: BackupPushSnapshot) {
    let level_warn = snapshot.corrupt_blocks > 0;
    if level_warn {
        warn!(
            target = "pgdelta::backup",
            backup,
            files = snapshot.files,
            corrupt_blocks = snapshot.corrupt_blocks,
            "backup_contains_corrupt_blocks"
        );
    }
    info!(
        target = "pgdelta::backup",
        backup,
        files = snapshot.files,
        skipped = snapshot.skipped,
        incremented = snapshot.incremented,
        full = snapshot.full,
        tars = snapshot.tars,
        uncompressed_size = snapshot.uncompressed_size,
        compressed_size = snapshot.compressed_size,
        "backup_push_finished"
    );
}

pub fn log_restore_link(backup: &str, snapshot: RestoreLinkSnapshot) {
    info!(
        target = "pgdelta::restore",
        backup,
        tars = snapshot.tars,
        completed = snapshot.completed,
        created_from_increment = snapshot.created_from_increment,
        written_from_increment = snapshot.written_from_increment,
        remaining = snapshot.remaining,
        "restore_link_unwrapped"
    );
}

/// Canceled groups are logged as a warning: their deltas will be rebuilt from WAL.
pub fn log_delta_flush(snapshot: DeltaFlushSnapshot) {
    if snapshot.canceled > 0 {
        warn!(
            target = "pgdelta::delta",
            completed = snapshot.completed,
            saved = snapshot.saved,
            canceled = snapshot.canceled,
            "delta_flush_with_canceled_groups"
        );
    } else {
        info!(
            target = "pgdelta::delta",
            completed = snapshot.completed,
            saved = snapshot.saved,
            "delta_flush_finished"
        );
    }
}
