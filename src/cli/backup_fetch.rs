//! Implementation of `pgdelta backup-fetch`.

use std::path::PathBuf;

use clap::Args;

use crate::config::{FsyncMode, Settings};
use crate::restore::{RestoreEngine, RestoreOptions};
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct BackupFetchArgs {
    /// Directory to restore into; must be empty unless --catchup
    pub destination: PathBuf,

    /// Backup name, or LATEST
    pub backup_name: String,

    /// Download only containers holding files still required
    #[arg(long = "skip-redundant-tars", default_value_t = false)]
    pub skip_redundant_tars: bool,

    /// Apply a catch-up increment onto an existing cluster
    #[arg(long = "catchup", default_value_t = false)]
    pub catchup: bool,

    /// When restored files are synced to disk
    #[arg(long = "fsync", value_enum)]
    pub fsync: Option<FsyncMode>,
}

pub fn execute(args: BackupFetchArgs, mut settings: Settings) -> Result<()> {
    settings.skip_redundant_tars |= args.skip_redundant_tars;
    if let Some(fsync) = args.fsync {
        settings.fsync = fsync;
    }
    let engine = RestoreEngine::new(
        settings.basebackups_folder(),
        RestoreOptions::from_settings(&settings, args.catchup),
    );
    let summary = engine.fetch(&args.backup_name, &args.destination)?;
    println!("{} restored from {} link(s)", summary.backup, summary.links.len());
    Ok(())
}
