//! Implementation of `pgdelta wal-push`.

use std::path::PathBuf;

use clap::Args;

use crate::config::Settings;
use crate::wal::push::handle_wal_push;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct WalPushArgs {
    /// Path of the WAL file to archive (%p)
    pub wal_path: PathBuf,
}

pub fn execute(args: WalPushArgs, settings: Settings) -> Result<()> {
    handle_wal_push(&settings, &args.wal_path)
}
