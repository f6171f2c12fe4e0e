//! Implementation of `pgdelta wal-fetch`.

use std::path::PathBuf;

use clap::Args;

use crate::config::Settings;
use crate::wal::fetch::fetch_wal_file;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct WalFetchArgs {
    /// Name of the archived WAL file (%f)
    pub wal_name: String,

    /// Where to put it (%p)
    pub destination: PathBuf,
}

pub fn execute(args: WalFetchArgs, settings: Settings) -> Result<()> {
    fetch_wal_file(settings.wal_folder().as_ref(), &args.wal_name, &args.destination)?;
    Ok(())
}
