//! Implementation of `pgdelta backup-mark`.

use clap::Args;

use crate::backup::mark_backup;
use crate::config::Settings;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct BackupMarkArgs {
    /// Backup to mark
    pub backup_name: String,

    /// Remove the permanent mark instead of setting it
    #[arg(long = "impermanent", default_value_t = false)]
    pub impermanent: bool,
}

pub fn execute(args: BackupMarkArgs, settings: Settings) -> Result<()> {
    let changed = mark_backup(&settings.basebackups_folder(), &args.backup_name, !args.impermanent)?;
    for name in changed {
        println!("{name}");
    }
    Ok(())
}
