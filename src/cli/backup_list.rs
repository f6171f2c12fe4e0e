//! Implementation of `pgdelta backup-list`.

use clap::Args;

use crate::backup::list::{backup_details, render_backup_table};
use crate::config::Settings;
use crate::Result;

#[derive(Debug, Clone, Args, Default)]
pub struct BackupListArgs {
    /// Print JSON instead of a table
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,
}

pub fn execute(args: BackupListArgs, settings: Settings) -> Result<()> {
    let details = backup_details(&settings.basebackups_folder())?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&details)?);
    } else {
        print!("{}", render_backup_table(&details));
    }
    Ok(())
}
