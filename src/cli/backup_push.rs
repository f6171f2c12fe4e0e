//! Implementation of `pgdelta backup-push`.

use std::path::PathBuf;

use clap::Args;
use tracing::{info, warn};

use crate::backup::previous::DeltaBackupConfigurator;
use crate::backup::push::{BackupPushHandler, BackupPushOptions};
use crate::config::{ComposerKind, Settings};
use crate::db::PgBackupControl;
use crate::sync::CancellationToken;
use crate::wal::parse_lsn;
use crate::{Error, Result};

#[derive(Debug, Clone, Args)]
pub struct BackupPushArgs {
    /// Data directory of the running cluster
    pub pgdata: PathBuf,

    /// Take a full backup even when an increment is possible
    #[arg(long = "full", default_value_t = false)]
    pub full: bool,

    /// Mark the new backup (and its ancestors) permanent
    #[arg(long = "permanent", default_value_t = false)]
    pub permanent: bool,

    /// How files are grouped into containers
    #[arg(long = "composer", value_enum)]
    pub composer: Option<ComposerKind>,

    /// Verify page checksums while reading relation files
    #[arg(long = "verify", default_value_t = false)]
    pub verify: bool,

    /// Record every corrupt block instead of the first few
    #[arg(long = "store-all-corrupt", default_value_t = false)]
    pub store_all_corrupt: bool,

    /// Take an increment of everything changed after this LSN (X/X)
    #[arg(long = "catchup-from-lsn", conflicts_with = "full")]
    pub catchup_from_lsn: Option<String>,

    /// JSON document stored with the backup
    #[arg(long = "user-data")]
    pub user_data: Option<String>,
}

pub fn execute(args: BackupPushArgs, mut settings: Settings) -> Result<()> {
    if let Some(composer) = args.composer {
        settings.composer = composer;
    }
    settings.verify_page_checksums |= args.verify;
    settings.store_all_corrupt_blocks |= args.store_all_corrupt;

    let configurator = match &args.catchup_from_lsn {
        Some(lsn) => DeltaBackupConfigurator::Catchup {
            from_lsn: parse_lsn(lsn)?,
        },
        None => DeltaBackupConfigurator::Regular { force_full: args.full },
    };
    let user_data = args
        .user_data
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| Error::Cli(format!("--user-data is not valid JSON: {e}")))?;

    let cancel = CancellationToken::new();
    if let Err(e) = ctrlc::set_handler({
        let cancel = cancel.clone();
        move || cancel.cancel()
    }) {
        warn!(error = %e, "failed to install signal handler");
    }

    let mut control = PgBackupControl::connect(&settings.pg_connection)?;
    let handler = BackupPushHandler::new(
        settings.clone(),
        settings.basebackups_folder(),
        settings.wal_folder(),
        cancel,
    );
    let result = handler.push(
        &mut control,
        &BackupPushOptions {
            data_dir: args.pgdata,
            configurator,
            is_permanent: args.permanent,
            user_data,
        },
    )?;
    info!(backup = %result.name, "backup_pushed");
    println!("{}", result.name);
    Ok(())
}
