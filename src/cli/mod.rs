//! Command line surface; one module per subcommand.

use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};

use crate::compression::CompressionMethod;
use crate::config::Settings;
use crate::logging::LogFormat;
use crate::Result;

pub mod backup_fetch;
pub mod backup_list;
pub mod backup_mark;
pub mod backup_push;
pub mod wal_fetch;
pub mod wal_push;
pub mod wal_verify;

#[derive(Debug, Clone)]
pub enum Command {
    BackupPush(backup_push::BackupPushArgs),
    BackupFetch(backup_fetch::BackupFetchArgs),
    BackupList(backup_list::BackupListArgs),
    BackupMark(backup_mark::BackupMarkArgs),
    WalPush(wal_push::WalPushArgs),
    WalFetch(wal_fetch::WalFetchArgs),
    WalVerify(wal_verify::WalVerifyArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
    pub global: GlobalArgs,
    pub log_format: LogFormat,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
            global: GlobalArgs::default(),
            log_format: LogFormat::Human,
        }
    }
}

/// Flags accepted by every subcommand; they override the config file.
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// JSON settings file (defaults to $PGDELTA_CONFIG)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Root directory of the backup storage
    #[arg(long = "storage", global = true)]
    pub storage: Option<PathBuf>,

    /// Compression for uploaded objects: lz4, zstd or none
    #[arg(long = "compression", global = true)]
    pub compression: Option<CompressionMethod>,
}

impl GlobalArgs {
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(storage) = &self.storage {
            settings.storage_path = storage.clone();
        }
        if let Some(compression) = self.compression {
            settings.compression = compression;
        }
        Ok(settings)
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    if matches!(args.command, Command::None) {
        return Ok(());
    }
    let settings = args.global.settings()?;
    match args.command {
        Command::BackupPush(a) => backup_push::execute(a, settings),
        Command::BackupFetch(a) => backup_fetch::execute(a, settings),
        Command::BackupList(a) => backup_list::execute(a, settings),
        Command::BackupMark(a) => backup_mark::execute(a, settings),
        Command::WalPush(a) => wal_push::execute(a, settings),
        Command::WalFetch(a) => wal_fetch::execute(a, settings),
        Command::WalVerify(a) => wal_verify::execute(a, settings),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "pgdelta", version, about = "Page-level incremental backups for PostgreSQL")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "human", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Take a base backup of a running cluster, incremental when possible.
    BackupPush(backup_push::BackupPushArgs),
    /// Restore a backup (and its increment chain) into a directory.
    BackupFetch(backup_fetch::BackupFetchArgs),
    /// List stored backups.
    BackupList(backup_list::BackupListArgs),
    /// Mark a backup and its ancestors permanent, or impermanent.
    BackupMark(backup_mark::BackupMarkArgs),
    /// Archive one WAL segment (archive_command).
    WalPush(wal_push::WalPushArgs),
    /// Restore one archived WAL segment (restore_command).
    WalFetch(wal_fetch::WalFetchArgs),
    /// Check that no WAL segment needed by the stored backups is missing.
    WalVerify(wal_verify::WalVerifyArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = match cli.command {
        Some(Subcommands::BackupPush(args)) => Command::BackupPush(args),
        Some(Subcommands::BackupFetch(args)) => Command::BackupFetch(args),
        Some(Subcommands::BackupList(args)) => Command::BackupList(args),
        Some(Subcommands::BackupMark(args)) => Command::BackupMark(args),
        Some(Subcommands::WalPush(args)) => Command::WalPush(args),
        Some(Subcommands::WalFetch(args)) => Command::WalFetch(args),
        Some(Subcommands::WalVerify(args)) => Command::WalVerify(args),
        None => Command::None,
    };

    Ok(CliArgs {
        command,
        global: cli.global,
        log_format: cli.log_format,
    })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
