use thiserror::Error;

pub mod backup;
pub mod bundle;
pub mod cli;
pub mod compression;
pub mod config;
pub mod db;
pub mod delta;
pub mod logging;
pub mod page;
pub mod restore;
pub mod storage;
pub mod sync;
pub mod wal;
pub mod walparser;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid increment file header (wrong magic)")]
    InvalidIncrementFileHeader,
    #[error("unknown increment file header version {0:#04x}")]
    UnknownIncrementFileHeader(u8),
    #[error("increment data ended early: {0}")]
    IncrementTruncated(String),
    #[error("invalid page header in block {block} of {path}")]
    InvalidBlock { path: String, block: u32 },
    #[error("no delta bitmap found for {0}")]
    NoBitmapFound(String),
    #[error("unknown tablespace layout for {0}")]
    UnknownTableSpace(String),
    #[error("not a WAL segment file name: {0}")]
    NotWalFilename(String),
    #[error("invalid LSN: {0}")]
    InvalidLsn(String),
    #[error("WAL parse error: {0}")]
    WalParse(#[from] crate::walparser::ParseError),
    #[error("WAL data of {0} would be discarded after recording started")]
    CantDiscardWalData(String),
    #[error("part file is inconsistent: {0}")]
    PartFileInconsistent(String),
    #[error("tar size mismatch for {path}: expected {expected} bytes, wrote {actual}")]
    TarSizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("destination directory is not empty: {0}")]
    NonEmptyDataDirectory(String),
    #[error("pg_control container not found in backup {0}")]
    PgControlNotFound(String),
    #[error("timeline changed during backup: {started} -> {finished}")]
    TimelineChanged { started: u32, finished: u32 },
    #[error("previous backup {previous} finished at {previous_finish} after the current start {current_start}")]
    BackupFromFuture {
        previous: String,
        previous_finish: String,
        current_start: String,
    },
    #[error("previous backup {previous} is from another database (system id {expected} vs {actual})")]
    BackupFromOtherDb {
        previous: String,
        expected: u64,
        actual: u64,
    },
    #[error("backup chain contains a cycle near {0}")]
    ChainCycle(String),
    #[error("backup chain is out of LSN order at {0}")]
    ChainLsnOrder(String),
    #[error("inconsistent increment metadata in sentinel of {0}")]
    InconsistentSentinel(String),
    #[error("missing backup: {0}")]
    MissingBackup(String),
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("timeline history file not found: {0}")]
    HistoryFileNotFound(String),
    #[error("refusing to overwrite archived WAL file {0} with different content")]
    CantOverwriteWalFile(String),
    #[error("backup {0} is required by a permanent backup")]
    PermanentDependency(String),
    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(String),
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    logging::init_logging(cli_args.log_format)?;
    cli::dispatch(cli_args)
}
