//! Stored backups: naming, sentinels and metadata, chains, listing,
//! retention marks and the `backup-push` handler.

pub mod chain;
pub mod list;
pub mod mark;
pub mod metadata;
pub mod previous;
pub mod push;

pub use chain::{BackupChain, ChainLink};
pub use list::{backup_details, backup_times, latest_backup_name, BackupDetail, BackupTime};
pub use mark::mark_backup;
pub use metadata::{
    Backup, BackupFileDescription, BackupFileList, BackupSentinelDto, ExtendedMetadataDto, FilesMetadataDto,
    TarFileSets,
};

use crate::wal::WAL_FILENAME_LEN;

pub const BACKUP_NAME_PREFIX: &str = "base_";
pub const INCREMENT_INFIX: &str = "_D_";
/// Selector naming the newest backup.
pub const LATEST: &str = "LATEST";

/// `base_<wal>` for a full backup, `base_<wal>_D_<parent wal>` for an increment.
pub fn backup_name(start_wal_filename: &str, parent: Option<&str>) -> String {
    match parent {
        None => format!("{BACKUP_NAME_PREFIX}{start_wal_filename}"),
        Some(parent) => format!(
            "{BACKUP_NAME_PREFIX}{start_wal_filename}{INCREMENT_INFIX}{}",
            wal_segment_of(parent)
        ),
    }
}

/// The WAL segment name embedded in a backup name.
pub fn wal_segment_of(backup_name: &str) -> &str {
    let stripped = backup_name.strip_prefix(BACKUP_NAME_PREFIX).unwrap_or(backup_name);
    stripped.get(..WAL_FILENAME_LEN).unwrap_or(stripped)
}
