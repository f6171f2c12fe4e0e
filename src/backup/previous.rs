//! Choosing the backup an increment is taken against.

use tracing::info;

use crate::config::Settings;
use crate::storage::FolderRef;
use crate::wal::{format_lsn, Lsn};
use crate::Result;

use super::list::latest_backup_name;
use super::metadata::{Backup, BackupSentinelDto, FilesMetadataDto};

/// The parent of a new increment.
#[derive(Debug, Clone)]
pub struct PreviousBackup {
    /// `None` for the synthetic parent of a catch-up backup.
    pub name: Option<String>,
    pub sentinel: BackupSentinelDto,
    /// File list of the parent. `None` means nothing can be skipped.
    pub files: Option<FilesMetadataDto>,
}

impl PreviousBackup {
    pub fn start_lsn(&self) -> Option<Lsn> {
        self.sentinel.start_lsn
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeltaBase {
    pub previous: Option<PreviousBackup>,
    /// Depth of the new backup in its chain; 0 for a full backup.
    pub increment_count: u32,
}

impl DeltaBase {
    pub fn full() -> Self {
        Self::default()
    }
}

/// The newest stored backup, whose unchanged containers the copy composer reuses.
#[derive(Debug, Clone)]
pub struct CopySource {
    pub name: String,
    pub files: FilesMetadataDto,
}

impl CopySource {
    /// `None` when storage is empty or the newest backup tracked no files.
    pub fn latest(folder: &FolderRef) -> Result<Option<Self>> {
        let Some(name) = latest_backup_name(folder.as_ref())? else {
            info!("no previous backup to copy containers from");
            return Ok(None);
        };
        let backup = Backup::new(folder.clone(), name.clone());
        let sentinel = backup.fetch_sentinel()?;
        match backup.fetch_files_metadata(&sentinel)? {
            Some(files) => Ok(Some(Self { name, files })),
            None => {
                info!(previous = %name, "previous backup has no file list, nothing to copy");
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DeltaBackupConfigurator {
    /// Increment against the newest backup, unless `force_full`.
    Regular { force_full: bool },
    /// Increment against everything changed after `from_lsn`.
    Catchup { from_lsn: Lsn },
}

impl DeltaBackupConfigurator {
    pub fn configure(&self, folder: &FolderRef, settings: &Settings, is_permanent: bool) -> Result<DeltaBase> {
        match *self {
            Self::Regular { force_full: true } => Ok(DeltaBase::full()),
            Self::Regular { force_full: false } => configure_regular(folder, settings, is_permanent),
            Self::Catchup { from_lsn } => Ok(DeltaBase {
                previous: Some(PreviousBackup {
                    name: None,
                    sentinel: BackupSentinelDto {
                        start_lsn: Some(from_lsn),
                        ..Default::default()
                    },
                    files: None,
                }),
                increment_count: 1,
            }),
        }
    }

    pub fn is_catchup(&self) -> bool {
        matches!(self, Self::Catchup { .. })
    }
}

fn configure_regular(folder: &FolderRef, settings: &Settings, is_permanent: bool) -> Result<DeltaBase> {
    if settings.delta_max_steps == 0 {
        return Ok(DeltaBase::full());
    }
    let Some(mut name) = latest_backup_name(folder.as_ref())? else {
        info!("no previous backup found, doing a full backup");
        return Ok(DeltaBase::full());
    };

    let mut backup = Backup::new(folder.clone(), name.clone());
    let mut sentinel = backup.fetch_sentinel()?;
    let mut increment_count = sentinel.increment_count.map_or(1, |count| count + 1);
    if increment_count > settings.delta_max_steps {
        info!(previous = %name, increment_count, "max delta steps reached, doing a full backup");
        return Ok(DeltaBase::full());
    }
    if sentinel.start_lsn.is_none() {
        info!(previous = %name, "previous backup has no start LSN, doing a full backup");
        return Ok(DeltaBase::full());
    }
    let meta = match backup.fetch_meta() {
        Ok(meta) => meta,
        Err(e) => {
            info!(previous = %name, error = %e, "previous backup metadata unreadable, doing a full backup");
            return Ok(DeltaBase::full());
        }
    };
    if !is_permanent && !settings.delta_from_full && meta.is_permanent {
        info!(previous = %name, "previous backup is permanent, doing a full backup");
        return Ok(DeltaBase::full());
    }

    if settings.delta_from_full {
        if let Some(full_name) = sentinel.increment_full_name.clone() {
            name = full_name;
            backup = Backup::new(folder.clone(), name.clone());
            sentinel = backup.fetch_sentinel()?;
        }
        increment_count = 1;
        info!(previous = %name, "delta will be taken from the full backup");
    }

    let files = backup.fetch_files_metadata(&sentinel)?;
    info!(
        previous = %name,
        lsn = %sentinel.start_lsn.map(format_lsn).unwrap_or_default(),
        "delta_backup_base_selected"
    );
    Ok(DeltaBase {
        previous: Some(PreviousBackup {
            name: Some(name),
            sentinel,
            files,
        }),
        increment_count,
    })
}
