//! Documents describing a stored backup.
//!
//! A backup `<name>` consists of:
//! - `<name>_backup_stop_sentinel.json`, written last, marking it complete;
//! - `<name>/files_metadata.json`, the per-file descriptions and the
//!   container-to-files mapping (older sentinels carry these inline);
//! - `<name>/metadata.json`, small extended metadata read by listings;
//! - `<name>/tar_partitions/`, the containers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::{is_not_found, FolderRef};
use crate::wal::Lsn;
use crate::{Error, Result};

pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const FILES_METADATA_FILE: &str = "files_metadata.json";
pub const TAR_PARTITIONS_FOLDER: &str = "tar_partitions";
/// Corrupt block numbers kept per file unless all are requested.
pub const MAX_CORRUPT_BLOCKS_STORED: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptBlocksInfo {
    #[serde(rename = "CorruptBlocksCount")]
    pub count: usize,
    #[serde(rename = "SomeCorruptBlocks")]
    pub some_blocks: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFileDescription {
    #[serde(rename = "IsIncremented")]
    pub is_incremented: bool,
    /// Unchanged since the parent; the data lives in an ancestor.
    #[serde(rename = "IsSkipped")]
    pub is_skipped: bool,
    #[serde(rename = "MTime")]
    pub mtime: DateTime<Utc>,
    #[serde(rename = "CorruptBlocks", default, skip_serializing_if = "Option::is_none")]
    pub corrupt_blocks: Option<CorruptBlocksInfo>,
    #[serde(rename = "UpdatesCount", default, skip_serializing_if = "is_zero")]
    pub updates_count: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl BackupFileDescription {
    pub fn skipped(mtime: DateTime<Utc>) -> Self {
        Self {
            is_incremented: false,
            is_skipped: true,
            mtime,
            corrupt_blocks: None,
            updates_count: 0,
        }
    }

    pub fn packed(mtime: DateTime<Utc>, is_incremented: bool) -> Self {
        Self {
            is_incremented,
            is_skipped: false,
            mtime,
            corrupt_blocks: None,
            updates_count: 0,
        }
    }

    pub fn set_corrupt_blocks(&mut self, mut blocks: Vec<u32>, store_all: bool) {
        if blocks.is_empty() {
            return;
        }
        let count = blocks.len();
        if !store_all {
            blocks.truncate(MAX_CORRUPT_BLOCKS_STORED);
        }
        self.corrupt_blocks = Some(CorruptBlocksInfo {
            count,
            some_blocks: blocks,
        });
    }
}

/// Data-directory-relative path to description.
pub type BackupFileList = BTreeMap<String, BackupFileDescription>;
/// Container name to the paths packed inside it.
pub type TarFileSets = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupSentinelDto {
    #[serde(rename = "LSN")]
    pub start_lsn: Option<Lsn>,
    #[serde(rename = "DeltaFromLSN", default, skip_serializing_if = "Option::is_none")]
    pub increment_from_lsn: Option<Lsn>,
    #[serde(rename = "DeltaFrom", default, skip_serializing_if = "Option::is_none")]
    pub increment_from: Option<String>,
    #[serde(rename = "DeltaFullName", default, skip_serializing_if = "Option::is_none")]
    pub increment_full_name: Option<String>,
    #[serde(rename = "DeltaCount", default, skip_serializing_if = "Option::is_none")]
    pub increment_count: Option<u32>,

    /// Inline file list of single-document sentinels.
    #[serde(rename = "Files", default, skip_serializing_if = "Option::is_none")]
    pub files: Option<BackupFileList>,
    #[serde(rename = "TarFileSets", default, skip_serializing_if = "Option::is_none")]
    pub tar_file_sets: Option<TarFileSets>,

    #[serde(rename = "PgVersion", default)]
    pub pg_version: u32,
    #[serde(rename = "FinishLSN", default)]
    pub finish_lsn: Option<Lsn>,
    #[serde(rename = "SystemIdentifier", default, skip_serializing_if = "Option::is_none")]
    pub system_identifier: Option<u64>,

    #[serde(rename = "UncompressedSize", default)]
    pub uncompressed_size: u64,
    #[serde(rename = "CompressedSize", default)]
    pub compressed_size: u64,

    #[serde(rename = "UserData", default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

impl BackupSentinelDto {
    pub fn is_incremental(&self) -> bool {
        self.increment_from.is_some()
    }

    /// Increment fields must be all present or all absent.
    pub fn validate(&self, name: &str) -> Result<()> {
        let present = [
            self.increment_from.is_some(),
            self.increment_from_lsn.is_some(),
            self.increment_full_name.is_some(),
            self.increment_count.is_some(),
        ];
        if present.iter().any(|p| *p) && !present.iter().all(|p| *p) {
            return Err(Error::InconsistentSentinel(name.to_string()).into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesMetadataDto {
    #[serde(rename = "Files", default)]
    pub files: BackupFileList,
    #[serde(rename = "TarFileSets", default)]
    pub tar_file_sets: TarFileSets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedMetadataDto {
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub hostname: String,
    pub data_dir: String,
    pub pg_version: u32,
    pub start_lsn: Lsn,
    pub finish_lsn: Lsn,
    pub is_permanent: bool,
    pub system_identifier: Option<u64>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

/// A named backup inside the base backups folder.
#[derive(Clone)]
pub struct Backup {
    pub name: String,
    folder: FolderRef,
}

impl std::fmt::Debug for Backup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backup").field("name", &self.name).finish()
    }
}

impl Backup {
    pub fn new(folder: FolderRef, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folder,
        }
    }

    pub fn sentinel_name(&self) -> String {
        format!("{}{SENTINEL_SUFFIX}", self.name)
    }

    /// The base backups folder holding this backup.
    pub fn base_folder(&self) -> &FolderRef {
        &self.folder
    }

    pub fn data_folder(&self) -> FolderRef {
        self.folder.sub_folder(&self.name)
    }

    pub fn tar_folder(&self) -> FolderRef {
        self.data_folder().sub_folder(TAR_PARTITIONS_FOLDER)
    }

    pub fn exists(&self) -> Result<bool> {
        self.folder.exists(&self.sentinel_name())
    }

    /// Fails with `Error::MissingBackup` when no sentinel is stored.
    pub fn fetch_sentinel(&self) -> Result<BackupSentinelDto> {
        let raw = match self.folder.read(&self.sentinel_name()) {
            Ok(raw) => raw,
            Err(e) if is_not_found(&e) => return Err(Error::MissingBackup(self.name.clone()).into()),
            Err(e) => return Err(e),
        };
        let sentinel: BackupSentinelDto = serde_json::from_slice(&raw)?;
        sentinel.validate(&self.name)?;
        Ok(sentinel)
    }

    /// File descriptions from `files_metadata.json`, falling back to the
    /// sentinel's inline list. `None` when the backup tracked no files.
    pub fn fetch_files_metadata(&self, sentinel: &BackupSentinelDto) -> Result<Option<FilesMetadataDto>> {
        match self.data_folder().read(FILES_METADATA_FILE) {
            Ok(raw) => return Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e),
        }
        debug!(backup = %self.name, "files_metadata_missing_using_sentinel");
        Ok(sentinel.files.as_ref().map(|files| FilesMetadataDto {
            files: files.clone(),
            tar_file_sets: sentinel.tar_file_sets.clone().unwrap_or_default(),
        }))
    }

    pub fn fetch_meta(&self) -> Result<ExtendedMetadataDto> {
        let raw = self.data_folder().read(METADATA_FILE)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn upload_meta(&self, meta: &ExtendedMetadataDto) -> Result<()> {
        self.data_folder().put(METADATA_FILE, &serde_json::to_vec(meta)?)
    }

    pub fn upload_files_metadata(&self, files: &FilesMetadataDto) -> Result<()> {
        self.data_folder().put(FILES_METADATA_FILE, &serde_json::to_vec(files)?)
    }

    /// Written last: its presence means the backup is complete.
    pub fn upload_sentinel(&self, sentinel: &BackupSentinelDto) -> Result<()> {
        self.folder.put(&self.sentinel_name(), &serde_json::to_vec(sentinel)?)
    }

    /// Permanence lives in the extended metadata; backups without it are not permanent.
    pub fn is_permanent(&self) -> Result<bool> {
        match self.fetch_meta() {
            Ok(meta) => Ok(meta.is_permanent),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
