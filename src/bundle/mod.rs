//! Composing a data directory into containers.
//!
//! The walk decides per entry whether it is skipped (unchanged since the
//! parent backup), packed as an increment, packed in full, or recorded as a
//! bare header. A [`composer::TarBallComposer`] distributes the packed
//! files over size-bounded containers drawn from a [`tarball::TarBallQueue`].
//! `pg_control` is held back and uploaded last.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::backup::BackupFileList;
use crate::config::Settings;
use crate::delta::DeltaMap;
use crate::page::is_paged_file;
use crate::wal::Lsn;
use crate::Result;

pub mod composer;
pub mod files;
pub mod packer;
pub mod rating;
pub mod tarball;
pub mod walker;

pub use composer::{CopyTarBallComposer, RatingTarBallComposer, RegularTarBallComposer, TarBallComposer};
pub use files::BundleFiles;
pub use packer::{ComposeFileInfo, PackerOptions, TarBallFilePacker};
pub use rating::{NoRating, RatingEvaluator, RelFileStatistics, StatisticsRating};
pub use tarball::{TarBall, TarBallMaker, TarBallQueue, TarBallQueueOptions};
pub use walker::{walk_data_dir, EntryKind, WalkedEntry};

pub const PG_CONTROL: &str = "pg_control";
pub const PG_CONTROL_PATH: &str = "global/pg_control";
pub const PG_CONTROL_TAR: &str = "pg_control.tar";
pub const BACKUP_LABEL: &str = "backup_label";
pub const TABLESPACE_MAP: &str = "tablespace_map";
pub const TABLESPACE_FOLDER: &str = "pg_tblspc";

/// Names never backed up. Directories among them are kept, empty.
pub const EXCLUDED_NAMES: &[&str] = &[
    "log",
    "pg_log",
    "pg_xlog",
    "pg_wal",
    "pgsql_tmp",
    "postgresql.auto.conf.tmp",
    "postmaster.pid",
    "postmaster.opts",
    "recovery.conf",
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_stat_tmp",
    "pg_snapshots",
    "pg_subtrans",
];

pub fn is_excluded(file_name: &str) -> bool {
    EXCLUDED_NAMES.contains(&file_name)
}

#[derive(Debug, Clone, Copy)]
pub struct BundleOptions {
    pub tar_size_threshold: u64,
    pub file_workers: usize,
    pub parallel_tarballs: usize,
    pub max_upload_queue: usize,
    pub packer: PackerOptions,
}

impl BundleOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tar_size_threshold: settings.tar_size_threshold,
            file_workers: settings.file_workers.max(1),
            parallel_tarballs: settings.upload_concurrency.max(1),
            max_upload_queue: settings.upload_concurrency.max(1),
            packer: PackerOptions {
                verify_page_checksums: settings.verify_page_checksums,
                store_all_corrupt_blocks: settings.store_all_corrupt_blocks,
            },
        }
    }

    pub fn queue_options(&self) -> TarBallQueueOptions {
        TarBallQueueOptions {
            tar_size_threshold: self.tar_size_threshold,
            parallel_tarballs: self.parallel_tarballs,
            max_upload_queue: self.max_upload_queue,
        }
    }
}

/// What an increment is taken against.
#[derive(Debug, Clone, Default)]
pub struct IncrementBase {
    pub lsn: Lsn,
    /// Parent file list; `None` when the parent tracked no files.
    pub files: Option<BackupFileList>,
    /// Treat every paged file as present in the parent (catch-up).
    pub force_incremental: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub entries: usize,
    pub data_size: u64,
}

pub struct Bundle {
    data_dir: PathBuf,
    base: Option<IncrementBase>,
    pg_control: Option<WalkedEntry>,
}

impl Bundle {
    pub fn new(data_dir: impl Into<PathBuf>, base: Option<IncrementBase>) -> Self {
        Self {
            data_dir: data_dir.into(),
            base,
            pg_control: None,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn increment_from_lsn(&self) -> Option<Lsn> {
        self.base.as_ref().map(|b| b.lsn)
    }

    pub fn base_files(&self) -> Option<&BackupFileList> {
        self.base.as_ref().and_then(|b| b.files.as_ref())
    }

    /// The packer for this bundle's increment base.
    pub fn packer(&self, delta_map: Option<Arc<DeltaMap>>, files: Arc<BundleFiles>, options: PackerOptions) -> TarBallFilePacker {
        TarBallFilePacker::new(delta_map, self.increment_from_lsn(), files, options)
    }

    /// Walk the data directory, handing each entry to `composer`.
    pub fn compose(&mut self, composer: &mut dyn TarBallComposer) -> Result<WalkSummary> {
        let mut summary = WalkSummary::default();
        for entry in walk_data_dir(&self.data_dir)? {
            summary.entries += 1;
            summary.data_size += entry.size;
            if entry.is_file() && entry.file_name() == PG_CONTROL && entry.name == PG_CONTROL_PATH {
                self.pg_control = Some(entry);
                continue;
            }
            self.add_to_bundle(entry, composer)?;
        }
        info!(entries = summary.entries, data_size = summary.data_size, "data_directory_walked");
        Ok(summary)
    }

    fn add_to_bundle(&self, entry: WalkedEntry, composer: &mut dyn TarBallComposer) -> Result<()> {
        if !entry.is_file() {
            return composer.add_header(entry);
        }
        let force_incremental = self.base.as_ref().is_some_and(|b| b.force_incremental);
        let base_file = self.base_files().and_then(|files| files.get(&entry.name));
        let was_in_base = base_file.is_some();

        if let Some(base_file) = base_file {
            if base_file.mtime == entry.mtime {
                debug!(file = %entry.name, "skipped due to unchanged modification time");
                composer.skip_file(&entry);
                return Ok(());
            }
        }
        let is_incremented = self.increment_from_lsn().is_some()
            && (was_in_base || force_incremental)
            && is_paged_file(Path::new(&entry.name), entry.size);
        composer.add_file(ComposeFileInfo {
            entry,
            was_in_base,
            is_incremented,
        })
    }

    /// `pg_control` as found by the last walk.
    pub fn pg_control(&self) -> Option<&WalkedEntry> {
        self.pg_control.as_ref()
    }
}

/// Upload the label and tablespace map returned by stop-backup, byte for
/// byte, in a container of their own. Returns the container and its members.
pub fn upload_label_files(queue: &TarBallQueue, label: &str, tablespace_map: &str) -> Result<(String, Vec<String>)> {
    let mut tarball = queue.new_tarball();
    tarball.append_bytes(BACKUP_LABEL, label.as_bytes())?;
    tarball.append_bytes(TABLESPACE_MAP, tablespace_map.as_bytes())?;
    let name = tarball.name().to_string();
    queue.close_tarball(tarball)?;
    info!(tar = %name, "label_files_uploaded");
    Ok((name, vec![BACKUP_LABEL.to_string(), TABLESPACE_MAP.to_string()]))
}

/// Upload `pg_control` alone; called only after everything else succeeded.
pub fn upload_pg_control(queue: &TarBallQueue, entry: &WalkedEntry) -> Result<String> {
    let mut tarball = queue.named_tarball(PG_CONTROL_TAR);
    let file = packer::open_for_packing(&entry.path)?;
    tarball.append_file(entry, entry.size, file)?;
    queue.close_tarball(tarball)?;
    info!(file = %entry.name, "pg_control_uploaded");
    Ok(PG_CONTROL_TAR.to_string())
}
