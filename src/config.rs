//! Settings shared by every command, loaded from an optional JSON file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compression::CompressionMethod;
use crate::storage::{FolderRef, FsFolder, BASEBACKUPS_PATH, WAL_PATH};
use crate::Result;

pub const CONFIG_ENV: &str = "PGDELTA_CONFIG";

/// How files are grouped into containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ComposerKind {
    #[default]
    Regular,
    Rating,
    Copy,
}

/// When restored files are synced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    #[default]
    None,
    /// Each file right after it is written.
    File,
    /// All files of a container once it is fully extracted.
    Tar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage_path: PathBuf,
    pub compression: CompressionMethod,
    /// Longest increment chain; 0 makes every backup a full one.
    pub delta_max_steps: u32,
    /// Base increments on the chain's full backup instead of the latest one.
    pub delta_from_full: bool,
    /// Record delta files while pushing WAL.
    pub use_wal_delta: bool,
    pub tar_size_threshold: u64,
    pub upload_concurrency: usize,
    pub file_workers: usize,
    pub download_concurrency: usize,
    pub verify_page_checksums: bool,
    pub store_all_corrupt_blocks: bool,
    pub composer: ComposerKind,
    pub fsync: FsyncMode,
    pub skip_redundant_tars: bool,
    pub without_files_metadata: bool,
    pub pg_connection: String,
    pub total_bg_uploaded_limit: usize,
    pub prevent_wal_overwrite: bool,
    pub ready_rename: bool,
    /// Missing segments right after the current one reported as delayed by `wal-verify`.
    pub max_delayed_segments: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("pgdelta_storage"),
            compression: CompressionMethod::Lz4,
            delta_max_steps: 0,
            delta_from_full: false,
            use_wal_delta: false,
            tar_size_threshold: 1 << 30,
            upload_concurrency: 16,
            file_workers: 4,
            download_concurrency: 10,
            verify_page_checksums: false,
            store_all_corrupt_blocks: false,
            composer: ComposerKind::Regular,
            fsync: FsyncMode::None,
            skip_redundant_tars: false,
            without_files_metadata: false,
            pg_connection: "host=localhost user=postgres".to_string(),
            total_bg_uploaded_limit: 32,
            prevent_wal_overwrite: false,
            ready_rename: true,
            max_delayed_segments: 0,
        }
    }
}

impl Settings {
    /// Settings from `path`, or from `$PGDELTA_CONFIG` when no path is given.
    /// Without either, the defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => env::var_os(CONFIG_ENV).map(PathBuf::from),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
        let settings: Settings =
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        debug!(config = %path.display(), "config_loaded");
        Ok(settings)
    }

    pub fn storage_root(&self) -> FolderRef {
        Arc::new(FsFolder::new(&self.storage_path))
    }

    pub fn basebackups_folder(&self) -> FolderRef {
        self.storage_root().sub_folder(BASEBACKUPS_PATH)
    }

    pub fn wal_folder(&self) -> FolderRef {
        self.storage_root().sub_folder(WAL_PATH)
    }

    /// Parallel background WAL uploads; one slot stays with the foreground push.
    pub fn background_upload_workers(&self) -> usize {
        self.upload_concurrency.saturating_sub(1)
    }
}
