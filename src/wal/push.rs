//! `wal-push`: archive one WAL file, uploading ready neighbours in the background.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{is_wal_filename, next_wal_filename, parse_backup_history_filename};
use crate::config::Settings;
use crate::delta::{DeltaFileManager, WalDeltaRecordingReader};
use crate::logging::DeltaFlushSnapshot;
use crate::storage::{download_and_decompress, is_not_found, DataFolder, Folder, Uploader};
use crate::sync::{CancellationToken, Semaphore};
use crate::{Error, Result};

pub const DATA_FOLDER_NAME: &str = "pgdelta_data";
pub const ARCHIVE_STATUS_DIR: &str = "archive_status";
pub const DELTA_STATE_DIR: &str = "delta";
pub const READY_SUFFIX: &str = ".ready";
pub const DONE_SUFFIX: &str = ".done";
const HISTORY_SUFFIX: &str = ".history";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn file_name_of(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Cli(format!("not a file path: {}", path.display())).into())
}

/// Markers of WAL files already uploaded by a background worker, so the
/// `wal-push` the server issues later for them is a no-op.
#[derive(Debug, Clone)]
pub struct ArchiveStatusManager {
    folder: DataFolder,
}

impl ArchiveStatusManager {
    pub fn new(folder: DataFolder) -> Self {
        Self { folder }
    }

    pub fn is_uploaded(&self, wal_filename: &str) -> bool {
        self.folder.exists(wal_filename)
    }

    pub fn mark_uploaded(&self, wal_filename: &str) -> Result<()> {
        self.folder.create_empty(wal_filename)
    }

    pub fn unmark(&self, wal_filename: &str) -> Result<()> {
        self.folder.delete(wal_filename)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteCheck {
    NotArchived,
    /// Archived with identical content; the upload can be skipped.
    AlreadyArchived,
}

/// Compare a local WAL file with its archived copy.
/// Different content is `Error::CantOverwriteWalFile`.
pub fn check_wal_overwrite(folder: &dyn Folder, path: &Path) -> Result<OverwriteCheck> {
    let name = file_name_of(path)?;
    let mut archived = Vec::new();
    match download_and_decompress(folder, name) {
        Ok(mut reader) => {
            reader.read_to_end(&mut archived)?;
        }
        Err(e) if is_not_found(&e) => return Ok(OverwriteCheck::NotArchived),
        Err(e) => return Err(e.context(format!("checking archived copy of {name}"))),
    }
    let local = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if archived != local {
        return Err(Error::CantOverwriteWalFile(name.to_string()).into());
    }
    info!(wal = %name, "wal_already_archived_with_equal_content");
    Ok(OverwriteCheck::AlreadyArchived)
}

/// Uploads WAL files into the WAL folder, recording deltas when enabled.
pub struct WalUploader {
    uploader: Uploader,
    delta_manager: Option<Arc<DeltaFileManager>>,
    archive_status: ArchiveStatusManager,
    prevent_overwrite: bool,
}

impl WalUploader {
    pub fn new(
        uploader: Uploader,
        delta_manager: Option<Arc<DeltaFileManager>>,
        archive_status: ArchiveStatusManager,
        prevent_overwrite: bool,
    ) -> Self {
        Self {
            uploader,
            delta_manager,
            archive_status,
            prevent_overwrite,
        }
    }

    /// Uploader for WAL files living in `wal_dir`, keeping local state below it.
    pub fn configure(settings: &Settings, wal_dir: &Path) -> Result<Self> {
        let data_root = wal_dir.join(DATA_FOLDER_NAME);
        let archive_status = ArchiveStatusManager::new(DataFolder::new(data_root.join(ARCHIVE_STATUS_DIR))?);
        let delta_manager = if settings.use_wal_delta {
            Some(Arc::new(DeltaFileManager::new(DataFolder::new(data_root.join(DELTA_STATE_DIR))?)))
        } else {
            None
        };
        Ok(Self::new(
            Uploader::new(settings.wal_folder(), settings.compression),
            delta_manager,
            archive_status,
            settings.prevent_wal_overwrite,
        ))
    }

    pub fn archive_status(&self) -> &ArchiveStatusManager {
        &self.archive_status
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn delta_manager(&self) -> Option<&Arc<DeltaFileManager>> {
        self.delta_manager.as_ref()
    }

    pub fn upload_wal_file(&self, path: &Path) -> Result<()> {
        let name = file_name_of(path)?;
        if self.prevent_overwrite || name.ends_with(HISTORY_SUFFIX) {
            if check_wal_overwrite(self.uploader.folder().as_ref(), path)? == OverwriteCheck::AlreadyArchived {
                if let (Some(manager), true) = (&self.delta_manager, is_wal_filename(name)) {
                    manager.cancel_recording(name)?;
                }
                return Ok(());
            }
        }

        let open = || File::open(path).with_context(|| format!("opening {}", path.display()));
        match &self.delta_manager {
            Some(manager) if is_wal_filename(name) => {
                let mut reader = match WalDeltaRecordingReader::new(open()?, name, manager.clone()) {
                    Ok(reader) => reader,
                    Err(e) => {
                        warn!(wal = %name, error = %format!("{e:#}"), "wal_delta_recording_unavailable");
                        manager.cancel_recording(name)?;
                        self.uploader.upload(name, &mut open()?)?;
                        return Ok(());
                    }
                };
                if let Err(e) = self.uploader.upload(name, &mut reader) {
                    manager.cancel_recording(name)?;
                    return Err(e.context(format!("uploading {name}")));
                }
                reader.finish()?;
            }
            _ => {
                self.uploader
                    .upload(name, &mut open()?)
                    .with_context(|| format!("uploading {name}"))?;
            }
        }
        info!(wal = %name, "wal_file_uploaded");
        Ok(())
    }

    /// A backup history file marks where a base backup started: the part
    /// file of that group may only have been recorded from that segment on.
    pub fn handle_backup_history_file(&self, path: &Path) -> Result<()> {
        let Some(manager) = &self.delta_manager else {
            return Ok(());
        };
        let Some(history) = parse_backup_history_filename(file_name_of(path)?) else {
            return Ok(());
        };
        let delta_filename = history.segment.delta_no().filename(history.timeline);
        let part = manager.part_file(&delta_filename)?;
        let mut part = part.lock();
        if let Some(index) = part.partially_filled_from()? {
            debug!(delta = %delta_filename, index, "partially_filled_part_file_completed");
            part.complete_from(index);
        }
        Ok(())
    }

    pub fn flush_files(&self) -> Option<DeltaFlushSnapshot> {
        self.delta_manager
            .as_ref()
            .map(|manager| manager.flush_files(&self.uploader))
    }
}

/// Uploads WAL files the server has marked `.ready` while the foreground
/// upload runs, up to a total limit.
pub struct BgUploader {
    dir: PathBuf,
    foreground: String,
    uploader: Arc<WalUploader>,
    ready_rename: bool,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    max_uploaded: usize,
    uploaded: Arc<AtomicUsize>,
    started: Mutex<HashSet<String>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl BgUploader {
    /// `wal_path` is the file uploaded in the foreground; it is never picked up here.
    pub fn new(wal_path: &Path, uploader: Arc<WalUploader>, max_workers: usize, max_uploaded: usize, ready_rename: bool) -> Result<Arc<Self>> {
        let dir = wal_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let foreground = file_name_of(wal_path)?.to_string();
        let started = HashSet::from([foreground.clone()]);
        Ok(Arc::new(Self {
            dir,
            foreground,
            uploader,
            ready_rename,
            workers: Arc::new(Semaphore::new(max_workers)),
            cancel: CancellationToken::new(),
            max_uploaded,
            uploaded: Arc::new(AtomicUsize::new(0)),
            started: Mutex::new(started),
            handles: Mutex::new(Vec::new()),
            scanner: Mutex::new(None),
        }))
    }

    pub fn uploaded(&self) -> usize {
        self.uploaded.load(Ordering::SeqCst)
    }

    fn status_dir(&self) -> PathBuf {
        self.dir.join(ARCHIVE_STATUS_DIR)
    }

    pub fn start(self: &Arc<Self>) {
        if self.workers.capacity() == 0 || self.max_uploaded == 0 {
            return;
        }
        let this = self.clone();
        *self.scanner.lock() = Some(thread::spawn(move || this.scan_loop()));
    }

    fn scan_loop(self: Arc<Self>) {
        self.scan_next_segments();
        while !self.cancel.is_cancelled() {
            if let Err(e) = self.scan_once() {
                warn!(dir = %self.status_dir().display(), error = %format!("{e:#}"), "bg_upload_scan_failed");
                return;
            }
            let mut waited = Duration::ZERO;
            while waited < POLL_INTERVAL && !self.cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(100));
                waited += Duration::from_millis(100);
            }
        }
    }

    /// The segments right after the foreground one are the likeliest to be ready.
    fn scan_next_segments(self: &Arc<Self>) {
        let mut name = self.foreground.clone();
        for _ in 0..self.max_uploaded {
            let Ok(next) = next_wal_filename(&name) else {
                return;
            };
            if !self.status_dir().join(format!("{next}{READY_SUFFIX}")).exists() {
                return;
            }
            if !self.submit(&next) {
                return;
            }
            name = next;
        }
    }

    /// Submit every `.ready` file currently in the archive status directory.
    pub fn scan_once(self: &Arc<Self>) -> Result<()> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.status_dir())? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(wal) = name.strip_suffix(READY_SUFFIX) {
                names.push(wal.to_string());
            }
        }
        names.sort();
        for name in names {
            if !self.submit(&name) {
                break;
            }
        }
        Ok(())
    }

    /// Returns false once no more work may be started.
    fn submit(self: &Arc<Self>, wal_filename: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.uploader.archive_status().is_uploaded(wal_filename) || !self.started.lock().insert(wal_filename.to_string()) {
            return true;
        }
        if !self.workers.acquire(&self.cancel) {
            return false;
        }
        let this = self.clone();
        let wal_filename = wal_filename.to_string();
        let handle = thread::spawn(move || {
            if this.upload(&wal_filename) && this.uploaded.fetch_add(1, Ordering::SeqCst) + 1 >= this.max_uploaded {
                this.cancel.cancel();
            }
            this.workers.release();
        });
        self.handles.lock().push(handle);
        true
    }

    fn upload(&self, wal_filename: &str) -> bool {
        if let Err(e) = self.uploader.upload_wal_file(&self.dir.join(wal_filename)) {
            warn!(wal = %wal_filename, error = %format!("{e:#}"), "bg_upload_failed");
            return false;
        }
        if let Err(e) = self.uploader.archive_status().mark_uploaded(wal_filename) {
            warn!(wal = %wal_filename, error = %format!("{e:#}"), "bg_upload_mark_failed");
        }
        if self.ready_rename {
            let ready = self.status_dir().join(format!("{wal_filename}{READY_SUFFIX}"));
            let done = self.status_dir().join(format!("{wal_filename}{DONE_SUFFIX}"));
            if let Err(e) = fs::rename(&ready, &done) {
                warn!(wal = %wal_filename, error = %e, "ready_rename_failed");
            }
        }
        debug!(wal = %wal_filename, "bg_upload_finished");
        true
    }

    /// Start no new uploads and wait for the running ones.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(scanner) = self.scanner.lock().take() {
            let _ = scanner.join();
        }
        self.workers.wait_idle();
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
        let uploaded = self.uploaded();
        if uploaded > 0 {
            info!(uploaded, "bg_uploads_finished");
        }
    }
}

/// Archive `wal_path`: skip it if a background worker already did, else upload
/// it while neighbours go up in parallel, then persist delta state.
pub fn handle_wal_push(settings: &Settings, wal_path: &Path) -> Result<()> {
    let wal_dir = wal_path.parent().map(Path::to_path_buf).unwrap_or_default();
    let uploader = Arc::new(WalUploader::configure(settings, &wal_dir)?);
    let name = file_name_of(wal_path)?;
    if uploader.archive_status().is_uploaded(name) {
        if let Err(e) = uploader.archive_status().unmark(name) {
            warn!(wal = %name, error = %format!("{e:#}"), "archive_status_unmark_failed");
        }
        info!(wal = %name, "wal_uploaded_in_background_skipping");
        return Ok(());
    }

    let bg = BgUploader::new(
        wal_path,
        uploader.clone(),
        settings.background_upload_workers(),
        settings.total_bg_uploaded_limit.saturating_sub(1),
        settings.ready_rename,
    )?;
    bg.start();
    let result = uploader
        .upload_wal_file(wal_path)
        .and_then(|()| uploader.handle_backup_history_file(wal_path));
    bg.stop();
    result?;
    uploader.flush_files();
    Ok(())
}
