//! Strategies for distributing files over containers.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backup::{Backup, FilesMetadataDto, TarFileSets};
use crate::page::increment::IncrementHeader;
use crate::page::DATABASE_PAGE_SIZE;
use crate::storage::find_stored_name;
use crate::{Error, Result};

use super::files::BundleFiles;
use super::packer::{ComposeFileInfo, PackOutcome, TarBallFilePacker};
use super::rating::RatingEvaluator;
use super::tarball::TarBallQueue;
use super::walker::WalkedEntry;

pub const COPY_PREFIX: &str = "copy_";

pub trait TarBallComposer {
    fn add_file(&mut self, cfi: ComposeFileInfo) -> Result<()>;

    /// Directories and links: a header without data.
    fn add_header(&mut self, entry: WalkedEntry) -> Result<()>;

    /// Unchanged since the parent backup.
    fn skip_file(&mut self, entry: &WalkedEntry);

    /// Wait for all packing; returns which container holds which files.
    fn finish_composing(self: Box<Self>) -> Result<TarFileSets>;

    fn files(&self) -> Arc<BundleFiles>;
}

fn record(sets: &Mutex<TarFileSets>, tar: &str, name: &str) {
    sets.lock().entry(tar.to_string()).or_default().push(name.to_string());
}

fn pack_one(queue: &TarBallQueue, packer: &TarBallFilePacker, sets: &Mutex<TarFileSets>, mut cfi: ComposeFileInfo) -> Result<()> {
    let mut tarball = queue.deque()?;
    let packed = packer.pack_file_into_tar(&mut cfi, &mut tarball);
    if let Ok(PackOutcome::Packed) = packed {
        record(sets, tarball.name(), &cfi.entry.name);
    }
    let requeued = match packed {
        Ok(_) => queue.check_size_and_enqueue_back(tarball),
        Err(_) => queue.enqueue_back(tarball),
    };
    packed?;
    requeued
}

fn write_header(queue: &TarBallQueue, files: &BundleFiles, sets: &Mutex<TarFileSets>, entry: &WalkedEntry) -> Result<()> {
    let mut tarball = queue.deque()?;
    let written = tarball.append_entry_header(entry);
    if written.is_ok() {
        record(sets, tarball.name(), &entry.name);
        files.add_file(&entry.name, entry.mtime, false);
    }
    queue.enqueue_back(tarball)?;
    written
}

/// Packs files as they arrive on a pool of workers, each filling whatever
/// container the queue hands out.
pub struct RegularTarBallComposer {
    queue: Arc<TarBallQueue>,
    files: Arc<BundleFiles>,
    tar_file_sets: Arc<Mutex<TarFileSets>>,
    tasks: Option<Sender<ComposeFileInfo>>,
    workers: Vec<JoinHandle<Result<()>>>,
}

impl RegularTarBallComposer {
    pub fn new(queue: Arc<TarBallQueue>, packer: Arc<TarBallFilePacker>, file_workers: usize) -> Self {
        let workers_count = file_workers.max(1);
        let (tx, rx) = bounded::<ComposeFileInfo>(workers_count);
        let tar_file_sets = Arc::new(Mutex::new(TarFileSets::new()));
        let workers = (0..workers_count)
            .map(|_| {
                let rx = rx.clone();
                let queue = queue.clone();
                let packer = packer.clone();
                let sets = tar_file_sets.clone();
                thread::spawn(move || -> Result<()> {
                    for cfi in rx.iter() {
                        pack_one(&queue, &packer, &sets, cfi)?;
                    }
                    Ok(())
                })
            })
            .collect();
        Self {
            queue,
            files: packer.files().clone(),
            tar_file_sets,
            tasks: Some(tx),
            workers,
        }
    }

    fn join_workers(&mut self) -> Result<()> {
        self.tasks.take();
        let mut first_error = None;
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(anyhow::anyhow!("pack worker panicked"));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl TarBallComposer for RegularTarBallComposer {
    fn add_file(&mut self, cfi: ComposeFileInfo) -> Result<()> {
        let sent = match &self.tasks {
            Some(tasks) => tasks.send(cfi).is_ok(),
            None => false,
        };
        if !sent {
            // every worker is gone; surface the error that stopped them
            self.join_workers()?;
            return Err(anyhow::anyhow!("pack workers stopped"));
        }
        Ok(())
    }

    fn add_header(&mut self, entry: WalkedEntry) -> Result<()> {
        write_header(&self.queue, &self.files, &self.tar_file_sets, &entry)
    }

    fn skip_file(&mut self, entry: &WalkedEntry) {
        self.files.add_skipped(&entry.name, entry.mtime);
    }

    fn finish_composing(mut self: Box<Self>) -> Result<TarFileSets> {
        self.join_workers()?;
        let sets = std::mem::take(&mut *self.tar_file_sets.lock());
        Ok(sets)
    }

    fn files(&self) -> Arc<BundleFiles> {
        self.files.clone()
    }
}

impl Drop for RegularTarBallComposer {
    fn drop(&mut self) {
        let _ = self.join_workers();
    }
}

struct RatedFile {
    cfi: ComposeFileInfo,
    rating: u64,
    expected_size: u64,
}

/// Collects every file first, then packs them sorted by update rating so
/// files that change together share containers.
pub struct RatingTarBallComposer {
    queue: Arc<TarBallQueue>,
    packer: Arc<TarBallFilePacker>,
    evaluator: Arc<dyn RatingEvaluator>,
    tar_size_threshold: u64,
    files_to_compose: Vec<RatedFile>,
    headers: Vec<WalkedEntry>,
}

impl RatingTarBallComposer {
    pub fn new(
        queue: Arc<TarBallQueue>,
        packer: Arc<TarBallFilePacker>,
        evaluator: Arc<dyn RatingEvaluator>,
        tar_size_threshold: u64,
    ) -> Self {
        Self {
            queue,
            packer,
            evaluator,
            tar_size_threshold,
            files_to_compose: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Size the file will take in a container: its length, or for an
    /// increment the header plus one page per changed block.
    fn expected_size(&self, cfi: &ComposeFileInfo) -> u64 {
        if !cfi.is_incremented {
            return cfi.entry.size;
        }
        let Some(map) = self.packer.delta_map() else {
            return cfi.entry.size;
        };
        match map.delta_bitmap_for(Path::new(&cfi.entry.name)) {
            Ok(bitmap) => {
                let blocks = bitmap.len() as u64;
                IncrementHeader {
                    file_size: cfi.entry.size,
                    blocks: Vec::new(),
                }
                .encoded_len()
                    + blocks * (4 + DATABASE_PAGE_SIZE as u64)
            }
            Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::NoBitmapFound(_))) => 0,
            Err(_) => cfi.entry.size,
        }
    }

    fn compose_collections(mut files: Vec<RatedFile>, threshold: u64) -> Vec<Vec<ComposeFileInfo>> {
        files.sort_by_key(|f| f.rating);
        let mut collections = Vec::new();
        let mut current: Vec<ComposeFileInfo> = Vec::new();
        let mut current_size = 0u64;
        let mut prev_rating = 0u64;
        for file in files {
            let starts_rated = prev_rating == 0 && file.rating > 0;
            if !current.is_empty() && (current_size > threshold || starts_rated) {
                collections.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current_size += file.expected_size;
            prev_rating = file.rating;
            current.push(file.cfi);
        }
        if !current.is_empty() {
            collections.push(current);
        }
        collections
    }
}

impl TarBallComposer for RatingTarBallComposer {
    fn add_file(&mut self, cfi: ComposeFileInfo) -> Result<()> {
        let updates = self.evaluator.updates_count(&cfi.entry.name);
        let rating = self.evaluator.evaluate(&cfi.entry.name, updates, cfi.was_in_base);
        let expected_size = self.expected_size(&cfi);
        self.files_to_compose.push(RatedFile {
            cfi,
            rating,
            expected_size,
        });
        Ok(())
    }

    fn add_header(&mut self, entry: WalkedEntry) -> Result<()> {
        self.headers.push(entry);
        Ok(())
    }

    fn skip_file(&mut self, entry: &WalkedEntry) {
        self.packer.files().add_skipped(&entry.name, entry.mtime);
    }

    fn finish_composing(self: Box<Self>) -> Result<TarFileSets> {
        let this = *self;
        let sets = Mutex::new(TarFileSets::new());
        let files = this.packer.files().clone();

        let mut headers_tar = this.queue.deque()?;
        for entry in &this.headers {
            headers_tar.append_entry_header(entry)?;
            record(&sets, headers_tar.name(), &entry.name);
            files.add_file(&entry.name, entry.mtime, false);
        }
        this.queue.enqueue_back(headers_tar)?;

        let collections = Self::compose_collections(this.files_to_compose, this.tar_size_threshold);
        info!(collections = collections.len(), "rated_files_composed");
        let queue = &this.queue;
        let packer = &this.packer;
        let sets_ref = &sets;
        crossbeam::thread::scope(|scope| -> Result<()> {
            let handles: Vec<_> = collections
                .into_iter()
                .map(|collection| {
                    scope.spawn(move |_| -> Result<()> {
                        let mut tarball = queue.deque()?;
                        let mut result = Ok(());
                        for mut cfi in collection {
                            match packer.pack_file_into_tar(&mut cfi, &mut tarball) {
                                Ok(PackOutcome::Packed) => record(sets_ref, tarball.name(), &cfi.entry.name),
                                Ok(_) => {}
                                Err(e) => {
                                    result = Err(e);
                                    break;
                                }
                            }
                        }
                        match result {
                            Ok(()) => queue.finish_tarball(tarball),
                            Err(e) => {
                                queue.enqueue_back(tarball)?;
                                Err(e)
                            }
                        }
                    })
                })
                .collect();
            let mut first_error = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(_) => {
                        first_error.get_or_insert(anyhow::anyhow!("rating pack worker panicked"));
                    }
                }
            }
            first_error.map_or(Ok(()), Err)
        })
        .map_err(|_| anyhow::anyhow!("rating pack scope panicked"))??;

        Ok(sets.into_inner())
    }

    fn files(&self) -> Arc<BundleFiles> {
        self.packer.files().clone()
    }
}

/// Reuses whole containers of the previous backup whose every entry is
/// unchanged, copying them inside storage; everything else is packed fresh.
pub struct CopyTarBallComposer {
    queue: Arc<TarBallQueue>,
    packer: Arc<TarBallFilePacker>,
    previous: Backup,
    previous_files: FilesMetadataDto,
    new_backup_name: String,
    entries: BTreeMap<String, CopyCandidate>,
}

enum CopyCandidate {
    File(ComposeFileInfo),
    Header(WalkedEntry),
}

impl CopyCandidate {
    fn entry(&self) -> &WalkedEntry {
        match self {
            Self::File(cfi) => &cfi.entry,
            Self::Header(entry) => entry,
        }
    }
}

impl CopyTarBallComposer {
    pub fn new(
        queue: Arc<TarBallQueue>,
        packer: Arc<TarBallFilePacker>,
        previous: Backup,
        previous_files: FilesMetadataDto,
        new_backup_name: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            packer,
            previous,
            previous_files,
            new_backup_name: new_backup_name.into(),
            entries: BTreeMap::new(),
        }
    }

    /// A previous container can be reused when it holds only full copies and
    /// every one of them is still present with the same modification time.
    fn is_reusable(&self, members: &[String]) -> bool {
        !members.is_empty()
            && members.iter().all(|name| {
                let (Some(desc), Some(current)) = (self.previous_files.files.get(name), self.entries.get(name)) else {
                    return false;
                };
                !desc.is_incremented && !desc.is_skipped && desc.mtime == current.entry().mtime
            })
    }

    fn copy_tar(&self, tar_name: &str) -> Result<String> {
        let stored = find_stored_name(self.previous.tar_folder().as_ref(), tar_name)?
            .ok_or_else(|| Error::ObjectNotFound(format!("{}/{tar_name}", self.previous.name)))?;
        let new_tar = format!("{COPY_PREFIX}{}", tar_name.strip_prefix(COPY_PREFIX).unwrap_or(tar_name));
        let new_stored = format!("{COPY_PREFIX}{}", stored.strip_prefix(COPY_PREFIX).unwrap_or(&stored));
        let tar_path = crate::backup::metadata::TAR_PARTITIONS_FOLDER;
        self.previous.base_folder().copy(
            &format!("{}/{tar_path}/{stored}", self.previous.name),
            &format!("{}/{tar_path}/{new_stored}", self.new_backup_name),
        )?;
        info!(from = %tar_name, to = %new_tar, "tarball_copied");
        Ok(new_tar)
    }
}

impl TarBallComposer for CopyTarBallComposer {
    fn add_file(&mut self, cfi: ComposeFileInfo) -> Result<()> {
        self.entries.insert(cfi.entry.name.clone(), CopyCandidate::File(cfi));
        Ok(())
    }

    fn add_header(&mut self, entry: WalkedEntry) -> Result<()> {
        self.entries.insert(entry.name.clone(), CopyCandidate::Header(entry));
        Ok(())
    }

    fn skip_file(&mut self, entry: &WalkedEntry) {
        self.packer.files().add_skipped(&entry.name, entry.mtime);
    }

    fn finish_composing(self: Box<Self>) -> Result<TarFileSets> {
        let mut this = *self;
        let sets = Mutex::new(TarFileSets::new());
        let files = this.packer.files().clone();

        let reusable: Vec<(String, Vec<String>)> = this
            .previous_files
            .tar_file_sets
            .iter()
            .filter(|(_, members)| this.is_reusable(members))
            .map(|(tar, members)| (tar.clone(), members.clone()))
            .collect();
        let mut copied: HashMap<String, String> = HashMap::new();
        for (tar, members) in reusable {
            let new_tar = this.copy_tar(&tar)?;
            for name in members {
                copied.insert(name, new_tar.clone());
            }
        }

        for (name, candidate) in std::mem::take(&mut this.entries) {
            if let Some(tar) = copied.get(&name) {
                record(&sets, tar, &name);
                files.add_file(&name, candidate.entry().mtime, false);
                continue;
            }
            match candidate {
                CopyCandidate::File(mut cfi) => {
                    cfi.is_incremented = false;
                    pack_one(&this.queue, &this.packer, &sets, cfi)?;
                }
                CopyCandidate::Header(entry) => write_header(&this.queue, &files, &sets, &entry)?,
            }
        }
        debug!(copied = copied.len(), "copy_composer_finished");
        Ok(sets.into_inner())
    }

    fn files(&self) -> Arc<BundleFiles> {
        self.packer.files().clone()
    }
}
