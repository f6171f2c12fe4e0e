//! Delta files and part files recorded while WAL segments are archived.
//!
//! Each group of [`WAL_FILE_IN_DELTA`] segments has one delta file, fed by a
//! consumer thread, and one part file collecting the record fragments cut at
//! the segment boundaries. Both survive between `wal-push` invocations in the
//! local data folder until the group is complete and the delta is uploaded.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{DeltaFile, WalPartFile};
use crate::logging::{log_delta_flush, DeltaFlushSnapshot};
use crate::storage::{DataFolder, Uploader};
use crate::wal::{delta_filename_for, next_wal_filename, to_part_filename, WAL_FILE_IN_DELTA};
use crate::walparser::{extract_block_locations, BlockImageLayout, BlockLocation, WalParser};
use crate::Result;

enum DeltaMessage {
    Locations(Vec<BlockLocation>),
    Parser(WalParser),
}

/// A delta file being filled by a background consumer.
pub struct DeltaFileChanWriter {
    name: String,
    sender: Mutex<Option<Sender<DeltaMessage>>>,
    consumer: Mutex<Option<JoinHandle<DeltaFile>>>,
    closed: Mutex<Option<DeltaFile>>,
}

impl DeltaFileChanWriter {
    fn start(name: String, delta: DeltaFile) -> Self {
        let (tx, rx) = unbounded::<DeltaMessage>();
        let consumer = thread::spawn(move || consume_locations(delta, rx));
        Self {
            name,
            sender: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
            closed: Mutex::new(None),
        }
    }

    fn send(&self, message: DeltaMessage) {
        let delivered = self
            .sender
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok());
        if !delivered {
            warn!(delta = %self.name, "delta_writer_closed_message_dropped");
        }
    }

    pub fn record(&self, locations: Vec<BlockLocation>) {
        if !locations.is_empty() {
            self.send(DeltaMessage::Locations(locations));
        }
    }

    fn set_parser(&self, parser: WalParser) {
        self.send(DeltaMessage::Parser(parser));
    }

    /// Stop accepting locations and wait for the consumer to drain.
    pub fn close(&self) -> DeltaFile {
        drop(self.sender.lock().take());
        if let Some(consumer) = self.consumer.lock().take() {
            match consumer.join() {
                Ok(delta) => *self.closed.lock() = Some(delta),
                Err(_) => warn!(delta = %self.name, "delta_consumer_panicked"),
            }
        }
        self.closed.lock().clone().unwrap_or_default()
    }
}

fn consume_locations(mut delta: DeltaFile, rx: Receiver<DeltaMessage>) -> DeltaFile {
    while let Ok(message) = rx.recv() {
        match message {
            DeltaMessage::Locations(locations) => delta.locations.extend(locations),
            DeltaMessage::Parser(parser) => delta.wal_parser = parser,
        }
    }
    delta
}

/// Load-or-create registry of the delta and part files touched by this process.
///
/// Keys are delta filenames. Part files live on disk under the matching
/// `_part` name.
pub struct DeltaFileManager {
    data_folder: DataFolder,
    part_files: DashMap<String, Arc<Mutex<WalPartFile>>>,
    writers: DashMap<String, Arc<DeltaFileChanWriter>>,
    canceled: Mutex<HashSet<String>>,
    layout: Mutex<Option<BlockImageLayout>>,
}

impl DeltaFileManager {
    pub fn new(data_folder: DataFolder) -> Self {
        Self {
            data_folder,
            part_files: DashMap::new(),
            writers: DashMap::new(),
            canceled: Mutex::new(HashSet::new()),
            layout: Mutex::new(None),
        }
    }

    pub fn data_folder(&self) -> &DataFolder {
        &self.data_folder
    }

    /// Get or create the part file of a delta group, returning Arc to release DashMap lock.
    pub fn part_file(&self, delta_filename: &str) -> Result<Arc<Mutex<WalPartFile>>> {
        match self.part_files.entry(delta_filename.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let part_filename = to_part_filename(delta_filename);
                let part = match self.data_folder.open_read(&part_filename)? {
                    Some(mut file) => {
                        debug!(part = %part_filename, "part_file_loaded");
                        WalPartFile::load(&mut file)?
                    }
                    None => WalPartFile::new(),
                };
                Ok(entry.insert(Arc::new(Mutex::new(part))).clone())
            }
        }
    }

    /// Get or create the writer of a delta file, resuming a locally saved one.
    pub fn writer(&self, delta_filename: &str) -> Result<Arc<DeltaFileChanWriter>> {
        match self.writers.entry(delta_filename.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let delta = match self.data_folder.open_read(delta_filename)? {
                    Some(mut file) => {
                        debug!(delta = %delta_filename, "delta_file_resumed");
                        DeltaFile::load(&mut file)?
                    }
                    None => DeltaFile::new(WalParser::new()),
                };
                let writer = DeltaFileChanWriter::start(delta_filename.to_string(), delta);
                Ok(entry.insert(Arc::new(writer)).clone())
            }
        }
    }

    pub fn record_locations(&self, delta_filename: &str, locations: Vec<BlockLocation>) -> Result<()> {
        self.writer(delta_filename)?.record(locations);
        Ok(())
    }

    /// Drop everything recorded for `wal_filename`.
    ///
    /// The group of the following segment is canceled too: when this is the
    /// last segment of its group, the next group can never get its previous head.
    pub fn cancel_recording(&self, wal_filename: &str) -> Result<()> {
        let delta = delta_filename_for(wal_filename)?;
        let next_delta = delta_filename_for(&next_wal_filename(wal_filename)?)?;
        warn!(wal = %wal_filename, delta = %delta, "delta_recording_canceled");
        let mut canceled = self.canceled.lock();
        canceled.insert(delta);
        canceled.insert(next_delta);
        Ok(())
    }

    pub fn is_canceled(&self, delta_filename: &str) -> bool {
        self.canceled.lock().contains(delta_filename)
    }

    /// Remember the block image layout of the WAL being recorded.
    pub fn set_layout(&self, layout: BlockImageLayout) {
        *self.layout.lock() = Some(layout);
    }

    pub fn layout(&self) -> BlockImageLayout {
        self.layout.lock().unwrap_or_default()
    }

    /// Turn a complete part file into the final parser state and the
    /// locations of the records crossing segment boundaries.
    fn combine_part_file(&self, delta_filename: &str, part: &WalPartFile) -> Result<()> {
        let writer = self.writer(delta_filename)?;
        let last_head = part.heads[WAL_FILE_IN_DELTA as usize - 1].clone().unwrap_or_default();
        writer.set_parser(WalParser::from_record_head(last_head));
        let records = part.combine_records(self.layout())?;
        writer.record(extract_block_locations(&records));
        Ok(())
    }

    fn snapshot<V: Clone>(map: &DashMap<String, V>) -> Vec<(String, V)> {
        let mut entries: Vec<_> = map.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Combine complete part files into their deltas and save the rest
    /// locally. Returns the delta filenames whose part file completed.
    pub fn flush_part_files(&self) -> HashSet<String> {
        let mut completed = HashSet::new();
        for (delta_filename, part) in Self::snapshot(&self.part_files) {
            if self.is_canceled(&delta_filename) {
                continue;
            }
            let part = part.lock();
            if part.is_complete() {
                match self.combine_part_file(&delta_filename, &part) {
                    Ok(()) => {
                        completed.insert(delta_filename);
                    }
                    Err(e) => {
                        warn!(delta = %delta_filename, error = %format!("{e:#}"), "part_file_combine_failed");
                        self.canceled.lock().insert(delta_filename);
                    }
                }
                continue;
            }
            let part_filename = to_part_filename(&delta_filename);
            let saved = self
                .data_folder
                .open_write(&part_filename)
                .and_then(|mut file| part.save(&mut file));
            if let Err(e) = saved {
                warn!(part = %part_filename, error = %format!("{e:#}"), "part_file_save_failed");
                self.canceled.lock().insert(delta_filename);
            }
        }
        completed
    }

    /// Upload deltas whose part file completed; save the others locally.
    /// Failures are logged and leave the group to be rebuilt from WAL.
    pub fn flush_delta_files(&self, uploader: &Uploader, completed: &HashSet<String>) -> DeltaFlushSnapshot {
        let mut snapshot = DeltaFlushSnapshot::default();
        for (delta_filename, writer) in Self::snapshot(&self.writers) {
            let delta = writer.close();
            if self.is_canceled(&delta_filename) {
                snapshot.canceled += 1;
                continue;
            }
            let mut bytes = Vec::new();
            if let Err(e) = delta.save(&mut bytes) {
                warn!(delta = %delta_filename, error = %format!("{e:#}"), "delta_file_serialize_failed");
                continue;
            }
            if completed.contains(&delta_filename) {
                match uploader.upload(&delta_filename, &mut bytes.as_slice()) {
                    Ok(_) => {
                        info!(delta = %delta_filename, locations = delta.locations.len(), "delta_file_uploaded");
                        snapshot.completed += 1;
                    }
                    Err(e) => warn!(delta = %delta_filename, error = %format!("{e:#}"), "delta_file_upload_failed"),
                }
                continue;
            }
            let saved = self.data_folder.open_write(&delta_filename).and_then(|mut file| {
                std::io::Write::write_all(&mut file, &bytes)?;
                Ok(())
            });
            match saved {
                Ok(()) => snapshot.saved += 1,
                Err(e) => warn!(delta = %delta_filename, error = %format!("{e:#}"), "delta_file_save_failed"),
            }
        }
        snapshot
    }

    /// Load the saved deltas of groups this process only reached through
    /// their part file, so wiping the data folder doesn't lose them.
    fn resume_saved_deltas(&self) {
        for (delta_filename, _) in Self::snapshot(&self.part_files) {
            if self.writers.contains_key(&delta_filename) || !self.data_folder.exists(&delta_filename) {
                continue;
            }
            if let Err(e) = self.writer(&delta_filename) {
                warn!(delta = %delta_filename, error = %format!("{e:#}"), "delta_file_resume_failed");
                self.canceled.lock().insert(delta_filename);
            }
        }
    }

    /// Persist all recorded state: the data folder is rewritten from what this
    /// process holds, and completed deltas are uploaded.
    pub fn flush_files(&self, uploader: &Uploader) -> DeltaFlushSnapshot {
        self.resume_saved_deltas();
        if let Err(e) = self.data_folder.clean() {
            warn!(error = %format!("{e:#}"), "delta_data_folder_clean_failed");
        }
        let completed = self.flush_part_files();
        let snapshot = self.flush_delta_files(uploader, &completed);
        log_delta_flush(snapshot);
        snapshot
    }
}
