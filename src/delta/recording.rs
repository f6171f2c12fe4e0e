use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::manager::{DeltaFileChanWriter, DeltaFileManager};
use super::WalPartFile;
use crate::wal::{parse_wal_filename, WalSegmentNo, WAL_FILE_IN_DELTA};
use crate::walparser::{extract_block_locations, ParseError, WalParser, WAL_PAGE_SIZE};
use crate::{Error, Result};

/// Passes a WAL segment through unchanged while recording the block
/// locations of its records into the delta of the segment's group.
///
/// Recording problems never fail the read: the group is canceled and the
/// bytes keep flowing to the uploader.
pub struct WalDeltaRecordingReader<R> {
    inner: R,
    manager: Arc<DeltaFileManager>,
    wal_filename: String,
    timeline: u32,
    segment: WalSegmentNo,
    writer: Arc<DeltaFileChanWriter>,
    part_file: Arc<Mutex<WalPartFile>>,
    parser: WalParser,
    pending: Vec<u8>,
    tail_saved: bool,
    recording: bool,
}

impl<R: Read> WalDeltaRecordingReader<R> {
    pub fn new(inner: R, wal_filename: &str, manager: Arc<DeltaFileManager>) -> Result<Self> {
        let (timeline, segment) = parse_wal_filename(wal_filename)?;
        let delta_filename = segment.delta_no().filename(timeline);
        let writer = manager.writer(&delta_filename)?;
        let part_file = manager.part_file(&delta_filename)?;
        Ok(Self {
            inner,
            manager,
            wal_filename: wal_filename.to_string(),
            timeline,
            segment,
            writer,
            part_file,
            parser: WalParser::new(),
            pending: Vec::with_capacity(WAL_PAGE_SIZE),
            tail_saved: false,
            recording: true,
        })
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    fn cancel(&mut self, reason: &str) {
        if !self.recording {
            return;
        }
        self.recording = false;
        warn!(wal = %self.wal_filename, reason, "wal_delta_recording_stopped");
        if let Err(e) = self.manager.cancel_recording(&self.wal_filename) {
            warn!(wal = %self.wal_filename, error = %format!("{e:#}"), "wal_delta_cancel_failed");
        }
    }

    fn record_page(&mut self, page: &[u8]) -> Result<()> {
        let parsed = match self.parser.parse_records_from_page(page) {
            Ok(parsed) => parsed,
            Err(ParseError::ZeroPage) => return Ok(()),
            Err(e) => {
                self.parser.invalidate();
                return Err(e.into());
            }
        };
        self.manager.set_layout(parsed.layout);
        let has_discarded = parsed.discarded_tail.as_ref().is_some_and(|t| !t.is_empty());
        if parsed.discarded_tail.is_some() || !parsed.records.is_empty() {
            if !self.tail_saved {
                self.tail_saved = true;
                self.part_file.lock().tails[self.segment.position_in_delta()] =
                    Some(parsed.discarded_tail.unwrap_or_default());
            } else if has_discarded {
                return Err(Error::CantDiscardWalData(self.wal_filename.clone()).into());
            }
        }
        self.writer.record(extract_block_locations(&parsed.records));
        Ok(())
    }

    fn consume(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        while self.recording && self.pending.len() >= WAL_PAGE_SIZE {
            let page: Vec<u8> = self.pending.drain(..WAL_PAGE_SIZE).collect();
            if let Err(e) = self.record_page(&page) {
                self.cancel(&format!("{e:#}"));
            }
        }
    }

    /// Store the unfinished last record as the head of this segment, and as
    /// the previous head of the next group when this segment ends a group.
    pub fn finish(mut self) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        if !self.tail_saved {
            self.cancel("no record boundary seen in segment");
            return Ok(());
        }
        if !self.parser.has_current_record_beginning() && !self.parser.current_record_data().is_empty() {
            self.cancel("segment ends inside a record without its beginning");
            return Ok(());
        }
        let head = self.parser.current_record_data().to_vec();
        let idx = self.segment.position_in_delta();
        self.part_file.lock().heads[idx] = Some(head.clone());
        if idx as u64 == WAL_FILE_IN_DELTA - 1 {
            let next_delta = self.segment.next().delta_no().filename(self.timeline);
            self.manager.part_file(&next_delta)?.lock().previous_head = Some(head);
        }
        debug!(wal = %self.wal_filename, slot = idx, "wal_delta_recorded");
        Ok(())
    }
}

impl<R: Read> Read for WalDeltaRecordingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.inner.read(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
            Err(e) => {
                self.cancel(&e.to_string());
                return Err(e);
            }
        };
        if self.recording {
            self.consume(&buf[..n]);
        }
        Ok(n)
    }
}
