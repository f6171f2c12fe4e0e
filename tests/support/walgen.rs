//! Synthetic WAL for tests: heap-like records laid out over pages and
//! segments the way the server writes them.
#![allow(dead_code)]

use pgdelta::walparser::{BlockLocation, WAL_PAGE_SIZE};

pub const PAGE_MAGIC_PG16: u16 = 0xD113;
pub const PAGE_MAGIC_PG14: u16 = 0xD10D;

const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
const XLP_LONG_HEADER: u16 = 0x0002;
const SHORT_HEADER_LEN: usize = 24;
const LONG_HEADER_LEN: usize = 40;
const RM_HEAP_ID: u8 = 10;
const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// A record touching `blocks` (each carrying 4 bytes of block data) with
/// `main_data` appended. Consecutive blocks of one relation use the
/// same-relation shortcut.
pub fn heap_record(blocks: &[BlockLocation], main_data: &[u8]) -> Vec<u8> {
    let mut headers = Vec::new();
    let mut payloads = Vec::new();
    let mut previous = None;
    for (id, block) in blocks.iter().enumerate() {
        let same_rel = previous == Some(block.rel);
        let flags = 0x20 | if same_rel { 0x80 } else { 0 };
        headers.push(id as u8);
        headers.push(flags);
        headers.extend_from_slice(&4u16.to_le_bytes());
        if !same_rel {
            headers.extend_from_slice(&block.rel.spc_node.to_le_bytes());
            headers.extend_from_slice(&block.rel.db_node.to_le_bytes());
            headers.extend_from_slice(&block.rel.rel_node.to_le_bytes());
        }
        headers.extend_from_slice(&block.block_no.to_le_bytes());
        payloads.extend_from_slice(&[0xB0 | id as u8; 4]);
        previous = Some(block.rel);
    }
    if !main_data.is_empty() {
        if main_data.len() <= u8::MAX as usize {
            headers.push(255);
            headers.push(main_data.len() as u8);
        } else {
            headers.push(254);
            headers.extend_from_slice(&(main_data.len() as u32).to_le_bytes());
        }
    }

    let total = 24 + headers.len() + payloads.len() + main_data.len();
    let mut record = Vec::with_capacity(total);
    record.extend_from_slice(&(total as u32).to_le_bytes());
    record.extend_from_slice(&42u32.to_le_bytes());
    record.extend_from_slice(&0u64.to_le_bytes());
    record.push(0);
    record.push(RM_HEAP_ID);
    record.extend_from_slice(&[0, 0]);
    record.extend_from_slice(&0u32.to_le_bytes());
    record.extend_from_slice(&headers);
    record.extend_from_slice(&payloads);
    record.extend_from_slice(main_data);
    record
}

/// An `XLOG_SWITCH` record: nothing after it in the segment is WAL.
pub fn switch_record() -> Vec<u8> {
    let mut record = Vec::with_capacity(24);
    record.extend_from_slice(&24u32.to_le_bytes());
    record.extend_from_slice(&0u32.to_le_bytes());
    record.extend_from_slice(&0u64.to_le_bytes());
    record.push(0x40);
    record.push(0);
    record.extend_from_slice(&[0, 0]);
    record.extend_from_slice(&0u32.to_le_bytes());
    record
}

/// Writes consecutive segments of one timeline. A record that doesn't fit
/// into a segment continues in the next one.
pub struct WalStream {
    pub timeline: u32,
    pub segment: u64,
    pub pages_per_segment: usize,
    pub magic: u16,
    pending: Vec<u8>,
}

impl WalStream {
    pub fn new(timeline: u32, first_segment: u64, pages_per_segment: usize) -> Self {
        Self {
            timeline,
            segment: first_segment,
            pages_per_segment,
            magic: PAGE_MAGIC_PG16,
            pending: Vec::new(),
        }
    }

    /// Bytes of the record still to be written into the next segment.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Lay out the continuation of the previous segment and then `records`.
    /// Only the last record may overflow into the next segment.
    pub fn segment(&mut self, records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![0u8; self.pages_per_segment * WAL_PAGE_SIZE];
        let mut queue = records.iter();
        let mut current: Option<(Vec<u8>, usize)> = if self.pending.is_empty() {
            None
        } else {
            Some((std::mem::take(&mut self.pending), 0))
        };
        let mut exhausted = false;

        for page_no in 0..self.pages_per_segment {
            if current.is_none() && exhausted {
                break;
            }
            let page = &mut out[page_no * WAL_PAGE_SIZE..(page_no + 1) * WAL_PAGE_SIZE];
            let mut info = if page_no == 0 { XLP_LONG_HEADER } else { 0 };
            let rem = current.as_ref().map_or(0, |(data, pos)| data.len() - pos);
            if rem > 0 {
                info |= XLP_FIRST_IS_CONTRECORD;
            }
            let address = self.segment * WAL_SEGMENT_SIZE + (page_no * WAL_PAGE_SIZE) as u64;
            page[0..2].copy_from_slice(&self.magic.to_le_bytes());
            page[2..4].copy_from_slice(&info.to_le_bytes());
            page[4..8].copy_from_slice(&self.timeline.to_le_bytes());
            page[8..16].copy_from_slice(&address.to_le_bytes());
            page[16..20].copy_from_slice(&(rem as u32).to_le_bytes());
            let mut at = if page_no == 0 {
                page[24..32].copy_from_slice(&7_000_000_000_000_000_001u64.to_le_bytes());
                page[32..36].copy_from_slice(&(WAL_SEGMENT_SIZE as u32).to_le_bytes());
                page[36..40].copy_from_slice(&(WAL_PAGE_SIZE as u32).to_le_bytes());
                LONG_HEADER_LEN
            } else {
                SHORT_HEADER_LEN
            };

            loop {
                at = align8(at);
                if at >= WAL_PAGE_SIZE {
                    break;
                }
                if current.is_none() {
                    match queue.next() {
                        Some(record) => current = Some((record.clone(), 0)),
                        None => {
                            exhausted = true;
                            break;
                        }
                    }
                }
                let Some((data, pos)) = current.as_mut() else {
                    break;
                };
                let n = (data.len() - *pos).min(WAL_PAGE_SIZE - at);
                page[at..at + n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                at += n;
                if *pos == data.len() {
                    current = None;
                } else {
                    break;
                }
            }
        }

        if let Some((data, pos)) = current {
            self.pending = data[pos..].to_vec();
        }
        assert!(queue.next().is_none(), "records left over after segment {:X}", self.segment);
        self.segment += 1;
        out
    }

    /// Name of the segment the next call to [`WalStream::segment`] writes.
    pub fn next_name(&self) -> String {
        pgdelta::wal::WalSegmentNo(self.segment).filename(self.timeline)
    }
}

pub fn loc(rel_node: u32, block_no: u32) -> BlockLocation {
    BlockLocation::new(1663, 5, rel_node, block_no)
}
