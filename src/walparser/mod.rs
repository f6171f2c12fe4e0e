//! Incremental parser for Postgres WAL pages.
//!
//! Pages are fed one at a time; records that cross a page boundary are
//! stitched together from the heading data kept in the parser and the
//! trailing data at the start of the next page. A parser that starts in the
//! middle of a record has no beginning to stitch to: the bytes finishing that
//! record are handed back to the caller as the "discarded tail".

use std::io::{self, Read, Write};

use thiserror::Error;

pub mod location;
pub mod page;
pub mod record;

pub use location::{read_locations, write_locations, BlockLocation, Oid, RelFileNode};
pub use page::XLogPageHeader;
pub use record::{BlockImageLayout, XLogRecord, XLogRecordBlock, XLogRecordBlockHeader, MAIN_FORK_NUM};

pub const WAL_PAGE_SIZE: usize = 8192;
pub const BLOCK_SIZE: u16 = 8192;
pub const XLOG_RECORD_ALIGNMENT: usize = 8;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("the whole page consists only of zero bytes")]
    ZeroPage,
    #[error("page header is zero but the page is not")]
    ZeroPageHeader,
    #[error("record header is zero")]
    ZeroRecordHeader,
    #[error("invalid page header: {0}")]
    InvalidPageHeader(String),
    #[error("invalid record header: {0}")]
    InvalidRecordHeader(String),
    #[error("invalid record block id {0}")]
    InvalidRecordBlockId(u8),
    #[error("out of order block id {got}, max read so far {max}")]
    OutOfOrderBlockId { got: u8, max: u8 },
    #[error("block refers to the previous relation but there is none")]
    NoPrevRelFileNode,
    #[error("inconsistent block data: {0}")]
    InconsistentBlockData(String),
    #[error("inconsistent block image: {0}")]
    InconsistentImage(String),
    #[error("not enough data for {0}")]
    Truncated(&'static str),
    #[error("continuation of the current record was not found")]
    ContinuationNotFound,
    #[error("parser doesn't hold the beginning of its record and can't be saved")]
    CantSavePartialParser,
    #[error("page must be {WAL_PAGE_SIZE} bytes, got {0}")]
    WrongPageSize(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub(crate) fn all_zero(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0)
}

/// Little-endian cursor over a byte slice.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
        if self.remaining() < len {
            return Err(ParseError::Truncated(what));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn take_up_to(&mut self, len: usize) -> &'a [u8] {
        let len = len.min(self.remaining());
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        out
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    pub fn align(&mut self, alignment: usize) {
        let aligned = self.pos.div_ceil(alignment) * alignment;
        self.pos = aligned.min(self.data.len());
    }

    pub fn peek_u32(&self) -> u32 {
        let b = &self.data[self.pos..self.pos + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, ParseError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16(&mut self, what: &'static str) -> Result<u16, ParseError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, ParseError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64, ParseError> {
        let b = self.take(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }
}

/// Outcome of feeding one page to the parser.
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    /// Bytes finishing a record whose beginning this parser never saw.
    /// `None` while such a record is still being continued.
    pub discarded_tail: Option<Vec<u8>>,
    /// Records completed on this page, in WAL order.
    pub records: Vec<XLogRecord>,
    /// The page ends in never-written zero bytes (the tail of a `.partial` file).
    pub partial: bool,
    pub layout: BlockImageLayout,
}

/// Stateful page-by-page WAL parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalParser {
    current_record_data: Vec<u8>,
    has_current_record_beginning: bool,
}

impl WalParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser resumed from the known beginning of an unfinished record.
    pub fn from_record_head(head: Vec<u8>) -> Self {
        Self {
            current_record_data: head,
            has_current_record_beginning: true,
        }
    }

    pub fn current_record_data(&self) -> &[u8] {
        &self.current_record_data
    }

    pub fn has_current_record_beginning(&self) -> bool {
        self.has_current_record_beginning
    }

    fn set_current_record_data(&mut self, data: Vec<u8>) {
        self.has_current_record_beginning = !data.is_empty();
        self.current_record_data = data;
    }

    /// Forget the record in progress.
    pub fn invalidate(&mut self) {
        self.set_current_record_data(Vec::new());
    }

    /// Feed one full WAL page.
    pub fn parse_records_from_page(&mut self, data: &[u8]) -> Result<ParsedPage, ParseError> {
        if data.len() != WAL_PAGE_SIZE {
            return Err(ParseError::WrongPageSize(data.len()));
        }
        let head = self
            .has_current_record_beginning
            .then_some(self.current_record_data.as_slice());
        let page = page::parse_page(data, head)?;
        let layout = page.header.image_layout();

        if (page.prev_record_trailing_data.len() as u32) < page.header.remaining_data_len {
            self.current_record_data
                .extend_from_slice(&page.prev_record_trailing_data);
            return Ok(ParsedPage {
                discarded_tail: None,
                records: Vec::new(),
                partial: page.partial,
                layout,
            });
        }

        let mut current = std::mem::take(&mut self.current_record_data);
        current.extend_from_slice(&page.prev_record_trailing_data);
        if !self.has_current_record_beginning {
            self.set_current_record_data(page.next_record_heading_data);
            return Ok(ParsedPage {
                discarded_tail: Some(current),
                records: page.records,
                partial: page.partial,
                layout,
            });
        }

        let mut header_reader = ByteReader::new(&current);
        let header = record::XLogRecordHeader::read(&mut header_reader)?;
        if header.total_record_length as usize != current.len() {
            return Err(ParseError::ContinuationNotFound);
        }
        let finished = XLogRecord::parse(&current, layout)?;
        let mut records = Vec::with_capacity(page.records.len() + 1);
        records.push(finished);
        records.extend(page.records);
        self.set_current_record_data(page.next_record_heading_data);
        Ok(ParsedPage {
            discarded_tail: None,
            records,
            partial: page.partial,
            layout,
        })
    }

    /// Persist the record in progress as `len: u32 LE` followed by the bytes.
    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), ParseError> {
        if !self.current_record_data.is_empty() && !self.has_current_record_beginning {
            return Err(ParseError::CantSavePartialParser);
        }
        writer.write_all(&(self.current_record_data.len() as u32).to_le_bytes())?;
        writer.write_all(&self.current_record_data)?;
        Ok(())
    }

    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self, ParseError> {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
        reader.read_exact(&mut data)?;
        let mut parser = Self::new();
        parser.set_current_record_data(data);
        Ok(parser)
    }
}

/// Main-fork block locations touched by `records`.
pub fn extract_block_locations(records: &[XLogRecord]) -> Vec<BlockLocation> {
    records
        .iter()
        .flat_map(|r| r.blocks.iter())
        .filter(|b| b.header.fork_num() == MAIN_FORK_NUM)
        .map(|b| b.header.location)
        .collect()
}
