//! Increment file codec.
//!
//! An increment of a paged file is a header followed by the selected pages:
//!
//! ```text
//! 'w' 'i' '1' 0x55 | file_size: u64 LE | count: u32 LE | count x block_no: u32 LE | count x 8192-byte page
//! ```
//!
//! The header is built up front; page bodies are read from the source file
//! lazily while the increment is streamed into a container.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::delta::BlockSet;
use crate::{Error, Result};

use super::{PageHeader, DATABASE_PAGE_SIZE};

pub const INCREMENT_MAGIC: [u8; 4] = [b'w', b'i', b'1', 0x55];
const SIGNATURE_VERSION_BYTE: usize = 2;

/// Header of an increment: the size of the source file at backup time and
/// the block numbers whose pages follow, in order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncrementHeader {
    pub file_size: u64,
    pub blocks: Vec<u32>,
}

impl IncrementHeader {
    pub fn encoded_len(&self) -> u64 {
        (INCREMENT_MAGIC.len() + 8 + 4 + 4 * self.blocks.len()) as u64
    }

    /// Total increment length: header plus one page per listed block.
    pub fn increment_len(&self) -> u64 {
        self.encoded_len() + self.blocks.len() as u64 * DATABASE_PAGE_SIZE as u64
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len() as usize);
        out.extend_from_slice(&INCREMENT_MAGIC);
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for block in &self.blocks {
            out.extend_from_slice(&block.to_le_bytes());
        }
        out
    }

    /// Read and validate a header from the start of an increment stream.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_exact_or(reader, &mut magic, "increment signature")?;
        if magic[0] != INCREMENT_MAGIC[0]
            || magic[1] != INCREMENT_MAGIC[1]
            || magic[3] != INCREMENT_MAGIC[3]
        {
            return Err(Error::InvalidIncrementFileHeader.into());
        }
        if magic[SIGNATURE_VERSION_BYTE] != INCREMENT_MAGIC[SIGNATURE_VERSION_BYTE] {
            return Err(Error::UnknownIncrementFileHeader(magic[SIGNATURE_VERSION_BYTE]).into());
        }

        let mut size = [0u8; 8];
        read_exact_or(reader, &mut size, "increment file size")?;
        let mut count = [0u8; 4];
        read_exact_or(reader, &mut count, "increment block count")?;
        let count = u32::from_le_bytes(count) as usize;

        let mut raw = vec![0u8; count * 4];
        read_exact_or(reader, &mut raw, "increment block map")?;
        let blocks = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            file_size: u64::from_le_bytes(size),
            blocks,
        })
    }
}

pub(crate) fn read_exact_or<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(Error::IncrementTruncated(what.to_string()).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Streams an increment: the encoded header first, then each selected page
/// read from the source file on demand.
#[derive(Debug)]
pub struct IncrementalPageReader {
    file: File,
    header: IncrementHeader,
    encoded_header: Vec<u8>,
    header_pos: usize,
    next_block: usize,
    page: Vec<u8>,
    page_pos: usize,
}

impl IncrementalPageReader {
    fn new(file: File, header: IncrementHeader) -> Self {
        let encoded_header = header.encode();
        Self {
            file,
            header,
            encoded_header,
            header_pos: 0,
            next_block: 0,
            page: vec![0u8; DATABASE_PAGE_SIZE],
            page_pos: DATABASE_PAGE_SIZE,
        }
    }

    pub fn header(&self) -> &IncrementHeader {
        &self.header
    }

    /// Fill the page buffer with `block`. A file truncated since the header was
    /// built yields zero bytes for the missing tail.
    fn load_page(&mut self, block: u32) -> io::Result<()> {
        let offset = block as u64 * DATABASE_PAGE_SIZE as u64;
        let mut filled = 0usize;
        while filled < DATABASE_PAGE_SIZE {
            let n = self
                .file
                .read_at(&mut self.page[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.page[filled..].fill(0);
        self.page_pos = 0;
        Ok(())
    }
}

impl Read for IncrementalPageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.header_pos < self.encoded_header.len() {
                let n = (self.encoded_header.len() - self.header_pos).min(buf.len());
                buf[..n].copy_from_slice(&self.encoded_header[self.header_pos..self.header_pos + n]);
                self.header_pos += n;
                return Ok(n);
            }
            if self.page_pos < self.page.len() {
                let n = (self.page.len() - self.page_pos).min(buf.len());
                buf[..n].copy_from_slice(&self.page[self.page_pos..self.page_pos + n]);
                self.page_pos += n;
                return Ok(n);
            }
            let Some(&block) = self.header.blocks.get(self.next_block) else {
                return Ok(0);
            };
            self.next_block += 1;
            self.load_page(block)?;
        }
    }
}

/// Build an increment for the paged file at `path`.
///
/// With a delta `bitmap` the listed blocks are taken as-is, stopping at the
/// first block that does not fit in `file_size`. Without one, every page is
/// scanned and selected when it is new or its LSN is at or after `since_lsn`;
/// an invalid non-new page aborts with [`Error::InvalidBlock`] so the caller
/// can fall back to a full copy.
pub fn read_incremental_file(
    path: &Path,
    file_size: u64,
    since_lsn: u64,
    bitmap: Option<&BlockSet>,
) -> Result<(IncrementalPageReader, u64)> {
    let file = File::open(path)?;
    let blocks = match bitmap {
        Some(bitmap) => bitmap
            .iter()
            .take_while(|block| (*block as u64 + 1) * DATABASE_PAGE_SIZE as u64 <= file_size)
            .collect(),
        None => select_modified_blocks(&file, path, file_size, since_lsn)?,
    };
    let header = IncrementHeader { file_size, blocks };
    let size = header.increment_len();
    Ok((IncrementalPageReader::new(file, header), size))
}

fn select_modified_blocks(file: &File, path: &Path, file_size: u64, since_lsn: u64) -> Result<Vec<u32>> {
    let mut selected = Vec::new();
    let mut page = vec![0u8; DATABASE_PAGE_SIZE];
    let page_count = file_size / DATABASE_PAGE_SIZE as u64;
    for block in 0..page_count {
        let offset = block * DATABASE_PAGE_SIZE as u64;
        match file.read_exact_at(&mut page, offset) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let header = PageHeader::parse(&page);
        if header.is_new() {
            selected.push(block as u32);
            continue;
        }
        if !header.is_valid() {
            return Err(Error::InvalidBlock {
                path: path.display().to_string(),
                block: block as u32,
            }
            .into());
        }
        if header.lsn() >= since_lsn {
            selected.push(block as u32);
        }
    }
    Ok(selected)
}
