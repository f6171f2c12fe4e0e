//! Data page checksum verification (`pg_checksum_page`).

use std::io::{self, Write};

use super::{PageHeader, BLOCKS_IN_REL_FILE, DATABASE_PAGE_SIZE};

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16_777_619;
const CHECKSUM_OFFSET: usize = 8;

const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9FBF8C76, 0x15CA20BE, 0xF2CA9FD3, 0x959BD756,
];

/// Names of files that look paged but are not relation data.
const NON_RELATION_FILES: [&str; 1] = ["pg_internal.init"];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

fn checksum_block(page: &[u8]) -> u32 {
    let mut sums = CHECKSUM_BASE_OFFSETS;
    for row in page.chunks_exact(N_SUMS * 4) {
        for (sum, word) in sums.iter_mut().zip(row.chunks_exact(4)) {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            *sum = checksum_comp(*sum, value);
        }
    }
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }
    sums.iter().fold(0u32, |acc, s| acc ^ s)
}

/// Compute the checksum Postgres stores in `pd_checksum` for `page` at the
/// absolute block number `block_no`.
pub fn page_checksum(page: &[u8], block_no: u32) -> u16 {
    let mut copy = page[..DATABASE_PAGE_SIZE].to_vec();
    copy[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
    let checksum = checksum_block(&copy) ^ block_no;
    ((checksum % 65535) + 1) as u16
}

/// A page is corrupt when it is initialised, carries a checksum and that
/// checksum does not match its content.
pub fn is_page_corrupt(page: &[u8], absolute_block_no: u32) -> bool {
    let header = PageHeader::parse(page);
    if header.is_new() || header.checksum == 0 {
        return false;
    }
    page_checksum(page, absolute_block_no) != header.checksum
}

pub fn should_verify(file_name: &str) -> bool {
    !NON_RELATION_FILES.contains(&file_name)
}

/// Streaming checker fed with page bytes as they are packed. Block numbers
/// either count up from zero (a full file) or come from an increment header.
#[derive(Debug)]
pub struct PageVerifier {
    segment_no: u32,
    blocks: Option<Vec<u32>>,
    skip: usize,
    buffer: Vec<u8>,
    page_index: usize,
    corrupt: Vec<u32>,
}

impl PageVerifier {
    /// Verifier for a full copy of relation segment `segment_no`.
    pub fn for_full_file(segment_no: u32) -> Self {
        Self::new(segment_no, None, 0)
    }

    /// Verifier for an increment stream; `header_len` bytes of header are skipped.
    pub fn for_increment(segment_no: u32, blocks: Vec<u32>, header_len: usize) -> Self {
        Self::new(segment_no, Some(blocks), header_len)
    }

    fn new(segment_no: u32, blocks: Option<Vec<u32>>, skip: usize) -> Self {
        Self {
            segment_no,
            blocks,
            skip,
            buffer: Vec::with_capacity(DATABASE_PAGE_SIZE),
            page_index: 0,
            corrupt: Vec::new(),
        }
    }

    fn check_buffered_page(&mut self) {
        let block = match &self.blocks {
            Some(blocks) => match blocks.get(self.page_index) {
                Some(b) => *b,
                None => {
                    self.page_index += 1;
                    return;
                }
            },
            None => self.page_index as u32,
        };
        self.page_index += 1;
        let absolute = self.segment_no.wrapping_mul(BLOCKS_IN_REL_FILE).wrapping_add(block);
        if is_page_corrupt(&self.buffer, absolute) {
            self.corrupt.push(block);
        }
    }

    /// Relative block numbers whose checksum did not match.
    pub fn finish(self) -> Vec<u32> {
        self.corrupt
    }
}

impl Write for PageVerifier {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let total = buf.len();
        if self.skip > 0 {
            let n = self.skip.min(buf.len());
            self.skip -= n;
            buf = &buf[n..];
        }
        while !buf.is_empty() {
            let n = (DATABASE_PAGE_SIZE - self.buffer.len()).min(buf.len());
            self.buffer.extend_from_slice(&buf[..n]);
            buf = &buf[n..];
            if self.buffer.len() == DATABASE_PAGE_SIZE {
                self.check_buffered_page();
                self.buffer.clear();
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
