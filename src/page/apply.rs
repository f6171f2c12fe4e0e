//! Applying increments and base files onto local relation files.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;

use tracing::{debug, warn};

use crate::{Error, Result};

use super::increment::{read_exact_or, IncrementHeader};
use super::{is_page_header_empty, DATABASE_PAGE_SIZE, PAGE_HEADER_SIZE};

/// Create a relation file from an increment. The file is sized to the recorded
/// file size (blocks not carried by the increment read back as zero pages) and
/// every carried page is written at its block offset.
///
/// Returns the number of blocks that still need data from older backups.
pub fn create_file_from_increment<R: Read + ?Sized>(increment: &mut R, target: &File) -> Result<u64> {
    let header = IncrementHeader::read_from(increment)?;
    target.set_len(header.file_size)?;

    let total_blocks = header.file_size / DATABASE_PAGE_SIZE as u64;
    let mut page = vec![0u8; DATABASE_PAGE_SIZE];
    let mut written = 0u64;
    for &block in &header.blocks {
        read_exact_or(increment, &mut page, "increment page")?;
        if block as u64 >= total_blocks {
            continue;
        }
        target.write_all_at(&page, block as u64 * DATABASE_PAGE_SIZE as u64)?;
        written += 1;
    }
    drain_leftover(increment, "create from increment")?;

    Ok(total_blocks.saturating_sub(written))
}

/// Write increment pages into an existing file. Pages past the current end of
/// the target are discarded. Unless `overwrite` is set, only blocks whose page
/// header is still empty are written.
///
/// Returns the number of blocks written.
pub fn write_pages_from_increment<R: Read + ?Sized>(
    increment: &mut R,
    target: &File,
    overwrite: bool,
) -> Result<u64> {
    let header = IncrementHeader::read_from(increment)?;
    let target_pages = target.metadata()?.len() / DATABASE_PAGE_SIZE as u64;

    let mut page = vec![0u8; DATABASE_PAGE_SIZE];
    let mut restored = 0u64;
    for &block in &header.blocks {
        read_exact_or(increment, &mut page, "increment page")?;
        if block as u64 >= target_pages {
            continue;
        }
        if write_page(target, block as u64, &page, overwrite)? {
            restored += 1;
        }
    }
    drain_leftover(increment, "write pages from increment")?;

    Ok(restored)
}

/// Fill the missing (empty-header) pages of `target` from a complete copy of
/// the file taken by an older backup.
pub fn restore_missing_pages<R: Read + ?Sized>(base: &mut R, target: &File) -> Result<()> {
    let target_pages = target.metadata()?.len() / DATABASE_PAGE_SIZE as u64;
    let mut page = vec![0u8; DATABASE_PAGE_SIZE];
    for block in 0..target_pages {
        if !read_page_or_end(base, &mut page)? {
            return Ok(());
        }
        write_page(target, block, &page, false)?;
    }

    let extra = io::copy(base, &mut io::sink())?;
    if extra > 0 {
        debug!(extra_bytes = extra, "skipping base file data past the local file end");
    }
    Ok(())
}

fn write_page(target: &File, block: u64, page: &[u8], overwrite: bool) -> Result<bool> {
    let offset = block * DATABASE_PAGE_SIZE as u64;
    if !overwrite {
        let mut header = [0u8; PAGE_HEADER_SIZE];
        target.read_exact_at(&mut header, offset)?;
        if !is_page_header_empty(&header) {
            return Ok(false);
        }
    }
    target.write_all_at(page, offset)?;
    Ok(true)
}

/// Read one page. Returns `false` on a clean end of stream.
fn read_page_or_end<R: Read + ?Sized>(reader: &mut R, page: &mut [u8]) -> Result<bool> {
    let mut filled = 0usize;
    while filled < page.len() {
        match reader.read(&mut page[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(false),
        n if n == page.len() => Ok(true),
        _ => Err(Error::IncrementTruncated("base file page".to_string()).into()),
    }
}

fn drain_leftover<R: Read + ?Sized>(reader: &mut R, operation: &str) -> Result<()> {
    let extra = io::copy(reader, &mut io::sink())?;
    if extra > 0 {
        warn!(operation, extra_bytes = extra, "skipping unknown data after increment pages");
    }
    Ok(())
}
