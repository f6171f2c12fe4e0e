//! Postgres data page layout and paged relation file helpers.
//!
//! A paged file is a relation segment under `base/` or `pg_tblspc/`: its
//! name is `<relfilenode>[.<segment>]` and its size is a non-zero multiple of
//! the page size. Only paged files take part in page-level increments.

use std::path::{Component, Path};
use std::sync::OnceLock;

use regex::Regex;

use crate::walparser::{Oid, RelFileNode};
use crate::{Error, Result};

pub mod apply;
pub mod checksum;
pub mod increment;

pub use apply::{create_file_from_increment, restore_missing_pages, write_pages_from_increment};
pub use increment::{read_incremental_file, IncrementHeader, IncrementalPageReader};

/// Postgres `BLCKSZ`.
pub const DATABASE_PAGE_SIZE: usize = 8192;
/// Size of `PageHeaderData` as stored at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 24;
/// Pages per 1 GiB relation segment file.
pub const BLOCKS_IN_REL_FILE: u32 = 131_072;
/// Oid of `pg_default`.
pub const DEFAULT_SPC_NODE: Oid = 1663;

pub const DEFAULT_TABLESPACE: &str = "base";
pub const NON_DEFAULT_TABLESPACE: &str = "pg_tblspc";

const VALID_FLAGS: u16 = 0x0007;
const PAGE_LAYOUT_VERSION: u16 = 4;

fn paged_filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)([.]\d+)?$").expect("static regex"))
}

/// Fixed fields of `PageHeaderData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageHeader {
    pub lsn_hi: u32,
    pub lsn_lo: u32,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub pagesize_version: u16,
    pub prune_xid: u32,
}

impl PageHeader {
    /// Decode the header from the first bytes of a page.
    pub fn parse(page: &[u8]) -> Self {
        let u16_at = |off: usize| u16::from_le_bytes([page[off], page[off + 1]]);
        let u32_at =
            |off: usize| u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]]);
        Self {
            lsn_hi: u32_at(0),
            lsn_lo: u32_at(4),
            checksum: u16_at(8),
            flags: u16_at(10),
            lower: u16_at(12),
            upper: u16_at(14),
            special: u16_at(16),
            pagesize_version: u16_at(18),
            prune_xid: u32_at(20),
        }
    }

    pub fn lsn(&self) -> u64 {
        ((self.lsn_hi as u64) << 32) | self.lsn_lo as u64
    }

    /// A page that was allocated but never initialised.
    pub fn is_new(&self) -> bool {
        self.upper == 0
    }

    pub fn is_valid(&self) -> bool {
        !(self.flags & !VALID_FLAGS != 0
            || (self.lower as usize) < PAGE_HEADER_SIZE
            || self.lower > self.upper
            || self.upper > self.special
            || self.special as usize > DATABASE_PAGE_SIZE
            || self.lsn() == 0
            || self.pagesize_version != DATABASE_PAGE_SIZE as u16 + PAGE_LAYOUT_VERSION)
    }
}

/// True when the header area of `page` is all zeroes, i.e. the block holds no data yet.
pub fn is_page_header_empty(page: &[u8]) -> bool {
    page.iter().take(PAGE_HEADER_SIZE).all(|b| *b == 0)
}

fn has_component(path: &Path, name: &str) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(part) if part == name))
}

/// Decide whether `relative_path` (relative to the data directory) of the given
/// size is a paged relation file.
pub fn is_paged_file(relative_path: &Path, size: u64) -> bool {
    if size == 0 || size % DATABASE_PAGE_SIZE as u64 != 0 {
        return false;
    }
    if !has_component(relative_path, DEFAULT_TABLESPACE)
        && !has_component(relative_path, NON_DEFAULT_TABLESPACE)
    {
        return false;
    }
    relative_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| paged_filename_regex().is_match(n))
        .unwrap_or(false)
}

/// Segment index of a relation file: `16384` is segment 0, `16384.2` is segment 2.
pub fn rel_file_segment_no(relative_path: &Path) -> Result<u32> {
    let name = relative_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let caps = paged_filename_regex()
        .captures(name)
        .ok_or_else(|| Error::UnknownTableSpace(relative_path.display().to_string()))?;
    match caps.get(2) {
        None => Ok(0),
        Some(m) => m.as_str()[1..]
            .parse::<u32>()
            .map_err(|_| Error::UnknownTableSpace(relative_path.display().to_string()).into()),
    }
}

/// Identify the relation a paged file belongs to from its location.
pub fn rel_file_node_from_path(relative_path: &Path) -> Result<RelFileNode> {
    let unknown = || Error::UnknownTableSpace(relative_path.display().to_string());
    let name = relative_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(unknown)?;
    let caps = paged_filename_regex().captures(name).ok_or_else(unknown)?;
    let rel_node: Oid = caps[1].parse().map_err(|_| unknown())?;

    let folders: Vec<&str> = relative_path
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(part) => part.to_str(),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    let db_node: Oid = folders
        .last()
        .and_then(|s| s.parse().ok())
        .ok_or_else(unknown)?;

    if folders.contains(&DEFAULT_TABLESPACE) {
        return Ok(RelFileNode {
            spc_node: DEFAULT_SPC_NODE,
            db_node,
            rel_node,
        });
    }
    if folders.contains(&NON_DEFAULT_TABLESPACE) && folders.len() >= 3 {
        let spc_node: Oid = folders[folders.len() - 3].parse().map_err(|_| unknown())?;
        return Ok(RelFileNode {
            spc_node,
            db_node,
            rel_node,
        });
    }
    Err(unknown().into())
}

#[cfg(test)]
pub(crate) fn make_page(lsn: u64) -> Vec<u8> {
    let mut page = vec![0u8; DATABASE_PAGE_SIZE];
    page[0..4].copy_from_slice(&((lsn >> 32) as u32).to_le_bytes());
    page[4..8].copy_from_slice(&(lsn as u32).to_le_bytes());
    page[12..14].copy_from_slice(&(PAGE_HEADER_SIZE as u16).to_le_bytes());
    page[14..16].copy_from_slice(&(DATABASE_PAGE_SIZE as u16).to_le_bytes());
    page[16..18].copy_from_slice(&(DATABASE_PAGE_SIZE as u16).to_le_bytes());
    page[18..20].copy_from_slice(&(DATABASE_PAGE_SIZE as u16 + PAGE_LAYOUT_VERSION).to_le_bytes());
    page
}
