//! WAL segment numbering, file names and LSN arithmetic.
//!
//! Segments are 16 MiB and 16 consecutive segments form one delta group.
//! Group `n` covers segments `16n .. 16n+15`; its delta file is named after
//! the WAL file of segment `16n` with a `_delta` suffix.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::{Error, Result};

pub mod fetch;
pub mod push;
pub mod scanner;
pub mod timeline;
pub mod verify;

pub type Lsn = u64;

pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
pub const XLOG_SEGMENTS_PER_XLOG_ID: u64 = 0x1_0000_0000 / WAL_SEGMENT_SIZE;
pub const WAL_FILE_IN_DELTA: u64 = 16;
pub const WAL_FILENAME_LEN: usize = 24;
pub const DELTA_FILENAME_SUFFIX: &str = "_delta";
pub const PART_FILENAME_SUFFIX: &str = "_part";

fn backup_history_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9A-F]{24})\.([0-9A-F]{8})\.backup$").expect("static regex"))
}

fn wal_name_in_text_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9A-F]{24}").expect("static regex"))
}

/// Absolute WAL segment number (`lsn / 16 MiB`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WalSegmentNo(pub u64);

impl WalSegmentNo {
    pub fn from_lsn(lsn: Lsn) -> Self {
        Self(lsn / WAL_SEGMENT_SIZE)
    }

    pub fn from_filename(name: &str) -> Result<Self> {
        parse_wal_filename(name).map(|(_, seg)| seg)
    }

    pub fn first_lsn(self) -> Lsn {
        self.0 * WAL_SEGMENT_SIZE
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn previous(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    pub fn add(self, n: u64) -> Self {
        Self(self.0 + n)
    }

    pub fn sub(self, n: u64) -> Self {
        Self(self.0.saturating_sub(n))
    }

    pub fn filename(self, timeline: u32) -> String {
        format_wal_filename(timeline, self)
    }

    pub fn delta_no(self) -> DeltaNo {
        DeltaNo(self.0 / WAL_FILE_IN_DELTA)
    }

    /// Index of this segment within its delta group.
    pub fn position_in_delta(self) -> usize {
        (self.0 % WAL_FILE_IN_DELTA) as usize
    }
}

impl fmt::Display for WalSegmentNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

/// Delta group number (`segment / 16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeltaNo(pub u64);

impl DeltaNo {
    pub fn from_lsn(lsn: Lsn) -> Self {
        WalSegmentNo::from_lsn(lsn).delta_no()
    }

    pub fn from_filename(name: &str) -> Result<Self> {
        Ok(WalSegmentNo::from_filename(name)?.delta_no())
    }

    pub fn first_wal_segment_no(self) -> WalSegmentNo {
        WalSegmentNo(self.0 * WAL_FILE_IN_DELTA)
    }

    pub fn first_lsn(self) -> Lsn {
        self.first_wal_segment_no().first_lsn()
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn previous(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    pub fn filename(self, timeline: u32) -> String {
        format!("{}{DELTA_FILENAME_SUFFIX}", self.first_wal_segment_no().filename(timeline))
    }

    pub fn part_filename(self, timeline: u32) -> String {
        to_part_filename(&self.filename(timeline))
    }
}

pub fn format_wal_filename(timeline: u32, segment: WalSegmentNo) -> String {
    format!(
        "{:08X}{:08X}{:08X}",
        timeline,
        segment.0 / XLOG_SEGMENTS_PER_XLOG_ID,
        segment.0 % XLOG_SEGMENTS_PER_XLOG_ID
    )
}

/// Split a 24-character WAL file name into timeline and segment number.
pub fn parse_wal_filename(name: &str) -> Result<(u32, WalSegmentNo)> {
    let not_wal = || Error::NotWalFilename(name.to_string());
    if name.len() != WAL_FILENAME_LEN || !name.is_ascii() {
        return Err(not_wal().into());
    }
    let field = |range: std::ops::Range<usize>| u32::from_str_radix(&name[range], 16).map_err(|_| not_wal());
    let timeline = field(0..8)?;
    let hi = field(8..16)? as u64;
    let lo = field(16..24)? as u64;
    if lo >= XLOG_SEGMENTS_PER_XLOG_ID {
        return Err(not_wal().into());
    }
    Ok((timeline, WalSegmentNo(hi * XLOG_SEGMENTS_PER_XLOG_ID + lo)))
}

pub fn is_wal_filename(name: &str) -> bool {
    parse_wal_filename(name).is_ok()
}

pub fn next_wal_filename(name: &str) -> Result<String> {
    let (timeline, segment) = parse_wal_filename(name)?;
    Ok(segment.next().filename(timeline))
}

/// Name of the delta file that covers the given WAL file.
pub fn delta_filename_for(wal_filename: &str) -> Result<String> {
    let (timeline, segment) = parse_wal_filename(wal_filename)?;
    Ok(segment.delta_no().filename(timeline))
}

pub fn to_part_filename(delta_filename: &str) -> String {
    format!("{delta_filename}{PART_FILENAME_SUFFIX}")
}

pub fn history_filename(timeline: u32) -> String {
    format!("{timeline:08X}.history")
}

/// A `<wal>.<offset>.backup` file written by the server when a backup stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHistoryFile {
    pub wal_filename: String,
    pub timeline: u32,
    pub segment: WalSegmentNo,
    pub offset: u32,
}

pub fn parse_backup_history_filename(name: &str) -> Option<BackupHistoryFile> {
    let caps = backup_history_regex().captures(name)?;
    let wal_filename = caps[1].to_string();
    let (timeline, segment) = parse_wal_filename(&wal_filename).ok()?;
    let offset = u32::from_str_radix(&caps[2], 16).ok()?;
    Some(BackupHistoryFile {
        wal_filename,
        timeline,
        segment,
        offset,
    })
}

/// First WAL file name embedded in an arbitrary object or backup name.
pub fn find_wal_filename(text: &str) -> Option<&str> {
    wal_name_in_text_regex()
        .find_iter(text)
        .map(|m| m.as_str())
        .find(|candidate| is_wal_filename(candidate))
}

/// Text form used by the server: `X/Y` with the high and low 32 bits in hex.
pub fn format_lsn(lsn: Lsn) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

pub fn parse_lsn(text: &str) -> Result<Lsn> {
    let invalid = || Error::InvalidLsn(text.to_string());
    let (hi, lo) = text.trim().split_once('/').ok_or_else(invalid)?;
    let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
    let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
    Ok(((hi as u64) << 32) | lo as u64)
}

/// Delta groups holding the changes between two LSNs: the group of the first
/// used LSN and the group of the first LSN that is no longer needed.
pub fn delta_range(first_used_lsn: Lsn, first_not_used_lsn: Lsn) -> (DeltaNo, DeltaNo) {
    (DeltaNo::from_lsn(first_used_lsn), DeltaNo::from_lsn(first_not_used_lsn))
}

/// WAL segments of `first_not_used_delta` that must be read directly: from
/// the first segment of the group up to (excluding) the segment after the one
/// holding the last used LSN.
pub fn wal_segment_range(first_not_used_delta: DeltaNo, first_not_used_lsn: Lsn) -> (WalSegmentNo, WalSegmentNo) {
    let first = first_not_used_delta.first_wal_segment_no();
    if first_not_used_lsn == 0 {
        return (first, first);
    }
    (first, WalSegmentNo::from_lsn(first_not_used_lsn - 1).next())
}
