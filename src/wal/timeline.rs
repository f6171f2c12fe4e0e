//! Timeline history files.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;

use super::{history_filename, parse_lsn, Lsn, WalSegmentNo};
use crate::storage::{download_and_decompress, is_not_found, Folder};
use crate::{Error, Result};

fn history_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\t(.+)\t(.+)$").expect("static regex"))
}

/// One row of a `.history` file: the parent timeline and the LSN where it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineHistoryRecord {
    pub timeline: u32,
    pub lsn: Lsn,
    pub comment: String,
}

impl TimelineHistoryRecord {
    pub fn new(timeline: u32, lsn: Lsn, comment: impl Into<String>) -> Self {
        Self {
            timeline,
            lsn,
            comment: comment.into(),
        }
    }
}

/// Timeline switches keyed by the segment holding the switch point.
pub type TimelineSwitchMap = HashMap<WalSegmentNo, TimelineHistoryRecord>;

/// Parse history rows. Blank lines and rows that don't look like records are skipped.
pub fn parse_history<R: Read>(reader: R) -> Result<Vec<TimelineHistoryRecord>> {
    let mut records = Vec::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        let Some(caps) = history_row_regex().captures(&line) else {
            continue;
        };
        let timeline = caps[1]
            .parse::<u32>()
            .with_context(|| format!("bad timeline in history row {line:?}"))?;
        records.push(TimelineHistoryRecord::new(timeline, parse_lsn(&caps[2])?, &caps[3]));
    }
    Ok(records)
}

/// History of `timeline` read from the WAL folder. A missing file is
/// reported as `Error::HistoryFileNotFound`.
pub fn history_records(timeline: u32, wal_folder: &dyn Folder) -> Result<Vec<TimelineHistoryRecord>> {
    let name = history_filename(timeline);
    match download_and_decompress(wal_folder, &name) {
        Ok(reader) => parse_history(reader),
        Err(e) if is_not_found(&e) => Err(Error::HistoryFileNotFound(name).into()),
        Err(e) => Err(e.context(format!("downloading history file {name}"))),
    }
}

pub fn switch_map(records: &[TimelineHistoryRecord]) -> TimelineSwitchMap {
    records
        .iter()
        .map(|r| (WalSegmentNo::from_lsn(r.lsn), r.clone()))
        .collect()
}

/// Switch map for `timeline`; empty when the timeline has no history file.
pub fn load_switch_map(timeline: u32, wal_folder: &dyn Folder) -> Result<TimelineSwitchMap> {
    match history_records(timeline, wal_folder) {
        Ok(records) => Ok(switch_map(&records)),
        Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::HistoryFileNotFound(_))) => {
            Ok(TimelineSwitchMap::new())
        }
        Err(e) => Err(e),
    }
}
