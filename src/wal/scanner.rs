//! Backward walk over archived WAL segments, following timeline switches.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use super::timeline::TimelineSwitchMap;
use super::{parse_wal_filename, WalSegmentNo};
use crate::compression::CompressionMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalSegmentDescription {
    pub number: WalSegmentNo,
    pub timeline: u32,
}

impl WalSegmentDescription {
    pub fn new(number: WalSegmentNo, timeline: u32) -> Self {
        Self { number, timeline }
    }

    pub fn filename(&self) -> String {
        self.number.filename(self.timeline)
    }
}

/// Archived WAL segments among stored object names. Other objects are ignored.
pub fn segments_from_filenames<'a, I>(names: I) -> HashSet<WalSegmentDescription>
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter_map(|name| {
            let (_, base) = CompressionMethod::from_object_name(name);
            parse_wal_filename(base).ok()
        })
        .map(|(timeline, number)| WalSegmentDescription::new(number, timeline))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStep {
    /// Moved to an existing segment.
    Found(WalSegmentDescription),
    /// The next segment is absent; the runner stays put until `force_move_next`.
    Missing(WalSegmentDescription),
    ReachedStop,
}

/// Walks from `start` (exclusive) down to `stop` (inclusive).
#[derive(Debug, Clone)]
pub struct WalSegmentRunner {
    current: WalSegmentDescription,
    stop: WalSegmentNo,
    segments: HashSet<WalSegmentDescription>,
    switches: TimelineSwitchMap,
}

impl WalSegmentRunner {
    pub fn new(
        start: WalSegmentDescription,
        segments: HashSet<WalSegmentDescription>,
        stop: WalSegmentNo,
        switches: TimelineSwitchMap,
    ) -> Self {
        Self {
            current: start,
            stop,
            segments,
            switches,
        }
    }

    pub fn current(&self) -> WalSegmentDescription {
        self.current
    }

    fn next_description(&self) -> WalSegmentDescription {
        // the segment holding a switch point begins on the parent timeline
        let timeline = self
            .switches
            .get(&self.current.number)
            .map_or(self.current.timeline, |record| record.timeline);
        WalSegmentDescription::new(self.current.number.previous(), timeline)
    }

    pub fn next(&mut self) -> RunnerStep {
        if self.current.number <= self.stop {
            return RunnerStep::ReachedStop;
        }
        let next = self.next_description();
        if self.segments.contains(&next) {
            self.current = next;
            RunnerStep::Found(next)
        } else {
            RunnerStep::Missing(next)
        }
    }

    /// Step over a missing segment.
    pub fn force_move_next(&mut self) {
        self.current = self.next_description();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScannedSegmentStatus {
    Found,
    /// Missing right after the newest segment: the archiver may be behind.
    ProbablyDelayed,
    /// Missing within the parallel upload window.
    ProbablyUploading,
    Lost,
}

impl fmt::Display for ScannedSegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Found => "FOUND",
            Self::ProbablyDelayed => "MISSING_DELAYED",
            Self::ProbablyUploading => "MISSING_UPLOADING",
            Self::Lost => "MISSING_LOST",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedSegment {
    pub segment: WalSegmentDescription,
    pub status: ScannedSegmentStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentScanConfig {
    /// `None` scans until the stop segment.
    pub limit: Option<usize>,
    pub stop_on_first_found: bool,
    pub missing_status: ScannedSegmentStatus,
}

impl SegmentScanConfig {
    pub fn unlimited(missing_status: ScannedSegmentStatus) -> Self {
        Self {
            limit: None,
            stop_on_first_found: false,
            missing_status,
        }
    }
}

/// Records every segment a runner passes. Successive scans continue where
/// the previous one stopped.
#[derive(Debug, Clone)]
pub struct WalSegmentScanner {
    runner: WalSegmentRunner,
    pub scanned: Vec<ScannedSegment>,
}

impl WalSegmentScanner {
    pub fn new(runner: WalSegmentRunner) -> Self {
        Self {
            runner,
            scanned: Vec::new(),
        }
    }

    pub fn scan(&mut self, config: SegmentScanConfig) {
        let mut count = 0usize;
        while config.limit.map_or(true, |limit| count < limit) {
            match self.runner.next() {
                RunnerStep::ReachedStop => break,
                RunnerStep::Found(segment) => {
                    self.scanned.push(ScannedSegment {
                        segment,
                        status: ScannedSegmentStatus::Found,
                    });
                    count += 1;
                    if config.stop_on_first_found {
                        break;
                    }
                }
                RunnerStep::Missing(segment) => {
                    self.runner.force_move_next();
                    self.scanned.push(ScannedSegment {
                        segment,
                        status: config.missing_status,
                    });
                    count += 1;
                }
            }
        }
    }

    pub fn missing_segments(&self) -> Vec<WalSegmentDescription> {
        self.scanned
            .iter()
            .filter(|s| s.status != ScannedSegmentStatus::Found)
            .map(|s| s.segment)
            .collect()
    }
}

/// Consecutive segments sharing a timeline and a status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentSequence {
    pub timeline_id: u32,
    pub start_segment: String,
    pub end_segment: String,
    pub segments_count: usize,
    pub status: ScannedSegmentStatus,
}

pub fn collapse_segments(scanned: &[ScannedSegment]) -> Vec<SegmentSequence> {
    let mut sorted = scanned.to_vec();
    sorted.sort_by_key(|s| s.segment.number);
    let mut out: Vec<SegmentSequence> = Vec::new();
    let mut run: Option<(ScannedSegment, ScannedSegment, usize)> = None;
    let close = |first: ScannedSegment, last: ScannedSegment, count: usize| SegmentSequence {
        timeline_id: first.segment.timeline,
        start_segment: first.segment.filename(),
        end_segment: last.segment.filename(),
        segments_count: count,
        status: first.status,
    };
    for item in sorted {
        run = match run {
            Some((first, _, count))
                if first.status == item.status && first.segment.timeline == item.segment.timeline =>
            {
                Some((first, item, count + 1))
            }
            Some((first, last, count)) => {
                out.push(close(first, last, count));
                Some((item, item, 1))
            }
            None => Some((item, item, 1)),
        };
    }
    if let Some((first, last, count)) = run {
        out.push(close(first, last, count));
    }
    out
}
