//! `wal-verify`: is every segment needed since the oldest backup archived?

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use super::scanner::{
    collapse_segments, segments_from_filenames, ScannedSegmentStatus, SegmentScanConfig, SegmentSequence,
    WalSegmentDescription, WalSegmentRunner, WalSegmentScanner,
};
use super::timeline::load_switch_map;
use super::{parse_wal_filename, WalSegmentNo};
use crate::storage::{list_recursive, Folder};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntegrityStatus {
    Ok,
    /// Only segments that may still arrive are missing.
    Warning,
    Failure,
}

impl fmt::Display for IntegrityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Failure => "FAILURE",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    pub details: Vec<SegmentSequence>,
}

#[derive(Debug, Clone, Copy)]
pub struct IntegrityScanLimits {
    /// Missing segments right below the current one that count as delayed.
    pub max_delayed: usize,
    /// Window below that which may still be in parallel upload.
    pub upload_concurrency: usize,
}

/// Walk back from `current_wal` (exclusive) to `stop` (inclusive).
///
/// Without a stop segment (no backups yet) the walk goes down to segment 1.
pub fn verify_wal_integrity(
    wal_folder: &dyn Folder,
    current_wal: &str,
    stop: Option<WalSegmentNo>,
    limits: IntegrityScanLimits,
) -> Result<IntegrityReport> {
    let (timeline, current) = parse_wal_filename(current_wal)?;
    let stop = stop.unwrap_or_else(|| {
        warn!("no backups found, checking WAL down to the first segment");
        WalSegmentNo(1)
    });
    let objects = list_recursive(wal_folder)?;
    let segments = segments_from_filenames(objects.iter().map(|o| o.name.as_str()));
    let switches = load_switch_map(timeline, wal_folder)?;
    info!(current = %current_wal, stop = %stop.filename(timeline), archived = segments.len(), "wal_integrity_scan_started");

    let runner = WalSegmentRunner::new(WalSegmentDescription::new(current, timeline), segments, stop, switches);
    let mut scanner = WalSegmentScanner::new(runner);
    scanner.scan(SegmentScanConfig {
        limit: Some(limits.max_delayed),
        stop_on_first_found: true,
        missing_status: ScannedSegmentStatus::ProbablyDelayed,
    });
    scanner.scan(SegmentScanConfig {
        limit: Some(limits.upload_concurrency),
        stop_on_first_found: false,
        missing_status: ScannedSegmentStatus::ProbablyUploading,
    });
    scanner.scan(SegmentScanConfig::unlimited(ScannedSegmentStatus::Lost));

    let status = scanner.scanned.iter().fold(IntegrityStatus::Ok, |status, s| match s.status {
        ScannedSegmentStatus::Lost => IntegrityStatus::Failure,
        ScannedSegmentStatus::ProbablyDelayed | ScannedSegmentStatus::ProbablyUploading
            if status == IntegrityStatus::Ok =>
        {
            IntegrityStatus::Warning
        }
        _ => status,
    });
    Ok(IntegrityReport {
        status,
        details: collapse_segments(&scanner.scanned),
    })
}
