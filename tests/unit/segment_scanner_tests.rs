use std::collections::HashSet;

use pgdelta::storage::{Folder, MemoryFolder};
use pgdelta::wal::scanner::{
    collapse_segments, segments_from_filenames, ScannedSegmentStatus, SegmentScanConfig, WalSegmentDescription,
    WalSegmentRunner, WalSegmentScanner,
};
use pgdelta::wal::timeline::{load_switch_map, TimelineSwitchMap};
use pgdelta::wal::verify::{verify_wal_integrity, IntegrityScanLimits, IntegrityStatus};
use pgdelta::wal::WalSegmentNo;

fn seg(number: u64, timeline: u32) -> WalSegmentDescription {
    WalSegmentDescription::new(WalSegmentNo(number), timeline)
}

fn archive(folder: &MemoryFolder, segments: &[WalSegmentDescription]) -> pgdelta::Result<()> {
    for segment in segments {
        folder.put(&format!("{}.lz4", segment.filename()), b"wal")?;
    }
    Ok(())
}

#[test]
fn only_wal_segments_are_collected_from_a_listing() {
    let names = [
        "000000010000000000000003.lz4",
        "000000010000000000000004.zst",
        "000000010000000000000005",
        "000000010000000000000010_delta.lz4",
        "00000002.history",
        "000000010000000000000003.00000028.backup.lz4",
    ];
    let segments = segments_from_filenames(names);
    assert_eq!(segments, HashSet::from([seg(3, 1), seg(4, 1), seg(5, 1)]));
}

#[test]
fn runner_follows_the_switch_to_the_parent_timeline() -> pgdelta::Result<()> {
    let folder = MemoryFolder::new();
    folder.put("00000002.history", b"1\t0/5000A28\tno recovery target specified\n")?;
    let switches = load_switch_map(2, &folder)?;
    let segments: HashSet<_> = (1..=5).map(|n| seg(n, 1)).chain((5..=8).map(|n| seg(n, 2))).collect();

    let mut scanner = WalSegmentScanner::new(WalSegmentRunner::new(seg(9, 2), segments, WalSegmentNo(2), switches));
    scanner.scan(SegmentScanConfig::unlimited(ScannedSegmentStatus::Lost));
    let visited: Vec<_> = scanner.scanned.iter().map(|s| s.segment).collect();
    assert_eq!(
        visited,
        vec![seg(8, 2), seg(7, 2), seg(6, 2), seg(5, 2), seg(4, 1), seg(3, 1), seg(2, 1)]
    );
    assert!(scanner.missing_segments().is_empty());

    let sequences = collapse_segments(&scanner.scanned);
    assert_eq!(sequences.len(), 2);
    assert_eq!(sequences[0].start_segment, "000000010000000000000002");
    assert_eq!(sequences[0].end_segment, "000000010000000000000004");
    assert_eq!(sequences[1].timeline_id, 2);
    assert_eq!(sequences[1].segments_count, 4);
    Ok(())
}

#[test]
fn limited_scans_continue_where_the_last_stopped() {
    let segments: HashSet<_> = [10u64, 9, 7, 6].into_iter().map(|n| seg(n, 1)).collect();
    let runner = WalSegmentRunner::new(seg(11, 1), segments, WalSegmentNo(6), TimelineSwitchMap::new());
    let mut scanner = WalSegmentScanner::new(runner);

    scanner.scan(SegmentScanConfig {
        limit: Some(5),
        stop_on_first_found: true,
        missing_status: ScannedSegmentStatus::ProbablyDelayed,
    });
    assert_eq!(scanner.scanned.len(), 1);

    scanner.scan(SegmentScanConfig {
        limit: Some(2),
        stop_on_first_found: false,
        missing_status: ScannedSegmentStatus::ProbablyUploading,
    });
    assert_eq!(scanner.missing_segments(), vec![seg(8, 1)]);
    assert_eq!(scanner.scanned[2].status, ScannedSegmentStatus::ProbablyUploading);

    scanner.scan(SegmentScanConfig::unlimited(ScannedSegmentStatus::Lost));
    assert_eq!(scanner.scanned.len(), 5);
    assert_eq!(scanner.scanned[4].segment, seg(6, 1));
}

#[test]
fn recent_gaps_only_warn() -> pgdelta::Result<()> {
    let folder = MemoryFolder::new();
    archive(&folder, &(1..=0x0D).map(|n| seg(n, 1)).collect::<Vec<_>>())?;
    let limits = IntegrityScanLimits {
        max_delayed: 1,
        upload_concurrency: 2,
    };

    let report = verify_wal_integrity(&folder, "000000010000000000000010", Some(WalSegmentNo(3)), limits)?;
    assert_eq!(report.status, IntegrityStatus::Warning);
    let statuses: Vec<_> = report.details.iter().map(|d| d.status).collect();
    assert_eq!(
        statuses,
        vec![
            ScannedSegmentStatus::Found,
            ScannedSegmentStatus::ProbablyUploading,
            ScannedSegmentStatus::ProbablyDelayed,
        ]
    );
    assert_eq!(report.details[0].segments_count, 0x0D - 3 + 1);
    Ok(())
}

#[test]
fn complete_archive_across_a_switch_is_ok() -> pgdelta::Result<()> {
    let folder = MemoryFolder::new();
    folder.put("00000002.history", b"1\t0/5000A28\tno recovery target specified\n")?;
    archive(&folder, &[seg(3, 1), seg(4, 1), seg(5, 2), seg(6, 2)])?;
    let limits = IntegrityScanLimits {
        max_delayed: 1,
        upload_concurrency: 4,
    };

    let report = verify_wal_integrity(&folder, "000000020000000000000007", Some(WalSegmentNo(3)), limits)?;
    assert_eq!(report.status, IntegrityStatus::Ok);
    assert_eq!(report.status.to_string(), "OK");
    assert_eq!(report.details.len(), 2);
    Ok(())
}

#[test]
fn old_gap_without_backups_fails() -> pgdelta::Result<()> {
    let folder = MemoryFolder::new();
    archive(&folder, &[seg(1, 1), seg(2, 1), seg(4, 1), seg(5, 1)])?;
    let limits = IntegrityScanLimits {
        max_delayed: 0,
        upload_concurrency: 0,
    };

    let report = verify_wal_integrity(&folder, "000000010000000000000006", None, limits)?;
    assert_eq!(report.status, IntegrityStatus::Failure);
    let lost: Vec<_> = report
        .details
        .iter()
        .filter(|d| d.status == ScannedSegmentStatus::Lost)
        .map(|d| d.start_segment.as_str())
        .collect();
    assert_eq!(lost, vec!["000000010000000000000003"]);
    assert_eq!(ScannedSegmentStatus::Lost.to_string(), "MISSING_LOST");
    Ok(())
}
