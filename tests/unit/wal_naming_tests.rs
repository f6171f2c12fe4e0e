use pgdelta::wal::{
    delta_filename_for, delta_range, find_wal_filename, format_lsn, history_filename, is_wal_filename,
    next_wal_filename, parse_backup_history_filename, parse_lsn, parse_wal_filename, to_part_filename,
    wal_segment_range, DeltaNo, WalSegmentNo, WAL_SEGMENT_SIZE,
};
use pgdelta::Error;

#[test]
fn segment_numbers_cross_the_log_id_boundary() -> pgdelta::Result<()> {
    let last_of_log = parse_wal_filename("0000000200000003000000FF")?;
    assert_eq!(last_of_log, (2, WalSegmentNo(3 * 256 + 255)));
    assert_eq!(next_wal_filename("0000000200000003000000FF")?, "000000020000000400000000");
    assert_eq!(WalSegmentNo(0x400).filename(2), "000000020000000400000000");
    assert_eq!(WalSegmentNo::from_lsn(0x4_0000_0000 + 5), WalSegmentNo(0x400));
    assert_eq!(WalSegmentNo(0x400).first_lsn(), 0x4_0000_0000);
    Ok(())
}

#[test]
fn malformed_names_are_not_wal() {
    for name in [
        "00000001000000000000000",
        "0000000100000000000000100",
        "00000001000000000000000G",
        "000000010000000000000100",
        "00000001.history",
    ] {
        assert!(!is_wal_filename(name), "{name} should not parse");
    }
    let err = parse_wal_filename("not-a-wal").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotWalFilename(_))));
}

#[test]
fn delta_groups_cover_sixteen_segments() -> pgdelta::Result<()> {
    assert_eq!(delta_filename_for("00000001000000000000001F")?, "000000010000000000000010_delta");
    assert_eq!(delta_filename_for("000000010000000000000020")?, "000000010000000000000020_delta");
    assert_eq!(
        to_part_filename("000000010000000000000020_delta"),
        "000000010000000000000020_delta_part"
    );
    assert_eq!(DeltaNo(2).part_filename(1), "000000010000000000000020_delta_part");
    assert_eq!(WalSegmentNo(0x1F).position_in_delta(), 15);
    assert_eq!(DeltaNo::from_filename("000000010000000000000025")?, DeltaNo(2));
    Ok(())
}

#[test]
fn delta_and_segment_ranges_for_an_lsn_window() {
    let first_used = 0x11 * WAL_SEGMENT_SIZE + 0x28;
    let first_not_used = 0x23 * WAL_SEGMENT_SIZE + 0x100;
    assert_eq!(delta_range(first_used, first_not_used), (DeltaNo(1), DeltaNo(2)));
    assert_eq!(
        wal_segment_range(DeltaNo(2), first_not_used),
        (WalSegmentNo(0x20), WalSegmentNo(0x24))
    );

    // an LSN right at a segment start doesn't need that segment
    let at_boundary = 0x23 * WAL_SEGMENT_SIZE;
    assert_eq!(
        wal_segment_range(DeltaNo(2), at_boundary),
        (WalSegmentNo(0x20), WalSegmentNo(0x23))
    );
}

#[test]
fn lsn_text_and_history_names() -> pgdelta::Result<()> {
    assert_eq!(parse_lsn(&format_lsn(0x2_0000_0A28))?, 0x2_0000_0A28);
    assert_eq!(format_lsn(0), "0/0");
    let err = parse_lsn("1/XYZ").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidLsn(_))));

    assert_eq!(history_filename(3), "00000003.history");
    let history = parse_backup_history_filename("000000010000000000000003.00000028.backup")
        .expect("backup history file name");
    assert_eq!(history.timeline, 1);
    assert_eq!(history.segment, WalSegmentNo(3));
    assert_eq!(history.offset, 0x28);
    assert_eq!(history.wal_filename, "000000010000000000000003");
    Ok(())
}

#[test]
fn wal_names_are_found_inside_backup_names() {
    assert_eq!(
        find_wal_filename("base_000000010000000000000004_D_000000010000000000000002"),
        Some("000000010000000000000004")
    );
    assert_eq!(find_wal_filename("base_LATEST"), None);
}
