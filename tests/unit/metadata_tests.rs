use std::sync::Arc;

use chrono::{TimeZone, Utc};
use pgdelta::backup::list::render_backup_table;
use pgdelta::backup::{
    backup_details, backup_name, latest_backup_name, mark_backup, wal_segment_of, Backup, BackupSentinelDto,
    ExtendedMetadataDto, LATEST,
};
use pgdelta::storage::{FolderRef, MemoryFolder};
use pgdelta::Error;

const FULL: &str = "base_000000010000000000000002";
const FIRST_INC: &str = "base_000000010000000000000005_D_000000010000000000000002";
const SECOND_INC: &str = "base_000000010000000000000009_D_000000010000000000000005";

fn store(folder: &FolderRef, name: &str, parent: Option<(&str, u32)>, start: u64, finish: u64) -> pgdelta::Result<()> {
    let backup = Backup::new(folder.clone(), name);
    let sentinel = BackupSentinelDto {
        start_lsn: Some(start),
        finish_lsn: Some(finish),
        increment_from: parent.map(|(p, _)| p.to_string()),
        increment_from_lsn: parent.map(|_| start - 0x100_0000),
        increment_full_name: parent.map(|_| FULL.to_string()),
        increment_count: parent.map(|(_, count)| count),
        pg_version: 160_002,
        ..Default::default()
    };
    let now = Utc::now();
    backup.upload_meta(&ExtendedMetadataDto {
        start_time: now,
        finish_time: now,
        hostname: "db1".into(),
        data_dir: "/var/lib/postgresql/16/main".into(),
        pg_version: 160_002,
        start_lsn: start,
        finish_lsn: finish,
        is_permanent: false,
        system_identifier: Some(7_000_000_000_000_000_001),
        uncompressed_size: 0,
        compressed_size: 0,
        user_data: None,
    })?;
    backup.upload_sentinel(&sentinel)
}

fn chain_of_three() -> pgdelta::Result<FolderRef> {
    let folder: FolderRef = Arc::new(MemoryFolder::new());
    store(&folder, FULL, None, 0x200_0028, 0x200_1000)?;
    store(&folder, FIRST_INC, Some((FULL, 1)), 0x500_0028, 0x500_1000)?;
    store(&folder, SECOND_INC, Some((FIRST_INC, 2)), 0x900_0028, 0x900_1000)?;
    Ok(folder)
}

#[test]
fn stored_sentinel_documents_are_read() -> pgdelta::Result<()> {
    let json = r#"{
        "LSN": 83886120,
        "DeltaFromLSN": 33554472,
        "DeltaFrom": "base_000000010000000000000002",
        "DeltaFullName": "base_000000010000000000000002",
        "DeltaCount": 1,
        "Files": {
            "base/5/16384": {"IsIncremented": true, "IsSkipped": false, "MTime": "2024-03-01T10:00:00Z"},
            "PG_VERSION": {"IsIncremented": false, "IsSkipped": true, "MTime": "2024-01-01T00:00:00Z"}
        },
        "TarFileSets": {"part_1.tar": ["base/5/16384"]},
        "PgVersion": 160002,
        "FinishLSN": 83890176,
        "SystemIdentifier": 7000000000000000001,
        "UncompressedSize": 24576,
        "CompressedSize": 1200,
        "UserData": {"env": "prod"}
    }"#;
    let sentinel: BackupSentinelDto = serde_json::from_str(json)?;
    sentinel.validate("base_000000010000000000000005_D_000000010000000000000002")?;
    assert!(sentinel.is_incremental());
    assert_eq!(sentinel.start_lsn, Some(0x500_0028));
    let files = sentinel.files.as_ref().expect("inline files");
    assert!(files["base/5/16384"].is_incremented);
    assert!(files["PG_VERSION"].is_skipped);
    assert_eq!(files["PG_VERSION"].mtime, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    assert_eq!(sentinel.user_data, Some(serde_json::json!({"env": "prod"})));

    // documents written before increments existed carry none of the fields
    let old: BackupSentinelDto = serde_json::from_str(r#"{"LSN": 16777256, "PgVersion": 90600}"#)?;
    assert!(!old.is_incremental());
    assert_eq!(old.finish_lsn, None);
    Ok(())
}

#[test]
fn names_embed_the_start_segment() {
    assert_eq!(backup_name("000000010000000000000002", None), FULL);
    assert_eq!(backup_name("000000010000000000000005", Some(FULL)), FIRST_INC);
    assert_eq!(backup_name("000000010000000000000009", Some(FIRST_INC)), SECOND_INC);
    assert_eq!(wal_segment_of(SECOND_INC), "000000010000000000000009");
    assert_eq!(wal_segment_of(LATEST), LATEST);
}

#[test]
fn listing_reports_each_completed_backup() -> pgdelta::Result<()> {
    let folder = chain_of_three()?;
    // data without a sentinel is an unfinished backup
    folder.sub_folder("base_00000001000000000000000A").put("metadata.json", b"{}")?;

    assert_eq!(latest_backup_name(folder.as_ref())?.as_deref(), Some(SECOND_INC));
    let details = backup_details(&folder)?;
    let names: Vec<_> = details.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec![FULL, FIRST_INC, SECOND_INC]);
    assert_eq!(details[1].start_lsn.as_deref(), Some("0/5000028"));
    assert_eq!(details[1].increment_from.as_deref(), Some(FULL));
    assert_eq!(details[0].wal_file_name, "000000010000000000000002");

    let table = render_backup_table(&details);
    assert!(table.starts_with("name\tmodified\t"));
    assert_eq!(table.lines().count(), 4);
    Ok(())
}

#[test]
fn empty_storage_has_no_latest_backup() -> pgdelta::Result<()> {
    let folder: FolderRef = Arc::new(MemoryFolder::new());
    assert_eq!(latest_backup_name(folder.as_ref())?, None);
    let err = Backup::new(folder, FULL).fetch_sentinel().unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::MissingBackup(name)) if name == FULL));
    Ok(())
}

#[test]
fn permanence_spreads_to_ancestors_and_blocks_unmarking_them() -> pgdelta::Result<()> {
    let folder = chain_of_three()?;

    let changed = mark_backup(&folder, FIRST_INC, true)?;
    assert_eq!(changed, vec![FULL.to_string(), FIRST_INC.to_string()]);
    assert!(Backup::new(folder.clone(), FULL).is_permanent()?);
    assert!(!Backup::new(folder.clone(), SECOND_INC).is_permanent()?);

    let err = mark_backup(&folder, FULL, false).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::PermanentDependency(name)) if name == FULL));

    assert_eq!(mark_backup(&folder, SECOND_INC, true)?, vec![SECOND_INC.to_string()]);
    assert_eq!(mark_backup(&folder, SECOND_INC, false)?, vec![SECOND_INC.to_string()]);
    assert_eq!(mark_backup(&folder, FIRST_INC, false)?, vec![FIRST_INC.to_string()]);
    assert_eq!(mark_backup(&folder, FULL, false)?, vec![FULL.to_string()]);
    assert!(backup_details(&folder)?.iter().all(|d| !d.is_permanent));
    Ok(())
}
