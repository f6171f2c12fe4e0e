#[path = "../support/walgen.rs"]
mod walgen;

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use pgdelta::compression::CompressionMethod;
use pgdelta::delta::{load_delta_file, DeltaFileManager};
use pgdelta::logging::DeltaFlushSnapshot;
use pgdelta::storage::{download_and_decompress, DataFolder, Folder, FolderRef, MemoryFolder, Uploader};
use pgdelta::wal::push::{ArchiveStatusManager, WalUploader};
use pgdelta::walparser::BlockLocation;
use tempfile::tempdir;
use walgen::{heap_record, loc, WalStream};

const GROUP: &str = "000000010000000000000010_delta";
const NEXT_GROUP_PART: &str = "000000010000000000000020_delta_part";

/// A fresh uploader over the shared local state, as each `wal-push` process builds one.
fn wal_push_process(dir: &Path, folder: &FolderRef) -> pgdelta::Result<WalUploader> {
    let manager = DeltaFileManager::new(DataFolder::new(dir.join("state/delta"))?);
    Ok(WalUploader::new(
        Uploader::new(folder.clone(), CompressionMethod::Lz4),
        Some(Arc::new(manager)),
        ArchiveStatusManager::new(DataFolder::new(dir.join("state/archive_status"))?),
        false,
    ))
}

fn push_segment(dir: &Path, folder: &FolderRef, wal: &mut WalStream, records: &[Vec<u8>]) -> pgdelta::Result<DeltaFlushSnapshot> {
    let path = dir.join("pg_wal").join(wal.next_name());
    fs::create_dir_all(dir.join("pg_wal"))?;
    fs::write(&path, wal.segment(records))?;
    let process = wal_push_process(dir, folder)?;
    process.upload_wal_file(&path)?;
    Ok(process.flush_files().unwrap_or_default())
}

fn state_files(dir: &Path) -> pgdelta::Result<HashSet<String>> {
    Ok(DataFolder::new(dir.join("state/delta"))?.file_names()?.into_iter().collect())
}

#[test]
fn group_recorded_across_processes_is_uploaded_once_complete() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let folder: FolderRef = Arc::new(MemoryFolder::new());
    let mut wal = WalStream::new(1, 0x10, 2);
    let mut expected: HashSet<BlockLocation> = HashSet::new();

    let first = push_segment(dir.path(), &folder, &mut wal, &[heap_record(&[loc(16384, 0x10)], &[])])?;
    expected.insert(loc(16384, 0x10));
    assert_eq!(first, DeltaFlushSnapshot { completed: 0, saved: 1, canceled: 0 });

    // the backup started in this group: nothing before segment 0x10 will ever arrive
    let history = dir.path().join("pg_wal/000000010000000000000010.00000028.backup");
    fs::write(&history, b"START WAL LOCATION: 0/10000028")?;
    let process = wal_push_process(dir.path(), &folder)?;
    process.handle_backup_history_file(&history)?;
    assert_eq!(process.flush_files().map(|s| s.completed), Some(0));

    for segment in 0x11u32..=0x1F {
        let records = if segment == 0x13 {
            expected.insert(loc(16384, 0x13));
            expected.insert(loc(16400, 1));
            vec![heap_record(&[loc(16384, 0x13)], &[]), heap_record(&[loc(16400, 1)], &vec![0x42; 20000])]
        } else {
            expected.insert(loc(16384, segment));
            vec![heap_record(&[loc(16384, segment)], &[])]
        };
        let snapshot = push_segment(dir.path(), &folder, &mut wal, &records)?;
        assert_eq!(snapshot.canceled, 0, "segment {segment:X}");
        if segment == 0x1F {
            assert_eq!(snapshot.completed, 1);
        } else {
            assert_eq!(snapshot.completed, 0, "segment {segment:X}");
        }
    }

    let delta = load_delta_file(folder.as_ref(), GROUP)?;
    let recorded: HashSet<BlockLocation> = delta.locations.iter().copied().collect();
    // the record crossing 0x13 -> 0x14 comes from the part file
    assert!(recorded.contains(&loc(16400, 1)));
    assert_eq!(recorded, expected);
    assert!(delta.wal_parser.current_record_data().is_empty());

    assert_eq!(state_files(dir.path())?, HashSet::from([NEXT_GROUP_PART.to_string()]));
    for segment in 0x10u64..=0x1F {
        let name = pgdelta::wal::WalSegmentNo(segment).filename(1);
        let mut archived = Vec::new();
        download_and_decompress(folder.as_ref(), &name)?.read_to_end(&mut archived)?;
        assert_eq!(archived, fs::read(dir.path().join("pg_wal").join(&name))?);
    }
    Ok(())
}

#[test]
fn unreadable_segment_cancels_the_group_but_still_uploads() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let folder: FolderRef = Arc::new(MemoryFolder::new());
    let name = "000000010000000000000031";
    let path = dir.path().join(name);
    let mut garbage = vec![0u8; 2 * pgdelta::walparser::WAL_PAGE_SIZE];
    garbage[0..2].copy_from_slice(&0xD113u16.to_le_bytes());
    garbage[2..4].copy_from_slice(&0x0100u16.to_le_bytes());
    fs::write(&path, &garbage)?;

    let process = wal_push_process(dir.path(), &folder)?;
    process.upload_wal_file(&path)?;
    let snapshot = process.flush_files().unwrap_or_default();
    assert_eq!(snapshot.canceled, 1);
    assert_eq!(snapshot.completed + snapshot.saved, 0);

    let manager = process.delta_manager().cloned().expect("delta recording enabled");
    assert!(manager.is_canceled("000000010000000000000030_delta"));
    assert!(!folder.exists("000000010000000000000030_delta.lz4")?);
    assert!(state_files(dir.path())?.is_empty());

    let mut archived = Vec::new();
    download_and_decompress(folder.as_ref(), name)?.read_to_end(&mut archived)?;
    assert_eq!(archived, garbage);
    Ok(())
}
