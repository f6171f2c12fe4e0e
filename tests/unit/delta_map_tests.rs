#[path = "../support/walgen.rs"]
mod walgen;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use pgdelta::compression::CompressionMethod;
use pgdelta::delta::{extract_locations_from_wal_file, get_delta_map, DeltaFile};
use pgdelta::storage::{Folder, FolderRef, MemoryFolder, Uploader};
use pgdelta::wal::WAL_SEGMENT_SIZE;
use pgdelta::walparser::{BlockLocation, WalParser, WAL_PAGE_SIZE};
use walgen::{heap_record, loc, WalStream};

fn wal_folder() -> (FolderRef, Uploader) {
    let folder: FolderRef = Arc::new(MemoryFolder::new());
    let uploader = Uploader::new(folder.clone(), CompressionMethod::Lz4);
    (folder, uploader)
}

fn upload_segment(uploader: &Uploader, wal: &mut WalStream, records: &[Vec<u8>]) -> pgdelta::Result<()> {
    let name = wal.next_name();
    let bytes = wal.segment(records);
    uploader.upload(&name, &mut bytes.as_slice())?;
    Ok(())
}

fn bitmap(map: &pgdelta::delta::DeltaMap, path: &str) -> pgdelta::Result<Vec<u32>> {
    Ok(map.delta_bitmap_for(Path::new(path))?.iter().collect())
}

#[test]
fn wal_file_replay_stops_at_the_end_of_written_wal() -> pgdelta::Result<()> {
    let mut wal = WalStream::new(1, 1, 4);
    let mut segment = wal.segment(&[heap_record(&[loc(16384, 1), loc(16384, 4)], &[])]);
    // garbage after the written part is never looked at
    segment[3 * WAL_PAGE_SIZE..].fill(0x5A);

    let mut parser = WalParser::new();
    let locations = extract_locations_from_wal_file(&mut parser, segment.as_slice())?;
    assert_eq!(locations, vec![loc(16384, 1), loc(16384, 4)]);
    Ok(())
}

#[test]
fn map_without_delta_files_replays_the_segments() -> pgdelta::Result<()> {
    let (folder, uploader) = wal_folder();
    let mut wal = WalStream::new(1, 0x10, 2);
    upload_segment(
        &uploader,
        &mut wal,
        &[heap_record(&[loc(16384, 0)], &[]), heap_record(&[loc(16384, 7)], &vec![0x11; 20000])],
    )?;
    upload_segment(&uploader, &mut wal, &[heap_record(&[loc(16390, 2)], &[])])?;
    upload_segment(&uploader, &mut wal, &[heap_record(&[loc(16384, 3)], &[])])?;

    let first_used = 0x10 * WAL_SEGMENT_SIZE + 0x28;
    let first_not_used = 0x12 * WAL_SEGMENT_SIZE + 0x100;
    let map = get_delta_map(folder.as_ref(), 1, first_used, first_not_used)?;

    assert_eq!(map.relation_count(), 2);
    assert_eq!(bitmap(&map, "base/5/16384")?, vec![0, 3, 7]);
    assert_eq!(bitmap(&map, "base/5/16390")?, vec![2]);
    Ok(())
}

/// Delta for the group `0x10..0x1F` whose last segment ends inside a record
/// continued by segment `0x20`, plus the segments `0x20..=0x21`.
fn delta_and_tail(folder: &FolderRef, uploader: &Uploader, upload_last: bool) -> pgdelta::Result<()> {
    let mut wal = WalStream::new(1, 0x1F, 2);
    let group_end = wal.segment(&[
        heap_record(&[loc(16384, 5)], &[]),
        heap_record(&[loc(16400, 11)], &vec![0x22; 20000]),
    ]);
    let mut parser = WalParser::new();
    for page in group_end.chunks(WAL_PAGE_SIZE) {
        parser.parse_records_from_page(page)?;
    }
    assert!(parser.has_current_record_beginning());

    let mut delta = DeltaFile::new(parser);
    delta.locations = vec![loc(16384, 1), loc(16384, 5), BlockLocation::new(1663, 5, 16384, 131072 + 2)];
    let mut saved = Vec::new();
    delta.save(&mut saved)?;
    uploader.upload("000000010000000000000010_delta", &mut saved.as_slice())?;

    upload_segment(uploader, &mut wal, &[heap_record(&[loc(16384, 6)], &[])])?;
    if upload_last {
        upload_segment(uploader, &mut wal, &[heap_record(&[loc(16390, 9)], &[])])?;
    }
    assert_eq!(folder.list()?.objects.len(), if upload_last { 3 } else { 2 });
    Ok(())
}

#[test]
fn map_combines_delta_files_with_the_tail_segments() -> pgdelta::Result<()> {
    let (folder, uploader) = wal_folder();
    delta_and_tail(&folder, &uploader, true)?;

    let first_used = 0x10 * WAL_SEGMENT_SIZE + 0x28;
    let first_not_used = 0x21 * WAL_SEGMENT_SIZE + 0x200;
    let map = get_delta_map(folder.as_ref(), 1, first_used, first_not_used)?;

    assert_eq!(bitmap(&map, "base/5/16384")?, vec![1, 5, 6]);
    assert_eq!(bitmap(&map, "base/5/16384.1")?, vec![2]);
    assert_eq!(bitmap(&map, "base/5/16390")?, vec![9]);
    // finished in the tail from the parser state saved in the delta
    assert_eq!(bitmap(&map, "base/5/16400")?, vec![11]);
    Ok(())
}

#[test]
fn missing_tail_segment_is_named_in_the_error() -> pgdelta::Result<()> {
    let (folder, uploader) = wal_folder();
    delta_and_tail(&folder, &uploader, false)?;

    let first_used = 0x10 * WAL_SEGMENT_SIZE + 0x28;
    let first_not_used = 0x21 * WAL_SEGMENT_SIZE + 0x200;
    let err = get_delta_map(folder.as_ref(), 1, first_used, first_not_used).unwrap_err();
    assert!(
        format!("{err:#}").contains("000000010000000000000021"),
        "unexpected error: {err:#}"
    );
    Ok(())
}

#[test]
fn untouched_relation_has_no_bitmap() -> pgdelta::Result<()> {
    let (folder, uploader) = wal_folder();
    let mut wal = WalStream::new(1, 0x30, 1);
    upload_segment(&uploader, &mut wal, &[heap_record(&[loc(16384, 0)], &[])])?;

    let map = get_delta_map(folder.as_ref(), 1, 0x30 * WAL_SEGMENT_SIZE, 0x30 * WAL_SEGMENT_SIZE + 0x80)?;
    let touched: HashSet<_> = bitmap(&map, "base/5/16384")?.into_iter().collect();
    assert_eq!(touched, HashSet::from([0]));
    let err = map.delta_bitmap_for(Path::new("base/5/16390")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<pgdelta::Error>(),
        Some(pgdelta::Error::NoBitmapFound(_))
    ));
    Ok(())
}
