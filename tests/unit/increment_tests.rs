use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use pgdelta::delta::BlockSet;
use pgdelta::page::{
    create_file_from_increment, read_incremental_file, restore_missing_pages, write_pages_from_increment,
    IncrementHeader, DATABASE_PAGE_SIZE,
};
use pgdelta::Error;
use tempfile::tempdir;

/// A valid heap page stamped with `lsn`, its body filled with `fill`.
fn page(lsn: u64, fill: u8) -> Vec<u8> {
    let mut page = vec![fill; DATABASE_PAGE_SIZE];
    page[..24].fill(0);
    page[0..4].copy_from_slice(&((lsn >> 32) as u32).to_le_bytes());
    page[4..8].copy_from_slice(&(lsn as u32).to_le_bytes());
    page[12..14].copy_from_slice(&24u16.to_le_bytes());
    page[14..16].copy_from_slice(&8192u16.to_le_bytes());
    page[16..18].copy_from_slice(&8192u16.to_le_bytes());
    page[18..20].copy_from_slice(&(8192u16 + 4).to_le_bytes());
    page
}

fn write_relation(path: &Path, pages: &[Vec<u8>]) -> pgdelta::Result<u64> {
    let mut file = File::create(path)?;
    for page in pages {
        file.write_all(page)?;
    }
    Ok((pages.len() * DATABASE_PAGE_SIZE) as u64)
}

fn increment_bytes(path: &Path, size: u64, since_lsn: u64, bitmap: Option<&BlockSet>) -> pgdelta::Result<Vec<u8>> {
    let (mut reader, expected) = read_incremental_file(path, size, since_lsn, bitmap)?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    assert_eq!(bytes.len() as u64, expected);
    Ok(bytes)
}

#[test]
fn header_layout_and_validation() -> pgdelta::Result<()> {
    let header = IncrementHeader {
        file_size: 3 * DATABASE_PAGE_SIZE as u64,
        blocks: vec![2, 5, 9],
    };
    let encoded = header.encode();
    assert_eq!(encoded.len() as u64, header.encoded_len());
    assert_eq!(&encoded[..4], b"wi1\x55");
    assert_eq!(IncrementHeader::read_from(&mut encoded.as_slice())?, header);

    let mut wrong_magic = encoded.clone();
    wrong_magic[0] = b'x';
    let err = IncrementHeader::read_from(&mut wrong_magic.as_slice()).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidIncrementFileHeader)));

    let mut other_version = encoded.clone();
    other_version[2] = b'2';
    let err = IncrementHeader::read_from(&mut other_version.as_slice()).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnknownIncrementFileHeader(b'2'))));

    let truncated = &encoded[..encoded.len() - 2];
    let err = IncrementHeader::read_from(&mut &truncated[..]).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::IncrementTruncated(_))));
    Ok(())
}

#[test]
fn page_scan_selects_changed_and_new_pages() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("16384");
    let blank = vec![0u8; DATABASE_PAGE_SIZE];
    let size = write_relation(&path, &[page(0x100, 1), page(0x900, 2), blank, page(0x500, 3)])?;

    let bytes = increment_bytes(&path, size, 0x500, None)?;
    let header = IncrementHeader::read_from(&mut bytes.as_slice())?;
    assert_eq!(header.file_size, size);
    assert_eq!(header.blocks, vec![1, 2, 3]);
    let first_page = &bytes[header.encoded_len() as usize..][..DATABASE_PAGE_SIZE];
    assert_eq!(first_page, page(0x900, 2).as_slice());
    Ok(())
}

#[test]
fn invalid_page_aborts_the_scan() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("16384");
    let mut broken = page(0x100, 1);
    broken[10] = 0xFF;
    let size = write_relation(&path, &[page(0x100, 1), broken])?;

    let err = read_incremental_file(&path, size, 0x50, None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidBlock { block: 1, .. })
    ));
    Ok(())
}

#[test]
fn bitmap_selection_stops_at_the_file_size() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("16384");
    let size = write_relation(&path, &[page(0x100, 1), page(0x100, 2), page(0x100, 3)])?;
    let bitmap: BlockSet = [0u32, 2, 7].into_iter().collect();

    let bytes = increment_bytes(&path, size, u64::MAX, Some(&bitmap))?;
    let header = IncrementHeader::read_from(&mut bytes.as_slice())?;
    assert_eq!(header.blocks, vec![0, 2]);
    Ok(())
}

#[test]
fn increment_over_base_rebuilds_the_file() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let base_path = dir.path().join("base");
    let current_path = dir.path().join("current");
    write_relation(&base_path, &[page(0x100, 1), page(0x100, 2), page(0x100, 3)])?;
    let size = write_relation(
        &current_path,
        &[page(0x100, 1), page(0x800, 9), page(0x100, 3), page(0x900, 4)],
    )?;

    let increment = increment_bytes(&current_path, size, 0x800, None)?;
    let restored_path = dir.path().join("restored");
    let restored = OpenOptions::new().read(true).write(true).create(true).open(&restored_path)?;

    let missing = create_file_from_increment(&mut increment.as_slice(), &restored)?;
    assert_eq!(missing, 2);
    restore_missing_pages(&mut File::open(&base_path)?, &restored)?;

    assert_eq!(fs::read(&restored_path)?, fs::read(&current_path)?);
    Ok(())
}

#[test]
fn increment_pages_fill_only_empty_blocks_unless_overwriting() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let source = dir.path().join("source");
    let size = write_relation(&source, &[page(0x700, 7), page(0x700, 8)])?;
    let increment = increment_bytes(&source, size, 0x100, None)?;

    let target_path = dir.path().join("target");
    write_relation(&target_path, &[page(0x300, 1), vec![0u8; DATABASE_PAGE_SIZE]])?;
    let target = OpenOptions::new().read(true).write(true).open(&target_path)?;
    assert_eq!(write_pages_from_increment(&mut increment.as_slice(), &target, false)?, 1);
    let content = fs::read(&target_path)?;
    assert_eq!(&content[..DATABASE_PAGE_SIZE], page(0x300, 1).as_slice());
    assert_eq!(&content[DATABASE_PAGE_SIZE..], page(0x700, 8).as_slice());

    assert_eq!(write_pages_from_increment(&mut increment.as_slice(), &target, true)?, 2);
    assert_eq!(fs::read(&target_path)?, fs::read(&source)?);
    Ok(())
}
