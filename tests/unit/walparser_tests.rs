#[path = "../support/walgen.rs"]
mod walgen;

use pgdelta::walparser::{extract_block_locations, BlockImageLayout, ParseError, WalParser, WAL_PAGE_SIZE};
use walgen::{heap_record, loc, switch_record, WalStream, PAGE_MAGIC_PG14};

fn page(segment: &[u8], n: usize) -> &[u8] {
    &segment[n * WAL_PAGE_SIZE..(n + 1) * WAL_PAGE_SIZE]
}

#[test]
fn records_of_one_page_are_decoded() -> pgdelta::Result<()> {
    let mut wal = WalStream::new(1, 1, 1);
    let segment = wal.segment(&[
        heap_record(&[loc(16384, 0), loc(16384, 1)], b"insert"),
        heap_record(&[loc(16390, 7)], &[]),
    ]);

    let mut parser = WalParser::new();
    let parsed = parser.parse_records_from_page(page(&segment, 0))?;
    assert_eq!(parsed.records.len(), 2);
    assert_eq!(parsed.discarded_tail, Some(Vec::new()));
    assert!(parsed.partial, "unwritten rest of the page marks a partial page");
    assert_eq!(parsed.layout, BlockImageLayout::Modern);

    let first = &parsed.records[0];
    assert_eq!(first.main_data, b"insert");
    assert!(!first.blocks[0].header.same_rel());
    assert!(first.blocks[1].header.same_rel());
    assert_eq!(first.blocks[1].data.len(), 4);

    assert_eq!(
        extract_block_locations(&parsed.records),
        vec![loc(16384, 0), loc(16384, 1), loc(16390, 7)]
    );
    Ok(())
}

#[test]
fn record_crossing_a_page_is_stitched() -> pgdelta::Result<()> {
    let mut wal = WalStream::new(1, 1, 2);
    let big = heap_record(&[loc(16384, 3)], &vec![0x11; 9000]);
    let segment = wal.segment(&[heap_record(&[loc(16384, 1)], &[]), big, heap_record(&[loc(16384, 2)], &[])]);

    let mut parser = WalParser::new();
    let first = parser.parse_records_from_page(page(&segment, 0))?;
    assert_eq!(extract_block_locations(&first.records), vec![loc(16384, 1)]);
    assert!(parser.has_current_record_beginning());

    let second = parser.parse_records_from_page(page(&segment, 1))?;
    assert_eq!(second.discarded_tail, None);
    assert_eq!(second.records.len(), 2);
    assert_eq!(second.records[0].main_data.len(), 9000);
    assert_eq!(
        extract_block_locations(&second.records),
        vec![loc(16384, 3), loc(16384, 2)]
    );
    Ok(())
}

#[test]
fn saved_parser_resumes_the_open_record() -> pgdelta::Result<()> {
    let mut wal = WalStream::new(1, 1, 2);
    let segment = wal.segment(&[heap_record(&[loc(16400, 9)], &vec![0x22; 12000])]);

    let mut parser = WalParser::new();
    parser.parse_records_from_page(page(&segment, 0))?;
    let mut saved = Vec::new();
    parser.save(&mut saved)?;

    let mut resumed = WalParser::load(&mut saved.as_slice())?;
    assert_eq!(resumed, parser);
    let parsed = resumed.parse_records_from_page(page(&segment, 1))?;
    assert_eq!(extract_block_locations(&parsed.records), vec![loc(16400, 9)]);
    Ok(())
}

#[test]
fn parser_started_mid_record_hands_back_the_tail() -> pgdelta::Result<()> {
    let mut wal = WalStream::new(1, 1, 2);
    wal.segment(&[heap_record(&[loc(16384, 1)], &[]), heap_record(&[loc(16384, 2)], &vec![0x33; 20000])]);
    let tail = wal.pending().to_vec();
    assert!(!tail.is_empty());
    let segment = wal.segment(&[heap_record(&[loc(16384, 5)], &[])]);

    let mut parser = WalParser::new();
    let parsed = parser.parse_records_from_page(page(&segment, 0))?;
    assert_eq!(parsed.discarded_tail, Some(tail));
    assert_eq!(extract_block_locations(&parsed.records), vec![loc(16384, 5)]);

    let err = parser.save(&mut Vec::new());
    assert!(err.is_ok(), "a parser without an open record can always be saved");
    Ok(())
}

#[test]
fn partial_record_without_beginning_cannot_be_saved() -> pgdelta::Result<()> {
    let mut wal = WalStream::new(1, 1, 2);
    wal.segment(&[heap_record(&[loc(16384, 2)], &vec![0x44; 34000])]);
    // continuation longer than one page: the fresh parser holds bytes with no beginning
    let segment = wal.segment(&[]);
    let mut parser = WalParser::new();
    let parsed = parser.parse_records_from_page(page(&segment, 0))?;
    assert!(parsed.records.is_empty());
    assert!(matches!(parser.save(&mut Vec::new()), Err(ParseError::CantSavePartialParser)));
    Ok(())
}

#[test]
fn switch_record_ends_the_page() -> pgdelta::Result<()> {
    let mut wal = WalStream::new(1, 1, 1);
    let segment = wal.segment(&[
        heap_record(&[loc(16384, 1)], &[]),
        switch_record(),
        heap_record(&[loc(16384, 2)], &[]),
    ]);
    let parsed = WalParser::new().parse_records_from_page(page(&segment, 0))?;
    assert_eq!(parsed.records.len(), 2);
    assert!(parsed.records[1].is_wal_switch());
    assert_eq!(extract_block_locations(&parsed.records), vec![loc(16384, 1)]);
    Ok(())
}

#[test]
fn old_page_magic_selects_the_old_image_layout() -> pgdelta::Result<()> {
    let mut wal = WalStream::new(1, 1, 1);
    wal.magic = PAGE_MAGIC_PG14;
    let segment = wal.segment(&[heap_record(&[loc(16384, 1)], &[])]);
    let parsed = WalParser::new().parse_records_from_page(page(&segment, 0))?;
    assert_eq!(parsed.layout, BlockImageLayout::Pre15);
    assert_eq!(BlockImageLayout::from_page_magic(0xD110), BlockImageLayout::Modern);
    Ok(())
}

#[test]
fn malformed_input_is_rejected() {
    let mut parser = WalParser::new();
    assert!(matches!(
        parser.parse_records_from_page(&vec![0u8; WAL_PAGE_SIZE]),
        Err(ParseError::ZeroPage)
    ));
    assert!(matches!(
        parser.parse_records_from_page(&[1u8; 100]),
        Err(ParseError::WrongPageSize(100))
    ));

    let mut garbage = vec![0u8; WAL_PAGE_SIZE];
    garbage[0..2].copy_from_slice(&0xD113u16.to_le_bytes());
    garbage[2..4].copy_from_slice(&0x0100u16.to_le_bytes());
    assert!(matches!(
        parser.parse_records_from_page(&garbage),
        Err(ParseError::InvalidPageHeader(_))
    ));
}
