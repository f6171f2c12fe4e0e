//! WAL page header and the record stream carried by one WAL page.

use super::record::{BlockImageLayout, XLogRecord, XLOG_RECORD_HEADER_SIZE};
use super::{all_zero, ByteReader, ParseError, XLOG_RECORD_ALIGNMENT};

pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;
const XLP_BKP_REMOVABLE: u16 = 0x0004;
const XLP_FIRST_IS_OVERWRITE_CONTRECORD: u16 = 0x0008;
const XLP_ALL_FLAGS: u16 =
    XLP_FIRST_IS_CONTRECORD | XLP_LONG_HEADER | XLP_BKP_REMOVABLE | XLP_FIRST_IS_OVERWRITE_CONTRECORD;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XLogLongPageHeaderFields {
    pub system_id: u64,
    pub segment_size: u32,
    pub xlog_block_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XLogPageHeader {
    pub magic: u16,
    pub info: u16,
    pub timeline: u32,
    pub page_address: u64,
    pub remaining_data_len: u32,
    pub long: Option<XLogLongPageHeaderFields>,
}

impl XLogPageHeader {
    pub(crate) fn read(reader: &mut ByteReader<'_>) -> Result<Self, ParseError> {
        let mut header = Self {
            magic: reader.u16("page magic")?,
            info: reader.u16("page info")?,
            timeline: reader.u32("page timeline")?,
            page_address: reader.u64("page address")?,
            remaining_data_len: reader.u32("remaining data length")?,
            long: None,
        };
        if header.is_zero() {
            return Err(ParseError::ZeroPageHeader);
        }
        if header.info & XLP_LONG_HEADER != 0 {
            reader.align(XLOG_RECORD_ALIGNMENT);
            header.long = Some(XLogLongPageHeaderFields {
                system_id: reader.u64("system id")?,
                segment_size: reader.u32("segment size")?,
                xlog_block_size: reader.u32("xlog block size")?,
            });
        }
        header.check_consistency()?;
        Ok(header)
    }

    fn is_zero(&self) -> bool {
        self.magic == 0
            && self.info == 0
            && self.timeline == 0
            && self.page_address == 0
            && self.remaining_data_len == 0
    }

    fn check_consistency(&self) -> Result<(), ParseError> {
        if self.info & !XLP_ALL_FLAGS != 0 {
            return Err(ParseError::InvalidPageHeader(format!(
                "unknown page info bits {:#06x}",
                self.info
            )));
        }
        if self.info & XLP_FIRST_IS_CONTRECORD == 0 && self.remaining_data_len != 0 {
            return Err(ParseError::InvalidPageHeader(format!(
                "{} bytes of continuation data without the continuation flag",
                self.remaining_data_len
            )));
        }
        Ok(())
    }

    pub fn image_layout(&self) -> BlockImageLayout {
        BlockImageLayout::from_page_magic(self.magic)
    }
}

/// One decoded WAL page.
#[derive(Debug, Clone, Default)]
pub(crate) struct XLogPage {
    pub header: XLogPageHeader,
    /// Bytes finishing the record that started on an earlier page.
    pub prev_record_trailing_data: Vec<u8>,
    /// Records fully contained in this page.
    pub records: Vec<XLogRecord>,
    /// Beginning of a record that continues on the next page.
    pub next_record_heading_data: Vec<u8>,
    /// The page ended in zero bytes: the rest of the file was never written.
    pub partial: bool,
}

enum RecordRead<'a> {
    Whole(&'a [u8]),
    Heading(&'a [u8]),
}

/// Read the next record starting at an aligned position: either the whole
/// record, or the heading bytes of a record that crosses the page end.
fn try_read_record_data<'a>(reader: &mut ByteReader<'a>) -> Result<RecordRead<'a>, ParseError> {
    reader.align(XLOG_RECORD_ALIGNMENT);
    if reader.remaining() < 4 {
        return Ok(RecordRead::Heading(reader.rest()));
    }
    let start = reader.position();
    let total_len = reader.peek_u32();
    if total_len == 0 {
        reader.take(4, "record length")?;
        return Err(ParseError::ZeroRecordHeader);
    }
    if (total_len as usize) < XLOG_RECORD_HEADER_SIZE {
        return Err(ParseError::InvalidRecordHeader(format!(
            "record at offset {start} declares length {total_len}"
        )));
    }
    if reader.remaining() < total_len as usize {
        return Ok(RecordRead::Heading(reader.rest()));
    }
    Ok(RecordRead::Whole(reader.take(total_len as usize, "record")?))
}

/// Turn a record-read failure into a partial page when everything after the
/// failing zero record header is zero as well.
fn check_partial_page(
    reader: &mut ByteReader<'_>,
    mut page: XLogPage,
    error: ParseError,
) -> Result<XLogPage, ParseError> {
    if matches!(error, ParseError::ZeroRecordHeader) && all_zero(reader.rest()) {
        page.partial = true;
        return Ok(page);
    }
    Err(error)
}

/// Decode one page. `current_record` is the heading data of the record that
/// is continued on this page, if its beginning is known.
pub(crate) fn parse_page(data: &[u8], current_record: Option<&[u8]>) -> Result<XLogPage, ParseError> {
    let mut reader = ByteReader::new(data);
    let header = match XLogPageHeader::read(&mut reader) {
        Ok(header) => header,
        Err(ParseError::ZeroPageHeader) => {
            if all_zero(reader.rest()) {
                return Err(ParseError::ZeroPage);
            }
            return Err(ParseError::ZeroPageHeader);
        }
        Err(e) => return Err(e),
    };
    let layout = header.image_layout();
    reader.align(XLOG_RECORD_ALIGNMENT);

    let wanted = header.remaining_data_len as usize;
    let trailing = reader.take_up_to(wanted).to_vec();
    let mut page = XLogPage {
        header,
        prev_record_trailing_data: trailing,
        ..Default::default()
    };
    if page.prev_record_trailing_data.len() != wanted {
        return Ok(page);
    }

    if let Some(head) = current_record {
        let mut whole = head.to_vec();
        whole.extend_from_slice(&page.prev_record_trailing_data);
        let record = XLogRecord::parse(&whole, layout)?;
        if record.is_wal_switch() {
            return Ok(page);
        }
    }

    loop {
        match try_read_record_data(&mut reader) {
            Ok(RecordRead::Whole(bytes)) => {
                match XLogRecord::parse(bytes, layout) {
                    Ok(record) => {
                        let switch = record.is_wal_switch();
                        page.records.push(record);
                        if switch {
                            return Ok(page);
                        }
                    }
                    Err(e) => return check_partial_page(&mut reader, page, e),
                }
            }
            Ok(RecordRead::Heading(bytes)) => {
                page.next_record_heading_data = bytes.to_vec();
                return Ok(page);
            }
            Err(e) => return check_partial_page(&mut reader, page, e),
        }
    }
}
