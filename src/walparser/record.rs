//! XLog record layout: fixed header, block reference headers, block images
//! and data, then main data.

use super::location::{BlockLocation, RelFileNode};
use super::{ByteReader, ParseError, BLOCK_SIZE};

pub const XLOG_RECORD_HEADER_SIZE: usize = 24;
pub const XLR_MAX_BLOCK_ID: u8 = 32;

const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
const XLR_BLOCK_ID_ORIGIN: u8 = 253;
const XLR_BLOCK_ID_TOPLEVEL_XID: u8 = 252;

pub const BKPBLOCK_FORK_MASK: u8 = 0x0F;
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
pub const BKPBLOCK_WILL_INIT: u8 = 0x40;
pub const BKPBLOCK_SAME_REL: u8 = 0x80;

pub const BKPIMAGE_HAS_HOLE: u8 = 0x01;
const BKPIMAGE_IS_COMPRESSED_PRE15: u8 = 0x02;
const BKPIMAGE_COMPRESSED_MODERN: u8 = 0x04 | 0x08 | 0x10;

pub const MAIN_FORK_NUM: u8 = 0;

const RM_XLOG_ID: u8 = 0;
const XLOG_SWITCH: u8 = 0x40;
const XLR_RMGR_INFO_MASK: u8 = 0xF0;

/// First `XLOG_PAGE_MAGIC` of the releases that re-numbered the block image flags.
const FIRST_MODERN_PAGE_MAGIC: u16 = 0xD110;

/// Which bit assignment of `bimg_info` the WAL was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockImageLayout {
    /// Up to Postgres 14: bit 0x02 marks a compressed image.
    Pre15,
    /// Postgres 15 and later: bits 0x04, 0x08 and 0x10 mark the compression method.
    #[default]
    Modern,
}

impl BlockImageLayout {
    pub fn from_page_magic(magic: u16) -> Self {
        if magic >= FIRST_MODERN_PAGE_MAGIC {
            Self::Modern
        } else {
            Self::Pre15
        }
    }

    fn is_compressed(self, info: u8) -> bool {
        match self {
            Self::Pre15 => info & BKPIMAGE_IS_COMPRESSED_PRE15 != 0,
            Self::Modern => info & BKPIMAGE_COMPRESSED_MODERN != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XLogRecordHeader {
    pub total_record_length: u32,
    pub xact_id: u32,
    pub prev_record_ptr: u64,
    pub info: u8,
    pub resource_manager_id: u8,
    pub crc32_hash: u32,
}

impl XLogRecordHeader {
    pub(crate) fn read(reader: &mut ByteReader<'_>) -> Result<Self, ParseError> {
        let total_record_length = reader.u32("total record length")?;
        let xact_id = reader.u32("xact id")?;
        let prev_record_ptr = reader.u64("prev record ptr")?;
        let info = reader.u8("info")?;
        let resource_manager_id = reader.u8("resource manager id")?;
        reader.take(2, "padding")?;
        let crc32_hash = reader.u32("crc32 hash")?;
        let header = Self {
            total_record_length,
            xact_id,
            prev_record_ptr,
            info,
            resource_manager_id,
            crc32_hash,
        };
        header.check_consistency()?;
        Ok(header)
    }

    pub(crate) fn check_consistency(&self) -> Result<(), ParseError> {
        if self.total_record_length == 0 {
            return Err(ParseError::ZeroRecordHeader);
        }
        if (self.total_record_length as usize) < XLOG_RECORD_HEADER_SIZE {
            return Err(ParseError::InvalidRecordHeader(format!(
                "total length {} is shorter than the record header",
                self.total_record_length
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XLogRecordBlockImageHeader {
    pub image_length: u16,
    pub hole_offset: u16,
    pub info: u8,
    pub hole_length: u16,
}

impl XLogRecordBlockImageHeader {
    pub fn has_hole(&self) -> bool {
        self.info & BKPIMAGE_HAS_HOLE != 0
    }

    fn read(reader: &mut ByteReader<'_>, layout: BlockImageLayout) -> Result<Self, ParseError> {
        let image_length = reader.u16("image length")?;
        let hole_offset = reader.u16("image hole offset")?;
        let info = reader.u8("image info")?;
        let mut header = Self {
            image_length,
            hole_offset,
            info,
            hole_length: 0,
        };
        let compressed = layout.is_compressed(info);
        if compressed {
            if header.has_hole() {
                header.hole_length = reader.u16("image hole length")?;
            }
        } else {
            header.hole_length = BLOCK_SIZE.wrapping_sub(image_length);
        }
        header.check_consistency(compressed)?;
        Ok(header)
    }

    fn check_consistency(&self, compressed: bool) -> Result<(), ParseError> {
        let inconsistent = |reason: &str| Err(ParseError::InconsistentImage(reason.to_string()));
        if self.has_hole() && (self.hole_offset == 0 || self.hole_length == 0 || self.image_length == BLOCK_SIZE) {
            return inconsistent("hole flag set but hole is empty or image is full size");
        }
        if !self.has_hole() && (self.hole_offset != 0 || self.hole_length != 0) {
            return inconsistent("hole described without the hole flag");
        }
        if compressed && self.image_length == BLOCK_SIZE {
            return inconsistent("compressed image has full block size");
        }
        if !self.has_hole() && !compressed && self.image_length != BLOCK_SIZE {
            return inconsistent("plain image without hole must have full block size");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XLogRecordBlockHeader {
    pub block_id: u8,
    pub fork_flags: u8,
    pub data_length: u16,
    pub image_header: Option<XLogRecordBlockImageHeader>,
    pub location: BlockLocation,
}

impl XLogRecordBlockHeader {
    pub fn fork_num(&self) -> u8 {
        self.fork_flags & BKPBLOCK_FORK_MASK
    }

    pub fn has_image(&self) -> bool {
        self.fork_flags & BKPBLOCK_HAS_IMAGE != 0
    }

    pub fn has_data(&self) -> bool {
        self.fork_flags & BKPBLOCK_HAS_DATA != 0
    }

    pub fn will_init(&self) -> bool {
        self.fork_flags & BKPBLOCK_WILL_INIT != 0
    }

    pub fn same_rel(&self) -> bool {
        self.fork_flags & BKPBLOCK_SAME_REL != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XLogRecordBlock {
    pub header: XLogRecordBlockHeader,
    pub image: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XLogRecord {
    pub header: XLogRecordHeader,
    pub origin: u16,
    pub toplevel_xid: u32,
    pub main_data_len: u32,
    pub blocks: Vec<XLogRecordBlock>,
    pub main_data: Vec<u8>,
}

impl XLogRecord {
    /// Parse one complete record (header included) from `data`.
    pub fn parse(data: &[u8], layout: BlockImageLayout) -> Result<Self, ParseError> {
        let mut reader = ByteReader::new(data);
        let header = XLogRecordHeader::read(&mut reader)?;
        Self::read_body(header, &mut reader, layout)
    }

    pub(crate) fn read_body(
        header: XLogRecordHeader,
        reader: &mut ByteReader<'_>,
        layout: BlockImageLayout,
    ) -> Result<Self, ParseError> {
        let mut record = XLogRecord {
            header,
            ..Default::default()
        };
        record.read_block_header_part(reader, layout)?;

        for block in record.blocks.iter_mut() {
            if let Some(image) = block.header.image_header {
                block.image = reader.take(image.image_length as usize, "block image")?.to_vec();
            }
            if block.header.has_data() {
                block.data = reader.take(block.header.data_length as usize, "block data")?.to_vec();
            }
        }
        record.main_data = reader.take(record.main_data_len as usize, "main data")?.to_vec();
        Ok(record)
    }

    /// Read block reference headers. The declared record length bounds the
    /// header area; every announced payload shrinks that bound so the loop
    /// stops exactly where the payloads begin.
    fn read_block_header_part(&mut self, reader: &mut ByteReader<'_>, layout: BlockImageLayout) -> Result<(), ParseError> {
        let body_len = self.header.total_record_length as usize - XLOG_RECORD_HEADER_SIZE;
        let mut header_end = reader.position() + body_len;

        let mut last_rel: Option<RelFileNode> = None;
        let mut max_block_id: i32 = -1;
        while reader.position() < header_end {
            let block_id = reader.u8("block id")?;
            match block_id {
                XLR_BLOCK_ID_DATA_SHORT => {
                    self.main_data_len = reader.u8("main data length (short)")? as u32;
                    shrink(&mut header_end, reader.position(), self.main_data_len as usize)?;
                }
                XLR_BLOCK_ID_DATA_LONG => {
                    self.main_data_len = reader.u32("main data length (long)")?;
                    shrink(&mut header_end, reader.position(), self.main_data_len as usize)?;
                }
                XLR_BLOCK_ID_ORIGIN => {
                    self.origin = reader.u16("origin")?;
                }
                XLR_BLOCK_ID_TOPLEVEL_XID => {
                    self.toplevel_xid = reader.u32("toplevel xid")?;
                }
                _ => {
                    if block_id > XLR_MAX_BLOCK_ID {
                        return Err(ParseError::InvalidRecordBlockId(block_id));
                    }
                    if block_id as i32 <= max_block_id {
                        return Err(ParseError::OutOfOrderBlockId {
                            got: block_id,
                            max: max_block_id as u8,
                        });
                    }
                    max_block_id = block_id as i32;

                    let fork_flags = reader.u8("fork flags")?;
                    let data_length = reader.u16("block data length")?;
                    let mut header = XLogRecordBlockHeader {
                        block_id,
                        fork_flags,
                        data_length,
                        ..Default::default()
                    };
                    if header.has_data() != (data_length > 0) {
                        return Err(ParseError::InconsistentBlockData(format!(
                            "block {block_id}: data flag does not match data length {data_length}"
                        )));
                    }
                    shrink(&mut header_end, reader.position(), data_length as usize)?;

                    if header.has_image() {
                        let image = XLogRecordBlockImageHeader::read(reader, layout)?;
                        shrink(&mut header_end, reader.position(), image.image_length as usize)?;
                        header.image_header = Some(image);
                    }

                    let rel = if header.same_rel() {
                        last_rel.ok_or(ParseError::NoPrevRelFileNode)?
                    } else {
                        RelFileNode {
                            spc_node: reader.u32("spc node")?,
                            db_node: reader.u32("db node")?,
                            rel_node: reader.u32("rel node")?,
                        }
                    };
                    let block_no = reader.u32("block no")?;
                    last_rel = Some(rel);
                    header.location = BlockLocation { rel, block_no };
                    self.blocks.push(XLogRecordBlock {
                        header,
                        ..Default::default()
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_wal_switch(&self) -> bool {
        self.header.resource_manager_id == RM_XLOG_ID
            && self.header.info & XLR_RMGR_INFO_MASK == XLOG_SWITCH
    }
}

fn shrink(header_end: &mut usize, pos: usize, len: usize) -> Result<(), ParseError> {
    if *header_end < pos + len {
        return Err(ParseError::InconsistentBlockData(format!(
            "payload of {len} bytes exceeds the record length"
        )));
    }
    *header_end -= len;
    Ok(())
}
