use std::io::{Read, Write};

use crate::walparser::{read_locations, write_locations, BlockLocation, WalParser};
use crate::Result;

/// Block locations of one group of WAL segments, plus the parser state at
/// the end of the group so WAL replay can continue into the next one.
///
/// Stored as the saved parser followed by the location quadruples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaFile {
    pub locations: Vec<BlockLocation>,
    pub wal_parser: WalParser,
}

impl DeltaFile {
    pub fn new(wal_parser: WalParser) -> Self {
        Self {
            locations: Vec::new(),
            wal_parser,
        }
    }

    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        self.wal_parser.save(writer)?;
        write_locations(&self.locations, writer)?;
        Ok(())
    }

    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let wal_parser = WalParser::load(reader)?;
        let locations = read_locations(reader)?;
        Ok(Self { locations, wal_parser })
    }
}
