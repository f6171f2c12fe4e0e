use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

pub type Oid = u32;

/// Physical identity of a relation: tablespace, database and relfilenode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RelFileNode {
    pub spc_node: Oid,
    pub db_node: Oid,
    pub rel_node: Oid,
}

/// A block of a relation touched by a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockLocation {
    pub rel: RelFileNode,
    pub block_no: u32,
}

impl BlockLocation {
    pub fn new(spc_node: Oid, db_node: Oid, rel_node: Oid, block_no: u32) -> Self {
        Self {
            rel: RelFileNode {
                spc_node,
                db_node,
                rel_node,
            },
            block_no,
        }
    }
}

/// Write locations as consecutive `spc, db, rel, block` little-endian u32 quadruples.
pub fn write_locations<W: Write + ?Sized>(locations: &[BlockLocation], writer: &mut W) -> io::Result<()> {
    let mut buf = Vec::with_capacity(locations.len() * 16);
    for loc in locations {
        buf.extend_from_slice(&loc.rel.spc_node.to_le_bytes());
        buf.extend_from_slice(&loc.rel.db_node.to_le_bytes());
        buf.extend_from_slice(&loc.rel.rel_node.to_le_bytes());
        buf.extend_from_slice(&loc.block_no.to_le_bytes());
    }
    writer.write_all(&buf)
}

/// Read location quadruples until end of stream. A trailing partial
/// quadruple is reported as `UnexpectedEof`.
pub fn read_locations<R: Read + ?Sized>(reader: &mut R) -> io::Result<Vec<BlockLocation>> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    if raw.len() % 16 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("block location stream has {} trailing bytes", raw.len() % 16),
        ));
    }
    Ok(raw
        .chunks_exact(16)
        .map(|c| {
            let word = |i: usize| u32::from_le_bytes([c[i], c[i + 1], c[i + 2], c[i + 3]]);
            BlockLocation::new(word(0), word(4), word(8), word(12))
        })
        .collect())
}
