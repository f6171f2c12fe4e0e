use std::io::{self, Read, Write};

use tracing::debug;

use crate::wal::WAL_FILE_IN_DELTA;
use crate::walparser::{BlockImageLayout, XLogRecord};
use crate::{Error, Result};

const SLOTS: usize = WAL_FILE_IN_DELTA as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PartKind {
    PreviousHead = 0,
    Tail = 1,
    Head = 2,
}

fn read_part_bytes<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(Error::PartFileInconsistent(format!("truncated {what}")).into())
        }
        Err(e) => Err(e.into()),
    }
}

impl PartKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::PreviousHead),
            1 => Ok(Self::Tail),
            2 => Ok(Self::Head),
            other => Err(Error::PartFileInconsistent(format!("unknown part type {other}")).into()),
        }
    }
}

/// Record fragments cut at the segment boundaries of one delta group.
///
/// `tails[i]` finishes the record that was open when segment `i` began;
/// `heads[i]` starts the record still open when segment `i` ended;
/// `previous_head` is `heads[15]` of the preceding group. `None` means the
/// fragment is not known yet, an empty vector means there is none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalPartFile {
    pub tails: [Option<Vec<u8>>; SLOTS],
    pub previous_head: Option<Vec<u8>>,
    pub heads: [Option<Vec<u8>>; SLOTS],
}

impl WalPartFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.previous_head.is_some()
            && self.tails.iter().all(Option::is_some)
            && self.heads.iter().all(Option::is_some)
    }

    /// Whether this group only started being recorded partway through,
    /// returning the first segment index seen.
    ///
    /// Such a group never gets the fragments of its earlier segments, and has
    /// no previous head since the preceding group was never recorded.
    pub fn partially_filled_from(&self) -> Result<Option<usize>> {
        if self.previous_head.is_some() {
            return Ok(None);
        }
        for (idx, (head, tail)) in self.heads.iter().zip(&self.tails).enumerate() {
            match (head.is_some(), tail.is_some()) {
                (true, true) => return Ok(Some(idx)),
                (false, false) => {}
                _ => {
                    return Err(Error::PartFileInconsistent(format!(
                        "head and tail of segment {idx} disagree"
                    ))
                    .into())
                }
            }
        }
        Ok(None)
    }

    /// Mark the segments before `index` (and the previous head) as having no fragments.
    pub fn complete_from(&mut self, index: usize) {
        self.previous_head = Some(Vec::new());
        for slot in 0..index.min(SLOTS) {
            self.tails[slot] = Some(Vec::new());
            self.heads[slot] = Some(Vec::new());
        }
    }

    /// Reassemble the records crossing the segment boundaries of this group.
    pub fn combine_records(&self, layout: BlockImageLayout) -> Result<Vec<XLogRecord>> {
        let mut records = Vec::new();
        for slot in 0..SLOTS {
            let head = if slot == 0 {
                self.previous_head.as_deref()
            } else {
                self.heads[slot - 1].as_deref()
            }
            .unwrap_or_default();
            let tail = self.tails[slot].as_deref().unwrap_or_default();
            if head.is_empty() {
                if !tail.is_empty() {
                    debug!(slot, tail_len = tail.len(), "record_without_head_skipped");
                }
                continue;
            }
            let mut data = Vec::with_capacity(head.len() + tail.len());
            data.extend_from_slice(head);
            data.extend_from_slice(tail);
            records.push(XLogRecord::parse(&data, layout)?);
        }
        Ok(records)
    }

    /// Known fragments as `kind: u8, slot: u8, len: u32 LE, bytes`.
    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let mut write_part = |kind: PartKind, slot: usize, data: &[u8]| -> io::Result<()> {
            writer.write_all(&[kind as u8, slot as u8])?;
            writer.write_all(&(data.len() as u32).to_le_bytes())?;
            writer.write_all(data)
        };
        for (slot, tail) in self.tails.iter().enumerate() {
            if let Some(data) = tail {
                write_part(PartKind::Tail, slot, data)?;
            }
        }
        if let Some(data) = &self.previous_head {
            write_part(PartKind::PreviousHead, 0, data)?;
        }
        for (slot, head) in self.heads.iter().enumerate() {
            if let Some(data) = head {
                write_part(PartKind::Head, slot, data)?;
            }
        }
        Ok(())
    }

    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut part_file = Self::new();
        loop {
            let mut prefix = [0u8; 2];
            match reader.read(&mut prefix[..1])? {
                0 => return Ok(part_file),
                _ => read_part_bytes(reader, &mut prefix[1..], "part slot")?,
            }
            let kind = PartKind::from_byte(prefix[0])?;
            let slot = prefix[1] as usize;
            if slot >= SLOTS {
                return Err(Error::PartFileInconsistent(format!("slot {slot} out of range")).into());
            }
            let mut len = [0u8; 4];
            read_part_bytes(reader, &mut len, "part length")?;
            let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
            read_part_bytes(reader, &mut data, "part data")?;
            match kind {
                PartKind::PreviousHead => part_file.previous_head = Some(data),
                PartKind::Tail => part_file.tails[slot] = Some(data),
                PartKind::Head => part_file.heads[slot] = Some(data),
            }
        }
    }
}
