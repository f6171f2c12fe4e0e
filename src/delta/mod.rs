//! Page-level change tracking built from WAL.
//!
//! A [`DeltaMap`] answers "which blocks of this relation file changed between
//! two LSNs". It is assembled from precomputed delta files for whole groups of
//! segments and from a direct replay of the WAL segments of the last, still
//! incomplete group.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};

use crate::page::{rel_file_node_from_path, rel_file_segment_no, BLOCKS_IN_REL_FILE};
use crate::storage::{download_and_decompress, is_not_found, Folder};
use crate::wal::{delta_range, wal_segment_range, DeltaNo, Lsn, WalSegmentNo, WAL_FILE_IN_DELTA};
use crate::walparser::{extract_block_locations, BlockLocation, ParseError, RelFileNode, WalParser, WAL_PAGE_SIZE};
use crate::{Error, Result};

pub mod file;
pub mod manager;
pub mod part;
pub mod recording;

pub use file::DeltaFile;
pub use manager::DeltaFileManager;
pub use part::WalPartFile;
pub use recording::WalDeltaRecordingReader;

const WORD_BITS: u32 = 64;

/// Set of block numbers, one bit per block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSet {
    words: Vec<u64>,
}

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: u32) {
        let idx = (block / WORD_BITS) as usize;
        if idx >= self.words.len() {
            self.words.resize(idx + 1, 0);
        }
        self.words[idx] |= 1 << (block % WORD_BITS);
    }

    pub fn contains(&self, block: u32) -> bool {
        self.words
            .get((block / WORD_BITS) as usize)
            .is_some_and(|word| word & (1 << (block % WORD_BITS)) != 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Blocks in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, word)| {
            let word = *word;
            (0..WORD_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| idx as u32 * WORD_BITS + bit)
        })
    }

    pub fn union_with(&mut self, other: &BlockSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= theirs;
        }
    }

    /// Blocks of relation segment `segment_no`, renumbered relative to that segment.
    pub fn select_rel_file(&self, segment_no: u32) -> BlockSet {
        let start = segment_no as u64 * BLOCKS_IN_REL_FILE as u64;
        let end = start + BLOCKS_IN_REL_FILE as u64;
        self.iter()
            .map(u64::from)
            .skip_while(|block| *block < start)
            .take_while(|block| *block < end)
            .map(|block| (block - start) as u32)
            .collect()
    }
}

impl FromIterator<u32> for BlockSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut set = BlockSet::new();
        for block in iter {
            set.insert(block);
        }
        set
    }
}

/// Changed blocks per relation, for whole relations across all their segments.
#[derive(Debug, Clone, Default)]
pub struct DeltaMap {
    relations: HashMap<RelFileNode, BlockSet>,
}

impl DeltaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_location(&mut self, location: BlockLocation) {
        self.relations
            .entry(location.rel)
            .or_default()
            .insert(location.block_no);
    }

    pub fn add_locations(&mut self, locations: &[BlockLocation]) {
        for location in locations {
            self.add_location(*location);
        }
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Changed blocks of the relation file at `relative_path`, numbered within
    /// that file. `Error::NoBitmapFound` means the relation was not touched.
    pub fn delta_bitmap_for(&self, relative_path: &Path) -> Result<BlockSet> {
        let rel = rel_file_node_from_path(relative_path)?;
        let bitmap = self
            .relations
            .get(&rel)
            .ok_or_else(|| Error::NoBitmapFound(relative_path.display().to_string()))?;
        Ok(bitmap.select_rel_file(rel_file_segment_no(relative_path)?))
    }

    fn locations_from_deltas(&mut self, folder: &dyn Folder, timeline: u32, first: DeltaNo, end: DeltaNo) -> Result<()> {
        let mut delta_no = first;
        while delta_no < end {
            let delta = load_delta_file(folder, &delta_no.filename(timeline))?;
            self.add_locations(&delta.locations);
            delta_no = delta_no.next();
        }
        Ok(())
    }

    fn locations_from_wals(
        &mut self,
        folder: &dyn Folder,
        timeline: u32,
        first: WalSegmentNo,
        end: WalSegmentNo,
        parser: &mut WalParser,
    ) -> Result<()> {
        let mut segment = first;
        while segment < end {
            let name = segment.filename(timeline);
            let reader = download_and_decompress(folder, &name).with_context(|| format!("downloading WAL segment {name}"))?;
            let locations = extract_locations_from_wal_file(parser, reader)
                .with_context(|| format!("extracting block locations from WAL segment {name}"))?;
            self.add_locations(&locations);
            debug!(wal = %name, locations = locations.len(), "wal_segment_replayed");
            segment = segment.next();
        }
        Ok(())
    }
}

pub fn load_delta_file(folder: &dyn Folder, name: &str) -> Result<DeltaFile> {
    let mut reader = download_and_decompress(folder, name)?;
    DeltaFile::load(&mut reader).with_context(|| format!("reading delta file {name}"))
}

/// Feed a whole WAL segment through `parser`, collecting touched main-fork blocks.
/// Zero or partial pages mark the end of written WAL.
pub fn extract_locations_from_wal_file<R: Read>(parser: &mut WalParser, mut reader: R) -> Result<Vec<BlockLocation>> {
    let mut locations = Vec::new();
    let mut page = vec![0u8; WAL_PAGE_SIZE];
    loop {
        match reader.read_exact(&mut page) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        match parser.parse_records_from_page(&page) {
            Ok(parsed) => {
                locations.extend(extract_block_locations(&parsed.records));
                if parsed.partial {
                    break;
                }
            }
            Err(ParseError::ZeroPage) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(locations)
}

/// Build the delta map for `[first_used_lsn, first_not_used_lsn)` on `timeline`
/// from the WAL folder.
pub fn get_delta_map(folder: &dyn Folder, timeline: u32, first_used_lsn: Lsn, first_not_used_lsn: Lsn) -> Result<DeltaMap> {
    let first_used_segment = WalSegmentNo::from_lsn(first_used_lsn);
    let (first_used_delta, first_not_used_delta) = delta_range(first_used_lsn, first_not_used_lsn);
    let (tail_first, tail_end) = wal_segment_range(first_not_used_delta, first_not_used_lsn);
    info!(
        timeline,
        first_used_wal = %first_used_segment.filename(timeline),
        first_used_delta = %first_used_delta.filename(timeline),
        first_not_used_delta = %first_not_used_delta.filename(timeline),
        "building_delta_map"
    );

    let mut map = DeltaMap::new();
    let mut parser = match load_delta_file(folder, &first_used_delta.filename(timeline)) {
        Ok(delta) => {
            map.add_locations(&delta.locations);
            delta.wal_parser
        }
        Err(e) if is_not_found(&e) => {
            // archiving started in the middle of this group, so it never got a delta file
            info!(delta = %first_used_delta.filename(timeline), "first_delta_missing_reading_wal");
            let group_end = first_used_delta.first_wal_segment_no().add(WAL_FILE_IN_DELTA);
            let mut parser = WalParser::new();
            map.locations_from_wals(folder, timeline, first_used_segment, group_end.min(tail_end), &mut parser)?;
            parser
        }
        Err(e) => return Err(e),
    };
    if first_used_delta == first_not_used_delta {
        return Ok(map);
    }

    let last_used_delta = first_not_used_delta.previous();
    if first_used_delta < last_used_delta {
        map.locations_from_deltas(folder, timeline, first_used_delta.next(), last_used_delta)
            .context("fetching locations from delta files")?;
        let last = load_delta_file(folder, &last_used_delta.filename(timeline)).context("downloading last delta file")?;
        map.add_locations(&last.locations);
        parser = last.wal_parser;
    }

    map.locations_from_wals(folder, timeline, tail_first, tail_end, &mut parser)
        .context("fetching locations from WAL segments")?;
    info!(relations = map.relation_count(), "delta_map_built");
    Ok(map)
}
