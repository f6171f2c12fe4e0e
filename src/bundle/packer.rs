//! Packing one file, as an increment or in full, into a container.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::delta::DeltaMap;
use crate::page::checksum::{should_verify, PageVerifier};
use crate::page::{is_paged_file, read_incremental_file, rel_file_segment_no};
use crate::wal::Lsn;
use crate::{Error, Result};

use super::files::BundleFiles;
use super::tarball::TarBall;
use super::walker::WalkedEntry;

/// A file the composer decided to pack.
#[derive(Debug, Clone)]
pub struct ComposeFileInfo {
    pub entry: WalkedEntry,
    pub was_in_base: bool,
    pub is_incremented: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PackerOptions {
    pub verify_page_checksums: bool,
    pub store_all_corrupt_blocks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    Packed,
    /// Unchanged according to the delta map; recorded as skipped.
    Skipped,
    /// Deleted before it could be opened; left out entirely.
    Vanished,
}

struct OpenedFile {
    reader: Box<dyn Read + Send>,
    size: u64,
    verifier: Option<PageVerifier>,
}

pub struct TarBallFilePacker {
    delta_map: RwLock<Option<Arc<DeltaMap>>>,
    increment_from_lsn: Option<Lsn>,
    files: Arc<BundleFiles>,
    options: PackerOptions,
}

impl TarBallFilePacker {
    pub fn new(
        delta_map: Option<Arc<DeltaMap>>,
        increment_from_lsn: Option<Lsn>,
        files: Arc<BundleFiles>,
        options: PackerOptions,
    ) -> Self {
        Self {
            delta_map: RwLock::new(delta_map),
            increment_from_lsn,
            files,
            options,
        }
    }

    pub fn files(&self) -> &Arc<BundleFiles> {
        &self.files
    }

    pub fn update_delta_map(&self, delta_map: Option<Arc<DeltaMap>>) {
        *self.delta_map.write() = delta_map;
    }

    pub fn delta_map(&self) -> Option<Arc<DeltaMap>> {
        self.delta_map.read().clone()
    }

    pub fn pack_file_into_tar(&self, cfi: &mut ComposeFileInfo, tarball: &mut TarBall) -> Result<PackOutcome> {
        let opened = match self.open(cfi)? {
            Ok(opened) => opened,
            Err(outcome) => {
                if outcome == PackOutcome::Skipped {
                    self.files.add_skipped(&cfi.entry.name, cfi.entry.mtime);
                }
                return Ok(outcome);
            }
        };

        let OpenedFile { reader, size, verifier } = opened;
        match verifier {
            Some(verifier) => {
                let mut verifying = VerifyingReader { inner: reader, verifier };
                tarball.append_file(&cfi.entry, size, &mut verifying)?;
                let corrupt = verifying.verifier.finish();
                if !corrupt.is_empty() {
                    warn!(file = %cfi.entry.name, corrupt_blocks = corrupt.len(), "corrupt blocks found");
                }
                self.files.add_file_with_corrupt_blocks(
                    &cfi.entry.name,
                    cfi.entry.mtime,
                    cfi.is_incremented,
                    corrupt,
                    self.options.store_all_corrupt_blocks,
                );
            }
            None => {
                tarball.append_file(&cfi.entry, size, reader)?;
                self.files.add_file(&cfi.entry.name, cfi.entry.mtime, cfi.is_incremented);
            }
        }
        debug!(file = %cfi.entry.name, tar = %tarball.name(), incremented = cfi.is_incremented, size, "file_packed");
        Ok(PackOutcome::Packed)
    }

    /// The stream to pack, or why there is none.
    fn open(&self, cfi: &mut ComposeFileInfo) -> Result<std::result::Result<OpenedFile, PackOutcome>> {
        let relative = Path::new(&cfi.entry.name);
        if cfi.is_incremented {
            if let Some(since_lsn) = self.increment_from_lsn {
                let bitmap = match self.delta_map() {
                    Some(map) => match map.delta_bitmap_for(relative) {
                        Ok(bitmap) => Some(bitmap),
                        Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::NoBitmapFound(_))) => {
                            debug!(file = %cfi.entry.name, "no changes recorded, skipped");
                            return Ok(Err(PackOutcome::Skipped));
                        }
                        Err(e) => {
                            return Err(e.context(format!("finding delta bitmap for {}", cfi.entry.name)));
                        }
                    },
                    None => None,
                };
                match read_incremental_file(&cfi.entry.path, cfi.entry.size, since_lsn, bitmap.as_ref()) {
                    Ok((reader, size)) => {
                        let verifier = self.verifier_for(cfi).map(|segment| {
                            PageVerifier::for_increment(
                                segment,
                                reader.header().blocks.clone(),
                                reader.header().encoded_len() as usize,
                            )
                        });
                        return Ok(Ok(OpenedFile {
                            reader: Box::new(reader),
                            size,
                            verifier,
                        }));
                    }
                    Err(e) if is_missing(&e) => return Ok(Err(self.vanished(cfi))),
                    Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::InvalidBlock { .. })) => {
                        warn!(file = %cfi.entry.name, error = %e, "failed to read file as incremented, packing it in full");
                        cfi.is_incremented = false;
                    }
                    Err(e) => return Err(e.context(format!("reading incremental file {}", cfi.entry.name))),
                }
            } else {
                cfi.is_incremented = false;
            }
        }

        let file = match File::open(&cfi.entry.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Err(self.vanished(cfi))),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("opening {}", cfi.entry.name))),
        };
        let verifier = self.verifier_for(cfi).map(PageVerifier::for_full_file);
        Ok(Ok(OpenedFile {
            reader: Box::new(file),
            size: cfi.entry.size,
            verifier,
        }))
    }

    /// Segment number to verify against, for paged files when verification is on.
    fn verifier_for(&self, cfi: &ComposeFileInfo) -> Option<u32> {
        if !self.options.verify_page_checksums || !should_verify(cfi.entry.file_name()) {
            return None;
        }
        let relative = Path::new(&cfi.entry.name);
        if !is_paged_file(relative, cfi.entry.size) {
            return None;
        }
        rel_file_segment_no(relative).ok()
    }

    fn vanished(&self, cfi: &ComposeFileInfo) -> PackOutcome {
        warn!(file = %cfi.entry.name, "file does not exist, probably deleted during the backup");
        PackOutcome::Vanished
    }
}

fn is_missing(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}

struct VerifyingReader<R> {
    inner: R,
    verifier: PageVerifier,
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.verifier.write_all(&buf[..n])?;
        Ok(n)
    }
}

/// Open `path` for a dedicated single-file container, such as `pg_control`.
pub fn open_for_packing(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("opening {}", path.display()))
}
