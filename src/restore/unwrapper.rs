//! What to do with one regular file of a container, given what is already
//! on disk.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use crate::page::{create_file_from_increment, restore_missing_pages, write_pages_from_increment};
use crate::Result;

/// Per-file facts the unwrapper decides on.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileUnwrapOptions {
    /// The container entry is an increment rather than a full copy.
    pub is_incremented: bool,
    /// The file on disk is a paged relation file.
    pub is_page_file: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileUnwrapOutcome {
    /// Nothing written; a newer link already produced the file.
    Skipped,
    /// The file needs nothing from older links.
    Completed,
    /// Created from an increment; this many blocks are still missing.
    CreatedFromIncrement(u64),
    /// This many missing blocks were filled from an increment.
    WroteIncrementBlocks(u64),
}

/// Unwrap strategy, chosen once per restore.
///
/// `Default` restores a chain newest link first into an empty directory, so
/// data already on disk always wins. `Catchup` applies a single increment to
/// an existing cluster, so container data always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileUnwrapper {
    Default,
    Catchup,
}

impl FileUnwrapper {
    pub fn for_catchup(catchup: bool) -> Self {
        if catchup {
            Self::Catchup
        } else {
            Self::Default
        }
    }

    /// `target` was just created, empty.
    pub fn unwrap_new_file<R: Read + ?Sized>(
        &self,
        reader: &mut R,
        options: FileUnwrapOptions,
        target: &mut File,
    ) -> Result<FileUnwrapOutcome> {
        if options.is_incremented {
            let missing = create_file_from_increment(reader, target)?;
            return Ok(FileUnwrapOutcome::CreatedFromIncrement(missing));
        }
        io::copy(reader, target)?;
        Ok(FileUnwrapOutcome::Completed)
    }

    /// `target` already existed and is opened for reading and writing.
    pub fn unwrap_existing_file<R: Read + ?Sized>(
        &self,
        reader: &mut R,
        options: FileUnwrapOptions,
        target: &mut File,
    ) -> Result<FileUnwrapOutcome> {
        match self {
            Self::Default => {
                if options.is_incremented {
                    let written = write_pages_from_increment(reader, target, false)?;
                    return Ok(FileUnwrapOutcome::WroteIncrementBlocks(written));
                }
                if options.is_page_file {
                    restore_missing_pages(reader, target)?;
                    return Ok(FileUnwrapOutcome::Completed);
                }
                Ok(FileUnwrapOutcome::Skipped)
            }
            Self::Catchup => {
                if options.is_incremented {
                    write_pages_from_increment(reader, target, true)?;
                    return Ok(FileUnwrapOutcome::Completed);
                }
                target.set_len(0)?;
                target.seek(SeekFrom::Start(0))?;
                io::copy(reader, target)?;
                Ok(FileUnwrapOutcome::Completed)
            }
        }
    }
}
