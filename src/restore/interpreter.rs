//! Streaming interpretation of container entries into the destination
//! directory. Entries are applied as they are read; a container is never
//! extracted to a scratch location first.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::Read;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use parking_lot::Mutex;
use tar::{Archive, Entry, EntryType};
use tracing::{debug, warn};

use crate::backup::BackupFileList;
use crate::config::FsyncMode;
use crate::page::is_paged_file;
use crate::Result;

use super::unwrapper::{FileUnwrapOptions, FileUnwrapOutcome, FileUnwrapper};

/// Per-file results of unwrapping one link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnwrapResult {
    pub completed: Vec<String>,
    /// File created from an increment and the blocks it still misses.
    pub created_from_increment: HashMap<String, u64>,
    /// File and the missing blocks just filled from an increment.
    pub written_from_increment: HashMap<String, u64>,
}

impl UnwrapResult {
    fn add(&mut self, name: &str, outcome: FileUnwrapOutcome) {
        match outcome {
            FileUnwrapOutcome::Skipped => {}
            FileUnwrapOutcome::Completed => self.completed.push(name.to_string()),
            FileUnwrapOutcome::CreatedFromIncrement(missing) => {
                self.created_from_increment.insert(name.to_string(), missing);
            }
            FileUnwrapOutcome::WroteIncrementBlocks(written) => {
                self.written_from_increment.insert(name.to_string(), written);
            }
        }
    }
}

/// Applies the containers of one chain link. Shared by the extraction workers.
pub struct TarInterpreter {
    destination: PathBuf,
    /// `None` unwraps everything.
    files_to_unwrap: Option<HashSet<String>>,
    link_files: Option<BackupFileList>,
    unwrapper: FileUnwrapper,
    fsync: FsyncMode,
    result: Mutex<UnwrapResult>,
}

impl TarInterpreter {
    pub fn new(
        destination: impl Into<PathBuf>,
        files_to_unwrap: Option<HashSet<String>>,
        link_files: Option<BackupFileList>,
        unwrapper: FileUnwrapper,
        fsync: FsyncMode,
    ) -> Self {
        Self {
            destination: destination.into(),
            files_to_unwrap,
            link_files,
            unwrapper,
            fsync,
            result: Mutex::new(UnwrapResult::default()),
        }
    }

    pub fn into_result(self) -> UnwrapResult {
        self.result.into_inner()
    }

    /// Read a whole container from `reader`, applying every entry.
    pub fn interpret_tar<R: Read>(&self, reader: R) -> Result<usize> {
        let mut archive = Archive::new(reader);
        let mut written = Vec::new();
        let mut entries = 0usize;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry_name(&entry)?;
            self.interpret_entry(&mut entry, &name, &mut written)
                .with_context(|| format!("unwrapping {name}"))?;
            entries += 1;
        }
        if self.fsync == FsyncMode::Tar {
            for path in written {
                sync_path(&path);
            }
        }
        Ok(entries)
    }

    fn interpret_entry<R: Read>(&self, entry: &mut Entry<'_, R>, name: &str, written: &mut Vec<PathBuf>) -> Result<()> {
        let target = self.destination.join(name);
        let mode = entry.header().mode().unwrap_or(0o700);
        let entry_type = entry.header().entry_type();
        match entry_type {
            EntryType::Regular | EntryType::Continuous => {
                if let Some(path) = self.unwrap_regular_file(entry, name, &target, mode)? {
                    written.push(path);
                }
            }
            EntryType::Directory => {
                fs::create_dir_all(&target).with_context(|| format!("creating directory {}", target.display()))?;
                fs::set_permissions(&target, Permissions::from_mode(mode))?;
            }
            EntryType::Link => {
                let source = link_name(entry)?;
                if fs::symlink_metadata(&target).is_ok() {
                    debug!(file = %name, "hard link already restored");
                    return Ok(());
                }
                prepare_dirs(&target)?;
                fs::hard_link(self.destination.join(&source), &target)
                    .with_context(|| format!("creating hard link {}", target.display()))?;
            }
            EntryType::Symlink => {
                let source = link_name(entry)?;
                self.restore_symlink(&source, &target)?;
            }
            other => debug!(file = %name, entry_type = ?other, "unsupported entry type skipped"),
        }
        Ok(())
    }

    /// Returns the path written, for container-level syncing.
    fn unwrap_regular_file<R: Read>(
        &self,
        entry: &mut Entry<'_, R>,
        name: &str,
        target: &Path,
        mode: u32,
    ) -> Result<Option<PathBuf>> {
        if let Some(files) = &self.files_to_unwrap {
            if !files.contains(name) {
                debug!(file = %name, "not needed from this backup");
                return Ok(None);
            }
        }

        let is_incremented = self
            .link_files
            .as_ref()
            .and_then(|files| files.get(name))
            .is_some_and(|desc| desc.is_incremented);

        let outcome = match fs::symlink_metadata(target) {
            Ok(meta) if meta.is_dir() => bail!("{} is a directory", target.display()),
            Ok(meta) => {
                let options = FileUnwrapOptions {
                    is_incremented,
                    is_page_file: is_paged_file(Path::new(name), meta.len()),
                };
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(target)
                    .with_context(|| format!("opening {}", target.display()))?;
                let outcome = self.unwrapper.unwrap_existing_file(entry, options, &mut file)?;
                self.finish_file(&file, target);
                outcome
            }
            Err(_) => {
                prepare_dirs(target)?;
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(mode)
                    .open(target)
                    .with_context(|| format!("creating {}", target.display()))?;
                let options = FileUnwrapOptions {
                    is_incremented,
                    is_page_file: false,
                };
                let outcome = self.unwrapper.unwrap_new_file(entry, options, &mut file)?;
                self.finish_file(&file, target);
                outcome
            }
        };
        debug!(file = %name, ?outcome, "file_unwrapped");
        self.result.lock().add(name, outcome);
        Ok((outcome != FileUnwrapOutcome::Skipped).then(|| target.to_path_buf()))
    }

    fn finish_file(&self, file: &File, target: &Path) {
        if self.fsync == FsyncMode::File {
            if let Err(e) = file.sync_all() {
                warn!(file = %target.display(), error = %e, "fsync failed");
            }
        }
    }

    /// The first link to restore a symlink wins; older links skip it.
    fn restore_symlink(&self, source: &Path, target: &Path) -> Result<()> {
        match fs::symlink_metadata(target) {
            Ok(meta) if meta.file_type().is_symlink() => {
                debug!(link = %target.display(), "symlink already restored by a newer backup");
                return Ok(());
            }
            Ok(_) => bail!("{} exists and is not a symlink", target.display()),
            Err(_) => {}
        }
        prepare_dirs(target)?;
        std::os::unix::fs::symlink(source, target)
            .with_context(|| format!("creating symlink {}", target.display()))?;
        Ok(())
    }
}

/// Entry path relative to the data directory; absolute and `..` paths are refused.
fn entry_name<R: Read>(entry: &Entry<'_, R>) -> Result<String> {
    let path = entry.path()?;
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => bail!("unsafe path in container: {}", path.display()),
        }
    }
    if parts.is_empty() {
        bail!("empty path in container");
    }
    Ok(parts.join("/"))
}

fn link_name<R: Read>(entry: &Entry<'_, R>) -> Result<PathBuf> {
    entry
        .link_name()?
        .map(|link| link.into_owned())
        .ok_or_else(|| anyhow::anyhow!("link entry without a target"))
}

fn prepare_dirs(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directories for {}", target.display()))?;
    }
    Ok(())
}

fn sync_path(path: &Path) {
    let synced = File::open(path).and_then(|file| file.sync_all());
    if let Err(e) = synced {
        warn!(file = %path.display(), error = %e, "fsync failed");
    }
}
