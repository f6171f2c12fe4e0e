//! Walking a data directory into backup entries.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::Result;

use super::{is_excluded, TABLESPACE_FOLDER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink(PathBuf),
}

/// A filesystem object found under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedEntry {
    /// Where the object lives on disk.
    pub path: PathBuf,
    /// Data-directory-relative name, `/`-separated, no leading slash.
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
}

impl WalkedEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Entries of `data_dir`, parents before children.
///
/// Excluded files are left out; excluded directories are kept but not
/// descended into. Tablespace links in `pg_tblspc` are kept as links and
/// their targets walked under the link's name. Objects that vanish during
/// the walk are skipped with a warning.
pub fn walk_data_dir(data_dir: &Path) -> Result<Vec<WalkedEntry>> {
    let mut entries = Vec::new();
    walk_tree(data_dir, "", &mut entries)?;
    Ok(entries)
}

fn walk_tree(root: &Path, prefix: &str, out: &mut Vec<WalkedEntry>) -> Result<()> {
    let mut it = WalkDir::new(root).follow_links(false).sort_by_file_name().min_depth(1).into_iter();
    while let Some(next) = it.next() {
        let dent = match next {
            Ok(dent) => dent,
            Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                warn!(error = %e, "entry deleted during walk");
                continue;
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("walking {}", root.display()))),
        };
        let relative = dent.path().strip_prefix(root).unwrap_or(dent.path());
        let name = join_name(prefix, relative);
        let meta = match dent.metadata() {
            Ok(meta) => meta,
            Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                warn!(file = %name, "entry deleted during walk");
                continue;
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("reading metadata of {name}"))),
        };
        let file_type = meta.file_type();
        let excluded = is_excluded(&dent.file_name().to_string_lossy());

        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            if excluded {
                debug!(file = %name, "excluded");
                continue;
            }
            EntryKind::File
        } else if file_type.is_symlink() {
            let target = fs::read_link(dent.path()).with_context(|| format!("reading link {name}"))?;
            EntryKind::Symlink(target)
        } else {
            debug!(file = %name, "not a regular file, skipped");
            continue;
        };

        let entry = WalkedEntry {
            path: dent.path().to_path_buf(),
            name: name.clone(),
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            mode: meta.mode() & 0o7777,
            mtime: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
            kind,
        };
        let tablespace_target = match (&entry.kind, is_tablespace_link(&name)) {
            (EntryKind::Symlink(target), true) => Some(resolve_link(dent.path(), target)),
            _ => None,
        };
        out.push(entry);

        if excluded && file_type.is_dir() {
            debug!(dir = %name, "excluded directory, contents skipped");
            it.skip_current_dir();
            continue;
        }
        if let Some(target) = tablespace_target {
            debug!(tablespace = %name, target = %target.display(), "walking tablespace");
            walk_tree(&target, &name, out)?;
        }
    }
    Ok(())
}

fn is_tablespace_link(name: &str) -> bool {
    matches!(name.split_once('/'), Some((TABLESPACE_FOLDER, rest)) if !rest.contains('/'))
}

fn resolve_link(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        link.parent().unwrap_or(Path::new("/")).join(target)
    }
}

fn join_name(prefix: &str, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if prefix.is_empty() {
        relative
    } else {
        format!("{prefix}/{relative}")
    }
}
