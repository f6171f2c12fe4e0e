//! Restoring a backup chain into a data directory.
//!
//! Links are applied newest first. Each link only writes what newer links
//! could not fully provide: the set of files still required shrinks as the
//! walk moves toward the full backup, and a file is dropped from it once no
//! block of it is missing anymore.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};

use crate::backup::{latest_backup_name, BackupChain, BackupFileList, ChainLink, FilesMetadataDto, LATEST};
use crate::bundle::{BACKUP_LABEL, PG_CONTROL_PATH, PG_CONTROL_TAR, TABLESPACE_MAP};
use crate::config::{FsyncMode, Settings};
use crate::logging::{log_restore_link, RestoreLinkSnapshot};
use crate::storage::FolderRef;
use crate::{Error, Result};

pub mod extract;
pub mod interpreter;
pub mod unwrapper;

pub use extract::{extract_all, link_tars, LinkTars};
pub use interpreter::{TarInterpreter, UnwrapResult};
pub use unwrapper::{FileUnwrapOptions, FileUnwrapOutcome, FileUnwrapper};

/// Files restored even though no file list describes them.
pub const UTILITY_FILE_PATHS: [&str; 3] = [PG_CONTROL_PATH, BACKUP_LABEL, TABLESPACE_MAP];

#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Leave out containers holding no file still required.
    pub skip_redundant_tars: bool,
    pub fsync: FsyncMode,
    pub download_concurrency: usize,
    /// Apply a single catch-up increment onto an existing cluster.
    pub catchup: bool,
}

impl RestoreOptions {
    pub fn from_settings(settings: &Settings, catchup: bool) -> Self {
        Self {
            skip_redundant_tars: settings.skip_redundant_tars,
            fsync: settings.fsync,
            download_concurrency: settings.download_concurrency.max(1),
            catchup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub backup: String,
    /// Chain links applied, newest first.
    pub links: Vec<String>,
}

/// Every file the target backup recorded plus the utility files, or `None`
/// (everything) when it recorded no files.
pub fn files_to_unwrap(files: Option<&FilesMetadataDto>) -> Option<HashSet<String>> {
    let files = files.filter(|f| !f.files.is_empty())?;
    let mut wanted: HashSet<String> = files.files.keys().cloned().collect();
    wanted.extend(UTILITY_FILE_PATHS.iter().map(|p| p.to_string()));
    Some(wanted)
}

/// Files that still need data from the parent of a link described by
/// `link_files`: the ones it skipped or only carried as an increment.
pub fn base_files_to_unwrap(link_files: &BackupFileList, current: &HashSet<String>) -> Result<HashSet<String>> {
    let mut base = HashSet::new();
    for name in current {
        let Some(desc) = link_files.get(name) else {
            if UTILITY_FILE_PATHS.contains(&name.as_str()) {
                continue;
            }
            anyhow::bail!("file {name} needs data from an older backup but is not described by its increment");
        };
        if desc.is_skipped || desc.is_incremented {
            base.insert(name.clone());
        }
    }
    Ok(base)
}

/// Whether a container of a link holds any file still required.
pub fn should_unwrap_tar(tar_name: &str, files: Option<&FilesMetadataDto>, wanted: Option<&HashSet<String>>) -> bool {
    let (Some(files), Some(wanted)) = (files, wanted) else {
        return true;
    };
    if files.tar_file_sets.is_empty() {
        return true;
    }
    let needed = files
        .tar_file_sets
        .get(tar_name)
        .is_some_and(|members| members.iter().any(|m| wanted.contains(m)));
    if !needed {
        debug!(tar = %tar_name, "skipping container without required files");
    }
    needed
}

/// Fails with `NonEmptyDataDirectory` when `destination` has any entry.
/// An absent destination is created.
pub fn ensure_empty_destination(destination: &Path) -> Result<()> {
    if !destination.exists() {
        fs::create_dir_all(destination).with_context(|| format!("creating {}", destination.display()))?;
        return Ok(());
    }
    let mut entries = fs::read_dir(destination).with_context(|| format!("reading {}", destination.display()))?;
    if let Some(entry) = entries.next() {
        debug!(found = %entry?.path().display(), "destination_not_empty");
        return Err(Error::NonEmptyDataDirectory(destination.display().to_string()).into());
    }
    Ok(())
}

pub struct RestoreEngine {
    folder: FolderRef,
    options: RestoreOptions,
    unwrapper: FileUnwrapper,
}

impl RestoreEngine {
    /// `folder` is the base backups folder.
    pub fn new(folder: FolderRef, options: RestoreOptions) -> Self {
        Self {
            folder,
            options,
            unwrapper: FileUnwrapper::for_catchup(options.catchup),
        }
    }

    /// Restore `backup_name` (or [`LATEST`]) into `destination`.
    pub fn fetch(&self, backup_name: &str, destination: &Path) -> Result<RestoreSummary> {
        let name = if backup_name == LATEST {
            latest_backup_name(self.folder.as_ref())?.ok_or_else(|| Error::MissingBackup(LATEST.to_string()))?
        } else {
            backup_name.to_string()
        };

        if self.options.catchup {
            fs::create_dir_all(destination).with_context(|| format!("creating {}", destination.display()))?;
        } else {
            ensure_empty_destination(destination)?;
        }

        let chain = if self.options.catchup {
            BackupChain::single(&self.folder, &name)?
        } else {
            BackupChain::from_target(&self.folder, &name)?
        };
        info!(backup = %name, links = chain.len(), catchup = self.options.catchup, "restore_started");

        let mut wanted: Option<HashSet<String>> = None;
        let mut missing_blocks: HashMap<String, u64> = HashMap::new();
        let mut pg_control_seen = false;
        let mut applied = Vec::new();

        for (depth, link) in chain.newest_first().enumerate() {
            let files = link
                .backup
                .fetch_files_metadata(&link.sentinel)
                .with_context(|| format!("loading file list of backup {}", link.name()))?;
            if depth == 0 {
                wanted = files_to_unwrap(files.as_ref());
            }

            let (result, saw_pg_control) = self
                .unwrap_link(link, files.as_ref(), wanted.as_ref(), destination)
                .with_context(|| format!("restoring backup {}", link.name()))?;
            pg_control_seen |= saw_pg_control;
            applied.push(link.name().to_string());

            let done = account_missing_blocks(&result, &mut missing_blocks);
            if let (Some(current), Some(files)) = (wanted.as_mut(), files.as_ref()) {
                if link.sentinel.is_incremental() && link.parent().is_some() {
                    let mut base = base_files_to_unwrap(&files.files, current)
                        .with_context(|| format!("narrowing files below backup {}", link.name()))?;
                    base.retain(|name| !done.contains(name));
                    *current = base;
                }
            }

            log_restore_link(
                link.name(),
                RestoreLinkSnapshot {
                    tars: result.tars,
                    completed: result.unwrap.completed.len(),
                    created_from_increment: result.unwrap.created_from_increment.len(),
                    written_from_increment: result.unwrap.written_from_increment.len(),
                    remaining: wanted.as_ref().map_or(0, HashSet::len),
                },
            );
        }

        if !pg_control_seen {
            return Err(Error::PgControlNotFound(name).into());
        }
        info!(backup = %name, links = applied.len(), "restore_finished");
        Ok(RestoreSummary {
            backup: name,
            links: applied,
        })
    }

    /// Apply one link. Returns its unwrap result and whether it carried `pg_control`.
    fn unwrap_link(
        &self,
        link: &ChainLink,
        files: Option<&FilesMetadataDto>,
        wanted: Option<&HashSet<String>>,
        destination: &Path,
    ) -> Result<(LinkUnwrap, bool)> {
        let tars = link_tars(link.backup.tar_folder().as_ref())?;
        let has_pg_control = tars.pg_control.is_some();

        let keep = |tar: &String| {
            !self.options.skip_redundant_tars || should_unwrap_tar(tar, files, wanted)
        };
        let regular: Vec<String> = tars.regular.iter().filter(|t| keep(&tar_base(t))).cloned().collect();
        let pg_control = tars.pg_control.filter(|t| keep(&tar_base(t)));

        debug!(backup = %link.name(), tars = regular.len(), pg_control = pg_control.is_some(), "link_containers_selected");
        let interpreter = TarInterpreter::new(
            destination,
            wanted.cloned(),
            files.map(|f| f.files.clone()),
            self.unwrapper,
            self.options.fsync,
        );
        let tar_folder = link.backup.tar_folder();
        let mut count = extract_all(&tar_folder, &regular, &interpreter, self.options.download_concurrency)?;
        if let Some(pg_control) = pg_control {
            count += extract_all(&tar_folder, &[pg_control], &interpreter, 1)
                .context("extracting pg_control")?;
        }
        Ok((
            LinkUnwrap {
                tars: count,
                unwrap: interpreter.into_result(),
            },
            has_pg_control,
        ))
    }
}

struct LinkUnwrap {
    tars: usize,
    unwrap: UnwrapResult,
}

/// Update per-file missing block counts with one link's outcome. Returns the
/// files that need nothing more from older links.
fn account_missing_blocks(result: &LinkUnwrap, missing: &mut HashMap<String, u64>) -> HashSet<String> {
    let mut done: HashSet<String> = result.unwrap.completed.iter().cloned().collect();
    for (name, &still_missing) in &result.unwrap.created_from_increment {
        if still_missing == 0 {
            done.insert(name.clone());
        } else {
            missing.insert(name.clone(), still_missing);
        }
    }
    for (name, &written) in &result.unwrap.written_from_increment {
        if let Some(left) = missing.get_mut(name) {
            *left = left.saturating_sub(written);
            if *left == 0 {
                missing.remove(name);
                done.insert(name.clone());
            }
        }
    }
    for name in &done {
        missing.remove(name);
    }
    done
}

fn tar_base(stored: &str) -> String {
    crate::compression::CompressionMethod::from_object_name(stored).1.to_string()
}

/// Whether `stored` is the `pg_control` container, under any compression.
pub fn is_pg_control_tar(stored: &str) -> bool {
    tar_base(stored) == PG_CONTROL_TAR
}
