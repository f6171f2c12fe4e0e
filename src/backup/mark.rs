//! `backup-mark`: toggling retention protection.

use tracing::{info, warn};

use crate::storage::FolderRef;
use crate::{Error, Result};

use super::chain::BackupChain;
use super::list::backup_times;
use super::metadata::Backup;

/// Mark `name` permanent together with its whole ancestry, oldest first,
/// or make `name` alone impermanent.
///
/// Returns the names whose metadata changed.
pub fn mark_backup(folder: &FolderRef, name: &str, permanent: bool) -> Result<Vec<String>> {
    let targets = if permanent {
        BackupChain::from_target(folder, name)?
            .elements
            .into_iter()
            .map(|link| link.backup)
            .collect()
    } else {
        ensure_no_permanent_descendant(folder, name)?;
        vec![Backup::new(folder.clone(), name)]
    };

    let mut changed = Vec::new();
    for backup in targets {
        let mut meta = backup.fetch_meta()?;
        if meta.is_permanent == permanent {
            continue;
        }
        meta.is_permanent = permanent;
        backup.upload_meta(&meta)?;
        info!(backup = %backup.name, permanent, "backup_marked");
        changed.push(backup.name);
    }
    Ok(changed)
}

fn ensure_no_permanent_descendant(folder: &FolderRef, name: &str) -> Result<()> {
    for time in backup_times(folder.as_ref())? {
        if time.name == name {
            continue;
        }
        let other = Backup::new(folder.clone(), time.name.clone());
        if !other.is_permanent()? {
            continue;
        }
        let chain = match BackupChain::from_target(folder, &time.name) {
            Ok(chain) => chain,
            Err(e) => {
                warn!(backup = %time.name, error = %e, "permanent_backup_chain_unreadable");
                continue;
            }
        };
        if chain.elements.iter().any(|link| link.name() == name) {
            return Err(Error::PermanentDependency(name.to_string()).into());
        }
    }
    Ok(())
}
