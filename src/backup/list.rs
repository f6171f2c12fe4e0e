//! Enumerating stored backups.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::storage::{is_not_found, Folder, FolderRef};
use crate::wal::format_lsn;
use crate::Result;

use super::metadata::{Backup, SENTINEL_SUFFIX};
use super::wal_segment_of;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupTime {
    pub name: String,
    pub modified: DateTime<Utc>,
    pub wal_file_name: String,
}

/// Completed backups (those with a sentinel), oldest first by sentinel time.
pub fn backup_times(folder: &dyn Folder) -> Result<Vec<BackupTime>> {
    let listing = folder.list()?;
    let mut backups: Vec<BackupTime> = listing
        .objects
        .into_iter()
        .filter_map(|object| {
            let name = object.name.strip_suffix(SENTINEL_SUFFIX)?.to_string();
            Some(BackupTime {
                wal_file_name: wal_segment_of(&name).to_string(),
                name,
                modified: object.last_modified,
            })
        })
        .collect();
    backups.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(backups)
}

/// Name of the newest completed backup, if any.
pub fn latest_backup_name(folder: &dyn Folder) -> Result<Option<String>> {
    Ok(backup_times(folder)?.pop().map(|b| b.name))
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupDetail {
    pub name: String,
    pub modified: DateTime<Utc>,
    pub wal_file_name: String,
    pub start_lsn: Option<String>,
    pub finish_lsn: Option<String>,
    pub is_permanent: bool,
    pub increment_from: Option<String>,
}

/// Backup listing enriched with sentinel and metadata fields.
pub fn backup_details(folder: &FolderRef) -> Result<Vec<BackupDetail>> {
    let mut details = Vec::new();
    for time in backup_times(folder.as_ref())? {
        let backup = Backup::new(folder.clone(), time.name.clone());
        let sentinel = backup.fetch_sentinel()?;
        let is_permanent = match backup.fetch_meta() {
            Ok(meta) => meta.is_permanent,
            Err(e) if is_not_found(&e) => false,
            Err(e) => {
                warn!(backup = %time.name, error = %e, "backup_metadata_unreadable");
                false
            }
        };
        details.push(BackupDetail {
            name: time.name,
            modified: time.modified,
            wal_file_name: time.wal_file_name,
            start_lsn: sentinel.start_lsn.map(format_lsn),
            finish_lsn: sentinel.finish_lsn.map(format_lsn),
            is_permanent,
            increment_from: sentinel.increment_from,
        });
    }
    Ok(details)
}

/// Plain-text table, one backup per line.
pub fn render_backup_table(details: &[BackupDetail]) -> String {
    let mut out = String::from("name\tmodified\twal_segment_backup_start\tstart_lsn\tfinish_lsn\tpermanent\n");
    for d in details {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            d.name,
            d.modified.to_rfc3339(),
            d.wal_file_name,
            d.start_lsn.as_deref().unwrap_or("-"),
            d.finish_lsn.as_deref().unwrap_or("-"),
            d.is_permanent,
        ));
    }
    out
}
