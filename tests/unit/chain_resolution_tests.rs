use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use pgdelta::backup::{Backup, BackupChain, BackupFileDescription, BackupFileList, BackupSentinelDto, FilesMetadataDto};
use pgdelta::restore::{base_files_to_unwrap, files_to_unwrap, should_unwrap_tar};
use pgdelta::storage::{FolderRef, MemoryFolder};
use pgdelta::Error;

fn sentinel(parent: Option<&str>, start: u64, finish: u64) -> BackupSentinelDto {
    BackupSentinelDto {
        start_lsn: Some(start),
        finish_lsn: Some(finish),
        increment_from: parent.map(str::to_string),
        increment_from_lsn: parent.map(|_| 0x100_0028),
        increment_full_name: parent.map(|_| "base_000000010000000000000001".to_string()),
        increment_count: parent.map(|_| 1),
        ..Default::default()
    }
}

fn store(folder: &FolderRef, name: &str, sentinel: &BackupSentinelDto) -> pgdelta::Result<()> {
    Backup::new(folder.clone(), name).upload_sentinel(sentinel)
}

fn names(chain: &BackupChain) -> Vec<&str> {
    chain.elements.iter().map(|link| link.name()).collect()
}

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn chain_is_resolved_from_the_target_to_the_full_backup() -> pgdelta::Result<()> {
    let folder: FolderRef = Arc::new(MemoryFolder::new());
    store(&folder, "full", &sentinel(None, 0x100_0028, 0x100_1000))?;
    store(&folder, "inc1", &sentinel(Some("full"), 0x300_0028, 0x300_1000))?;
    store(&folder, "inc2", &sentinel(Some("inc1"), 0x500_0028, 0x500_1000))?;
    store(&folder, "unrelated", &sentinel(None, 0x600_0028, 0x600_1000))?;

    let chain = BackupChain::from_target(&folder, "inc2")?;
    assert_eq!(names(&chain), vec!["full", "inc1", "inc2"]);
    assert_eq!(chain.root().map(|l| l.name()), Some("full"));
    assert_eq!(chain.target_link().and_then(|l| l.parent()), Some("inc1"));
    let newest_first: Vec<_> = chain.newest_first().map(|l| l.name()).collect();
    assert_eq!(newest_first, vec!["inc2", "inc1", "full"]);

    let single = BackupChain::single(&folder, "inc2")?;
    assert_eq!(names(&single), vec!["inc2"]);
    Ok(())
}

#[test]
fn cyclic_parents_are_rejected() -> pgdelta::Result<()> {
    let folder: FolderRef = Arc::new(MemoryFolder::new());
    store(&folder, "a", &sentinel(Some("b"), 0x100_0028, 0x100_0028))?;
    store(&folder, "b", &sentinel(Some("a"), 0x100_0028, 0x100_0028))?;

    let err = BackupChain::from_target(&folder, "a").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ChainCycle(name)) if name == "a"));
    Ok(())
}

#[test]
fn parent_finishing_after_the_child_started_is_rejected() -> pgdelta::Result<()> {
    let folder: FolderRef = Arc::new(MemoryFolder::new());
    store(&folder, "full", &sentinel(None, 0x100_0028, 0x400_0000))?;
    store(&folder, "inc", &sentinel(Some("full"), 0x300_0028, 0x500_0000))?;

    let err = BackupChain::from_target(&folder, "inc").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ChainLsnOrder(name)) if name == "inc"));
    Ok(())
}

#[test]
fn missing_or_inconsistent_links_fail_the_chain() -> pgdelta::Result<()> {
    let folder: FolderRef = Arc::new(MemoryFolder::new());
    store(&folder, "orphan", &sentinel(Some("deleted"), 0x300_0028, 0x300_1000))?;
    let err = BackupChain::from_target(&folder, "orphan").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::MissingBackup(name)) if name == "deleted"));

    let mut broken = sentinel(Some("orphan"), 0x500_0028, 0x500_1000);
    broken.increment_count = None;
    store(&folder, "broken", &broken)?;
    let err = BackupChain::from_target(&folder, "broken").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InconsistentSentinel(_))));
    Ok(())
}

#[test]
fn required_files_shrink_down_the_chain() -> pgdelta::Result<()> {
    let now = Utc::now();
    let mut newest = BackupFileList::new();
    newest.insert("base/5/16384".into(), BackupFileDescription::packed(now, true));
    newest.insert("base/5/16390".into(), BackupFileDescription::skipped(now));
    newest.insert("base/5/PG_VERSION".into(), BackupFileDescription::packed(now, false));
    let target = FilesMetadataDto {
        files: newest.clone(),
        ..Default::default()
    };

    let wanted = files_to_unwrap(Some(&target)).expect("file list present");
    assert!(wanted.contains("global/pg_control"));
    assert!(wanted.contains("backup_label"));
    assert_eq!(wanted.len(), 3 + 3);

    // the parent must supply what the newest link skipped or carried as an increment
    let below_newest = base_files_to_unwrap(&newest, &wanted)?;
    assert_eq!(below_newest, set(&["base/5/16384", "base/5/16390"]));

    let mut middle = BackupFileList::new();
    middle.insert("base/5/16384".into(), BackupFileDescription::packed(now, false));
    middle.insert("base/5/16390".into(), BackupFileDescription::packed(now, true));
    let below_middle = base_files_to_unwrap(&middle, &below_newest)?;
    assert_eq!(below_middle, set(&["base/5/16390"]));

    let undescribed = set(&["base/5/99999"]);
    assert!(base_files_to_unwrap(&middle, &undescribed).is_err());

    assert_eq!(files_to_unwrap(Some(&FilesMetadataDto::default())), None);
    assert_eq!(files_to_unwrap(None), None);
    Ok(())
}

#[test]
fn containers_without_required_files_are_skipped() {
    let mut files = FilesMetadataDto::default();
    files.tar_file_sets.insert("part_1.tar".into(), vec!["base/5/16384".into(), "base/5/16385".into()]);
    files.tar_file_sets.insert("part_2.tar".into(), vec!["base/5/16390".into()]);
    let wanted = set(&["base/5/16385"]);

    assert!(should_unwrap_tar("part_1.tar", Some(&files), Some(&wanted)));
    assert!(!should_unwrap_tar("part_2.tar", Some(&files), Some(&wanted)));
    assert!(!should_unwrap_tar("part_3.tar", Some(&files), Some(&wanted)));
    // without a mapping or a wanted set nothing can be ruled out
    assert!(should_unwrap_tar("part_2.tar", Some(&files), None));
    assert!(should_unwrap_tar("part_2.tar", Some(&FilesMetadataDto::default()), Some(&wanted)));
    assert!(should_unwrap_tar("part_2.tar", None, Some(&wanted)));
}
