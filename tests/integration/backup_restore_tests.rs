use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use pgdelta::backup::previous::DeltaBackupConfigurator;
use pgdelta::backup::push::{BackupPushHandler, BackupPushOptions};
use pgdelta::backup::{latest_backup_name, Backup, LATEST};
use pgdelta::config::{ComposerKind, FsyncMode, Settings};
use pgdelta::db::{BackupControl, RelationStatistics, StartBackupResult, StopBackupResult};
use pgdelta::page::DATABASE_PAGE_SIZE;
use pgdelta::restore::{RestoreEngine, RestoreOptions};
use pgdelta::storage::Folder;
use pgdelta::sync::CancellationToken;
use pgdelta::wal::{Lsn, WalSegmentNo};
use pgdelta::walparser::RelFileNode;
use pgdelta::Error;
use tempfile::{tempdir, TempDir};

const SYSTEM_ID: u64 = 7_000_000_000_000_000_001;

/// Server stand-in handing out the LSNs of one backup at a time.
struct FakeServer {
    start_lsn: Lsn,
    stop_lsn: Lsn,
    data_dir: String,
    starts: usize,
    stops: usize,
}

impl FakeServer {
    fn new(data_dir: &Path, start_lsn: Lsn, stop_lsn: Lsn) -> Self {
        Self {
            start_lsn,
            stop_lsn,
            data_dir: data_dir.display().to_string(),
            starts: 0,
            stops: 0,
        }
    }

    fn label(&self) -> String {
        format!(
            "START WAL LOCATION: {:X}/{:X} (file {})\nLABEL: test\n",
            self.start_lsn >> 32,
            self.start_lsn & 0xFFFF_FFFF,
            WalSegmentNo::from_lsn(self.start_lsn).filename(1)
        )
    }
}

impl BackupControl for FakeServer {
    fn server_version(&mut self) -> pgdelta::Result<u32> {
        Ok(160_002)
    }

    fn system_identifier(&mut self) -> pgdelta::Result<Option<u64>> {
        Ok(Some(SYSTEM_ID))
    }

    fn timeline(&mut self) -> pgdelta::Result<u32> {
        Ok(1)
    }

    fn start_backup(&mut self, _label: &str) -> pgdelta::Result<StartBackupResult> {
        self.starts += 1;
        Ok(StartBackupResult {
            wal_filename: Some(WalSegmentNo::from_lsn(self.start_lsn).filename(1)),
            lsn: self.start_lsn,
            in_recovery: false,
            data_dir: self.data_dir.clone(),
        })
    }

    fn stop_backup(&mut self) -> pgdelta::Result<StopBackupResult> {
        self.stops += 1;
        Ok(StopBackupResult {
            label: self.label(),
            tablespace_map: String::new(),
            lsn: self.stop_lsn,
        })
    }

    fn relation_statistics(&mut self) -> pgdelta::Result<HashMap<RelFileNode, RelationStatistics>> {
        Ok(HashMap::new())
    }
}

fn page(lsn: u64, fill: u8) -> Vec<u8> {
    let mut page = vec![fill; DATABASE_PAGE_SIZE];
    page[..24].fill(0);
    page[0..4].copy_from_slice(&((lsn >> 32) as u32).to_le_bytes());
    page[4..8].copy_from_slice(&(lsn as u32).to_le_bytes());
    page[12..14].copy_from_slice(&24u16.to_le_bytes());
    page[14..16].copy_from_slice(&8192u16.to_le_bytes());
    page[16..18].copy_from_slice(&8192u16.to_le_bytes());
    page[18..20].copy_from_slice(&(8192u16 + 4).to_le_bytes());
    page
}

struct Cluster {
    _root: TempDir,
    data_dir: std::path::PathBuf,
    restore_root: std::path::PathBuf,
    settings: Settings,
}

fn cluster() -> pgdelta::Result<Cluster> {
    let root = tempdir()?;
    let data_dir = root.path().join("pgdata");
    fs::create_dir_all(data_dir.join("base/5"))?;
    fs::create_dir_all(data_dir.join("global"))?;
    fs::create_dir_all(data_dir.join("pg_wal"))?;
    fs::write(data_dir.join("PG_VERSION"), b"16\n")?;
    fs::write(data_dir.join("base/5/PG_VERSION"), b"16\n")?;
    fs::write(data_dir.join("global/pg_control"), vec![0x7Cu8; 8192])?;
    fs::write(data_dir.join("postmaster.pid"), b"4242\n")?;
    fs::write(data_dir.join("pg_wal/000000010000000000000001"), b"not backed up")?;
    fs::write(
        data_dir.join("base/5/16384"),
        [page(0x100, 1), page(0x200, 2), page(0x100, 3)].concat(),
    )?;
    fs::write(data_dir.join("base/5/16390"), page(0x200, 9))?;

    let settings = Settings {
        storage_path: root.path().join("storage"),
        delta_max_steps: 3,
        ..Settings::default()
    };
    Ok(Cluster {
        restore_root: root.path().join("restored"),
        data_dir,
        settings,
        _root: root,
    })
}

fn push(cluster: &Cluster, server: &mut FakeServer) -> pgdelta::Result<String> {
    push_with(cluster, cluster.settings.composer, server)
}

fn push_with(cluster: &Cluster, composer: ComposerKind, server: &mut FakeServer) -> pgdelta::Result<String> {
    let settings = Settings {
        composer,
        ..cluster.settings.clone()
    };
    let handler = BackupPushHandler::new(
        settings.clone(),
        settings.basebackups_folder(),
        settings.wal_folder(),
        CancellationToken::new(),
    );
    let result = handler.push(
        server,
        &BackupPushOptions {
            data_dir: cluster.data_dir.clone(),
            configurator: DeltaBackupConfigurator::Regular { force_full: false },
            is_permanent: false,
            user_data: None,
        },
    )?;
    Ok(result.name)
}

fn restore_options() -> RestoreOptions {
    RestoreOptions {
        skip_redundant_tars: true,
        fsync: FsyncMode::None,
        download_concurrency: 2,
        catchup: false,
    }
}

/// Rewrite block 1 and append block 3 of `base/5/16384`, moving its mtime on.
fn modify_relation(data_dir: &Path) -> pgdelta::Result<()> {
    let path = data_dir.join("base/5/16384");
    let mut file = OpenOptions::new().write(true).open(&path)?;
    file.seek(SeekFrom::Start(DATABASE_PAGE_SIZE as u64))?;
    file.write_all(&page(0x300_0000, 0xA1))?;
    file.seek(SeekFrom::Start(3 * DATABASE_PAGE_SIZE as u64))?;
    file.write_all(&page(0x300_0000, 0xA3))?;
    file.set_modified(SystemTime::now() + Duration::from_secs(10))?;
    Ok(())
}

const RESTORED_FILES: [&str; 5] = ["base/5/16384", "base/5/16390", "base/5/PG_VERSION", "PG_VERSION", "global/pg_control"];

fn assert_same_file(restored: &Path, original: &Path, name: &str) -> pgdelta::Result<()> {
    assert_eq!(
        fs::read(restored.join(name))?,
        fs::read(original.join(name))?,
        "{name} differs after restore"
    );
    Ok(())
}

#[test]
fn full_then_incremental_backup_restores_the_latest_state() -> pgdelta::Result<()> {
    let cluster = cluster()?;
    let folder = cluster.settings.basebackups_folder();

    let mut first = FakeServer::new(&cluster.data_dir, 0x100_0028, 0x100_1000);
    let full = push(&cluster, &mut first)?;
    assert_eq!(full, "base_000000010000000000000001");
    assert_eq!((first.starts, first.stops), (1, 1));

    modify_relation(&cluster.data_dir)?;
    let mut second = FakeServer::new(&cluster.data_dir, 0x400_0028, 0x400_1000);
    let increment = push(&cluster, &mut second)?;
    assert_eq!(increment, "base_000000010000000000000004_D_000000010000000000000001");
    assert_eq!(latest_backup_name(folder.as_ref())?.as_deref(), Some(increment.as_str()));

    let backup = Backup::new(folder.clone(), increment.clone());
    let sentinel = backup.fetch_sentinel()?;
    assert_eq!(sentinel.increment_from.as_deref(), Some(full.as_str()));
    assert_eq!(sentinel.increment_from_lsn, Some(0x100_0028));
    assert_eq!(sentinel.increment_count, Some(1));
    assert_eq!(sentinel.system_identifier, Some(SYSTEM_ID));
    let files = backup.fetch_files_metadata(&sentinel)?.expect("file list");
    assert!(files.files["base/5/16384"].is_incremented);
    assert!(files.files["base/5/16390"].is_skipped);
    assert!(files.files["PG_VERSION"].is_skipped);
    assert!(!files.files.contains_key("postmaster.pid"));
    assert!(files.tar_file_sets.contains_key("pg_control.tar"));

    let engine = RestoreEngine::new(folder.clone(), restore_options());
    let destination = cluster.restore_root.join("by_name");
    let summary = engine.fetch(&increment, &destination)?;
    assert_eq!(summary.links, vec![increment.clone(), full.clone()]);

    for name in RESTORED_FILES {
        assert_same_file(&destination, &cluster.data_dir, name)?;
    }
    assert_eq!(fs::read_to_string(destination.join("backup_label"))?, second.label());
    assert!(destination.join("pg_wal").is_dir());
    assert_eq!(fs::read_dir(destination.join("pg_wal"))?.count(), 0);
    assert!(!destination.join("postmaster.pid").exists());

    let latest = engine.fetch(LATEST, &cluster.restore_root.join("latest"))?;
    assert_eq!(latest.backup, increment);
    Ok(())
}

#[test]
fn full_backup_alone_restores_its_own_state() -> pgdelta::Result<()> {
    let cluster = cluster()?;
    let original = fs::read(cluster.data_dir.join("base/5/16384"))?;
    let mut server = FakeServer::new(&cluster.data_dir, 0x100_0028, 0x100_1000);
    let full = push(&cluster, &mut server)?;
    modify_relation(&cluster.data_dir)?;

    let destination = cluster.restore_root.join("full");
    let summary = RestoreEngine::new(cluster.settings.basebackups_folder(), restore_options())
        .fetch(&full, &destination)?;
    assert_eq!(summary.links, vec![full]);
    assert_eq!(fs::read(destination.join("base/5/16384"))?, original);
    Ok(())
}

#[test]
fn restore_refuses_a_non_empty_destination() -> pgdelta::Result<()> {
    let cluster = cluster()?;
    let mut server = FakeServer::new(&cluster.data_dir, 0x100_0028, 0x100_1000);
    let full = push(&cluster, &mut server)?;

    let destination = cluster.restore_root.join("occupied");
    fs::create_dir_all(&destination)?;
    File::create(destination.join("leftover"))?;
    let err = RestoreEngine::new(cluster.settings.basebackups_folder(), restore_options())
        .fetch(&full, &destination)
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NonEmptyDataDirectory(_))));
    Ok(())
}

#[test]
fn missing_pg_control_fails_the_backup_after_stopping_it() -> pgdelta::Result<()> {
    let cluster = cluster()?;
    fs::remove_file(cluster.data_dir.join("global/pg_control"))?;
    let mut server = FakeServer::new(&cluster.data_dir, 0x100_0028, 0x100_1000);

    let err = push(&cluster, &mut server).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::PgControlNotFound(_))));
    assert_eq!(server.stops, 1);
    assert_eq!(latest_backup_name(cluster.settings.basebackups_folder().as_ref())?, None);
    Ok(())
}

#[test]
fn rating_composer_backups_restore_the_latest_state() -> pgdelta::Result<()> {
    let cluster = cluster()?;
    let mut first = FakeServer::new(&cluster.data_dir, 0x100_0028, 0x100_1000);
    let full = push_with(&cluster, ComposerKind::Rating, &mut first)?;

    modify_relation(&cluster.data_dir)?;
    let mut second = FakeServer::new(&cluster.data_dir, 0x400_0028, 0x400_1000);
    let increment = push_with(&cluster, ComposerKind::Rating, &mut second)?;
    assert_eq!(increment, format!("base_000000010000000000000004_D_{}", &full["base_".len()..]));

    let destination = cluster.restore_root.join("rated");
    let summary = RestoreEngine::new(cluster.settings.basebackups_folder(), restore_options())
        .fetch(&increment, &destination)?;
    assert_eq!(summary.links, vec![increment, full]);
    for name in RESTORED_FILES {
        assert_same_file(&destination, &cluster.data_dir, name)?;
    }
    assert_eq!(fs::read_to_string(destination.join("backup_label"))?, second.label());
    Ok(())
}

#[test]
fn copy_composer_reuses_containers_of_unchanged_files() -> pgdelta::Result<()> {
    let cluster = cluster()?;
    let folder = cluster.settings.basebackups_folder();
    let mut first = FakeServer::new(&cluster.data_dir, 0x100_0028, 0x100_1000);
    push(&cluster, &mut first)?;

    let mut second = FakeServer::new(&cluster.data_dir, 0x400_0028, 0x400_1000);
    let copied = push_with(&cluster, ComposerKind::Copy, &mut second)?;
    assert_eq!(copied, "base_000000010000000000000004");

    let backup = Backup::new(folder.clone(), copied.clone());
    let sentinel = backup.fetch_sentinel()?;
    assert_eq!(sentinel.increment_from, None);
    let files = backup.fetch_files_metadata(&sentinel)?.expect("file list");
    let copied_tars: Vec<_> = files
        .tar_file_sets
        .iter()
        .filter(|(tar, _)| tar.starts_with("copy_"))
        .collect();
    assert!(
        copied_tars.iter().any(|(_, members)| members.iter().any(|m| m == "base/5/16390")),
        "no copied container holds base/5/16390: {:?}",
        files.tar_file_sets
    );
    assert!(files.files.values().all(|d| !d.is_skipped && !d.is_incremented));
    let stored: Vec<_> = backup.tar_folder().list()?.objects.into_iter().map(|o| o.name).collect();
    assert!(stored.iter().any(|name| name.starts_with("copy_")), "stored: {stored:?}");

    let destination = cluster.restore_root.join("copied");
    let summary = RestoreEngine::new(folder.clone(), restore_options()).fetch(&copied, &destination)?;
    assert_eq!(summary.links, vec![copied]);
    for name in RESTORED_FILES {
        assert_same_file(&destination, &cluster.data_dir, name)?;
    }
    assert_eq!(fs::read_to_string(destination.join("backup_label"))?, second.label());

    // a changed file is packed fresh; the restore still matches the cluster
    modify_relation(&cluster.data_dir)?;
    let mut third = FakeServer::new(&cluster.data_dir, 0x700_0028, 0x700_1000);
    let after_change = push_with(&cluster, ComposerKind::Copy, &mut third)?;
    let destination = cluster.restore_root.join("copied_after_change");
    RestoreEngine::new(folder, restore_options()).fetch(&after_change, &destination)?;
    for name in RESTORED_FILES {
        assert_same_file(&destination, &cluster.data_dir, name)?;
    }
    Ok(())
}
