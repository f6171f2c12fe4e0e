//! The `backup-push` handler: start a backup on the server, compose the data
//! directory into containers, stop the backup and publish the metadata.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use crate::bundle::{
    upload_label_files, upload_pg_control, Bundle, BundleFiles, BundleOptions, CopyTarBallComposer, IncrementBase,
    NoRating, RatingEvaluator, RatingTarBallComposer, RegularTarBallComposer, RelFileStatistics, StatisticsRating,
    TarBallComposer, TarBallMaker, TarBallQueue, PG_CONTROL_PATH,
};
use crate::config::{ComposerKind, Settings};
use crate::db::{BackupControl, StartBackupResult};
use crate::delta::{get_delta_map, DeltaMap};
use crate::logging::{log_backup_push, BackupPushSnapshot};
use crate::storage::{FolderRef, Uploader};
use crate::sync::CancellationToken;
use crate::wal::{format_lsn, WalSegmentNo};
use crate::{Error, Result};

use super::metadata::{
    Backup, BackupFileDescription, BackupSentinelDto, ExtendedMetadataDto, FilesMetadataDto,
};
use super::previous::{CopySource, DeltaBackupConfigurator, DeltaBase, PreviousBackup};
use super::backup_name;

#[derive(Debug, Clone)]
pub struct BackupPushOptions {
    pub data_dir: PathBuf,
    pub configurator: DeltaBackupConfigurator,
    pub is_permanent: bool,
    pub user_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct BackupPushResult {
    pub name: String,
    pub sentinel: BackupSentinelDto,
}

pub struct BackupPushHandler {
    settings: Settings,
    folder: FolderRef,
    wal_folder: FolderRef,
    cancel: CancellationToken,
}

impl BackupPushHandler {
    pub fn new(settings: Settings, folder: FolderRef, wal_folder: FolderRef, cancel: CancellationToken) -> Self {
        Self {
            settings,
            folder,
            wal_folder,
            cancel,
        }
    }

    /// Take one backup. The server's backup mode is always left again: when
    /// anything fails after the start, stop-backup is still attempted.
    pub fn push(&self, control: &mut dyn BackupControl, options: &BackupPushOptions) -> Result<BackupPushResult> {
        // copied containers hold full files only, so every file must be walked as new
        let copy_source = match (self.settings.composer, options.configurator) {
            (ComposerKind::Copy, DeltaBackupConfigurator::Regular { .. }) => Some(CopySource::latest(&self.folder)?),
            _ => None,
        };
        let base = match copy_source {
            Some(_) => {
                info!("copy composer takes full backups");
                DeltaBase::full()
            }
            None => options
                .configurator
                .configure(&self.folder, &self.settings, options.is_permanent)?,
        };
        let pg_version = control.server_version()?;
        let system_identifier = control.system_identifier()?;
        let timeline = control.timeline()?;

        let label = format!("pgdelta backup {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let start_time = Utc::now();
        let start = control.start_backup(&label)?;
        info!(lsn = %format_lsn(start.lsn), in_recovery = start.in_recovery, "backup_started");

        let mut stopped = false;
        let context = PushContext {
            options,
            base,
            copy_source: copy_source.flatten(),
            start,
            timeline,
            pg_version,
            system_identifier,
            start_time,
        };
        let result = self.push_started(control, &context, &mut stopped);
        if result.is_err() && !stopped {
            if let Err(e) = control.stop_backup() {
                warn!(error = %e, "stop backup after a failed backup also failed");
            }
        }
        result
    }

    fn push_started(
        &self,
        control: &mut dyn BackupControl,
        ctx: &PushContext<'_>,
        stopped: &mut bool,
    ) -> Result<BackupPushResult> {
        let start_wal = ctx
            .start
            .wal_filename
            .clone()
            .unwrap_or_else(|| WalSegmentNo::from_lsn(ctx.start.lsn).filename(ctx.timeline));
        let regular_parent = ctx.base.previous.as_ref().filter(|p| p.name.is_some());
        if let Some(previous) = regular_parent {
            check_previous(previous, &ctx.start, ctx.system_identifier)?;
        }
        let name = backup_name(&start_wal, regular_parent.and_then(|p| p.name.as_deref()));
        let backup = Backup::new(self.folder.clone(), name.clone());
        info!(backup = %name, "backup_name_chosen");

        let increment_base = ctx.base.previous.as_ref().and_then(|p| {
            p.start_lsn().map(|lsn| IncrementBase {
                lsn,
                files: p.files.as_ref().map(|f| f.files.clone()),
                force_incremental: ctx.options.configurator.is_catchup(),
            })
        });
        let delta_map = match &increment_base {
            Some(base) if self.settings.use_wal_delta => self.delta_map(ctx.timeline, base.lsn, ctx.start.lsn),
            _ => None,
        };

        let bundle_options = BundleOptions::from_settings(&self.settings);
        let uploader = Uploader::new(backup.tar_folder(), self.settings.compression);
        let queue = Arc::new(TarBallQueue::start(
            TarBallMaker::new(uploader.clone()),
            bundle_options.queue_options(),
        ));

        let rating = self.rating(control, ctx.base.previous.as_ref());
        let files = Arc::new(match &rating {
            Some(rating) => BundleFiles::with_rating(rating.clone()),
            None => BundleFiles::new(),
        });
        let mut bundle = Bundle::new(&ctx.options.data_dir, increment_base);
        let packer = Arc::new(bundle.packer(delta_map, files.clone(), bundle_options.packer));
        let mut composer = self.composer(queue.clone(), packer, rating, ctx.copy_source.as_ref(), &name, &bundle_options);

        let walked = bundle.compose(composer.as_mut())?;
        let mut tar_file_sets = composer.finish_composing()?;
        if self.cancel.is_cancelled() {
            anyhow::bail!("backup {name} interrupted");
        }
        queue.finish_queue()?;

        let stop = control.stop_backup()?;
        *stopped = true;
        if ctx.start.in_recovery {
            let finished = control.timeline()?;
            if finished != ctx.timeline {
                return Err(Error::TimelineChanged {
                    started: ctx.timeline,
                    finished,
                }
                .into());
            }
        }
        info!(backup = %name, lsn = %format_lsn(stop.lsn), "backup_stopped");

        let (label_tar, label_members) = upload_label_files(&queue, &stop.label, &stop.tablespace_map)?;
        tar_file_sets.insert(label_tar, label_members);
        let pg_control = bundle
            .pg_control()
            .cloned()
            .ok_or_else(|| Error::PgControlNotFound(ctx.options.data_dir.display().to_string()))?;
        let pg_control_tar = upload_pg_control(&queue, &pg_control)?;
        tar_file_sets.insert(pg_control_tar, vec![PG_CONTROL_PATH.to_string()]);
        files.add_description(PG_CONTROL_PATH, BackupFileDescription::packed(pg_control.mtime, false));

        let counters = uploader.counters();
        let mut sentinel = BackupSentinelDto {
            start_lsn: Some(ctx.start.lsn),
            pg_version: ctx.pg_version,
            finish_lsn: Some(stop.lsn),
            system_identifier: ctx.system_identifier,
            uncompressed_size: counters.uncompressed(),
            compressed_size: counters.compressed(),
            user_data: ctx.options.user_data.clone(),
            ..Default::default()
        };
        if let Some(previous) = regular_parent {
            set_increment_fields(&mut sentinel, previous, ctx.base.increment_count);
        }

        let counts = files.counts();
        if !self.settings.without_files_metadata {
            backup
                .upload_files_metadata(&FilesMetadataDto {
                    files: files.to_list(),
                    tar_file_sets: tar_file_sets.clone(),
                })
                .context("uploading files metadata")?;
        }
        backup
            .upload_meta(&ExtendedMetadataDto {
                start_time: ctx.start_time,
                finish_time: Utc::now(),
                hostname: hostname(),
                data_dir: ctx.start.data_dir.clone(),
                pg_version: ctx.pg_version,
                start_lsn: ctx.start.lsn,
                finish_lsn: stop.lsn,
                is_permanent: ctx.options.is_permanent,
                system_identifier: ctx.system_identifier,
                uncompressed_size: sentinel.uncompressed_size,
                compressed_size: sentinel.compressed_size,
                user_data: ctx.options.user_data.clone(),
            })
            .context("uploading backup metadata")?;
        backup.upload_sentinel(&sentinel).context("uploading sentinel")?;

        log_backup_push(
            &name,
            BackupPushSnapshot {
                files: counts.files,
                skipped: counts.skipped,
                incremented: counts.incremented,
                full: counts.files - counts.skipped - counts.incremented,
                tars: tar_file_sets.len(),
                uncompressed_size: sentinel.uncompressed_size,
                compressed_size: sentinel.compressed_size,
                corrupt_blocks: counts.corrupt_blocks,
            },
        );
        info!(backup = %name, entries = walked.entries, data_size = walked.data_size, "backup_push_done");
        Ok(BackupPushResult { name, sentinel })
    }

    /// Falls back to a full page scan when the map can't be built.
    fn delta_map(&self, timeline: u32, from_lsn: u64, to_lsn: u64) -> Option<Arc<DeltaMap>> {
        match get_delta_map(self.wal_folder.as_ref(), timeline, from_lsn, to_lsn) {
            Ok(map) => {
                info!(relations = map.relation_count(), "delta_map_loaded");
                Some(Arc::new(map))
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "delta map unavailable, scanning page headers instead");
                None
            }
        }
    }

    fn rating(&self, control: &mut dyn BackupControl, previous: Option<&PreviousBackup>) -> Option<Arc<dyn RatingEvaluator>> {
        if self.settings.composer != ComposerKind::Rating {
            return None;
        }
        let previous_files = previous
            .and_then(|p| p.files.as_ref())
            .map(|f| f.files.clone())
            .unwrap_or_default();
        match control.relation_statistics() {
            Ok(stats) => Some(Arc::new(StatisticsRating::new(RelFileStatistics::new(stats), previous_files))),
            Err(e) => {
                warn!(error = %e, "relation statistics unavailable, packing in walk order");
                Some(Arc::new(NoRating))
            }
        }
    }

    fn composer(
        &self,
        queue: Arc<TarBallQueue>,
        packer: Arc<crate::bundle::TarBallFilePacker>,
        rating: Option<Arc<dyn RatingEvaluator>>,
        copy_source: Option<&CopySource>,
        name: &str,
        options: &BundleOptions,
    ) -> Box<dyn TarBallComposer> {
        match self.settings.composer {
            ComposerKind::Rating => Box::new(RatingTarBallComposer::new(
                queue,
                packer,
                rating.unwrap_or_else(|| Arc::new(NoRating)),
                options.tar_size_threshold,
            )),
            ComposerKind::Copy => match copy_source {
                Some(source) => Box::new(CopyTarBallComposer::new(
                    queue,
                    packer,
                    Backup::new(self.folder.clone(), source.name.clone()),
                    source.files.clone(),
                    name,
                )),
                None => Box::new(RegularTarBallComposer::new(queue, packer, options.file_workers)),
            },
            ComposerKind::Regular => Box::new(RegularTarBallComposer::new(queue, packer, options.file_workers)),
        }
    }
}

struct PushContext<'a> {
    options: &'a BackupPushOptions,
    base: DeltaBase,
    copy_source: Option<CopySource>,
    start: StartBackupResult,
    timeline: u32,
    pg_version: u32,
    system_identifier: Option<u64>,
    start_time: chrono::DateTime<Utc>,
}

/// The parent must have finished before this backup started, on the same cluster.
fn check_previous(previous: &PreviousBackup, start: &StartBackupResult, system_identifier: Option<u64>) -> Result<()> {
    let name = previous.name.clone().unwrap_or_default();
    if let Some(previous_finish) = previous.sentinel.finish_lsn {
        if previous_finish > start.lsn {
            return Err(Error::BackupFromFuture {
                previous: name,
                previous_finish: format_lsn(previous_finish),
                current_start: format_lsn(start.lsn),
            }
            .into());
        }
    }
    if let (Some(expected), Some(actual)) = (previous.sentinel.system_identifier, system_identifier) {
        if expected != actual {
            return Err(Error::BackupFromOtherDb {
                previous: name,
                expected,
                actual,
            }
            .into());
        }
    }
    Ok(())
}

fn set_increment_fields(sentinel: &mut BackupSentinelDto, previous: &PreviousBackup, increment_count: u32) {
    let previous_name = previous.name.clone().unwrap_or_default();
    sentinel.increment_from_lsn = previous.start_lsn();
    sentinel.increment_full_name = Some(
        previous
            .sentinel
            .increment_full_name
            .clone()
            .unwrap_or_else(|| previous_name.clone()),
    );
    sentinel.increment_from = Some(previous_name);
    sentinel.increment_count = Some(increment_count);
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for its whole length
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return std::env::var("HOSTNAME").unwrap_or_default();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
