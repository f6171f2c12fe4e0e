//! Control calls issued to the live server around a base backup.

use std::collections::HashMap;

use anyhow::{bail, Context};
use postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::page::DEFAULT_SPC_NODE;
use crate::wal::{parse_lsn, Lsn};
use crate::walparser::{Oid, RelFileNode};
use crate::Result;

/// First server version with `pg_backup_start`/`pg_backup_stop`.
const PG_BACKUP_START_VERSION: u32 = 150_000;
/// Oldest server with non-exclusive backups.
const MIN_SUPPORTED_VERSION: u32 = 90_600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartBackupResult {
    /// WAL file holding the start LSN; `None` on a standby, where the server can't name it.
    pub wal_filename: Option<String>,
    pub lsn: Lsn,
    pub in_recovery: bool,
    pub data_dir: String,
}

/// Label and tablespace map exactly as the server produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopBackupResult {
    pub label: String,
    pub tablespace_map: String,
    pub lsn: Lsn,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationStatistics {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl RelationStatistics {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Everything a backup needs from the server. Start and stop must be called
/// exactly once per attempt, on the same session.
pub trait BackupControl: Send {
    /// Numeric version, e.g. `160002`.
    fn server_version(&mut self) -> Result<u32>;

    fn system_identifier(&mut self) -> Result<Option<u64>>;

    fn timeline(&mut self) -> Result<u32>;

    fn start_backup(&mut self, label: &str) -> Result<StartBackupResult>;

    fn stop_backup(&mut self) -> Result<StopBackupResult>;

    /// Tuple change counters per relation file, for container ordering.
    fn relation_statistics(&mut self) -> Result<HashMap<RelFileNode, RelationStatistics>>;
}

pub struct PgBackupControl {
    client: Client,
    version: Option<u32>,
}

impl PgBackupControl {
    pub fn connect(params: &str) -> Result<Self> {
        let client = Client::connect(params, NoTls).context("connecting to the database server")?;
        Ok(Self { client, version: None })
    }

    fn start_backup_query(version: u32) -> Result<&'static str> {
        if version >= PG_BACKUP_START_VERSION {
            Ok("SELECT CASE WHEN pg_is_in_recovery() THEN '' ELSE (pg_walfile_name_offset(lsn)).file_name END, \
                lsn::text, pg_is_in_recovery() FROM pg_backup_start($1, true) lsn")
        } else if version >= 100_000 {
            Ok("SELECT CASE WHEN pg_is_in_recovery() THEN '' ELSE (pg_walfile_name_offset(lsn)).file_name END, \
                lsn::text, pg_is_in_recovery() FROM pg_start_backup($1, true, false) lsn")
        } else if version >= MIN_SUPPORTED_VERSION {
            Ok("SELECT CASE WHEN pg_is_in_recovery() THEN '' ELSE (pg_xlogfile_name_offset(lsn)).file_name END, \
                lsn::text, pg_is_in_recovery() FROM pg_start_backup($1, true, false) lsn")
        } else {
            bail!("server version {version} does not support non-exclusive backups")
        }
    }

    fn stop_backup_query(version: u32) -> &'static str {
        if version >= PG_BACKUP_START_VERSION {
            "SELECT labelfile, spcmapfile, lsn::text FROM pg_backup_stop(false)"
        } else {
            "SELECT labelfile, spcmapfile, lsn::text FROM pg_stop_backup(false)"
        }
    }
}

impl BackupControl for PgBackupControl {
    fn server_version(&mut self) -> Result<u32> {
        if let Some(version) = self.version {
            return Ok(version);
        }
        let row = self
            .client
            .query_one("SELECT current_setting('server_version_num')", &[])
            .context("getting server version")?;
        let raw: String = row.get(0);
        let version = raw.trim().parse::<u32>().with_context(|| format!("bad server version {raw:?}"))?;
        self.version = Some(version);
        Ok(version)
    }

    fn system_identifier(&mut self) -> Result<Option<u64>> {
        let row = self
            .client
            .query_one("SELECT system_identifier FROM pg_control_system()", &[])
            .context("getting system identifier")?;
        let id: Option<i64> = row.get(0);
        Ok(id.map(|id| id as u64))
    }

    fn timeline(&mut self) -> Result<u32> {
        let row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .context("getting current timeline")?;
        let timeline: i32 = row.get(0);
        Ok(timeline as u32)
    }

    fn start_backup(&mut self, label: &str) -> Result<StartBackupResult> {
        let version = self.server_version()?;
        info!(label, version, "calling_start_backup");
        let row = self
            .client
            .query_one(Self::start_backup_query(version)?, &[&label])
            .context("start backup failed")?;
        let wal_filename: String = row.get(0);
        let lsn: String = row.get(1);
        let in_recovery: bool = row.get(2);
        let data_dir: String = self
            .client
            .query_one("SHOW data_directory", &[])
            .context("show data_directory failed")?
            .get(0);
        Ok(StartBackupResult {
            wal_filename: (!wal_filename.is_empty()).then_some(wal_filename),
            lsn: parse_lsn(&lsn)?,
            in_recovery,
            data_dir,
        })
    }

    fn stop_backup(&mut self) -> Result<StopBackupResult> {
        let version = self.server_version()?;
        info!("calling_stop_backup");
        let mut tx = self.client.transaction().context("stop backup: transaction begin failed")?;
        tx.batch_execute("SET statement_timeout=0")
            .context("stop backup: setting statement timeout failed")?;
        let row = tx
            .query_one(Self::stop_backup_query(version), &[])
            .context("stop backup failed")?;
        let label: String = row.get(0);
        let tablespace_map: Option<String> = row.get(1);
        let lsn: String = row.get(2);
        tx.commit().context("stop backup: commit failed")?;
        Ok(StopBackupResult {
            label,
            tablespace_map: tablespace_map.unwrap_or_default(),
            lsn: parse_lsn(&lsn)?,
        })
    }

    fn relation_statistics(&mut self) -> Result<HashMap<RelFileNode, RelationStatistics>> {
        let rows = self
            .client
            .query(
                "SELECT c.reltablespace::bigint, d.oid::bigint, pg_relation_filenode(c.oid)::bigint, \
                 COALESCE(s.n_tup_ins, 0), COALESCE(s.n_tup_upd, 0), COALESCE(s.n_tup_del, 0) \
                 FROM pg_class c \
                 JOIN pg_database d ON d.datname = current_database() \
                 LEFT JOIN pg_stat_all_tables s ON s.relid = c.oid \
                 WHERE pg_relation_filenode(c.oid) IS NOT NULL",
                &[],
            )
            .context("querying relation statistics")?;
        let mut stats = HashMap::with_capacity(rows.len());
        for row in rows {
            let spc: i64 = row.get(0);
            let db: i64 = row.get(1);
            let rel: i64 = row.get(2);
            let spc = if spc == 0 { DEFAULT_SPC_NODE } else { spc as Oid };
            let node = RelFileNode {
                spc_node: spc,
                db_node: db as Oid,
                rel_node: rel as Oid,
            };
            stats.insert(
                node,
                RelationStatistics {
                    inserted: row.get::<_, i64>(3).max(0) as u64,
                    updated: row.get::<_, i64>(4).max(0) as u64,
                    deleted: row.get::<_, i64>(5).max(0) as u64,
                },
            );
        }
        if stats.is_empty() {
            warn!("relation_statistics_empty");
        }
        Ok(stats)
    }
}
