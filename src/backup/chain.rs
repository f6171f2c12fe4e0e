use std::collections::HashSet;

use tracing::debug;

use crate::storage::FolderRef;
use crate::wal::format_lsn;
use crate::{Error, Result};

use super::metadata::{Backup, BackupSentinelDto};

/// One backup of a chain together with its sentinel.
#[derive(Debug, Clone)]
pub struct ChainLink {
    pub backup: Backup,
    pub sentinel: BackupSentinelDto,
}

impl ChainLink {
    pub fn name(&self) -> &str {
        &self.backup.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.sentinel.increment_from.as_deref()
    }
}

/// The parent-linked backups from a full backup up to a target increment.
#[derive(Debug, Clone)]
pub struct BackupChain {
    pub target: String,
    /// Oldest (the full backup) first.
    pub elements: Vec<ChainLink>,
}

impl BackupChain {
    /// Follow `DeltaFrom` pointers from `target` down to a full backup.
    ///
    /// Fails on a repeated name (`ChainCycle`), on a parent that finished
    /// after its child started (`ChainLsnOrder`) and on any missing link.
    pub fn from_target(folder: &FolderRef, target: &str) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut current = target.to_string();
        let mut chain: Vec<ChainLink> = Vec::new();

        loop {
            if !seen.insert(current.clone()) {
                return Err(Error::ChainCycle(current).into());
            }
            let backup = Backup::new(folder.clone(), current.clone());
            let sentinel = backup.fetch_sentinel()?;

            if let Some(child) = chain.last() {
                check_lsn_order(&sentinel, &child.sentinel, child.name())?;
            }
            let parent = sentinel.increment_from.clone();
            debug!(backup = %current, parent = ?parent, "chain_link_loaded");
            chain.push(ChainLink { backup, sentinel });

            match parent {
                None => break,
                Some(parent) => current = parent,
            }
        }

        chain.reverse();
        Ok(Self {
            target: target.to_string(),
            elements: chain,
        })
    }

    /// A chain of just `target`, whose parents are not followed.
    pub fn single(folder: &FolderRef, target: &str) -> Result<Self> {
        let backup = Backup::new(folder.clone(), target);
        let sentinel = backup.fetch_sentinel()?;
        Ok(Self {
            target: target.to_string(),
            elements: vec![ChainLink { backup, sentinel }],
        })
    }

    pub fn root(&self) -> Option<&ChainLink> {
        self.elements.first()
    }

    pub fn target_link(&self) -> Option<&ChainLink> {
        self.elements.last()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Newest first, the order restore applies links in.
    pub fn newest_first(&self) -> impl Iterator<Item = &ChainLink> {
        self.elements.iter().rev()
    }
}

fn check_lsn_order(parent: &BackupSentinelDto, child: &BackupSentinelDto, child_name: &str) -> Result<()> {
    let (Some(parent_finish), Some(child_start)) = (parent.finish_lsn, child.start_lsn) else {
        return Ok(());
    };
    if parent_finish > child_start {
        debug!(
            backup = %child_name,
            parent_finish = %format_lsn(parent_finish),
            child_start = %format_lsn(child_start),
            "chain_lsn_order_violation"
        );
        return Err(Error::ChainLsnOrder(child_name.to_string()).into());
    }
    Ok(())
}
