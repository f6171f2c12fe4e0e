//! Update ratings used by the rating composer to cluster files that change together.

use std::collections::HashMap;
use std::path::Path;

use crate::backup::BackupFileList;
use crate::db::RelationStatistics;
use crate::page::rel_file_node_from_path;
use crate::walparser::RelFileNode;

/// Tuple change counters per relation, taken from the live database.
#[derive(Debug, Clone, Default)]
pub struct RelFileStatistics {
    relations: HashMap<RelFileNode, RelationStatistics>,
}

impl RelFileStatistics {
    pub fn new(relations: HashMap<RelFileNode, RelationStatistics>) -> Self {
        Self { relations }
    }

    /// Inserted, updated and deleted tuples of the relation owning `name`; 0 when unknown.
    pub fn update_count(&self, name: &str) -> u64 {
        rel_file_node_from_path(Path::new(name))
            .ok()
            .and_then(|rel| self.relations.get(&rel))
            .map(RelationStatistics::total)
            .unwrap_or(0)
    }
}

pub trait RatingEvaluator: Send + Sync {
    fn updates_count(&self, name: &str) -> u64;

    fn evaluate(&self, name: &str, updates_count: u64, was_in_base: bool) -> u64;
}

/// Every file rates 0, so packing keeps walk order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRating;

impl RatingEvaluator for NoRating {
    fn updates_count(&self, _name: &str) -> u64 {
        0
    }

    fn evaluate(&self, _name: &str, _updates_count: u64, _was_in_base: bool) -> u64 {
        0
    }
}

/// Rates a file by how much its relation changed since the previous backup,
/// relative to the count recorded there.
#[derive(Debug, Clone, Default)]
pub struct StatisticsRating {
    statistics: RelFileStatistics,
    previous: BackupFileList,
}

impl StatisticsRating {
    pub fn new(statistics: RelFileStatistics, previous: BackupFileList) -> Self {
        Self { statistics, previous }
    }
}

impl RatingEvaluator for StatisticsRating {
    fn updates_count(&self, name: &str) -> u64 {
        self.statistics.update_count(name)
    }

    fn evaluate(&self, name: &str, updates_count: u64, was_in_base: bool) -> u64 {
        if !was_in_base {
            return updates_count;
        }
        let previous = self.previous.get(name).map_or(0, |desc| desc.updates_count);
        if previous == 0 {
            return updates_count;
        }
        updates_count.saturating_sub(previous) * 100 / previous
    }
}
