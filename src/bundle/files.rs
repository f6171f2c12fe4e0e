use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::backup::{BackupFileDescription, BackupFileList};

use super::rating::RatingEvaluator;

/// File descriptions collected while composing, shared by the pack workers.
#[derive(Default)]
pub struct BundleFiles {
    files: DashMap<String, BackupFileDescription>,
    rating: Option<Arc<dyn RatingEvaluator>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleFilesCounts {
    pub files: usize,
    pub skipped: usize,
    pub incremented: usize,
    pub corrupt_blocks: usize,
}

impl BundleFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptions also record each relation's update count.
    pub fn with_rating(rating: Arc<dyn RatingEvaluator>) -> Self {
        Self {
            files: DashMap::new(),
            rating: Some(rating),
        }
    }

    pub fn add_skipped(&self, name: &str, mtime: DateTime<Utc>) {
        self.add_description(name, BackupFileDescription::skipped(mtime));
    }

    pub fn add_file(&self, name: &str, mtime: DateTime<Utc>, is_incremented: bool) {
        self.add_description(name, BackupFileDescription::packed(mtime, is_incremented));
    }

    pub fn add_file_with_corrupt_blocks(
        &self,
        name: &str,
        mtime: DateTime<Utc>,
        is_incremented: bool,
        corrupt_blocks: Vec<u32>,
        store_all: bool,
    ) {
        let mut desc = BackupFileDescription::packed(mtime, is_incremented);
        desc.set_corrupt_blocks(corrupt_blocks, store_all);
        self.add_description(name, desc);
    }

    pub fn add_description(&self, name: &str, mut desc: BackupFileDescription) {
        if let Some(rating) = &self.rating {
            desc.updates_count = rating.updates_count(name);
        }
        self.files.insert(name.to_string(), desc);
    }

    pub fn get(&self, name: &str) -> Option<BackupFileDescription> {
        self.files.get(name).map(|d| d.value().clone())
    }

    pub fn counts(&self) -> BundleFilesCounts {
        let mut counts = BundleFilesCounts::default();
        for entry in self.files.iter() {
            let desc = entry.value();
            counts.files += 1;
            if desc.is_skipped {
                counts.skipped += 1;
            }
            if desc.is_incremented {
                counts.incremented += 1;
            }
            counts.corrupt_blocks += desc.corrupt_blocks.as_ref().map_or(0, |c| c.count);
        }
        counts
    }

    pub fn to_list(&self) -> BackupFileList {
        self.files
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
