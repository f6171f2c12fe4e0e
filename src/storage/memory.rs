use std::collections::BTreeSet;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{join_path, Folder, FolderRef, Listing, ObjectInfo, ObjectWriter};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    modified: DateTime<Utc>,
}

/// In-process folder. Sub-folders share the parent's object map.
#[derive(Debug, Clone, Default)]
pub struct MemoryFolder {
    objects: Arc<DashMap<String, StoredObject>>,
    prefix: String,
}

impl MemoryFolder {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self, name: &str) -> String {
        join_path(&self.prefix, name)
    }

    /// Number of objects in the whole store.
    pub fn total_objects(&self) -> usize {
        self.objects.len()
    }
}

struct MemoryObjectWriter {
    objects: Arc<DashMap<String, StoredObject>>,
    key: String,
    buffer: Vec<u8>,
}

impl Write for MemoryObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ObjectWriter for MemoryObjectWriter {
    fn commit(self: Box<Self>) -> Result<()> {
        self.objects.insert(
            self.key,
            StoredObject {
                data: Arc::new(self.buffer),
                modified: Utc::now(),
            },
        );
        Ok(())
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Folder for MemoryFolder {
    fn path(&self) -> String {
        self.prefix.clone()
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.objects.contains_key(&self.key(name)))
    }

    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let key = self.key(name);
        let data = self
            .objects
            .get(&key)
            .map(|o| o.data.clone())
            .ok_or(Error::ObjectNotFound(key))?;
        Ok(Box::new(Cursor::new(SharedBytes(data))))
    }

    fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>> {
        Ok(Box::new(MemoryObjectWriter {
            objects: self.objects.clone(),
            key: self.key(name),
            buffer: Vec::new(),
        }))
    }

    fn list(&self) -> Result<Listing> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let mut listing = Listing::default();
        let mut folders = BTreeSet::new();
        for entry in self.objects.iter() {
            let Some(rest) = entry.key().strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((folder, _)) => {
                    folders.insert(folder.to_string());
                }
                None => listing.objects.push(ObjectInfo {
                    name: rest.to_string(),
                    size: entry.value().data.len() as u64,
                    last_modified: entry.value().modified,
                }),
            }
        }
        listing.objects.sort_by(|a, b| a.name.cmp(&b.name));
        listing.sub_folders = folders.into_iter().collect();
        Ok(listing)
    }

    fn delete(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.objects.remove(&self.key(name));
        }
        Ok(())
    }

    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let key = self.key(src);
        let object = self
            .objects
            .get(&key)
            .map(|o| o.value().clone())
            .ok_or(Error::ObjectNotFound(key))?;
        self.objects.insert(
            self.key(dst),
            StoredObject {
                data: object.data,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    fn sub_folder(&self, path: &str) -> FolderRef {
        Arc::new(Self {
            objects: self.objects.clone(),
            prefix: join_path(&self.prefix, path),
        })
    }
}
