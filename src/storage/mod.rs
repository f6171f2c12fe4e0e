//! Object storage seen as a tree of folders holding named objects.
//!
//! Object names may contain `/`; they are always relative to the folder they
//! are used with. Writes are atomic: an object becomes visible only once its
//! writer is committed.

use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::compression::CompressionMethod;
use crate::{Error, Result};

pub mod data;
pub mod fs;
pub mod memory;
pub mod uploader;

pub use data::DataFolder;
pub use fs::FsFolder;
pub use memory::MemoryFolder;
pub use uploader::Uploader;

pub const BASEBACKUPS_PATH: &str = "basebackups_005";
pub const WAL_PATH: &str = "wal_005";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Direct children of a folder.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<ObjectInfo>,
    pub sub_folders: Vec<String>,
}

/// Pending object. Nothing is visible to readers until `commit`.
pub trait ObjectWriter: Write + Send {
    fn commit(self: Box<Self>) -> Result<()>;
}

pub type FolderRef = Arc<dyn Folder>;

pub trait Folder: Send + Sync {
    /// Path of this folder relative to the storage root, for messages.
    fn path(&self) -> String;

    fn exists(&self, name: &str) -> Result<bool>;

    /// Fails with `Error::ObjectNotFound` when the object is absent.
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>>;

    fn list(&self) -> Result<Listing>;

    /// Missing objects are ignored.
    fn delete(&self, names: &[String]) -> Result<()>;

    fn copy(&self, src: &str, dst: &str) -> Result<()>;

    fn sub_folder(&self, path: &str) -> FolderRef;

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open(name)?.read_to_end(&mut data)?;
        Ok(data)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.create(name)?;
        writer.write_all(data)?;
        writer.commit()
    }
}

/// Every object below `folder`, named relative to it.
pub fn list_recursive(folder: &dyn Folder) -> Result<Vec<ObjectInfo>> {
    let mut out = Vec::new();
    let mut pending = vec![String::new()];
    while let Some(prefix) = pending.pop() {
        let listing = if prefix.is_empty() {
            folder.list()?
        } else {
            folder.sub_folder(&prefix).list()?
        };
        let join = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}/{name}")
            }
        };
        for object in listing.objects {
            out.push(ObjectInfo {
                name: join(&object.name),
                ..object
            });
        }
        pending.extend(listing.sub_folders.iter().map(|sub| join(sub)));
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Open `base` stored under any supported compression extension, decompressing it.
pub fn download_and_decompress(folder: &dyn Folder, base: &str) -> Result<Box<dyn Read + Send>> {
    for method in CompressionMethod::ALL {
        let name = method.object_name(base);
        if folder.exists(&name)? {
            let raw = folder.open(&name)?;
            return method.decompressor(raw);
        }
    }
    Err(Error::ObjectNotFound(format!("{}/{base}", folder.path())).into())
}

/// Name under which `base` is actually stored, if at all.
pub fn find_stored_name(folder: &dyn Folder, base: &str) -> Result<Option<String>> {
    for method in CompressionMethod::ALL {
        let name = method.object_name(base);
        if folder.exists(&name)? {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::ObjectNotFound(_)))
}

pub(crate) fn join_path(base: &str, name: &str) -> String {
    let name = name.trim_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{}/{name}", base.trim_end_matches('/'))
    }
}
