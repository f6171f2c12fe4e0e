use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{join_path, Folder, FolderRef, Listing, ObjectInfo, ObjectWriter};
use crate::{Error, Result};

const TEMP_PREFIX: &str = ".tmp-";

/// Folder backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsFolder {
    root: PathBuf,
    rel: String,
}

impl FsFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rel: String::new(),
        }
    }

    fn dir(&self) -> PathBuf {
        self.root.join(&self.rel)
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.dir().join(name.trim_start_matches('/'))
    }
}

struct FsObjectWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: BufWriter<File>,
}

impl Write for FsObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl ObjectWriter for FsObjectWriter {
    fn commit(self: Box<Self>) -> Result<()> {
        let Self {
            temp_path,
            final_path,
            file,
        } = *self;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }
}

fn modified_at(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_default()
}

impl Folder for FsFolder {
    fn path(&self) -> String {
        self.rel.clone()
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.object_path(name).is_file())
    }

    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        match File::open(self.object_path(name)) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(join_path(&self.rel, name)).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>> {
        let final_path = self.object_path(name);
        let parent = final_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        fs::create_dir_all(&parent)?;
        let temp_path = parent.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let file = File::create(&temp_path)?;
        Ok(Box::new(FsObjectWriter {
            temp_path,
            final_path,
            file: BufWriter::new(file),
        }))
    }

    fn list(&self) -> Result<Listing> {
        let mut listing = Listing::default();
        let entries = match fs::read_dir(self.dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_dir() {
                listing.sub_folders.push(name);
            } else {
                listing.objects.push(ObjectInfo {
                    name,
                    size: meta.len(),
                    last_modified: modified_at(&meta),
                });
            }
        }
        listing.objects.sort_by(|a, b| a.name.cmp(&b.name));
        listing.sub_folders.sort();
        Ok(listing)
    }

    fn delete(&self, names: &[String]) -> Result<()> {
        for name in names {
            let path = self.object_path(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            // drop empty directories left behind by nested names
            let mut dir = path.parent().map(Path::to_path_buf);
            while let Some(current) = dir {
                if current == self.dir() || fs::remove_dir(&current).is_err() {
                    break;
                }
                dir = current.parent().map(Path::to_path_buf);
            }
        }
        Ok(())
    }

    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let mut reader = self.open(src)?;
        let mut writer = self.create(dst)?;
        if let Err(e) = io::copy(&mut reader, &mut writer) {
            warn!(src = %src, dst = %dst, error = %e, "object_copy_failed");
            return Err(e.into());
        }
        writer.commit()
    }

    fn sub_folder(&self, path: &str) -> FolderRef {
        Arc::new(Self {
            root: self.root.clone(),
            rel: join_path(&self.rel, path),
        })
    }
}
