use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::{FolderRef, ObjectWriter};
use crate::compression::CompressionMethod;
use crate::Result;

/// Counts bytes passing through a writer.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compressing writer into a pending object.
pub struct CompressedObject {
    name: String,
    writer: crate::compression::Compressor<CountingWriter<Box<dyn ObjectWriter>>>,
    uncompressed: u64,
    counters: Arc<UploadCounters>,
}

impl CompressedObject {
    /// Commit the object, returning its compressed size.
    pub fn finish(self) -> Result<u64> {
        let counting = self.writer.finish()?;
        let compressed = counting.count();
        counting.into_inner().commit()?;
        self.counters.record(self.uncompressed, compressed);
        debug!(object = %self.name, uncompressed = self.uncompressed, compressed, "object_uploaded");
        Ok(compressed)
    }
}

impl Write for CompressedObject {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.uncompressed += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Default)]
pub struct UploadCounters {
    uncompressed: AtomicU64,
    compressed: AtomicU64,
}

impl UploadCounters {
    fn record(&self, uncompressed: u64, compressed: u64) {
        self.uncompressed.fetch_add(uncompressed, Ordering::Relaxed);
        self.compressed.fetch_add(compressed, Ordering::Relaxed);
    }

    pub fn uncompressed(&self) -> u64 {
        self.uncompressed.load(Ordering::Relaxed)
    }

    pub fn compressed(&self) -> u64 {
        self.compressed.load(Ordering::Relaxed)
    }
}

/// Uploads compressed objects into one folder and tallies their sizes.
#[derive(Clone)]
pub struct Uploader {
    folder: FolderRef,
    compression: CompressionMethod,
    counters: Arc<UploadCounters>,
}

impl Uploader {
    pub fn new(folder: FolderRef, compression: CompressionMethod) -> Self {
        Self {
            folder,
            compression,
            counters: Arc::new(UploadCounters::default()),
        }
    }

    pub fn folder(&self) -> &FolderRef {
        &self.folder
    }

    pub fn compression(&self) -> CompressionMethod {
        self.compression
    }

    pub fn counters(&self) -> &UploadCounters {
        &self.counters
    }

    /// Uploader sharing this one's counters and compression, rooted elsewhere.
    pub fn with_folder(&self, folder: FolderRef) -> Self {
        Self {
            folder,
            compression: self.compression,
            counters: self.counters.clone(),
        }
    }

    /// Start a compressed object named `base` plus the compression extension.
    pub fn start(&self, base: &str) -> Result<CompressedObject> {
        let name = self.compression.object_name(base);
        let raw = self.folder.create(&name)?;
        Ok(CompressedObject {
            name,
            writer: self.compression.compressor(CountingWriter::new(raw))?,
            uncompressed: 0,
            counters: self.counters.clone(),
        })
    }

    pub fn upload<R: Read + ?Sized>(&self, base: &str, reader: &mut R) -> Result<u64> {
        let mut object = self.start(base)?;
        io::copy(reader, &mut object)?;
        object.finish()
    }

    /// Upload without compression, under exactly `name`.
    pub fn upload_raw(&self, name: &str, data: &[u8]) -> Result<()> {
        self.folder.put(name, data)?;
        self.counters.record(data.len() as u64, data.len() as u64);
        Ok(())
    }
}
