//! Size-bounded containers and the queue handing them to pack workers.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tar::{Builder, EntryType, Header};
use tracing::{debug, info};

use crate::storage::uploader::CompressedObject;
use crate::storage::Uploader;
use crate::{Error, Result};

use super::walker::{EntryKind, WalkedEntry};

/// One container being written. The object is created on the first write,
/// so a container that never receives an entry leaves nothing behind.
pub struct TarBall {
    name: String,
    uploader: Uploader,
    builder: Option<Builder<CompressedObject>>,
    size: u64,
}

impl TarBall {
    pub fn new(name: impl Into<String>, uploader: Uploader) -> Self {
        Self {
            name: name.into(),
            uploader,
            builder: None,
            size: 0,
        }
    }

    /// Container name without the compression extension.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes of entry data appended so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.builder.is_none()
    }

    fn builder(&mut self) -> Result<&mut Builder<CompressedObject>> {
        if self.builder.is_none() {
            let object = self.uploader.start(&self.name)?;
            let mut builder = Builder::new(object);
            builder.mode(tar::HeaderMode::Complete);
            self.builder = Some(builder);
        }
        self.builder
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("tarball {} is not set up", self.name))
    }

    /// Append a directory or symlink entry.
    pub fn append_entry_header(&mut self, entry: &WalkedEntry) -> Result<()> {
        let mut header = entry_header(entry, 0);
        let builder = self.builder()?;
        match &entry.kind {
            EntryKind::Symlink(target) => builder.append_link(&mut header, &entry.name, target),
            _ => builder.append_data(&mut header, &entry.name, io::empty()),
        }
        .with_context(|| format!("writing tar header for {}", entry.name))
    }

    /// Append exactly `size` bytes of `reader` as a regular file. A reader that
    /// ends early is padded with zeros.
    pub fn append_file<R: Read>(&mut self, entry: &WalkedEntry, size: u64, reader: R) -> Result<u64> {
        let mut header = entry_header(entry, size);
        let mut sized = SizedReader::new(reader, size);
        self.builder()?
            .append_data(&mut header, &entry.name, &mut sized)
            .with_context(|| format!("packing {}", entry.name))?;
        if sized.produced != size {
            return Err(Error::TarSizeMismatch {
                path: entry.name.clone(),
                expected: size,
                actual: sized.produced,
            }
            .into());
        }
        if sized.padded > 0 {
            debug!(file = %entry.name, padded = sized.padded, "file shrank while packing");
        }
        self.size += size;
        Ok(size)
    }

    /// Append in-memory content as a regular file named `name`.
    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o600);
        header.set_size(data.len() as u64);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        self.builder()?
            .append_data(&mut header, name, data)
            .with_context(|| format!("packing {name}"))?;
        self.size += data.len() as u64;
        Ok(())
    }

    /// Finish the archive and commit the object. Returns the stored size.
    pub fn close(self) -> Result<u64> {
        let Some(builder) = self.builder else {
            return Ok(0);
        };
        let object = builder.into_inner().with_context(|| format!("finishing tarball {}", self.name))?;
        let compressed = object.finish()?;
        info!(tar = %self.name, size = self.size, compressed, "tarball_uploaded");
        Ok(compressed)
    }
}

fn entry_header(entry: &WalkedEntry, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(match entry.kind {
        EntryKind::Dir => EntryType::Directory,
        EntryKind::File => EntryType::Regular,
        EntryKind::Symlink(_) => EntryType::Symlink,
    });
    header.set_mode(entry.mode);
    header.set_size(size);
    header.set_mtime(entry.mtime.timestamp().max(0) as u64);
    header
}

struct SizedReader<R> {
    inner: R,
    remaining: u64,
    produced: u64,
    padded: u64,
    inner_done: bool,
}

impl<R: Read> SizedReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
            produced: 0,
            padded: 0,
            inner_done: false,
        }
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = if self.inner_done {
            0
        } else {
            self.inner.read(&mut buf[..want])?
        };
        let n = if n == 0 {
            self.inner_done = true;
            buf[..want].fill(0);
            self.padded += want as u64;
            want
        } else {
            n
        };
        self.remaining -= n as u64;
        self.produced += n as u64;
        Ok(n)
    }
}

/// Names containers `part_001.tar`, `part_002.tar`, ... in one folder.
pub struct TarBallMaker {
    uploader: Uploader,
    next: AtomicUsize,
}

impl TarBallMaker {
    pub fn new(uploader: Uploader) -> Self {
        Self {
            uploader,
            next: AtomicUsize::new(1),
        }
    }

    pub fn make(&self) -> TarBall {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        TarBall::new(format!("part_{n:03}.tar"), self.uploader.clone())
    }

    pub fn make_named(&self, name: &str) -> TarBall {
        TarBall::new(name, self.uploader.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TarBallQueueOptions {
    pub tar_size_threshold: u64,
    /// Containers open for packing at once.
    pub parallel_tarballs: usize,
    /// Full containers waiting to be committed before packing blocks.
    pub max_upload_queue: usize,
}

/// Hands open containers to pack workers and commits full ones on a
/// separate pool of upload threads.
pub struct TarBallQueue {
    maker: TarBallMaker,
    options: TarBallQueueOptions,
    to_fill_tx: Sender<TarBall>,
    to_fill_rx: Receiver<TarBall>,
    upload_tx: Mutex<Option<Sender<TarBall>>>,
    uploaders: Mutex<Vec<JoinHandle<Result<()>>>>,
    total_size: AtomicU64,
}

impl TarBallQueue {
    pub fn start(maker: TarBallMaker, options: TarBallQueueOptions) -> Self {
        let parallel = options.parallel_tarballs.max(1);
        let (to_fill_tx, to_fill_rx) = bounded(parallel);
        for _ in 0..parallel {
            // capacity equals the count, cannot block
            let _ = to_fill_tx.send(maker.make());
        }
        let (upload_tx, upload_rx) = bounded::<TarBall>(options.max_upload_queue.max(1));
        let uploaders = (0..parallel)
            .map(|_| {
                let rx = upload_rx.clone();
                thread::spawn(move || -> Result<()> {
                    for tarball in rx.iter() {
                        tarball.close()?;
                    }
                    Ok(())
                })
            })
            .collect();
        Self {
            maker,
            options,
            to_fill_tx,
            to_fill_rx,
            upload_tx: Mutex::new(Some(upload_tx)),
            uploaders: Mutex::new(uploaders),
            total_size: AtomicU64::new(0),
        }
    }

    pub fn deque(&self) -> Result<TarBall> {
        self.to_fill_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("tarball queue is closed"))
    }

    pub fn enqueue_back(&self, tarball: TarBall) -> Result<()> {
        self.to_fill_tx
            .send(tarball)
            .map_err(|_| anyhow::anyhow!("tarball queue is closed"))
    }

    pub fn check_size_and_enqueue_back(&self, tarball: TarBall) -> Result<()> {
        if tarball.size() > self.options.tar_size_threshold {
            return self.finish_tarball(tarball);
        }
        self.enqueue_back(tarball)
    }

    /// Send a full container to the upload pool and open a fresh one in its place.
    pub fn finish_tarball(&self, tarball: TarBall) -> Result<()> {
        self.total_size.fetch_add(tarball.size(), Ordering::Relaxed);
        {
            let upload_tx = self.upload_tx.lock();
            let tx = upload_tx
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("tarball queue is finished"))?;
            tx.send(tarball)
                .map_err(|_| anyhow::anyhow!("tarball upload workers stopped"))?;
        }
        self.enqueue_back(self.maker.make())
    }

    /// A container outside the packing rotation, closed by the caller.
    pub fn new_tarball(&self) -> TarBall {
        self.maker.make()
    }

    pub fn named_tarball(&self, name: &str) -> TarBall {
        self.maker.make_named(name)
    }

    pub fn close_tarball(&self, tarball: TarBall) -> Result<u64> {
        self.total_size.fetch_add(tarball.size(), Ordering::Relaxed);
        tarball.close()
    }

    /// Bytes of entry data in every container handed back so far.
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Close the containers still open and wait for every upload.
    pub fn finish_queue(&self) -> Result<()> {
        let mut first_error = None;
        for _ in 0..self.options.parallel_tarballs.max(1) {
            let tarball = self.deque()?;
            if tarball.is_empty() {
                continue;
            }
            if let Err(e) = self.close_tarball(tarball) {
                first_error.get_or_insert(e);
            }
        }
        self.upload_tx.lock().take();
        for handle in self.uploaders.lock().drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(anyhow::anyhow!("tarball upload worker panicked"));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
