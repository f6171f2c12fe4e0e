//! Small blocking primitives shared by the upload and extraction pools.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Counting semaphore bounding in-flight work.
pub struct Semaphore {
    available: Mutex<usize>,
    condvar: Condvar,
    capacity: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
            condvar: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take one permit, giving up once `cancel` fires. Returns whether a permit was taken.
    pub fn acquire(&self, cancel: &CancellationToken) -> bool {
        let mut available = self.available.lock();
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if *available > 0 {
                *available -= 1;
                return true;
            }
            // periodic wakeup so a cancellation is noticed without a notify
            self.condvar.wait_for(&mut available, Duration::from_millis(100));
        }
    }

    pub fn release(&self) {
        let mut available = self.available.lock();
        *available = (*available + 1).min(self.capacity);
        self.condvar.notify_all();
    }

    /// Block until every permit is back, i.e. all in-flight work is done.
    pub fn wait_idle(&self) {
        let mut available = self.available.lock();
        while *available < self.capacity {
            self.condvar.wait(&mut available);
        }
    }
}

/// Stops new work from being started. In-flight work always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
