use std::sync::{Arc, Condvar, Mutex};

use crate::backend::{Backend, ContentHasher, FileInfo, FileType, Handle};
use crate::error::Result;

/// Counting semaphore built on Mutex + Condvar.
struct Semaphore {
    available: Mutex<usize>,
    freed: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            available: Mutex::new(permits),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.freed.wait(available).unwrap();
        }
        *available -= 1;
        SemaphoreGuard { sem: self }
    }

    fn release(&self) {
        let mut available = self.available.lock().unwrap();
        *available += 1;
        self.freed.notify_one();
    }
}

struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

/// Caps concurrent backend operations to the backend's advertised connection
/// count. The permit is held for the full duration of each call; for `load`
/// that covers the whole transfer, since loads return owned buffers.
pub struct LimitedBackend {
    inner: Arc<dyn Backend>,
    sem: Semaphore,
    permits: usize,
}

impl LimitedBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        let permits = inner.connections().max(1);
        Self {
            inner,
            sem: Semaphore::new(permits),
            permits,
        }
    }
}

impl Backend for LimitedBackend {
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        let _permit = self.sem.acquire();
        self.inner.save(handle, data)
    }

    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        let _permit = self.sem.acquire();
        self.inner.load(handle, length, offset)
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        let _permit = self.sem.acquire();
        self.inner.stat(handle)
    }

    fn list(&self, t: FileType, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()> {
        // List is serial from the caller's perspective and not limited.
        self.inner.list(t, f)
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        let _permit = self.sem.acquire();
        self.inner.remove(handle)
    }

    fn delete(&self) -> Result<()> {
        self.inner.delete()
    }

    fn connections(&self) -> usize {
        self.permits
    }

    fn hasher(&self) -> Option<Box<dyn ContentHasher>> {
        self.inner.hasher()
    }

    fn has_atomic_replace(&self) -> bool {
        self.inner.has_atomic_replace()
    }
}
