use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Backend, ContentHasher, FileInfo, FileType, Handle};
use crate::error::{CairnError, Result};

/// Invoked before each retry with the operation label, the error that caused
/// it, and the delay about to be slept.
pub type RetryReportFn = dyn Fn(&str, &CairnError, Duration) + Send + Sync;

/// Invoked once after an operation succeeds following at least one retry,
/// with the operation label and the number of retries it took.
pub type RetrySuccessFn = dyn Fn(&str, usize) + Send + Sync;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the (doubling) delay between retries.
    pub max_delay: Duration,
    /// Total wall-clock budget per operation, retries included.
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

/// Transparent retry wrapper over a backend.
///
/// Transient failures are retried with exponential backoff plus jitter until
/// the wall-clock budget is exhausted; permanent errors (invalid arguments,
/// decrypt failures, absent files) propagate immediately.
pub struct RetryBackend {
    inner: Arc<dyn Backend>,
    config: RetryConfig,
    report: Option<Arc<RetryReportFn>>,
    success: Option<Arc<RetrySuccessFn>>,
}

impl RetryBackend {
    pub fn new(inner: Arc<dyn Backend>, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            report: None,
            success: None,
        }
    }

    /// Install observation callbacks for retries and post-retry successes.
    pub fn with_callbacks(
        mut self,
        report: Arc<RetryReportFn>,
        success: Arc<RetrySuccessFn>,
    ) -> Self {
        self.report = Some(report);
        self.success = Some(success);
        self
    }

    fn retry<T>(&self, op: &str, f: impl Fn() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let mut delay = self.config.initial_delay;
        let mut retries = 0usize;

        loop {
            match f() {
                Ok(val) => {
                    if retries > 0 {
                        if let Some(success) = &self.success {
                            success(op, retries);
                        }
                    }
                    return Ok(val);
                }
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    if started.elapsed() + delay > self.config.max_elapsed {
                        return Err(e);
                    }
                    let jitter =
                        Duration::from_millis(rand::random::<u64>() % delay.as_millis().max(1) as u64);
                    let sleep = delay + jitter;
                    tracing::warn!("{op}: transient error, retrying in {sleep:?}: {e}");
                    if let Some(report) = &self.report {
                        report(op, &e, sleep);
                    }
                    std::thread::sleep(sleep);
                    delay = (delay * 2).min(self.config.max_delay);
                    retries += 1;
                }
            }
        }
    }
}

impl Backend for RetryBackend {
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        handle.valid()?;
        self.retry(&format!("save {handle}"), || self.inner.save(handle, data))
    }

    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        handle.valid()?;
        self.retry(&format!("load {handle}"), || {
            self.inner.load(handle, length, offset)
        })
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        handle.valid()?;
        self.retry(&format!("stat {handle}"), || self.inner.stat(handle))
    }

    fn list(&self, t: FileType, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()> {
        // The callback may be stateful, so a partial enumeration cannot be
        // transparently restarted. List is not retried.
        self.inner.list(t, f)
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        handle.valid()?;
        self.retry(&format!("remove {handle}"), || self.inner.remove(handle))
    }

    fn delete(&self) -> Result<()> {
        self.inner.delete()
    }

    fn connections(&self) -> usize {
        self.inner.connections()
    }

    fn hasher(&self) -> Option<Box<dyn ContentHasher>> {
        self.inner.hasher()
    }

    fn has_atomic_replace(&self) -> bool {
        self.inner.has_atomic_replace()
    }
}
