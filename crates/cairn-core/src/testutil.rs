use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, FileInfo, FileType, Handle};
use crate::error::{CairnError, Result};
use crate::repo::{CancelToken, Repository, RepositoryOptions};

/// A known-good chunker polynomial for test repositories.
pub const TEST_POLY: u64 = 0x3DA3358B4DC173;

pub const TEST_PASSPHRASE: &str = "test-passphrase";

/// In-memory storage backend for testing. Thread-safe via Mutex.
pub struct MemoryBackend {
    data: Mutex<HashMap<(FileType, String), Vec<u8>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl Backend for MemoryBackend {
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        handle.valid()?;
        let mut map = self.data.lock().unwrap();
        let key = (handle.file_type, handle.name.clone());
        if map.contains_key(&key) {
            return Err(CairnError::InvalidFormat(format!(
                "refusing to overwrite existing file {handle}"
            )));
        }
        map.insert(key, data.to_vec());
        Ok(())
    }

    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        let map = self.data.lock().unwrap();
        let data = map
            .get(&(handle.file_type, handle.name.clone()))
            .ok_or_else(|| CairnError::NotFound {
                file_type: handle.file_type,
                name: handle.name.clone(),
            })?;

        let start = offset as usize;
        if length == 0 {
            if start > data.len() {
                return Err(CairnError::InvalidFormat(format!(
                    "offset {offset} past end of {handle}"
                )));
            }
            return Ok(data[start..].to_vec());
        }
        let end = start + length as usize;
        if end > data.len() {
            return Err(CairnError::InvalidFormat(format!(
                "range {start}..{end} past end of {handle} ({} bytes)",
                data.len()
            )));
        }
        Ok(data[start..end].to_vec())
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        let map = self.data.lock().unwrap();
        match map.get(&(handle.file_type, handle.name.clone())) {
            Some(data) => Ok(FileInfo {
                name: handle.name.clone(),
                size: data.len() as u64,
            }),
            None => Err(CairnError::NotFound {
                file_type: handle.file_type,
                name: handle.name.clone(),
            }),
        }
    }

    fn list(&self, t: FileType, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()> {
        let entries: Vec<FileInfo> = {
            let map = self.data.lock().unwrap();
            map.iter()
                .filter(|((file_type, _), _)| *file_type == t)
                .map(|((_, name), data)| FileInfo {
                    name: name.clone(),
                    size: data.len() as u64,
                })
                .collect()
        };
        for info in entries {
            f(info)?;
        }
        Ok(())
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(&(handle.file_type, handle.name.clone()));
        Ok(())
    }

    fn connections(&self) -> usize {
        4
    }

    fn has_atomic_replace(&self) -> bool {
        false
    }
}

/// Fast retry settings so transient-failure tests don't sleep for real.
pub fn fast_options() -> RepositoryOptions {
    let mut options = RepositoryOptions::default();
    options.retry.initial_delay = std::time::Duration::from_millis(1);
    options.retry.max_delay = std::time::Duration::from_millis(5);
    options.retry.max_elapsed = std::time::Duration::from_secs(5);
    options
}

/// Fresh v2 repository over a `MemoryBackend`, uploader started.
pub fn test_repo() -> Repository {
    test_repo_on(Arc::new(MemoryBackend::new()))
}

/// Fresh v2 repository over the given backend, uploader started.
pub fn test_repo_on(backend: Arc<dyn Backend>) -> Repository {
    let mut repo = Repository::init(backend, TEST_PASSPHRASE, 2, TEST_POLY, fast_options())
        .expect("failed to init test repo");
    repo.start_pack_uploader(CancelToken::new());
    repo
}
