use std::sync::Arc;

use crate::backend::{Backend, ContentHasher, FileInfo, FileType, Handle};
use crate::error::{CairnError, Result};
use crate::id::Id;

/// Resolve an id prefix against the files of one type.
///
/// Exactly one name starting with `prefix` must exist; zero matches yield
/// `NoIdWithPrefix`, two or more yield `MultipleIdMatches`.
pub fn find(backend: &dyn Backend, t: FileType, prefix: &str) -> Result<Id> {
    let mut matched: Option<Id> = None;
    let result = backend.list(t, &mut |info| {
        if info.name.starts_with(prefix) {
            let id: Id = info.name.parse()?;
            if matched.is_some() {
                return Err(CairnError::MultipleIdMatches(prefix.to_string()));
            }
            matched = Some(id);
        }
        Ok(())
    });

    match result {
        Ok(()) => matched.ok_or_else(|| CairnError::NoIdWithPrefix(prefix.to_string())),
        Err(e) => Err(e),
    }
}

/// Backend wrapper that caches one enumeration of a single file type, so
/// several consumers (check, prune, finders) don't re-list the same files.
/// Lists for other types pass through to the inner backend.
pub struct MemorizedBackend {
    inner: Arc<dyn Backend>,
    file_type: FileType,
    cached: Vec<FileInfo>,
}

impl MemorizedBackend {
    pub fn new(inner: Arc<dyn Backend>, file_type: FileType) -> Result<Self> {
        let mut cached = Vec::new();
        inner.list(file_type, &mut |info| {
            cached.push(info);
            Ok(())
        })?;
        Ok(Self {
            inner,
            file_type,
            cached,
        })
    }
}

impl Backend for MemorizedBackend {
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        self.inner.save(handle, data)
    }

    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        self.inner.load(handle, length, offset)
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        self.inner.stat(handle)
    }

    fn list(&self, t: FileType, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()> {
        if t != self.file_type {
            return self.inner.list(t, f);
        }
        for info in &self.cached {
            f(info.clone())?;
        }
        Ok(())
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        self.inner.remove(handle)
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
