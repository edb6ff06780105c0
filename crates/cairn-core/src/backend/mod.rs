pub mod limiter;
pub mod local;
pub mod retry;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

/// The kinds of files a repository stores. Everything a backend holds is one
/// of these; the on-disk layout is backend-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pack,
    Index,
    Snapshot,
    Key,
    Lock,
    Config,
}

impl FileType {
    /// All file types, in the order `delete` sweeps them.
    pub const ALL: [FileType; 6] = [
        FileType::Pack,
        FileType::Index,
        FileType::Snapshot,
        FileType::Key,
        FileType::Lock,
        FileType::Config,
    ];

    /// Directory name under the repository root (empty for the config file).
    pub fn dirname(&self) -> &'static str {
        match self {
            FileType::Pack => "data",
            FileType::Index => "index",
            FileType::Snapshot => "snapshots",
            FileType::Key => "keys",
            FileType::Lock => "locks",
            FileType::Config => "",
        }
    }
}

/// Addresses one file in a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Self {
            file_type,
            name: name.into(),
        }
    }

    /// The singleton config file has a fixed name.
    pub fn config() -> Self {
        Self::new(FileType::Config, "config")
    }

    /// Reject handles that cannot address a file. Invalid handles are
    /// permanent errors, never retried.
    pub fn valid(&self) -> Result<()> {
        if self.file_type == FileType::Config {
            return Ok(());
        }
        if self.name.is_empty() {
            return Err(CairnError::InvalidHandle(format!(
                "empty name for {:?} file",
                self.file_type
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{:?}/{}>", self.file_type, self.name)
    }
}

/// Metadata for one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Incremental content hasher some backends need for upload integrity checks
/// (e.g. MD5 for Swift-like stores). Backends that verify nothing return
/// `None` from [`Backend::hasher`].
pub trait ContentHasher: Send {
    fn update(&mut self, data: &[u8]);
    fn finish(self: Box<Self>) -> Vec<u8>;
}

/// A flat namespace of typed files: the only contract the repository core
/// has with its storage.
///
/// All operations are synchronous and callable from many threads; wrappers
/// (retry, connection limiting) compose by embedding an inner backend.
pub trait Backend: Send + Sync {
    /// Durably store `data` under `handle`. Backends must refuse to overwrite
    /// an existing file; repository files are immutable once written.
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()>;

    /// Read `length` bytes at `offset`. `length == 0` means "to the end".
    /// A ranged read past the end of the file is an error, not a short read.
    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>>;

    /// Return name and size, failing with a `NotFound` error for absent files.
    fn stat(&self, handle: &Handle) -> Result<FileInfo>;

    /// Enumerate files of one type in unspecified order. An error from the
    /// callback stops the enumeration and propagates.
    fn list(&self, t: FileType, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()>;

    /// Delete one file. Removing an absent file is not an error.
    fn remove(&self, handle: &Handle) -> Result<()>;

    /// Remove every known typed file. The first per-type error is surfaced.
    fn delete(&self) -> Result<()> {
        let mut first_err: Option<CairnError> = None;
        for t in FileType::ALL {
            let mut names = Vec::new();
            let res = self.list(t, &mut |info| {
                names.push(info.name);
                Ok(())
            });
            if let Err(e) = res {
                first_err.get_or_insert(e);
                continue;
            }
            for name in names {
                if let Err(e) = self.remove(&Handle::new(t, name)) {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Advisory cap on concurrent operations against this backend.
    fn connections(&self) -> usize {
        5
    }

    /// Optional content hasher for backend-side upload integrity.
    fn hasher(&self) -> Option<Box<dyn ContentHasher>> {
        None
    }

    /// Whether `save` over an existing name replaces it atomically.
    fn has_atomic_replace(&self) -> bool;
}

// Wrappers hold an `Arc<dyn Backend>`; let it be used as a backend directly.
impl Backend for Arc<dyn Backend> {
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        (**self).save(handle, data)
    }
    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        (**self).load(handle, length, offset)
    }
    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        (**self).stat(handle)
    }
    fn list(&self, t: FileType, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()> {
        (**self).list(t, f)
    }
    fn remove(&self, handle: &Handle) -> Result<()> {
        (**self).remove(handle)
    }
    fn delete(&self) -> Result<()> {
        (**self).delete()
    }
    fn connections(&self) -> usize {
        (**self).connections()
    }
    fn hasher(&self) -> Option<Box<dyn ContentHasher>> {
        (**self).hasher()
    }
    fn has_atomic_replace(&self) -> bool {
        (**self).has_atomic_replace()
    }
}
