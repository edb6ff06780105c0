use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::backend::{Backend, FileInfo, FileType, Handle};
use crate::error::{CairnError, Result};

/// Filesystem backend rooted at a repository directory, using `std::fs`
/// directly. Pack files are sharded into `data/<first-two-hex-chars>/`.
pub struct LocalBackend {
    root: PathBuf,
    connections: usize,
}

/// Default advisory concurrency for local disks.
const LOCAL_CONNECTIONS: usize = 2;

impl LocalBackend {
    /// Open a backend over an existing repository directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            connections: LOCAL_CONNECTIONS,
        })
    }

    /// Create the repository directory structure and return the backend.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let backend = Self::open(root)?;
        fs::create_dir_all(&backend.root)?;
        for t in FileType::ALL {
            if !t.dirname().is_empty() {
                fs::create_dir_all(backend.root.join(t.dirname()))?;
            }
        }
        Ok(backend)
    }

    /// Resolve a handle to its on-disk path.
    fn path(&self, handle: &Handle) -> PathBuf {
        match handle.file_type {
            FileType::Config => self.root.join("config"),
            FileType::Pack => self
                .root
                .join("data")
                .join(&handle.name[..2.min(handle.name.len())])
                .join(&handle.name),
            t => self.root.join(t.dirname()).join(&handle.name),
        }
    }

    fn not_found(handle: &Handle) -> CairnError {
        CairnError::NotFound {
            file_type: handle.file_type,
            name: handle.name.clone(),
        }
    }
}

impl Backend for LocalBackend {
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        handle.valid()?;
        let path = self.path(handle);
        if path.exists() {
            return Err(CairnError::InvalidFormat(format!(
                "refusing to overwrite existing file {handle}"
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a temp file in the target directory, then rename into
        // place so a crash never leaves a half-written repository file.
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        handle.valid()?;
        let path = self.path(handle);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Self::not_found(handle))
            }
            Err(e) => return Err(e.into()),
        };

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }

        if length == 0 {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            return Ok(buf);
        }

        let mut buf = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(CairnError::InvalidFormat(format!(
                        "short read from {handle}: wanted {length} bytes at offset {offset}, got {filled}"
                    )))
                }
                Ok(n) => filled += n,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        handle.valid()?;
        let path = self.path(handle);
        match fs::metadata(&path) {
            Ok(meta) => Ok(FileInfo {
                name: handle.name.clone(),
                size: meta.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Self::not_found(handle)),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, t: FileType, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()> {
        if t == FileType::Config {
            if let Ok(meta) = fs::metadata(self.root.join("config")) {
                f(FileInfo {
                    name: "config".into(),
                    size: meta.len(),
                })?;
            }
            return Ok(());
        }

        let dir = self.root.join(t.dirname());
        if !dir.exists() {
            return Ok(());
        }

        if t == FileType::Pack {
            // Two-level sharding: data/<2hex>/<name>
            for shard in read_dir_sorted(&dir)? {
                if shard.path().is_dir() {
                    list_files(&shard.path(), f)?;
                }
            }
            return Ok(());
        }

        list_files(&dir, f)
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        handle.valid()?;
        match fs::remove_file(self.path(handle)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn connections(&self) -> usize {
        self.connections
    }

    fn has_atomic_replace(&self) -> bool {
        true
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

fn list_files(dir: &Path, f: &mut dyn FnMut(FileInfo) -> Result<()>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            f(FileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
            })?;
        }
    }
    Ok(())
}
