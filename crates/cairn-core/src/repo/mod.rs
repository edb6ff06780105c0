pub mod config;
pub mod find;
pub mod lock;
pub mod packer_manager;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::limiter::LimitedBackend;
use crate::backend::retry::{RetryBackend, RetryConfig, RetryReportFn, RetrySuccessFn};
use crate::backend::{Backend, FileType, Handle};
use crate::blob::{BlobHandle, BlobType, PackedBlob};
use crate::crypto::keyfile::{self, KdfParams};
use crate::crypto::MasterKey;
use crate::error::{CairnError, Result};
use crate::id::Id;
use crate::index::MasterIndex;
use crate::pack;
use crate::platform;

pub use self::config::Config;
pub use self::packer_manager::{CancelToken, PackerManager, DEFAULT_PACK_SIZE_MIB};

/// zstd level for blob compression in v2 repositories.
const BLOB_COMPRESSION_LEVEL: i32 = 3;

/// Tunables for opening a repository.
#[derive(Clone)]
pub struct RepositoryOptions {
    /// Target pack size in MiB (minimum 4).
    pub pack_size_mib: usize,
    pub retry: RetryConfig,
    /// Observation hooks for the retry wrapper.
    pub on_retry: Option<Arc<RetryReportFn>>,
    pub on_retry_success: Option<Arc<RetrySuccessFn>>,
    /// Bound on key files tried during open (0 = unlimited).
    pub max_keys: usize,
    /// Key file name to try first.
    pub key_hint: Option<String>,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            pack_size_mib: DEFAULT_PACK_SIZE_MIB,
            retry: RetryConfig::default(),
            on_retry: None,
            on_retry_success: None,
            max_keys: 0,
            key_hint: None,
        }
    }
}

/// A handle to an opened repository: backend (wrapped in connection limiting
/// and retry), master key, config, master index, and, once started, the
/// pack upload pipeline.
pub struct Repository {
    backend: Arc<dyn Backend>,
    key: Arc<MasterKey>,
    config: Config,
    index: Arc<MasterIndex>,
    packer: Option<PackerManager>,
    options: RepositoryOptions,
}

/// Apply the standard wrapper stack: connection limiter innermost, retry
/// outermost, so each retry attempt re-acquires a permit.
fn wrap_backend(raw: Arc<dyn Backend>, options: &RepositoryOptions) -> Arc<dyn Backend> {
    let limited: Arc<dyn Backend> = Arc::new(LimitedBackend::new(raw));
    let mut retry = RetryBackend::new(limited, options.retry.clone());
    if let (Some(report), Some(success)) = (&options.on_retry, &options.on_retry_success) {
        retry = retry.with_callbacks(Arc::clone(report), Arc::clone(success));
    }
    Arc::new(retry)
}

impl Repository {
    /// Initialize a fresh repository on `raw_backend`: generate a master key,
    /// wrap it under `passphrase`, and write the sealed config.
    pub fn init(
        raw_backend: Arc<dyn Backend>,
        passphrase: &str,
        version: u32,
        chunker_polynomial: u64,
        options: RepositoryOptions,
    ) -> Result<Repository> {
        let backend = wrap_backend(raw_backend, &options);

        match backend.stat(&Handle::config()) {
            Ok(_) => return Err(CairnError::RepoAlreadyExists),
            Err(e) if e.is_not_exist() => {}
            Err(e) => return Err(e),
        }

        let key = Arc::new(MasterKey::generate());
        keyfile::create_key(
            &backend,
            &key,
            passphrase,
            &platform::username(),
            &platform::hostname(),
            KdfParams::default(),
        )?;

        let config = Config::new(version, chunker_polynomial)?;
        let repo = Repository {
            backend,
            key,
            config,
            index: Arc::new(MasterIndex::new()),
            packer: None,
            options,
        };
        repo.store_config()?;
        debug!(id = %repo.config.id, version, "initialized repository");
        Ok(repo)
    }

    /// Open an existing repository: search the key files for one the
    /// passphrase unwraps, then load and validate the config. The master
    /// index is loaded separately via [`Repository::load_index`].
    pub fn open(
        raw_backend: Arc<dyn Backend>,
        passphrase: &str,
        options: RepositoryOptions,
    ) -> Result<Repository> {
        let backend = wrap_backend(raw_backend, &options);

        let (key_name, key) = keyfile::search_key(
            &backend,
            passphrase,
            options.max_keys,
            options.key_hint.as_deref(),
        )?;
        debug!("unlocked with key '{key_name}'");
        let key = Arc::new(key);

        let config = load_config(&backend, &key)?;
        Ok(Repository {
            backend,
            key,
            config,
            index: Arc::new(MasterIndex::new()),
            packer: None,
            options,
        })
    }

    /// Load every index file into the in-memory master index.
    pub fn load_index(&self) -> Result<()> {
        let loaded = MasterIndex::load(&self.backend, &self.key)?;
        self.index.adopt(loaded);
        Ok(())
    }

    /// Start the pack assembly and upload pipeline. Required before
    /// [`Repository::save_blob`]; the caller owns the cancellation token.
    pub fn start_pack_uploader(&mut self, cancel: CancelToken) {
        self.packer = Some(PackerManager::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.key),
            Arc::clone(&self.index),
            self.options.pack_size_mib,
            cancel,
        ));
    }

    /// Store one blob.
    ///
    /// Passing [`Id::NULL`]-like `None` computes the id from the plaintext.
    /// Returns `(id, known)`: when the blob already exists in the index and
    /// `allow_duplicate` is false, nothing is stored and `known` is true.
    /// With `allow_duplicate`, a second copy is stored (in a different pack,
    /// never twice within one).
    pub fn save_blob(
        &self,
        blob_type: BlobType,
        data: &[u8],
        id: Option<Id>,
        allow_duplicate: bool,
    ) -> Result<(Id, bool)> {
        let packer = self
            .packer
            .as_ref()
            .ok_or_else(|| CairnError::Other("pack uploader not started".into()))?;

        let id = match id {
            Some(id) if !id.is_null() => id,
            _ => Id::hash(data),
        };
        let handle = BlobHandle::new(blob_type, id);

        let known = self.index.has(&handle);
        if known && !allow_duplicate {
            return Ok((id, true));
        }
        if packer.contains_pending(&handle) {
            return Ok((id, true));
        }

        // Compress (v2 only, and only when it helps), then seal.
        let mut uncompressed_length = None;
        let mut payload = std::borrow::Cow::Borrowed(data);
        if self.config.compression_enabled() {
            let compressed = zstd::bulk::compress(data, BLOB_COMPRESSION_LEVEL)
                .map_err(|e| CairnError::Other(format!("zstd compress: {e}")))?;
            if compressed.len() < data.len() {
                uncompressed_length = Some(data.len() as u32);
                payload = std::borrow::Cow::Owned(compressed);
            }
        }
        let sealed = self.key.seal(&payload)?;

        let added = packer.add_blob(blob_type, id, &sealed, uncompressed_length)?;
        if !added {
            // Raced with another producer of the same blob.
            return Ok((id, true));
        }
        Ok((id, known))
    }

    /// Read one blob back, trying every indexed location before giving up.
    pub fn load_blob(&self, blob_type: BlobType, id: &Id) -> Result<Vec<u8>> {
        let candidates = self.index.lookup(&BlobHandle::new(blob_type, *id));
        if candidates.is_empty() {
            return Err(CairnError::BlobNotFound {
                blob_type,
                id: id.to_hex(),
            });
        }

        let mut last_err = None;
        for packed in &candidates {
            match self.load_packed_blob(packed, id) {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!(
                        pack = %packed.pack_id,
                        "blob {id} unreadable from one location: {e}"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("candidates was non-empty"))
    }

    /// Range-read, decrypt, decompress, and hash-verify one blob location.
    fn load_packed_blob(&self, packed: &PackedBlob, id: &Id) -> Result<Vec<u8>> {
        let handle = Handle::new(FileType::Pack, packed.pack_id.to_hex());
        let sealed = self
            .backend
            .load(&handle, packed.blob.length, packed.blob.offset as u64)?;
        let plain = self.key.open(&sealed)?;

        let plain = match packed.blob.uncompressed_length {
            Some(size) => zstd::bulk::decompress(&plain, size as usize)
                .map_err(|e| CairnError::Other(format!("zstd decompress: {e}")))?,
            None => plain,
        };

        let actual = Id::hash(&plain);
        if actual != *id {
            return Err(CairnError::HashMismatch {
                expected: id.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(plain)
    }

    /// Seal and store a whole file; its name is the hash of the sealed bytes
    /// (except config, which has a fixed name). Returns that hash.
    pub fn save_unpacked(&self, t: FileType, plaintext: &[u8]) -> Result<Id> {
        let sealed = self.key.seal(plaintext)?;
        let id = Id::hash(&sealed);
        let handle = if t == FileType::Config {
            Handle::config()
        } else {
            Handle::new(t, id.to_hex())
        };
        self.backend.save(&handle, &sealed)?;
        Ok(id)
    }

    /// Download and decrypt a whole file. For content-addressed types the
    /// stored bytes are verified against `id`; one mismatch triggers a single
    /// re-download (a truncated transfer heals, real corruption does not).
    pub fn load_unpacked(&self, t: FileType, id: &Id) -> Result<Vec<u8>> {
        let handle = if t == FileType::Config {
            Handle::config()
        } else {
            Handle::new(t, id.to_hex())
        };
        let verify = !matches!(t, FileType::Config | FileType::Key);

        let mut retried = false;
        loop {
            let data = self.backend.load(&handle, 0, 0)?;
            if verify {
                let actual = Id::hash(&data);
                if actual != *id {
                    if !retried {
                        warn!("{handle}: hash mismatch, retrying download");
                        retried = true;
                        continue;
                    }
                    return Err(CairnError::HashMismatch {
                        expected: id.to_hex(),
                        actual: actual.to_hex(),
                    });
                }
            }
            return self.key.open(&data);
        }
    }

    /// Names and sizes of all files of one type.
    pub fn list(&self, t: FileType) -> Result<Vec<(Id, u64)>> {
        let mut out = Vec::new();
        self.backend.list(t, &mut |info| {
            let id: Id = info.name.parse().map_err(|_| {
                CairnError::InvalidFormat(format!("{t:?} file '{}' has a non-ID name", info.name))
            })?;
            out.push((id, info.size));
            Ok(())
        })?;
        Ok(out)
    }

    /// The blobs of one pack, from its on-disk header.
    pub fn list_pack(&self, pack_id: &Id, pack_size: u64) -> Result<Vec<crate::blob::Blob>> {
        pack::read_header(&self.backend, pack_id, pack_size, &self.key)
    }

    /// Resolve an id prefix against the files of one type.
    pub fn find(&self, t: FileType, prefix: &str) -> Result<Id> {
        find::find(&self.backend, t, prefix)
    }

    /// Drain pending packs, wait for their uploads, and persist the new
    /// index entries. After a successful flush every accepted blob is
    /// readable and indexed.
    pub fn flush(&self) -> Result<()> {
        if let Some(packer) = &self.packer {
            packer.flush()?;
        }
        self.index.save_pending(&self.backend, &self.key)
    }

    /// Discard the in-memory index and reconstruct it by reading every pack
    /// header, then write fresh index files superseding all existing ones.
    pub fn rebuild_index(&self) -> Result<()> {
        let packs = self.list(FileType::Pack)?;
        let obsolete: HashSet<Id> = self.list(FileType::Index)?.into_iter().map(|(id, _)| id).collect();

        let rebuilt = MasterIndex::new();
        for (pack_id, size) in packs {
            let blobs = pack::read_header(&self.backend, &pack_id, size, &self.key)?;
            rebuilt.store_in_pack(pack_id, &blobs);
        }

        self.index.adopt(rebuilt);
        self.index
            .save_full(&self.backend, &self.key, &HashSet::new(), &obsolete)?;
        debug!(handles = self.index.len(), "rebuilt master index");
        Ok(())
    }

    /// Give the repository a fresh id, keeping everything else.
    ///
    /// The window between removing the old config and writing the new one
    /// must not be widened by cancellation checks: a repository without a
    /// config file is unreadable. This method runs straight through.
    pub fn change_repo_id(&mut self) -> Result<Id> {
        let new = Config {
            version: self.config.version,
            id: Id::random(),
            chunker_polynomial: self.config.chunker_polynomial,
        };
        self.backend.remove(&Handle::config())?;
        self.config = new;
        self.store_config()?;
        Ok(self.config.id)
    }

    fn store_config(&self) -> Result<()> {
        let encoded = serde_json::to_vec(&self.config)?;
        self.save_unpacked(FileType::Config, &encoded)?;
        Ok(())
    }

    // ----- Accessors -----

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn key(&self) -> &Arc<MasterKey> {
        &self.key
    }

    pub fn index(&self) -> &Arc<MasterIndex> {
        &self.index
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn connections(&self) -> usize {
        self.backend.connections()
    }
}

/// Read and validate the sealed config file.
fn load_config(backend: &Arc<dyn Backend>, key: &MasterKey) -> Result<Config> {
    let data = backend.load(&Handle::config(), 0, 0)?;
    let plain = key.open(&data)?;
    let config: Config = serde_json::from_slice(&plain)?;
    config.validate()?;
    Ok(config)
}

/// Forensic recovery: write a fresh config when the original is gone but the
/// keys (and packs) survive. Refuses to touch a repository whose config is
/// still readable; that refusal is a safety guard, never retried or wrapped.
pub fn recreate_config(
    raw_backend: Arc<dyn Backend>,
    passphrase: &str,
    version: u32,
    chunker_polynomial: u64,
) -> Result<Config> {
    let backend = wrap_backend(raw_backend, &RepositoryOptions::default());
    let (_, key) = keyfile::search_key(&backend, passphrase, 0, None)?;

    if load_config(&backend, &key).is_ok() {
        return Err(CairnError::Fatal(
            "refusing to recreate config: a valid config already exists".into(),
        ));
    }
    // A present-but-unreadable config still blocks the plain save path.
    let _ = backend.remove(&Handle::config());

    let config = Config::new(version, chunker_polynomial)?;
    let sealed = key.seal(&serde_json::to_vec(&config)?)?;
    backend.save(&Handle::config(), &sealed)?;
    warn!(id = %config.id, "wrote fresh repository config");
    Ok(config)
}
