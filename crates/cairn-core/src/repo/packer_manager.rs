use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::backend::{Backend, FileType, Handle};
use crate::blob::{BlobHandle, BlobType};
use crate::crypto::MasterKey;
use crate::error::{CairnError, Result};
use crate::id::Id;
use crate::index::MasterIndex;
use crate::pack::Packer;

/// Default target pack size.
pub const DEFAULT_PACK_SIZE_MIB: usize = 16;
/// Smallest allowed target pack size.
pub const MIN_PACK_SIZE_MIB: usize = 4;

/// Shared cancellation flag for a backup run. Workers check it before
/// appending blobs and before uploading packs; a cancelled run discards
/// in-flight packs, which is safe because nothing reaches the index until
/// its pack upload has succeeded.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Accepts sealed blobs from many producers, assembles bounded-size packs,
/// and uploads full packs on background threads.
///
/// Data and tree blobs fill separate packs: tree packs are small and hot,
/// and mixing them would spread tree blobs across large data packs. In-flight
/// uploads are bounded by the backend's connection count; producers block
/// only when that bound is reached. Index entries for a pack are published by
/// its upload thread, strictly after `Backend::save` succeeds.
pub struct PackerManager {
    backend: Arc<dyn Backend>,
    key: Arc<MasterKey>,
    index: Arc<MasterIndex>,
    target_size: usize,
    data_packer: Mutex<Packer>,
    tree_packer: Mutex<Packer>,
    uploads: Mutex<Vec<JoinHandle<Result<()>>>>,
    max_in_flight: usize,
    /// First upload error, kept as text; every later operation fails with it.
    latched: Mutex<Option<String>>,
    cancel: CancelToken,
}

impl PackerManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        key: Arc<MasterKey>,
        index: Arc<MasterIndex>,
        pack_size_mib: usize,
        cancel: CancelToken,
    ) -> Self {
        let target_size = pack_size_mib.max(MIN_PACK_SIZE_MIB) * 1024 * 1024;
        let max_in_flight = backend.connections().max(1);
        Self {
            data_packer: Mutex::new(Packer::new(Arc::clone(&key))),
            tree_packer: Mutex::new(Packer::new(Arc::clone(&key))),
            backend,
            key,
            index,
            target_size,
            uploads: Mutex::new(Vec::new()),
            max_in_flight,
            latched: Mutex::new(None),
            cancel,
        }
    }

    /// Whether a blob with this handle sits in a not-yet-detached pack.
    pub fn contains_pending(&self, handle: &BlobHandle) -> bool {
        self.data_packer.lock().unwrap().contains(handle)
            || self.tree_packer.lock().unwrap().contains(handle)
    }

    /// Append one sealed blob to the active pack of its type.
    ///
    /// Returns `false` when the same `(type, id)` is already pending in the
    /// active pack. The bytes are dropped, keeping the single-pack
    /// no-duplicates invariant. A pack reaching the target size is detached
    /// and handed to an upload thread; a fresh packer replaces it under the
    /// same lock.
    pub fn add_blob(
        &self,
        blob_type: BlobType,
        id: Id,
        sealed: &[u8],
        uncompressed_length: Option<u32>,
    ) -> Result<bool> {
        self.check()?;

        let packer_slot = match blob_type {
            BlobType::Data => &self.data_packer,
            BlobType::Tree => &self.tree_packer,
        };

        let full = {
            let mut packer = packer_slot.lock().unwrap();
            if packer.contains(&BlobHandle::new(blob_type, id)) {
                return Ok(false);
            }
            packer.add(blob_type, id, sealed, uncompressed_length)?;
            if packer.size() >= self.target_size {
                Some(std::mem::replace(
                    &mut *packer,
                    Packer::new(Arc::clone(&self.key)),
                ))
            } else {
                None
            }
        };

        if let Some(full) = full {
            self.spawn_upload(full)?;
        }
        Ok(true)
    }

    /// Drain active packers regardless of size and wait for every upload.
    /// Returns the first error encountered, if any.
    pub fn flush(&self) -> Result<()> {
        self.check()?;

        for packer_slot in [&self.data_packer, &self.tree_packer] {
            let partial = {
                let mut packer = packer_slot.lock().unwrap();
                if packer.is_empty() {
                    None
                } else {
                    Some(std::mem::replace(
                        &mut *packer,
                        Packer::new(Arc::clone(&self.key)),
                    ))
                }
            };
            if let Some(partial) = partial {
                self.spawn_upload(partial)?;
            }
        }

        self.wait_uploads()
    }

    /// Fail fast when cancelled or after a latched upload error.
    fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CairnError::Cancelled);
        }
        if let Some(msg) = self.latched.lock().unwrap().as_ref() {
            return Err(CairnError::UploadFailed(msg.clone()));
        }
        Ok(())
    }

    fn latch(&self, err: &CairnError) {
        let mut latched = self.latched.lock().unwrap();
        if latched.is_none() {
            *latched = Some(err.to_string());
        }
    }

    /// Finalize a detached pack and upload it on a background thread.
    fn spawn_upload(&self, packer: Packer) -> Result<()> {
        self.cap_uploads()?;

        let backend = Arc::clone(&self.backend);
        let index = Arc::clone(&self.index);
        let cancel = self.cancel.clone();

        let handle = std::thread::spawn(move || -> Result<()> {
            if cancel.is_cancelled() {
                debug!("discarding pack, run was cancelled");
                return Err(CairnError::Cancelled);
            }

            let finished = packer.finalize()?;
            let handle = Handle::new(FileType::Pack, finished.id.to_hex());
            backend.save(&handle, &finished.data)?;

            // Only now do the blobs become visible.
            index.store_in_pack(finished.id, &finished.blobs);
            debug!(
                pack = %finished.id,
                blobs = finished.blobs.len(),
                bytes = finished.data.len(),
                "uploaded pack"
            );
            Ok(())
        });

        self.uploads.lock().unwrap().push(handle);
        Ok(())
    }

    /// Join finished upload threads; when the in-flight bound is reached,
    /// block on one handle for backpressure.
    fn cap_uploads(&self) -> Result<()> {
        let mut handles = self.uploads.lock().unwrap();

        let mut i = 0;
        while i < handles.len() {
            if handles[i].is_finished() {
                let handle = handles.swap_remove(i);
                self.join_one(handle)?;
            } else {
                i += 1;
            }
        }

        if handles.len() >= self.max_in_flight {
            let handle = handles.remove(0);
            drop(handles);
            self.join_one(handle)?;
        }
        Ok(())
    }

    fn wait_uploads(&self) -> Result<()> {
        let handles: Vec<_> = self.uploads.lock().unwrap().drain(..).collect();
        let mut first_err: Option<CairnError> = None;
        for handle in handles {
            if let Err(e) = self.join_one(handle) {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    warn!("additional pack upload failure: {e}");
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn join_one(&self, handle: JoinHandle<Result<()>>) -> Result<()> {
        let res = handle
            .join()
            .map_err(|_| CairnError::Other("pack upload thread panicked".into()))
            .and_then(|r| r);
        if let Err(e) = &res {
            self.latch(e);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryBackend;

    fn manager(pack_size_mib: usize) -> (Arc<dyn Backend>, Arc<MasterIndex>, PackerManager) {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let key = Arc::new(MasterKey::generate());
        let index = Arc::new(MasterIndex::new());
        let mgr = PackerManager::new(
            Arc::clone(&backend),
            key,
            Arc::clone(&index),
            pack_size_mib,
            CancelToken::new(),
        );
        (backend, index, mgr)
    }

    fn count_packs(backend: &dyn Backend) -> usize {
        let mut n = 0;
        backend
            .list(FileType::Pack, &mut |_| {
                n += 1;
                Ok(())
            })
            .unwrap();
        n
    }

    #[test]
    fn nothing_visible_before_flush_of_small_pack() {
        let (backend, index, mgr) = manager(DEFAULT_PACK_SIZE_MIB);
        let key = MasterKey::generate();
        let sealed = key.seal(b"tiny").unwrap();
        let id = Id::hash(b"tiny");

        assert!(mgr.add_blob(BlobType::Data, id, &sealed, None).unwrap());
        assert_eq!(count_packs(&backend), 0);
        assert!(!index.has(&BlobHandle::new(BlobType::Data, id)));

        mgr.flush().unwrap();
        assert_eq!(count_packs(&backend), 1);
        assert!(index.has(&BlobHandle::new(BlobType::Data, id)));
    }

    #[test]
    fn pending_duplicate_is_dropped() {
        let (backend, index, mgr) = manager(DEFAULT_PACK_SIZE_MIB);
        let key = MasterKey::generate();
        let sealed = key.seal(b"dup").unwrap();
        let id = Id::hash(b"dup");

        assert!(mgr.add_blob(BlobType::Data, id, &sealed, None).unwrap());
        assert!(!mgr.add_blob(BlobType::Data, id, &sealed, None).unwrap());
        assert!(mgr.contains_pending(&BlobHandle::new(BlobType::Data, id)));

        mgr.flush().unwrap();
        assert_eq!(count_packs(&backend), 1);
        assert_eq!(index.lookup(&BlobHandle::new(BlobType::Data, id)).len(), 1);
    }

    #[test]
    fn data_and_tree_fill_separate_packs() {
        let (backend, _index, mgr) = manager(DEFAULT_PACK_SIZE_MIB);
        let key = MasterKey::generate();

        let sealed = key.seal(b"payload").unwrap();
        mgr.add_blob(BlobType::Data, Id::hash(b"payload"), &sealed, None)
            .unwrap();
        let sealed = key.seal(b"treedata").unwrap();
        mgr.add_blob(BlobType::Tree, Id::hash(b"treedata"), &sealed, None)
            .unwrap();

        mgr.flush().unwrap();
        assert_eq!(count_packs(&backend), 2);
    }

    #[test]
    fn cancelled_run_publishes_nothing() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let key = Arc::new(MasterKey::generate());
        let index = Arc::new(MasterIndex::new());
        let cancel = CancelToken::new();
        let mgr = PackerManager::new(
            Arc::clone(&backend),
            Arc::clone(&key),
            Arc::clone(&index),
            DEFAULT_PACK_SIZE_MIB,
            cancel.clone(),
        );

        let sealed = key.seal(b"doomed").unwrap();
        mgr.add_blob(BlobType::Data, Id::hash(b"doomed"), &sealed, None)
            .unwrap();

        cancel.cancel();
        assert!(matches!(mgr.flush(), Err(CairnError::Cancelled)));
        assert!(index.is_empty());
        assert_eq!(count_packs(&backend), 0);
    }

    #[test]
    fn upload_error_latches() {
        // Backend that rejects every save.
        struct Broken;
        impl Backend for Broken {
            fn save(&self, _h: &Handle, _d: &[u8]) -> Result<()> {
                Err(CairnError::Other("disk on fire".into()))
            }
            fn load(&self, h: &Handle, _l: u32, _o: u64) -> Result<Vec<u8>> {
                Err(CairnError::NotFound {
                    file_type: h.file_type,
                    name: h.name.clone(),
                })
            }
            fn stat(&self, h: &Handle) -> Result<crate::backend::FileInfo> {
                Err(CairnError::NotFound {
                    file_type: h.file_type,
                    name: h.name.clone(),
                })
            }
            fn list(
                &self,
                _t: FileType,
                _f: &mut dyn FnMut(crate::backend::FileInfo) -> Result<()>,
            ) -> Result<()> {
                Ok(())
            }
            fn remove(&self, _h: &Handle) -> Result<()> {
                Ok(())
            }
            fn has_atomic_replace(&self) -> bool {
                false
            }
        }

        let backend: Arc<dyn Backend> = Arc::new(Broken);
        let key = Arc::new(MasterKey::generate());
        let index = Arc::new(MasterIndex::new());
        let mgr = PackerManager::new(
            backend,
            Arc::clone(&key),
            Arc::clone(&index),
            DEFAULT_PACK_SIZE_MIB,
            CancelToken::new(),
        );

        let sealed = key.seal(b"x").unwrap();
        mgr.add_blob(BlobType::Data, Id::hash(b"x"), &sealed, None)
            .unwrap();
        assert!(mgr.flush().is_err());

        // The failure sticks: later operations fail without new uploads.
        let sealed = key.seal(b"y").unwrap();
        assert!(matches!(
            mgr.add_blob(BlobType::Data, Id::hash(b"y"), &sealed, None),
            Err(CairnError::UploadFailed(_))
        ));
        assert!(index.is_empty());
    }

    #[test]
    fn many_small_blobs_roll_over_into_multiple_packs() {
        // 4 MiB target; 300 KiB blobs force rollovers mid-stream.
        let (backend, index, mgr) = manager(MIN_PACK_SIZE_MIB);
        let key = MasterKey::generate();

        for i in 0..20u32 {
            let mut data = vec![0u8; 300 * 1024];
            // Cheap deterministic non-constant fill.
            for (j, byte) in data.iter_mut().enumerate() {
                *byte = (j as u32).wrapping_mul(2654435761).wrapping_add(i) as u8;
            }
            let sealed = key.seal(&data).unwrap();
            mgr.add_blob(BlobType::Data, Id::hash(&data), &sealed, None)
                .unwrap();
        }
        mgr.flush().unwrap();

        assert!(count_packs(&backend) >= 2, "expected at least two packs");
        assert_eq!(index.len(), 20);
    }
}
