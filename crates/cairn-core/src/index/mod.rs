use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Backend, FileType, Handle};
use crate::blob::{Blob, BlobHandle, BlobType, PackedBlob};
use crate::crypto::MasterKey;
use crate::error::{CairnError, Result};
use crate::id::Id;

/// Rough cap on blob entries per serialized index file, keeping each file
/// around the 16 MiB target once hex ids and JSON framing are counted.
const MAX_BLOBS_PER_INDEX_FILE: usize = 100_000;

/// One blob's location. The handle is the map key, so only the pack
/// coordinates are stored per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
    pack_id: Id,
    offset: u32,
    length: u32,
    uncompressed_length: Option<u32>,
}

fn to_packed(handle: &BlobHandle, loc: &Location) -> PackedBlob {
    PackedBlob {
        pack_id: loc.pack_id,
        blob: Blob {
            blob_type: handle.blob_type,
            id: handle.id,
            offset: loc.offset,
            length: loc.length,
            uncompressed_length: loc.uncompressed_length,
        },
    }
}

#[derive(Default)]
struct Inner {
    /// Entries loaded from index files at open (immutable shards).
    persisted: HashMap<BlobHandle, Vec<Location>>,
    /// Entries published since open, not yet written to an index file.
    pending: HashMap<BlobHandle, Vec<Location>>,
    /// Ids of the index files whose contents sit in `persisted`. A full save
    /// supersedes (and deletes) these.
    loaded_ids: Vec<Id>,
}

impl Inner {
    fn locations<'a>(&'a self, handle: &BlobHandle) -> impl Iterator<Item = &'a Location> {
        self.persisted
            .get(handle)
            .into_iter()
            .flatten()
            .chain(self.pending.get(handle).into_iter().flatten())
    }
}

/// The master index: a multimap `BlobHandle -> {pack locations}`.
///
/// Reads vastly outnumber writes (lookups happen per saved blob, writes only
/// when a pack upload completes), so the whole structure sits behind one
/// `RwLock`. Entries split into an immutable persisted part (merged from
/// index files at open) and a pending part (published by the uploader), so a
/// flush serializes only what is new. Duplicate locations for a handle are
/// expected (retries, concurrent backups) and harmless.
pub struct MasterIndex {
    inner: RwLock<Inner>,
}

/// Wire form of one pack's entry in an index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPack {
    pub id: Id,
    pub blobs: Vec<Blob>,
}

/// Index file wire format (v2). The tolerant reader also accepts the v1
/// layout, a bare top-level array of pack entries.
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    supersedes: Vec<Id>,
    packs: Vec<IndexPack>,
}

impl Default for MasterIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn has(&self, handle: &BlobHandle) -> bool {
        let inner = self.inner.read().unwrap();
        inner.persisted.contains_key(handle) || inner.pending.contains_key(handle)
    }

    /// All known locations for a handle. Possibly more than one; callers pick
    /// any and fall back to the others on corruption.
    pub fn lookup(&self, handle: &BlobHandle) -> Vec<PackedBlob> {
        let inner = self.inner.read().unwrap();
        inner.locations(handle).map(|l| to_packed(handle, l)).collect()
    }

    /// Plaintext size of a blob, when known.
    pub fn lookup_blob_size(&self, id: &Id, blob_type: BlobType) -> Option<u32> {
        self.lookup(&BlobHandle::new(blob_type, *id))
            .first()
            .map(|pb| pb.blob.data_length())
    }

    /// Publish the blobs of a freshly uploaded pack. Called only by the
    /// uploader, after `Backend::save` succeeded.
    pub fn store_in_pack(&self, pack_id: Id, blobs: &[Blob]) {
        let mut inner = self.inner.write().unwrap();
        for blob in blobs {
            inner.pending.entry(blob.handle()).or_default().push(Location {
                pack_id,
                offset: blob.offset,
                length: blob.length,
                uncompressed_length: blob.uncompressed_length,
            });
        }
    }

    /// Visit every `PackedBlob`. Holds the read lock for the whole sweep, so
    /// structural changes block until it finishes.
    pub fn each(&self, mut f: impl FnMut(&PackedBlob)) {
        let inner = self.inner.read().unwrap();
        for shard in [&inner.persisted, &inner.pending] {
            for (handle, locations) in shard {
                for loc in locations {
                    f(&to_packed(handle, loc));
                }
            }
        }
    }

    /// Group entries by pack, optionally restricted to `packs`.
    pub fn list_packs(&self, packs: Option<&HashSet<Id>>) -> Vec<IndexPack> {
        let mut grouped: HashMap<Id, Vec<Blob>> = HashMap::new();
        self.each(|pb| {
            if packs.map_or(true, |set| set.contains(&pb.pack_id)) {
                grouped.entry(pb.pack_id).or_default().push(pb.blob);
            }
        });
        let mut out: Vec<IndexPack> = grouped
            .into_iter()
            .map(|(id, mut blobs)| {
                blobs.sort_by_key(|b| b.offset);
                IndexPack { id, blobs }
            })
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }

    /// Number of distinct blob handles.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        let pending_only = inner
            .pending
            .keys()
            .filter(|h| !inner.persisted.contains_key(*h))
            .count();
        inner.persisted.len() + pending_only
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.persisted.is_empty() && inner.pending.is_empty()
    }

    /// Ids of the index files currently backing the persisted entries.
    pub fn loaded_ids(&self) -> Vec<Id> {
        self.inner.read().unwrap().loaded_ids.clone()
    }

    /// Merge one decoded index file into the persisted shard.
    fn merge_file(&self, id: Id, file: IndexFile) {
        let mut inner = self.inner.write().unwrap();
        for pack in file.packs {
            for blob in pack.blobs {
                inner
                    .persisted
                    .entry(blob.handle())
                    .or_default()
                    .push(Location {
                        pack_id: pack.id,
                        offset: blob.offset,
                        length: blob.length,
                        uncompressed_length: blob.uncompressed_length,
                    });
            }
        }
        inner.loaded_ids.push(id);
    }

    /// Replace the whole in-memory state with `other`'s. Used when (re)loading
    /// the index from storage and by the rebuild path, where `other` holds
    /// everything in its pending shard so the next full save writes it all.
    pub fn adopt(&self, other: MasterIndex) {
        let mut inner = self.inner.write().unwrap();
        *inner = other.inner.into_inner().unwrap();
    }

    /// Load all index files from the backend in parallel and merge them.
    pub fn load(backend: &Arc<dyn Backend>, key: &Arc<MasterKey>) -> Result<MasterIndex> {
        let mut names = Vec::new();
        backend.list(FileType::Index, &mut |info| {
            names.push(info.name);
            Ok(())
        })?;

        let index = MasterIndex::new();
        if names.is_empty() {
            return Ok(index);
        }

        let workers = backend.connections().clamp(1, names.len());
        let (name_tx, name_rx) = crossbeam_channel::unbounded::<String>();
        for name in names {
            name_tx.send(name).expect("unbounded send");
        }
        drop(name_tx);

        let (res_tx, res_rx) = crossbeam_channel::unbounded::<Result<(Id, IndexFile)>>();
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let name_rx = name_rx.clone();
                let res_tx = res_tx.clone();
                let backend = Arc::clone(backend);
                let key = Arc::clone(key);
                scope.spawn(move || {
                    for name in name_rx {
                        let res = load_index_file(&backend, &key, &name);
                        if res_tx.send(res).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(res_tx);

            let mut first_err = None;
            for res in res_rx {
                match res {
                    Ok((id, file)) => index.merge_file(id, file),
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })?;

        debug!(
            files = index.loaded_ids().len(),
            handles = index.len(),
            "loaded master index"
        );
        Ok(index)
    }

    /// Serialize only the pending entries to new index files and upload them.
    /// Nothing is superseded; this is the cheap end-of-backup flush. On
    /// success the pending entries move into the persisted shard.
    pub fn save_pending(&self, backend: &dyn Backend, key: &MasterKey) -> Result<()> {
        let pending_packs = {
            let inner = self.inner.read().unwrap();
            if inner.pending.is_empty() {
                return Ok(());
            }
            group_by_pack(&inner.pending)
        };

        let new_ids = write_index_files(backend, key, pending_packs, &[])?;

        let mut inner = self.inner.write().unwrap();
        let pending = std::mem::take(&mut inner.pending);
        for (handle, locations) in pending {
            inner.persisted.entry(handle).or_default().extend(locations);
        }
        inner.loaded_ids.extend(new_ids);
        Ok(())
    }

    /// Serialize every entry to fresh index files, superseding all files the
    /// in-memory state came from plus `extra_obsolete`, and delete the
    /// superseded files. Entries for packs in `exclude_packs` are dropped;
    /// prune uses this to forget packs it is rewriting.
    ///
    /// Returns the set of index file ids that were obsoleted.
    pub fn save_full(
        &self,
        backend: &dyn Backend,
        key: &MasterKey,
        exclude_packs: &HashSet<Id>,
        extra_obsolete: &HashSet<Id>,
    ) -> Result<HashSet<Id>> {
        let mut obsolete: HashSet<Id> = self.loaded_ids().into_iter().collect();
        obsolete.extend(extra_obsolete.iter().copied());
        let mut supersedes: Vec<Id> = obsolete.iter().copied().collect();
        supersedes.sort();

        let packs: Vec<IndexPack> = self
            .list_packs(None)
            .into_iter()
            .filter(|pack| !exclude_packs.contains(&pack.id))
            .collect();

        let new_ids = write_index_files(backend, key, packs, &supersedes)?;

        for id in &obsolete {
            backend.remove(&Handle::new(FileType::Index, id.to_hex()))?;
        }

        let mut inner = self.inner.write().unwrap();
        let pending = std::mem::take(&mut inner.pending);
        for (handle, locations) in pending {
            inner.persisted.entry(handle).or_default().extend(locations);
        }
        inner.loaded_ids = new_ids;
        Ok(obsolete)
    }
}

fn group_by_pack(entries: &HashMap<BlobHandle, Vec<Location>>) -> Vec<IndexPack> {
    let mut grouped: HashMap<Id, Vec<Blob>> = HashMap::new();
    for (handle, locations) in entries {
        for loc in locations {
            grouped
                .entry(loc.pack_id)
                .or_default()
                .push(to_packed(handle, loc).blob);
        }
    }
    let mut out: Vec<IndexPack> = grouped
        .into_iter()
        .map(|(id, mut blobs)| {
            blobs.sort_by_key(|b| b.offset);
            IndexPack { id, blobs }
        })
        .collect();
    out.sort_by_key(|p| p.id);
    out
}

/// Seal and upload index files of bounded size. Returns the new file ids.
fn write_index_files(
    backend: &dyn Backend,
    key: &MasterKey,
    packs: Vec<IndexPack>,
    supersedes: &[Id],
) -> Result<Vec<Id>> {
    let mut files: Vec<Vec<IndexPack>> = Vec::new();
    let mut current: Vec<IndexPack> = Vec::new();
    let mut current_blobs = 0usize;
    for pack in packs {
        if current_blobs + pack.blobs.len() > MAX_BLOBS_PER_INDEX_FILE && !current.is_empty() {
            files.push(std::mem::take(&mut current));
            current_blobs = 0;
        }
        current_blobs += pack.blobs.len();
        current.push(pack);
    }
    if !current.is_empty() || files.is_empty() {
        files.push(current);
    }

    let mut new_ids = Vec::with_capacity(files.len());
    for packs in files {
        let file = IndexFile {
            supersedes: supersedes.to_vec(),
            packs,
        };
        let encoded = serde_json::to_vec(&file)?;
        let sealed = key.seal(&encoded)?;
        let id = Id::hash(&sealed);
        backend.save(&Handle::new(FileType::Index, id.to_hex()), &sealed)?;
        new_ids.push(id);
    }
    Ok(new_ids)
}

/// Load, verify, decrypt, and decode one index file.
fn load_index_file(backend: &dyn Backend, key: &MasterKey, name: &str) -> Result<(Id, IndexFile)> {
    let id: Id = name
        .parse()
        .map_err(|_| CairnError::InvalidFormat(format!("index file '{name}' has a non-ID name")))?;
    let data = backend.load(&Handle::new(FileType::Index, name.to_string()), 0, 0)?;

    let actual = Id::hash(&data);
    if actual != id {
        return Err(CairnError::HashMismatch {
            expected: id.to_hex(),
            actual: actual.to_hex(),
        });
    }

    let plain = key.open(&data)?;
    let file = decode_index(&plain)?;
    Ok((id, file))
}

/// Decode an index document, accepting both the v2 object form and the v1
/// bare-array form.
fn decode_index(plain: &[u8]) -> Result<IndexFile> {
    match serde_json::from_slice::<IndexFile>(plain) {
        Ok(file) => Ok(file),
        Err(v2_err) => match serde_json::from_slice::<Vec<IndexPack>>(plain) {
            Ok(packs) => Ok(IndexFile {
                supersedes: Vec::new(),
                packs,
            }),
            Err(_) => Err(v2_err.into()),
        },
    }
}
