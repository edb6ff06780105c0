use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::FileType;
use crate::error::{CairnError, Result};
use crate::id::Id;
use crate::platform;
use crate::repo::Repository;

/// The state of a set of source paths at one point in time: a pointer to the
/// root tree plus bookkeeping metadata. Stored as a sealed file in
/// `snapshots/`; the content is opaque to the storage core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    pub tree: Id,
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "u32_is_zero")]
    pub uid: u32,
    #[serde(default, skip_serializing_if = "u32_is_zero")]
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn u32_is_zero(v: &u32) -> bool {
    *v == 0
}

impl Snapshot {
    /// New snapshot for the current user, host, and time.
    pub fn new(tree: Id, paths: Vec<String>, tags: Vec<String>) -> Self {
        Self {
            time: Utc::now(),
            parent: None,
            tree,
            paths,
            hostname: platform::hostname(),
            username: platform::username(),
            uid: platform::uid(),
            gid: platform::gid(),
            excludes: Vec::new(),
            tags,
        }
    }
}

pub fn save_snapshot(repo: &Repository, snapshot: &Snapshot) -> Result<Id> {
    repo.save_unpacked(FileType::Snapshot, &serde_json::to_vec(snapshot)?)
}

pub fn load_snapshot(repo: &Repository, id: &Id) -> Result<Snapshot> {
    let data = repo.load_unpacked(FileType::Snapshot, id)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Load all snapshots in parallel and call `f` for each, skipping
/// `exclude_ids`. The callback is serialized under a mutex; its first error
/// stops the sweep and is returned.
pub fn for_all_snapshots<F>(repo: &Repository, exclude_ids: &HashSet<Id>, f: F) -> Result<()>
where
    F: FnMut(Id, Result<Snapshot>) -> Result<()> + Send,
{
    let ids: Vec<Id> = repo
        .list(FileType::Snapshot)?
        .into_iter()
        .map(|(id, _)| id)
        .filter(|id| !exclude_ids.contains(id))
        .collect();
    if ids.is_empty() {
        return Ok(());
    }

    // Decoding is nearly free next to the download, so size the pool to I/O.
    let workers = repo.connections().clamp(1, ids.len());
    let (id_tx, id_rx) = crossbeam_channel::unbounded::<Id>();
    for id in ids {
        id_tx.send(id).expect("unbounded send");
    }
    drop(id_tx);

    let callback = Mutex::new(f);
    let stop = AtomicBool::new(false);
    let first_err: Mutex<Option<CairnError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let id_rx = id_rx.clone();
            let callback = &callback;
            let stop = &stop;
            let first_err = &first_err;
            scope.spawn(move || {
                for id in id_rx {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let res = load_snapshot(repo, &id);
                    let mut cb = callback.lock().unwrap();
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = (*cb)(id, res) {
                        stop.store(true, Ordering::SeqCst);
                        first_err.lock().unwrap().get_or_insert(e);
                        break;
                    }
                }
            });
        }
    });

    match first_err.into_inner().unwrap() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
