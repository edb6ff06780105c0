use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Backend, FileType, Handle};
use crate::crypto::MasterKey;
use crate::error::{CairnError, Result};
use crate::id::Id;
use crate::platform;

/// A lock older than this is considered stale and may be removed by other
/// processes. Holders must refresh well before it elapses.
const STALE_TIMEOUT_SECS: i64 = 30 * 60;

/// Cooperative lock file content, stored sealed in `locks/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub exclusive: bool,
    pub hostname: String,
    pub username: String,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Lock {
    fn new(exclusive: bool) -> Self {
        Self {
            time: Utc::now(),
            exclusive,
            hostname: platform::hostname(),
            username: platform::username(),
            pid: std::process::id(),
            uid: platform::uid(),
            gid: platform::gid(),
        }
    }

    /// Whether this lock no longer protects anything.
    pub fn is_stale(&self) -> bool {
        Utc::now().signed_duration_since(self.time) > Duration::seconds(STALE_TIMEOUT_SECS)
    }

    fn holder(&self) -> String {
        format!(
            "{}@{} (pid {}, since {})",
            self.username, self.hostname, self.pid, self.time
        )
    }
}

/// Handle to a held lock. Release with [`LockGuard::unlock`]; a dropped guard
/// leaves its (eventually stale) file behind for the next acquirer to clean.
pub struct LockGuard {
    backend: Arc<dyn Backend>,
    key: Arc<MasterKey>,
    id: Id,
    exclusive: bool,
}

impl LockGuard {
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    /// Re-upload the lock with a fresh timestamp and drop the old file.
    /// Callers run this periodically from a background task so the lock never
    /// goes stale while held.
    pub fn refresh(&mut self) -> Result<()> {
        let new_id = write_lock(&self.backend, &self.key, &Lock::new(self.exclusive))?;
        let old = std::mem::replace(&mut self.id, new_id);
        remove_lock(&self.backend, old)?;
        debug!(old = %old, new = %self.id, "refreshed repository lock");
        Ok(())
    }

    /// Release the lock.
    pub fn unlock(self) -> Result<()> {
        remove_lock(&self.backend, self.id)
    }
}

/// Acquire a repository lock.
///
/// A non-exclusive (append) lock fails on any live exclusive lock; an
/// exclusive lock fails on any live lock at all. Stale locks found during the
/// check are removed. After writing its own lock file the acquirer re-checks,
/// so two racing acquirers cannot both believe they hold exclusivity.
pub fn lock_repo(
    backend: &Arc<dyn Backend>,
    key: &Arc<MasterKey>,
    exclusive: bool,
) -> Result<LockGuard> {
    check_conflicts(backend, key, exclusive, None)?;

    let lock = Lock::new(exclusive);
    let id = write_lock(backend, key, &lock)?;

    if let Err(e) = check_conflicts(backend, key, exclusive, Some(id)) {
        let _ = remove_lock(backend, id);
        return Err(e);
    }

    Ok(LockGuard {
        backend: Arc::clone(backend),
        key: Arc::clone(key),
        id,
        exclusive,
    })
}

/// Remove every lock file, stale or not. Recovery tool for locks left behind
/// by killed processes. Returns the number of files removed.
pub fn break_locks(backend: &dyn Backend) -> Result<usize> {
    let mut names = Vec::new();
    backend.list(FileType::Lock, &mut |info| {
        names.push(info.name);
        Ok(())
    })?;
    let removed = names.len();
    for name in names {
        backend.remove(&Handle::new(FileType::Lock, name))?;
    }
    Ok(removed)
}

fn write_lock(backend: &Arc<dyn Backend>, key: &MasterKey, lock: &Lock) -> Result<Id> {
    let sealed = key.seal(&serde_json::to_vec(lock)?)?;
    let id = Id::hash(&sealed);
    backend.save(&Handle::new(FileType::Lock, id.to_hex()), &sealed)?;
    Ok(id)
}

fn remove_lock(backend: &Arc<dyn Backend>, id: Id) -> Result<()> {
    backend.remove(&Handle::new(FileType::Lock, id.to_hex()))
}

/// Scan the lock directory for live conflicting locks, removing stale ones
/// along the way. `own` excludes the caller's freshly written lock file.
fn check_conflicts(
    backend: &Arc<dyn Backend>,
    key: &MasterKey,
    exclusive: bool,
    own: Option<Id>,
) -> Result<()> {
    let mut names = Vec::new();
    backend.list(FileType::Lock, &mut |info| {
        names.push(info.name);
        Ok(())
    })?;

    for name in names {
        if own.map(|id| id.to_hex()) == Some(name.clone()) {
            continue;
        }
        let lock = match load_lock(backend, key, &name) {
            Ok(lock) => lock,
            Err(e) => {
                // An unreadable lock file cannot be proven stale; treat it as
                // a conflict rather than silently ignoring another writer.
                warn!("unreadable lock file '{name}': {e}");
                return Err(CairnError::LockConflict(format!(
                    "unreadable lock file '{name}'"
                )));
            }
        };

        if lock.is_stale() {
            debug!("removing stale lock from {}", lock.holder());
            let _ = backend.remove(&Handle::new(FileType::Lock, name));
            continue;
        }

        if exclusive || lock.exclusive {
            return Err(CairnError::LockConflict(lock.holder()));
        }
    }
    Ok(())
}

fn load_lock(backend: &dyn Backend, key: &MasterKey, name: &str) -> Result<Lock> {
    let data = backend.load(&Handle::new(FileType::Lock, name.to_string()), 0, 0)?;
    let plain = key.open(&data)?;
    Ok(serde_json::from_slice(&plain)?)
}
