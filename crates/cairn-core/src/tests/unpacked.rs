use std::sync::Arc;

use crate::backend::{Backend, FileType, Handle};
use crate::error::CairnError;
use crate::id::Id;
use crate::repo::{recreate_config, Repository};
use crate::testutil::{fast_options, test_repo_on, MemoryBackend, TEST_PASSPHRASE, TEST_POLY};

#[test]
fn unpacked_roundtrip() {
    let repo = test_repo_on(Arc::new(MemoryBackend::new()));
    let payload = br#"{"time":"2024-01-01T00:00:00Z"}"#;
    let id = repo.save_unpacked(FileType::Snapshot, payload).unwrap();
    assert_eq!(repo.load_unpacked(FileType::Snapshot, &id).unwrap(), payload);
}

#[test]
fn unpacked_name_is_hash_of_sealed_bytes() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let repo = test_repo_on(Arc::clone(&backend));

    let id = repo.save_unpacked(FileType::Snapshot, b"snapshot body").unwrap();
    let stored = backend
        .load(&Handle::new(FileType::Snapshot, id.to_hex()), 0, 0)
        .unwrap();
    assert_eq!(Id::hash(&stored), id);
    // The stored bytes are sealed, not the plaintext.
    assert_ne!(stored, b"snapshot body");
}

#[test]
fn corrupted_unpacked_file_fails_after_one_retry() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let repo = test_repo_on(Arc::clone(&backend));

    let id = repo.save_unpacked(FileType::Snapshot, b"will be flipped").unwrap();

    let handle = Handle::new(FileType::Snapshot, id.to_hex());
    let mut data = backend.load(&handle, 0, 0).unwrap();
    data[3] ^= 0x80;
    backend.remove(&handle).unwrap();
    backend.save(&handle, &data).unwrap();

    // The backend returns the same corrupt bytes on the retry, so the load
    // fails with a hash mismatch rather than a decrypt error.
    assert!(matches!(
        repo.load_unpacked(FileType::Snapshot, &id),
        Err(CairnError::HashMismatch { .. })
    ));
}

#[test]
fn missing_unpacked_file_is_not_exist() {
    let repo = test_repo_on(Arc::new(MemoryBackend::new()));
    let err = repo
        .load_unpacked(FileType::Snapshot, &Id::hash(b"absent"))
        .unwrap_err();
    assert!(err.is_not_exist());
}

#[test]
fn recreate_config_refuses_when_config_is_healthy() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let _repo = test_repo_on(Arc::clone(&backend));

    assert!(matches!(
        recreate_config(backend, TEST_PASSPHRASE, 2, TEST_POLY),
        Err(CairnError::Fatal(_))
    ));
}

#[test]
fn recreate_config_revives_a_repo_without_config() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let (blob_id, old_repo_id) = {
        let repo = test_repo_on(Arc::clone(&backend));
        let (id, _) = repo
            .save_blob(crate::blob::BlobType::Data, b"survivor", None, false)
            .unwrap();
        repo.flush().unwrap();
        (id, repo.config().id)
    };

    // The config vanishes; opening now fails.
    backend.remove(&Handle::config()).unwrap();
    assert!(Repository::open(Arc::clone(&backend), TEST_PASSPHRASE, fast_options()).is_err());

    let config = recreate_config(Arc::clone(&backend), TEST_PASSPHRASE, 2, TEST_POLY).unwrap();
    assert_ne!(config.id, old_repo_id);

    // Packs and keys are readable again.
    let repo = Repository::open(backend, TEST_PASSPHRASE, fast_options()).unwrap();
    repo.load_index().unwrap();
    assert_eq!(
        repo.load_blob(crate::blob::BlobType::Data, &blob_id).unwrap(),
        b"survivor"
    );
}

#[test]
fn recreate_config_requires_the_passphrase() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let _repo = test_repo_on(Arc::clone(&backend));
    backend.remove(&Handle::config()).unwrap();

    assert!(matches!(
        recreate_config(backend, "wrong", 2, TEST_POLY),
        Err(CairnError::NoKeyFound)
    ));
}
