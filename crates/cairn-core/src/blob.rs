use serde::{Deserialize, Serialize};

use crate::crypto::OVERHEAD;
use crate::id::Id;

/// Distinguishes file-content blobs from directory-tree blobs. The type is
/// part of a blob's identity in the master index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Data,
    Tree,
}

/// The key used throughout the master index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobHandle {
    pub id: Id,
    pub blob_type: BlobType,
}

impl BlobHandle {
    pub fn new(blob_type: BlobType, id: Id) -> Self {
        Self { id, blob_type }
    }
}

/// Describes one blob inside a pack file.
///
/// `length` counts the sealed, possibly compressed, on-disk bytes (nonce +
/// ciphertext + tag). `uncompressed_length` is present only when the blob was
/// zstd-compressed before sealing (repository format v2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "type")]
    pub blob_type: BlobType,
    pub id: Id,
    pub offset: u32,
    pub length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_length: Option<u32>,
}

impl Blob {
    pub fn handle(&self) -> BlobHandle {
        BlobHandle::new(self.blob_type, self.id)
    }

    pub fn is_compressed(&self) -> bool {
        self.uncompressed_length.is_some()
    }

    /// Plaintext size of the blob once decrypted and decompressed.
    pub fn data_length(&self) -> u32 {
        match self.uncompressed_length {
            Some(len) => len,
            None => self.length.saturating_sub(OVERHEAD as u32),
        }
    }
}

/// A blob's location record in the master index: the in-pack descriptor plus
/// the pack that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBlob {
    pub blob: Blob,
    pub pack_id: Id,
}
