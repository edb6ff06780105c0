use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::{Backend, FileType, Handle};
use crate::blob::{Blob, BlobHandle, BlobType};
use crate::crypto::{MasterKey, OVERHEAD};
use crate::error::{CairnError, Result};
use crate::id::Id;

// Header entry type tags.
const ENTRY_DATA: u8 = 0;
const ENTRY_TREE: u8 = 1;
const ENTRY_COMPRESSED_DATA: u8 = 2;
const ENTRY_COMPRESSED_TREE: u8 = 3;

/// Header entry without an uncompressed length: type(1) + length(4) + id(32).
pub const PLAIN_ENTRY_SIZE: usize = 37;
/// Header entry carrying an uncompressed length.
pub const COMPRESSED_ENTRY_SIZE: usize = 41;
/// Trailing little-endian length field giving the *plaintext* header size.
pub const HEADER_LEN_SIZE: usize = 4;
/// Upper bound on a decrypted pack header. A header this size describes
/// hundreds of thousands of blobs; anything larger is corruption.
pub const MAX_HEADER_SIZE: usize = 16 * 1024 * 1024;

/// Bytes fetched speculatively from the end of a pack when reading its
/// header. Covers packs with up to ~800 blobs in a single range request.
const EAGER_TAIL_SIZE: u64 = 32 * 1024;

/// A pack finalized in memory, ready for upload. The pack's name is the
/// SHA-256 of `data`.
pub struct FinishedPack {
    pub id: Id,
    pub data: Vec<u8>,
    pub blobs: Vec<Blob>,
}

/// Assembles sealed blobs into a pack file: concatenated blobs, then the
/// sealed header listing them in append order, then the 4-byte footer.
pub struct Packer {
    key: Arc<MasterKey>,
    buffer: Vec<u8>,
    blobs: Vec<Blob>,
    pending: HashSet<BlobHandle>,
}

impl Packer {
    pub fn new(key: Arc<MasterKey>) -> Self {
        Self {
            key,
            buffer: Vec::new(),
            blobs: Vec::new(),
            pending: HashSet::new(),
        }
    }

    /// Append one sealed blob. Returns its offset within the pack body.
    /// A `(type, id)` pair may appear at most once per pack.
    pub fn add(
        &mut self,
        blob_type: BlobType,
        id: Id,
        sealed: &[u8],
        uncompressed_length: Option<u32>,
    ) -> Result<u32> {
        let handle = BlobHandle::new(blob_type, id);
        if !self.pending.insert(handle) {
            return Err(CairnError::InvalidFormat(format!(
                "blob {id} already present in this pack"
            )));
        }

        let offset = self.buffer.len() as u32;
        self.buffer.extend_from_slice(sealed);
        self.blobs.push(Blob {
            blob_type,
            id,
            offset,
            length: sealed.len() as u32,
            uncompressed_length,
        });
        Ok(offset)
    }

    /// Whether a blob with this handle is already buffered here.
    pub fn contains(&self, handle: &BlobHandle) -> bool {
        self.pending.contains(handle)
    }

    /// Bytes of blob data buffered so far (excluding the eventual header).
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn count(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Build and seal the header, append the footer, and hash the result.
    pub fn finalize(mut self) -> Result<FinishedPack> {
        if self.blobs.is_empty() {
            return Err(CairnError::InvalidFormat("cannot finalize empty pack".into()));
        }

        let header = encode_header(&self.blobs);
        let sealed_header = self.key.seal(&header)?;
        self.buffer.extend_from_slice(&sealed_header);
        self.buffer
            .extend_from_slice(&(header.len() as u32).to_le_bytes());

        let id = Id::hash(&self.buffer);
        Ok(FinishedPack {
            id,
            data: self.buffer,
            blobs: self.blobs,
        })
    }
}

/// On-disk size of one header entry for this blob.
fn entry_size(blob: &Blob) -> usize {
    if blob.is_compressed() {
        COMPRESSED_ENTRY_SIZE
    } else {
        PLAIN_ENTRY_SIZE
    }
}

/// On-disk size of the sealed header plus its footer for this blob sequence.
/// Pure; used by writers to plan sizes and by sanity checks against the
/// actual bytes produced.
pub fn calculate_header_size(blobs: &[Blob]) -> usize {
    let plain: usize = blobs.iter().map(entry_size).sum();
    plain + OVERHEAD + HEADER_LEN_SIZE
}

fn encode_header(blobs: &[Blob]) -> Vec<u8> {
    let mut out = Vec::with_capacity(blobs.iter().map(entry_size).sum());
    for blob in blobs {
        let tag = match (blob.blob_type, blob.is_compressed()) {
            (BlobType::Data, false) => ENTRY_DATA,
            (BlobType::Tree, false) => ENTRY_TREE,
            (BlobType::Data, true) => ENTRY_COMPRESSED_DATA,
            (BlobType::Tree, true) => ENTRY_COMPRESSED_TREE,
        };
        out.push(tag);
        out.extend_from_slice(&blob.length.to_le_bytes());
        if let Some(uncompressed) = blob.uncompressed_length {
            out.extend_from_slice(&uncompressed.to_le_bytes());
        }
        out.extend_from_slice(&blob.id.0);
    }
    out
}

/// Decode header entries, assigning each blob its offset as the running sum
/// of the preceding lengths.
fn decode_header(plain: &[u8]) -> Result<Vec<Blob>> {
    let mut blobs = Vec::with_capacity(plain.len() / PLAIN_ENTRY_SIZE);
    let mut pos = 0usize;
    let mut offset = 0u32;

    while pos < plain.len() {
        let (blob_type, compressed) = match plain[pos] {
            ENTRY_DATA => (BlobType::Data, false),
            ENTRY_TREE => (BlobType::Tree, false),
            ENTRY_COMPRESSED_DATA => (BlobType::Data, true),
            ENTRY_COMPRESSED_TREE => (BlobType::Tree, true),
            tag => {
                return Err(CairnError::InvalidFormat(format!(
                    "unknown pack header entry type {tag}"
                )))
            }
        };
        let size = if compressed {
            COMPRESSED_ENTRY_SIZE
        } else {
            PLAIN_ENTRY_SIZE
        };
        if pos + size > plain.len() {
            return Err(CairnError::InvalidFormat(
                "truncated pack header entry".into(),
            ));
        }

        let length = u32::from_le_bytes(plain[pos + 1..pos + 5].try_into().unwrap());
        if (length as usize) < OVERHEAD {
            return Err(CairnError::InvalidFormat(format!(
                "pack header entry length {length} below sealing overhead"
            )));
        }
        let (uncompressed_length, id_start) = if compressed {
            let ul = u32::from_le_bytes(plain[pos + 5..pos + 9].try_into().unwrap());
            (Some(ul), pos + 9)
        } else {
            (None, pos + 5)
        };
        let mut id = [0u8; 32];
        id.copy_from_slice(&plain[id_start..id_start + 32]);

        blobs.push(Blob {
            blob_type,
            id: Id(id),
            offset,
            length,
            uncompressed_length,
        });
        offset = offset.checked_add(length).ok_or_else(|| {
            CairnError::InvalidFormat("pack body length exceeds u32".into())
        })?;
        pos += size;
    }

    Ok(blobs)
}

/// Read and decrypt the trailing header of a pack via range reads.
///
/// Fetches an eager tail window first; when the footer reveals a header
/// larger than the window, refetches with the exact size. The decoded blob
/// list carries offsets computed by running sum, and the body length is
/// checked against the file size.
pub fn read_header(
    backend: &dyn Backend,
    pack_id: &Id,
    pack_size: u64,
    key: &MasterKey,
) -> Result<Vec<Blob>> {
    let handle = Handle::new(FileType::Pack, pack_id.to_hex());
    let min_size = (HEADER_LEN_SIZE + OVERHEAD + PLAIN_ENTRY_SIZE) as u64;
    if pack_size < min_size {
        return Err(CairnError::InvalidFormat(format!(
            "pack {pack_id} is too small ({pack_size} bytes)"
        )));
    }

    let eager = pack_size.min(EAGER_TAIL_SIZE);
    let mut tail = backend.load(&handle, eager as u32, pack_size - eager)?;

    let len_field = &tail[tail.len() - HEADER_LEN_SIZE..];
    let header_len = u32::from_le_bytes(len_field.try_into().unwrap()) as usize;
    if header_len == 0 || header_len > MAX_HEADER_SIZE {
        return Err(CairnError::InvalidFormat(format!(
            "pack {pack_id} header length {header_len} out of range"
        )));
    }

    let sealed_len = header_len + OVERHEAD;
    let total = sealed_len + HEADER_LEN_SIZE;
    if total as u64 > pack_size {
        return Err(CairnError::InvalidFormat(format!(
            "pack {pack_id} header ({total} bytes) larger than the pack ({pack_size} bytes)"
        )));
    }
    if total > tail.len() {
        // Eager window was too small; refetch the exact header span.
        tail = backend.load(&handle, total as u32, pack_size - total as u64)?;
    }

    let sealed_start = tail.len() - HEADER_LEN_SIZE - sealed_len;
    let plain = key.open(&tail[sealed_start..tail.len() - HEADER_LEN_SIZE])?;
    let blobs = decode_header(&plain)?;

    let body: u64 = blobs.iter().map(|b| b.length as u64).sum();
    if body + total as u64 != pack_size {
        return Err(CairnError::InvalidFormat(format!(
            "pack {pack_id} size mismatch: {body} bytes of blobs + {total} header != {pack_size}"
        )));
    }

    Ok(blobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Arc<MasterKey> {
        Arc::new(MasterKey::from_parts([0x01; 32], [0x02; 16], [0x03; 16]))
    }

    #[test]
    fn offsets_follow_append_order() {
        let key = test_key();
        let mut packer = Packer::new(Arc::clone(&key));
        let sealed_a = key.seal(b"aaaa").unwrap();
        let sealed_b = key.seal(b"bb").unwrap();

        let off_a = packer
            .add(BlobType::Data, Id::hash(b"aaaa"), &sealed_a, None)
            .unwrap();
        let off_b = packer
            .add(BlobType::Data, Id::hash(b"bb"), &sealed_b, None)
            .unwrap();
        assert_eq!(off_a, 0);
        assert_eq!(off_b, sealed_a.len() as u32);
    }

    #[test]
    fn duplicate_handle_rejected() {
        let key = test_key();
        let mut packer = Packer::new(Arc::clone(&key));
        let sealed = key.seal(b"dup").unwrap();
        let id = Id::hash(b"dup");
        packer.add(BlobType::Data, id, &sealed, None).unwrap();
        assert!(packer.add(BlobType::Data, id, &sealed, None).is_err());
        // Same id as a tree blob is a different handle.
        packer.add(BlobType::Tree, id, &sealed, None).unwrap();
    }

    #[test]
    fn header_size_matches_actual_bytes() {
        let key = test_key();
        // Mixed plain and compressed entries.
        let cases: &[&[(usize, Option<u32>)]] = &[
            &[(10, None)],
            &[(10, None), (20, Some(100))],
            &[(1, Some(9)), (2, Some(8)), (3, None), (4, None), (5, Some(7))],
        ];

        for shape in cases {
            let mut packer = Packer::new(Arc::clone(&key));
            let mut body = 0usize;
            for (i, (len, uncompressed)) in shape.iter().enumerate() {
                let data = vec![i as u8; *len];
                let sealed = key.seal(&data).unwrap();
                body += sealed.len();
                packer
                    .add(BlobType::Data, Id::hash(&data), &sealed, *uncompressed)
                    .unwrap();
            }
            let predicted = calculate_header_size(&packer.blobs);
            let finished = packer.finalize().unwrap();
            assert_eq!(finished.data.len(), body + predicted);
        }
    }

    #[test]
    fn single_blob_pack_layout() {
        // One 11-byte blob: body 43, sealed header 37+32, footer 4.
        let key = test_key();
        let mut packer = Packer::new(Arc::clone(&key));
        let sealed = key.seal(b"hello world").unwrap();
        assert_eq!(sealed.len(), 43);
        packer
            .add(BlobType::Data, Id::hash(b"hello world"), &sealed, None)
            .unwrap();
        assert_eq!(calculate_header_size(&packer.blobs), 37 + 32 + 4);
        let finished = packer.finalize().unwrap();
        assert_eq!(finished.data.len(), 43 + 69 + 4);
        assert_eq!(finished.id, Id::hash(&finished.data));
    }

    #[test]
    fn finalize_empty_pack_fails() {
        assert!(Packer::new(test_key()).finalize().is_err());
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut plain = vec![9u8];
        plain.extend_from_slice(&[0u8; PLAIN_ENTRY_SIZE - 1]);
        assert!(decode_header(&plain).is_err());
    }

    #[test]
    fn decode_rejects_truncated_entry() {
        let plain = vec![ENTRY_DATA; PLAIN_ENTRY_SIZE - 5];
        assert!(decode_header(&plain).is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let blobs = vec![
            Blob {
                blob_type: BlobType::Data,
                id: Id::hash(b"one"),
                offset: 0,
                length: 50,
                uncompressed_length: None,
            },
            Blob {
                blob_type: BlobType::Tree,
                id: Id::hash(b"two"),
                offset: 50,
                length: 80,
                uncompressed_length: Some(300),
            },
        ];
        let decoded = decode_header(&encode_header(&blobs)).unwrap();
        assert_eq!(decoded, blobs);
    }
}
