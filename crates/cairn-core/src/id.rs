use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{CairnError, Result};

/// Size of an [`Id`] in bytes.
pub const ID_SIZE: usize = 32;

/// A 32-byte content identifier: the SHA-256 of a blob's plaintext, or of a
/// repository file's stored bytes. The lowercase-hex form is canonical and
/// doubles as the storage name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// The all-zero sentinel. Never a valid content hash.
    pub const NULL: Id = Id([0u8; ID_SIZE]);

    /// Hash `data` with SHA-256.
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; ID_SIZE];
        out.copy_from_slice(&digest);
        Id(out)
    }

    /// Generate a random ID from OS entropy (used for key file names and
    /// fresh repository ids, which are not content hashes).
    pub fn random() -> Self {
        use rand::RngCore;
        let mut out = [0u8; ID_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut out);
        Id(out)
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; ID_SIZE]
    }

    /// Full lowercase-hex encoding (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte as a two-char hex string, used for pack shard directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Whether the hex form starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.to_hex().starts_with(prefix)
    }
}

impl FromStr for Id {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| CairnError::InvalidFormat(format!("invalid hex ID '{s}'")))?;
        if bytes.len() != ID_SIZE {
            return Err(CairnError::InvalidFormat(format!(
                "ID '{s}' has wrong length {} (want {ID_SIZE} bytes)",
                bytes.len()
            )));
        }
        let mut out = [0u8; ID_SIZE];
        out.copy_from_slice(&bytes);
        Ok(Id(out))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

// On the wire (index files, snapshots, trees) IDs are hex strings.
impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_sha256() {
        // SHA-256("hello world")
        let id = Id::hash(b"hello world");
        assert_eq!(
            id.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn null_sentinel() {
        assert!(Id::NULL.is_null());
        assert!(!Id::hash(b"").is_null());
    }

    #[test]
    fn hex_roundtrip() {
        let id = Id::hash(b"roundtrip");
        let parsed: Id = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("zz".parse::<Id>().is_err());
        assert!("abcd".parse::<Id>().is_err()); // too short
    }

    #[test]
    fn shard_prefix_is_first_byte() {
        let id = Id([0xAB; ID_SIZE]);
        assert_eq!(id.shard_prefix(), "ab");
    }

    #[test]
    fn prefix_matching() {
        let id = Id::hash(b"hello world");
        assert!(id.has_prefix("b94d"));
        assert!(!id.has_prefix("ffff"));
    }

    #[test]
    fn serde_is_hex_string() {
        let id = Id::hash(b"x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
