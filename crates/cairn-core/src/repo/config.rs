use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};
use crate::id::Id;

pub const MIN_REPO_VERSION: u32 = 1;
pub const MAX_REPO_VERSION: u32 = 2;

/// Repository configuration, stored sealed at the fixed `config` key.
/// The `id` identifies the repository (e.g. for cache directories) and never
/// changes except through an explicit id change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    pub id: Id,
    #[serde(with = "hex_u64")]
    pub chunker_polynomial: u64,
}

impl Config {
    /// Build a fresh config with a random repository id. The chunker
    /// polynomial is chosen by the (out-of-scope) chunking collaborator and
    /// only stored here.
    pub fn new(version: u32, chunker_polynomial: u64) -> Result<Self> {
        let config = Self {
            version,
            id: Id::random(),
            chunker_polynomial,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version < MIN_REPO_VERSION || self.version > MAX_REPO_VERSION {
            return Err(CairnError::UnsupportedVersion(self.version));
        }
        if self.chunker_polynomial == 0 {
            return Err(CairnError::Config("chunker polynomial must not be zero".into()));
        }
        Ok(())
    }

    /// Blob compression exists from format v2 on.
    pub fn compression_enabled(&self) -> bool {
        self.version >= 2
    }
}

/// The chunker polynomial is hex on the wire.
mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{v:x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        u64::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A known-good irreducible polynomial, as a chunker would generate.
    const TEST_POLY: u64 = 0x3DA3358B4DC173;

    #[test]
    fn new_validates_version() {
        assert!(Config::new(1, TEST_POLY).is_ok());
        assert!(Config::new(2, TEST_POLY).is_ok());
        assert!(matches!(
            Config::new(0, TEST_POLY),
            Err(CairnError::UnsupportedVersion(0))
        ));
        assert!(matches!(
            Config::new(3, TEST_POLY),
            Err(CairnError::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn zero_polynomial_rejected() {
        assert!(Config::new(2, 0).is_err());
    }

    #[test]
    fn polynomial_is_hex_on_the_wire() {
        let config = Config::new(2, TEST_POLY).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"chunker_polynomial\":\"3da3358b4dc173\""), "{json}");

        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn fresh_configs_have_distinct_ids() {
        let a = Config::new(2, TEST_POLY).unwrap();
        let b = Config::new(2, TEST_POLY).unwrap();
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_null());
    }

    #[test]
    fn compression_gate() {
        assert!(!Config::new(1, TEST_POLY).unwrap().compression_enabled());
        assert!(Config::new(2, TEST_POLY).unwrap().compression_enabled());
    }
}
