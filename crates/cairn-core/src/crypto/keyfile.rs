use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::backend::{Backend, FileType, Handle};
use crate::crypto::MasterKey;
use crate::error::{CairnError, Result};
use crate::id::Id;

/// On-disk key file: plaintext JSON wrapping the sealed master key.
/// Key file names are random, not content hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub created: DateTime<Utc>,
    pub username: String,
    pub hostname: String,
    pub kdf: String,
    #[serde(rename = "N")]
    pub n: u32,
    pub r: u32,
    pub p: u32,
    /// base64-encoded 32-byte salt.
    pub salt: String,
    /// base64-encoded sealed master key payload.
    pub data: String,
}

/// Sealed payload inside `data`: the master key in its wire form.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyWire {
    mac: MacWire,
    encrypt: String,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct MacWire {
    k: String,
    r: String,
}

/// scrypt parameters for wrapping new keys.
#[derive(Debug, Clone, Copy)]
pub struct KdfParams {
    pub n: u32,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            n: 32768,
            r: 8,
            p: 1,
        }
    }
}

impl KdfParams {
    /// Cheaper parameters for constrained hardware.
    pub fn hardware_slow() -> Self {
        Self {
            n: 16384,
            r: 8,
            p: 1,
        }
    }
}

// Bounds rejecting maliciously crafted key files.
const MIN_N: u32 = 1024;
const MAX_N: u32 = 1 << 22;
const MAX_R: u32 = 32;
const MAX_P: u32 = 16;
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

fn validate_kdf(key_file: &KeyFile, salt_len: usize) -> Result<()> {
    if key_file.kdf != "scrypt" {
        return Err(CairnError::KeyDerivation(format!(
            "unsupported KDF '{}'",
            key_file.kdf
        )));
    }
    if !key_file.n.is_power_of_two() || key_file.n < MIN_N || key_file.n > MAX_N {
        return Err(CairnError::KeyDerivation(format!(
            "scrypt N={} out of bounds",
            key_file.n
        )));
    }
    if key_file.r == 0 || key_file.r > MAX_R {
        return Err(CairnError::KeyDerivation(format!(
            "scrypt r={} out of bounds",
            key_file.r
        )));
    }
    if key_file.p == 0 || key_file.p > MAX_P {
        return Err(CairnError::KeyDerivation(format!(
            "scrypt p={} out of bounds",
            key_file.p
        )));
    }
    if salt_len < MIN_SALT_LEN || salt_len > MAX_SALT_LEN {
        return Err(CairnError::KeyDerivation(format!(
            "salt length {salt_len} out of bounds"
        )));
    }
    Ok(())
}

/// Derive the key-wrapping key from a passphrase. The 64-byte scrypt output
/// splits into `mac.k(16) ‖ mac.r(16) ‖ encrypt(32)`.
fn derive_wrapping_key(passphrase: &str, salt: &[u8], n: u32, r: u32, p: u32) -> Result<MasterKey> {
    let log_n = n.trailing_zeros() as u8;
    let params = scrypt::Params::new(log_n, r, p, 64)
        .map_err(|e| CairnError::KeyDerivation(format!("scrypt params: {e}")))?;

    let mut out = Zeroizing::new([0u8; 64]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, out.as_mut())
        .map_err(|e| CairnError::KeyDerivation(format!("scrypt: {e}")))?;

    let mut k = [0u8; 16];
    let mut mac_r = [0u8; 16];
    let mut encrypt = [0u8; 32];
    k.copy_from_slice(&out[..16]);
    mac_r.copy_from_slice(&out[16..32]);
    encrypt.copy_from_slice(&out[32..]);
    Ok(MasterKey::from_parts(encrypt, k, mac_r))
}

/// Wrap `master` under `passphrase` and store it as a new key file.
/// Returns the (random) key file name.
pub fn create_key(
    backend: &dyn Backend,
    master: &MasterKey,
    passphrase: &str,
    username: &str,
    hostname: &str,
    params: KdfParams,
) -> Result<String> {
    use rand::RngCore;
    let mut salt = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let wrapping = derive_wrapping_key(passphrase, &salt, params.n, params.r, params.p)?;

    let wire = KeyWire {
        mac: MacWire {
            k: BASE64.encode(master.mac.k),
            r: BASE64.encode(master.mac.r),
        },
        encrypt: BASE64.encode(master.encrypt),
    };
    let payload = Zeroizing::new(serde_json::to_vec(&wire)?);
    let sealed = wrapping.seal(&payload)?;

    let key_file = KeyFile {
        created: Utc::now(),
        username: username.to_string(),
        hostname: hostname.to_string(),
        kdf: "scrypt".to_string(),
        n: params.n,
        r: params.r,
        p: params.p,
        salt: BASE64.encode(salt),
        data: BASE64.encode(sealed),
    };

    let name = Id::random().to_hex();
    let data = serde_json::to_vec(&key_file)?;
    backend.save(&Handle::new(FileType::Key, &name), &data)?;
    Ok(name)
}

/// Load one key file and attempt to unwrap it with `passphrase`.
pub fn open_key(backend: &dyn Backend, name: &str, passphrase: &str) -> Result<MasterKey> {
    let data = backend.load(&Handle::new(FileType::Key, name), 0, 0)?;
    let key_file: KeyFile = serde_json::from_slice(&data)?;

    let salt = BASE64
        .decode(&key_file.salt)
        .map_err(|e| CairnError::KeyDerivation(format!("bad salt encoding: {e}")))?;
    validate_kdf(&key_file, salt.len())?;

    let sealed = BASE64
        .decode(&key_file.data)
        .map_err(|e| CairnError::KeyDerivation(format!("bad key data encoding: {e}")))?;

    let wrapping = derive_wrapping_key(passphrase, &salt, key_file.n, key_file.r, key_file.p)?;
    let payload = Zeroizing::new(wrapping.open(&sealed)?);
    let wire: KeyWire = serde_json::from_slice(&payload).map_err(|_| CairnError::Decrypt)?;

    let k = decode_exact::<16>(&wire.mac.k)?;
    let r = decode_exact::<16>(&wire.mac.r)?;
    let encrypt = decode_exact::<32>(&wire.encrypt)?;
    Ok(MasterKey::from_parts(encrypt, k, r))
}

fn decode_exact<const N: usize>(encoded: &str) -> Result<[u8; N]> {
    let bytes = BASE64.decode(encoded).map_err(|_| CairnError::Decrypt)?;
    let arr: [u8; N] = bytes.try_into().map_err(|_| CairnError::Decrypt)?;
    Ok(arr)
}

/// Enumerate key files and try to unwrap each with `passphrase`; the first
/// success wins. `key_hint` is tried before the enumeration. `max_keys`
/// bounds how many candidates are attempted (0 = unlimited) so a repository
/// with hundreds of keys doesn't stall interactive unlocks.
pub fn search_key(
    backend: &dyn Backend,
    passphrase: &str,
    max_keys: usize,
    key_hint: Option<&str>,
) -> Result<(String, MasterKey)> {
    if let Some(hint) = key_hint {
        match open_key(backend, hint, passphrase) {
            Ok(key) => return Ok((hint.to_string(), key)),
            Err(e) => tracing::debug!("key hint '{hint}' did not unlock: {e}"),
        }
    }

    let mut names = Vec::new();
    backend.list(FileType::Key, &mut |info| {
        names.push(info.name);
        Ok(())
    })?;

    let mut checked = 0usize;
    for name in names {
        if Some(name.as_str()) == key_hint {
            continue;
        }
        if max_keys > 0 && checked >= max_keys {
            tracing::warn!("stopped after trying {checked} keys");
            break;
        }
        checked += 1;
        match open_key(backend, &name, passphrase) {
            Ok(key) => return Ok((name, key)),
            Err(e) => tracing::debug!("key '{name}' did not unlock: {e}"),
        }
    }

    Err(CairnError::NoKeyFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryBackend;

    // Tiny scrypt parameters; production strength is pointless in tests.
    fn fast_params() -> KdfParams {
        KdfParams { n: 1024, r: 1, p: 1 }
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let backend = MemoryBackend::new();
        let master = MasterKey::generate();
        let name = create_key(&backend, &master, "sekrit", "alice", "host1", fast_params()).unwrap();

        let opened = open_key(&backend, &name, "sekrit").unwrap();
        assert_eq!(opened.encrypt, master.encrypt);
        assert_eq!(opened.mac.k, master.mac.k);
        assert_eq!(opened.mac.r, master.mac.r);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let backend = MemoryBackend::new();
        let master = MasterKey::generate();
        let name = create_key(&backend, &master, "right", "alice", "host1", fast_params()).unwrap();
        assert!(matches!(
            open_key(&backend, &name, "wrong"),
            Err(CairnError::Decrypt)
        ));
    }

    #[test]
    fn search_finds_the_matching_key() {
        let backend = MemoryBackend::new();
        let master_a = MasterKey::generate();
        let master_b = MasterKey::generate();
        create_key(&backend, &master_a, "pass-a", "alice", "h", fast_params()).unwrap();
        let name_b = create_key(&backend, &master_b, "pass-b", "bob", "h", fast_params()).unwrap();

        let (found, key) = search_key(&backend, "pass-b", 0, None).unwrap();
        assert_eq!(found, name_b);
        assert_eq!(key.encrypt, master_b.encrypt);
    }

    #[test]
    fn search_with_wrong_passphrase_fails() {
        let backend = MemoryBackend::new();
        create_key(
            &backend,
            &MasterKey::generate(),
            "pass",
            "alice",
            "h",
            fast_params(),
        )
        .unwrap();
        assert!(matches!(
            search_key(&backend, "nope", 0, None),
            Err(CairnError::NoKeyFound)
        ));
    }

    #[test]
    fn search_respects_max_keys() {
        let backend = MemoryBackend::new();
        for i in 0..3 {
            create_key(
                &backend,
                &MasterKey::generate(),
                &format!("pass-{i}"),
                "alice",
                "h",
                fast_params(),
            )
            .unwrap();
        }
        // One attempt allowed; at most one of three can match "pass-2", so
        // searching may fail; the point is it stops without trying all.
        let res = search_key(&backend, "definitely-wrong", 1, None);
        assert!(matches!(res, Err(CairnError::NoKeyFound)));
    }

    #[test]
    fn rejects_absurd_kdf_params() {
        let backend = MemoryBackend::new();
        let master = MasterKey::generate();
        let name = create_key(&backend, &master, "x", "alice", "h", fast_params()).unwrap();

        // Corrupt the stored N to something non-power-of-two.
        let handle = Handle::new(FileType::Key, &name);
        let data = backend.load(&handle, 0, 0).unwrap();
        let mut key_file: KeyFile = serde_json::from_slice(&data).unwrap();
        key_file.n = 12345;
        backend.remove(&handle).unwrap();
        backend
            .save(&handle, &serde_json::to_vec(&key_file).unwrap())
            .unwrap();

        assert!(matches!(
            open_key(&backend, &name, "x"),
            Err(CairnError::KeyDerivation(_))
        ));
    }
}
