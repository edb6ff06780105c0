pub mod keyfile;

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CairnError, Result};

/// Nonce length of the sealing format.
pub const NONCE_SIZE: usize = 16;
/// Poly1305 tag length.
pub const TAG_SIZE: usize = 16;
/// Total per-message overhead: every sealed message is
/// `nonce ‖ ciphertext ‖ tag`, so `sealed_len = plain_len + OVERHEAD`.
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Poly1305-AES MAC key: `k` keys the AES-128 nonce mask, `r` is the
/// polynomial evaluation point (clamped on use).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MacKey {
    pub k: [u8; 16],
    pub r: [u8; 16],
}

/// The repository master key. Confidentiality comes from AES-256-CTR,
/// authenticity from Poly1305-AES over the ciphertext.
/// Zeroized on drop so key material does not linger in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    pub encrypt: [u8; 32],
    pub mac: MacKey,
}

impl MasterKey {
    /// Generate a fresh random key from OS entropy.
    pub fn generate() -> Self {
        let mut encrypt = [0u8; 32];
        let mut k = [0u8; 16];
        let mut r = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut encrypt);
        rand::rngs::OsRng.fill_bytes(&mut k);
        rand::rngs::OsRng.fill_bytes(&mut r);
        Self {
            encrypt,
            mac: MacKey { k, r },
        }
    }

    /// Build a key from raw bytes (key file unwrapping, KDF output).
    pub fn from_parts(encrypt: [u8; 32], k: [u8; 16], r: [u8; 16]) -> Self {
        Self {
            encrypt,
            mac: MacKey { k, r },
        }
    }

    /// Seal `plaintext`: fresh random nonce, encrypt, MAC the ciphertext.
    /// Output layout: `nonce(16) ‖ ciphertext ‖ tag(16)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = random_nonce();

        let mut out = Vec::with_capacity(plaintext.len() + OVERHEAD);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);

        let mut cipher = Aes256Ctr::new((&self.encrypt).into(), (&nonce).into());
        cipher.apply_keystream(&mut out[NONCE_SIZE..]);

        let tag = poly1305_mac(&self.mac, &nonce, &out[NONCE_SIZE..]);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Open a sealed message. The MAC is verified in constant time before any
    /// decryption happens; on mismatch no plaintext escapes.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < OVERHEAD {
            return Err(CairnError::Decrypt);
        }
        let (nonce_bytes, rest) = sealed.split_at(NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);
        let nonce: [u8; NONCE_SIZE] = nonce_bytes.try_into().expect("split at NONCE_SIZE");

        let expected = poly1305_mac(&self.mac, &nonce, ciphertext);
        if !bool::from(expected[..].ct_eq(tag)) {
            return Err(CairnError::Decrypt);
        }

        let mut plain = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new((&self.encrypt).into(), (&nonce).into());
        cipher.apply_keystream(&mut plain);
        Ok(plain)
    }
}

/// Fresh random nonce. An all-zero nonce is statistically impossible but
/// would indicate a broken RNG, so it is rejected outright.
fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    loop {
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        if nonce != [0u8; NONCE_SIZE] {
            return nonce;
        }
    }
}

/// Poly1305-AES: the per-message Poly1305 key is `r ‖ AES-128(k, nonce)`.
/// Clamping of `r` is done by the poly1305 implementation.
fn poly1305_mac(mac: &MacKey, nonce: &[u8; NONCE_SIZE], msg: &[u8]) -> [u8; TAG_SIZE] {
    let mut poly_key = [0u8; 32];
    poly_key[..16].copy_from_slice(&mac.r);

    let cipher = Aes128::new((&mac.k).into());
    let mut block = aes::Block::clone_from_slice(nonce);
    cipher.encrypt_block(&mut block);
    poly_key[16..].copy_from_slice(&block);

    let tag = poly1305::Poly1305::new((&poly_key).into()).compute_unpadded(msg);
    poly_key.zeroize();
    tag.into()
}
