//! Field crypto.
//!
//! Symmetric cipher wrapping individual field values. Encrypted fields are
//! stored as hex `nonce || tag || ciphertext`; `open` verifies the HMAC tag
//! before decrypting. Built on the SHA-256/HMAC primitives: a per-value
//! random nonce keys a SHA-256 counter keystream, so sealing the same
//! plaintext twice yields distinct ciphertexts.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Field crypto errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Malformed ciphertext")]
    Malformed,

    #[error("Authentication tag mismatch")]
    TagMismatch,
}

/// Symmetric field cipher. One instance per engine, keyed from the schema's
/// secret at construction.
#[derive(Clone)]
pub struct FieldCipher {
    key: [u8; 32],
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FieldCipher(..)")
    }
}

impl FieldCipher {
    /// Derive the cipher key from an arbitrary-length secret.
    pub fn new(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Seal a field value. The stored plaintext is never mutated; callers
    /// replace the field with the returned hex string.
    pub fn seal(&self, value: &Value) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.seal_with_nonce(&nonce, value)
    }

    /// Deterministic variant used by tests.
    pub fn seal_with_nonce(&self, nonce: &[u8; NONCE_LEN], value: &Value) -> String {
        let mut data = value.to_string().into_bytes();
        self.apply_keystream(nonce, &mut data);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(nonce);
        mac.update(&data);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + data.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&data);
        hex::encode(out)
    }

    /// Verify and unseal a field value previously produced by `seal`.
    pub fn open(&self, sealed: &str) -> Result<Value, CryptoError> {
        let bytes = hex::decode(sealed).map_err(|_| CryptoError::Malformed)?;
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed);
        }
        let (nonce, rest) = bytes.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(nonce);
        mac.update(ciphertext);
        mac.verify_slice(tag)
            .map_err(|_| CryptoError::TagMismatch)?;

        let mut nonce_arr = [0u8; NONCE_LEN];
        nonce_arr.copy_from_slice(nonce);
        let mut data = ciphertext.to_vec();
        self.apply_keystream(&nonce_arr, &mut data);

        serde_json::from_slice(&data).map_err(|_| CryptoError::Malformed)
    }

    /// XOR the buffer with SHA-256(key || nonce || counter) blocks.
    fn apply_keystream(&self, nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
        let mut counter: u64 = 0;
        for chunk in data.chunks_mut(32) {
            let mut hasher = Sha256::new();
            hasher.update(self.key);
            hasher.update(nonce);
            hasher.update(counter.to_le_bytes());
            let block = hasher.finalize();
            for (byte, key_byte) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key_byte;
            }
            counter += 1;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
