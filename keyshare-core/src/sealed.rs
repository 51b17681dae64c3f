//! Encrypt-then-MAC sealing for data at rest.
//!
//! AES-256-CBC + HMAC-SHA256 over `IV || ciphertext`, with all three parts
//! Base64-encoded for embedding in JSON.  Key derivation from the machine
//! seed uses HKDF-SHA256 with a caller-chosen `info` label so different
//! consumers never share keys.
//!
//! A fresh IV is generated for every `seal` call and plaintext is returned in
//! `Zeroizing<Vec<u8>>` so it is scrubbed when dropped.

use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcDec = Decryptor<Aes256>;
type Aes256CbcEnc = Encryptor<Aes256>;

/// A 64-byte symmetric key pair: 32 bytes encryption key + 32 bytes MAC key.
pub struct StorageKey {
    data: Zeroizing<Vec<u8>>,
}

impl StorageKey {
    /// Create from raw 64-byte key material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != 64 {
            return Err(format!("StorageKey requires 64 bytes, got {}", bytes.len()));
        }
        Ok(Self {
            data: Zeroizing::new(bytes.to_vec()),
        })
    }

    /// Expand a seed (e.g. the machine key) into a storage key bound to `info`.
    pub fn derive(seed: &[u8], info: &[u8]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, seed);
        let mut okm = Zeroizing::new(vec![0u8; 64]);
        // 64 bytes is far below HKDF-SHA256's 8160-byte output limit.
        hkdf.expand(info, &mut okm)
            .expect("HKDF expand cannot fail for 64-byte output");
        Self { data: okm }
    }

    fn enc_key(&self) -> &[u8] {
        &self.data[..32]
    }

    fn mac_key(&self) -> &[u8] {
        &self.data[32..]
    }
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageKey([redacted])")
    }
}

/// Sealed payload as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBlob {
    pub iv_b64: String,
    pub ciphertext_b64: String,
    /// HMAC-SHA256 over IV + ciphertext.
    pub mac_b64: String,
}

pub fn seal(key: &StorageKey, plaintext: &[u8]) -> Result<SealedBlob, String> {
    use rand::RngCore;

    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);

    let encryptor =
        Aes256CbcEnc::new_from_slices(key.enc_key(), &iv).map_err(|e| format!("AES init: {e}"))?;
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut hmac =
        HmacSha256::new_from_slice(key.mac_key()).map_err(|e| format!("HMAC init: {e}"))?;
    hmac.update(&iv);
    hmac.update(&ciphertext);
    let mac = hmac.finalize().into_bytes();

    Ok(SealedBlob {
        iv_b64: B64.encode(iv),
        ciphertext_b64: B64.encode(&ciphertext),
        mac_b64: B64.encode(mac),
    })
}

/// Verify the MAC, then decrypt.
pub fn open(key: &StorageKey, blob: &SealedBlob) -> Result<Zeroizing<Vec<u8>>, String> {
    let iv = B64
        .decode(&blob.iv_b64)
        .map_err(|e| format!("base64 decode iv: {e}"))?;
    let ciphertext = B64
        .decode(&blob.ciphertext_b64)
        .map_err(|e| format!("base64 decode ciphertext: {e}"))?;
    let mac_bytes = B64
        .decode(&blob.mac_b64)
        .map_err(|e| format!("base64 decode mac: {e}"))?;

    let mut hmac =
        HmacSha256::new_from_slice(key.mac_key()).map_err(|e| format!("HMAC init: {e}"))?;
    hmac.update(&iv);
    hmac.update(&ciphertext);
    hmac.verify_slice(&mac_bytes)
        .map_err(|_| "MAC verification failed (wrong key or tampered data)".to_string())?;

    let decryptor =
        Aes256CbcDec::new_from_slices(key.enc_key(), &iv).map_err(|e| format!("AES init: {e}"))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map(Zeroizing::new)
        .map_err(|e| format!("AES decrypt: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> StorageKey {
        StorageKey::from_bytes(&[byte; 64]).unwrap()
    }

    #[test]
    fn storage_key_rejects_wrong_length() {
        assert!(StorageKey::from_bytes(&[0u8; 32]).is_err());
        assert!(StorageKey::from_bytes(&[0u8; 65]).is_err());
        assert!(StorageKey::from_bytes(&[0u8; 64]).is_ok());
    }

    #[test]
    fn storage_key_debug_redacts() {
        assert_eq!(format!("{:?}", test_key(0x42)), "StorageKey([redacted])");
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key(0x55);
        let blob = seal(&key, b"installed credentials").unwrap();
        assert_eq!(open(&key, &blob).unwrap().as_slice(), b"installed credentials");
    }

    #[test]
    fn derived_keys_depend_on_info() {
        let a = StorageKey::derive(&[7u8; 32], b"keyshare store");
        let b = StorageKey::derive(&[7u8; 32], b"something else");
        let blob = seal(&a, b"payload").unwrap();
        assert!(open(&a, &blob).is_ok());
        assert!(open(&b, &blob).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let key = test_key(0x42);
        let mut blob = seal(&key, b"hello").unwrap();
        let mut ct = B64.decode(&blob.ciphertext_b64).unwrap();
        ct[0] ^= 0xFF;
        blob.ciphertext_b64 = B64.encode(&ct);
        assert!(open(&key, &blob).is_err());
    }
}
