//! AES-256-GCM encryption, Argon2id master-key derivation, and per-directory
//! subkeys for manifest and filename protection.
//!
//! Key hierarchy:
//!
//! ```text
//! password ──Argon2id(salt)──▶ master key (32 B)
//! master key ──HKDF-SHA256(dir path)──▶ directory key (32 B)
//! ```
//!
//! The same directory always derives the same subkey; different directories
//! derive unlinkable subkeys.  Filenames are encrypted under the directory
//! key, manifests under the master key.
//!
//! Encrypted payload layout: `[ nonce (12 B) | ciphertext | GCM tag (16 B) ]`
//! — a fresh random nonce per call, so two encryptions of the same name are
//! distinguishable only by the key holder.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Byte length of the AES-GCM nonce prepended to every encrypted payload.
pub const NONCE_LEN: usize = 12;

/// Domain separation string for directory subkey derivation.
const DIR_KEY_CONTEXT: &[u8] = b"noisefs/dir-key/v1";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed — wrong key or corrupted data")]
    DecryptionFailed,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encrypted payload too short (minimum {NONCE_LEN} bytes)")]
    TooShort,
}

/// Derive a 256-bit master key from a password and a salt using Argon2id.
///
/// `salt` should be unique per deployment (or per user index) so the same
/// password yields unrelated keys across installations.
pub fn derive_master_key(password: &str, salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(64 * 1024, 3, 1, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Derive the subkey for one directory from the master key and the
/// directory's path.
///
/// HKDF-SHA256 with a fixed context salt and the path as info: deterministic
/// per directory, unlinkable across directories.
pub fn derive_directory_key(master_key: &[u8; 32], dir_path: &str) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(DIR_KEY_CONTEXT), master_key);
    let mut key = [0u8; 32];
    hk.expand(dir_path.as_bytes(), &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Encrypt `plaintext` with AES-256-GCM using a fresh random nonce.
///
/// Returns `nonce (12 B) || ciphertext || GCM-tag (16 B)`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an AES-256-GCM payload produced by [`encrypt`].
///
/// Input must start with the 12-byte nonce followed by ciphertext + GCM tag;
/// the tag authenticates the ciphertext, so tampering fails here.
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::TooShort);
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce = aes_gcm::Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &data[NONCE_LEN..])
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt a filename under its directory key.
pub fn encrypt_filename(name: &str, dir_key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    encrypt(dir_key, name.as_bytes())
}

/// Recover a filename encrypted with [`encrypt_filename`].
///
/// Fails on authentication failure or when the plaintext is not UTF-8.
pub fn decrypt_filename(ciphertext: &[u8], dir_key: &[u8; 32]) -> Result<String, CryptoError> {
    let plain = decrypt(dir_key, ciphertext)?;
    String::from_utf8(plain).map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        let payload = b"manifest bytes";
        let sealed = encrypt(&key, payload).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], payload.as_slice());
        assert_eq!(decrypt(&key, &sealed).unwrap(), payload);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = encrypt(&[1u8; 32], b"secret").unwrap();
        assert!(matches!(
            decrypt(&[2u8; 32], &sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        assert!(matches!(decrypt(&[0u8; 32], &[1, 2, 3]), Err(CryptoError::TooShort)));
    }

    #[test]
    fn directory_keys_deterministic_and_distinct() {
        let master = [9u8; 32];
        let a1 = derive_directory_key(&master, "photos/2024");
        let a2 = derive_directory_key(&master, "photos/2024");
        let b = derive_directory_key(&master, "photos/2025");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_ne!(a1, master);
    }

    #[test]
    fn filename_encryption_randomized_but_reversible() {
        let key = derive_directory_key(&[3u8; 32], "docs");
        let c1 = encrypt_filename("report.pdf", &key).unwrap();
        let c2 = encrypt_filename("report.pdf", &key).unwrap();
        assert_ne!(c1, c2, "fresh nonce per call");
        assert_eq!(decrypt_filename(&c1, &key).unwrap(), "report.pdf");
        assert_eq!(decrypt_filename(&c2, &key).unwrap(), "report.pdf");
    }

    #[test]
    fn master_key_derivation_is_salted() {
        let k1 = derive_master_key("hunter2", b"salt-one-16bytes").unwrap();
        let k2 = derive_master_key("hunter2", b"salt-two-16bytes").unwrap();
        assert_ne!(k1, k2);
    }
}
