//! Manifest codec — serialize, encrypt, and block-wrap directory manifests.
//!
//! The pipeline is: detached snapshot → JSON document → AES-256-GCM under
//! the master key → length-prefixed, zero-padded single [`Block`].
//!
//! The stored block obeys the same uniform-size rule as file data, so a
//! manifest block is indistinguishable from any other block in the store.
//! Because zero padding would otherwise be ambiguous, the ciphertext is
//! framed with a little-endian u64 length prefix before padding; `open`
//! reads the prefix, slices the ciphertext, and decrypts.  The GCM tag
//! authenticates the ciphertext, so any tampering surfaces as a
//! decryption failure rather than garbage entries.

use thiserror::Error;

use crate::block::{Block, BlockError};
use crate::crypto::{self, CryptoError};
use crate::manifest::{DirectoryManifest, ManifestSnapshot};

/// Bytes of the little-endian ciphertext length prefix inside a manifest block.
const LEN_PREFIX: usize = 8;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("manifest serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("invalid block size {0} (must be > 0)")]
    BadSize(usize),
    #[error("manifest block malformed: {0}")]
    Malformed(&'static str),
}

/// Serialize a detached snapshot of `manifest` and encrypt it under
/// `master_key`.  Output layout is the crypto module's nonce-prepended form.
pub fn encrypt_manifest(
    manifest: &DirectoryManifest,
    master_key: &[u8; 32],
) -> Result<Vec<u8>, CodecError> {
    let snapshot = manifest.snapshot();
    let document = serde_json::to_vec(&snapshot)?;
    Ok(crypto::encrypt(master_key, &document)?)
}

/// Inverse of [`encrypt_manifest`].  Fails on authentication failure or a
/// document that does not parse as a manifest.
pub fn decrypt_manifest(
    ciphertext: &[u8],
    master_key: &[u8; 32],
) -> Result<DirectoryManifest, CodecError> {
    let document = crypto::decrypt(master_key, ciphertext)?;
    let snapshot: ManifestSnapshot = serde_json::from_slice(&document)?;
    Ok(DirectoryManifest::from_snapshot(snapshot))
}

/// Encrypt `manifest` and wrap it as a single block padded to a multiple of
/// `block_size`.
pub fn seal_manifest_block(
    manifest: &DirectoryManifest,
    master_key: &[u8; 32],
    block_size: usize,
) -> Result<Block, CodecError> {
    if block_size == 0 {
        return Err(CodecError::BadSize(block_size));
    }

    let ciphertext = encrypt_manifest(manifest, master_key)?;
    let framed = LEN_PREFIX + ciphertext.len();
    let padded = framed.div_ceil(block_size) * block_size;

    let mut buf = Vec::with_capacity(padded);
    buf.extend_from_slice(&(ciphertext.len() as u64).to_le_bytes());
    buf.extend_from_slice(&ciphertext);
    buf.resize(padded, 0u8);

    Ok(Block::new(buf)?)
}

/// Recover a manifest from a block produced by [`seal_manifest_block`].
pub fn open_manifest_block(
    block: &Block,
    master_key: &[u8; 32],
) -> Result<DirectoryManifest, CodecError> {
    let data = block.data();
    if data.len() < LEN_PREFIX {
        return Err(CodecError::Malformed("shorter than the length prefix"));
    }
    let len = u64::from_le_bytes(data[..LEN_PREFIX].try_into().unwrap()) as usize;
    let end = LEN_PREFIX
        .checked_add(len)
        .ok_or(CodecError::Malformed("length prefix overflows"))?;
    if end > data.len() {
        return Err(CodecError::Malformed("length prefix exceeds block size"));
    }
    decrypt_manifest(&data[LEN_PREFIX..end], master_key)
}

// ── Tests ────────────────────────────────────────────────────────────────────
