//! Block model — fixed-size, immutable, content-addressed.
//!
//! Every block is identified by the lowercase hex of SHA-256 over its data.
//! The ID doubles as the CAS key in the external store and as the handle the
//! universal pool and the reuse enforcer track.  Blocks never change after
//! construction; all combinators return fresh blocks.
//!
//! # Anonymization primitive
//!
//! [`Block::xor`] is the 3-tuple XOR at the heart of the engine:
//!
//! ```text
//! anon[i] = data[i] ^ r1[i] ^ r2[i]
//! ```
//!
//! XOR is an involution — applying the same operation with the same two
//! randomizers recovers the original data.  All three operands must have
//! identical length; the engine keeps every block at one uniform size so
//! that any randomizer can mask any data block.
//!
//! # Integrity
//!
//! [`Block::verify_integrity`] recomputes the SHA-256 digest and compares it
//! against the stored ID with a constant-time comparison.  Both hex strings
//! are decoded to raw bytes first: comparing the hex text directly would
//! short-circuit on the first differing character and leak a timing signal
//! when callers validate attacker-supplied IDs.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

// ── Constants ────────────────────────────────────────────────────────────────

/// Engine-wide default block size: 128 KiB.
///
/// Uniform across a deployment.  Changing it is a compatibility-breaking
/// configuration change: blocks of different sizes cannot mask each other,
/// so a mixed deployment splits the anonymity set.
pub const DEFAULT_BLOCK_SIZE: usize = 128 * 1024;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block data must not be empty")]
    EmptyData,
    #[error("invalid block size {0} (must be > 0)")]
    BadSize(usize),
    #[error("block size mismatch: {left} vs {right}")]
    SizeMismatch { left: usize, right: usize },
    #[error("block {id} failed integrity verification")]
    Integrity { id: String },
}

// ── Block ────────────────────────────────────────────────────────────────────

/// An immutable, content-addressed datum.
///
/// Fields are private: a block can only be produced by [`Block::new`] (which
/// computes the ID) or by combinators that go through it, so `id` and `data`
/// can never disagree by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    id:   String,
    data: Vec<u8>,
}

impl Block {
    /// Wrap `data` in a block, computing its content address.
    ///
    /// Fails with [`BlockError::EmptyData`] on empty input.
    pub fn new(data: Vec<u8>) -> Result<Self, BlockError> {
        if data.is_empty() {
            return Err(BlockError::EmptyData);
        }
        let id = content_id(&data);
        Ok(Self { id, data })
    }

    /// Create a block of `size` cryptographically secure random bytes.
    ///
    /// This is how fresh randomizer blocks are minted.  Fails with
    /// [`BlockError::BadSize`] when `size == 0`.
    pub fn new_random(size: usize) -> Result<Self, BlockError> {
        if size == 0 {
            return Err(BlockError::BadSize(size));
        }
        let mut data = vec![0u8; size];
        OsRng.fill_bytes(&mut data);
        Self::new(data)
    }

    /// 3-tuple XOR: returns a block whose byte `i` is
    /// `self[i] ^ r1[i] ^ r2[i]`.
    ///
    /// All three blocks must be the same size.  The operation is its own
    /// inverse: `b.xor(r1, r2)?.xor(r1, r2)? == b`.
    pub fn xor(&self, r1: &Block, r2: &Block) -> Result<Block, BlockError> {
        if self.data.len() != r1.data.len() {
            return Err(BlockError::SizeMismatch {
                left:  self.data.len(),
                right: r1.data.len(),
            });
        }
        if self.data.len() != r2.data.len() {
            return Err(BlockError::SizeMismatch {
                left:  self.data.len(),
                right: r2.data.len(),
            });
        }

        let data: Vec<u8> = self
            .data
            .iter()
            .zip(r1.data.iter())
            .zip(r2.data.iter())
            .map(|((a, b), c)| a ^ b ^ c)
            .collect();

        Block::new(data)
    }

    /// The hex SHA-256 content address.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Borrow the block payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the block, returning its payload.
    #[inline]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Payload length in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Recompute the digest and compare it to the stored ID in constant time.
    ///
    /// Both the stored and recomputed hex IDs are decoded to raw bytes before
    /// comparison; a decode failure or length mismatch returns `false`.
    /// Advisory: callers decide whether a `false` verdict is fatal.
    pub fn verify_integrity(&self) -> bool {
        let actual: [u8; 32] = Sha256::digest(&self.data).into();
        id_matches(&self.id, &actual)
    }

    /// `Result` form of [`verify_integrity`](Self::verify_integrity) for
    /// call sites that treat corruption as a hard failure.
    pub fn ensure_integrity(&self) -> Result<(), BlockError> {
        if self.verify_integrity() {
            Ok(())
        } else {
            Err(BlockError::Integrity { id: self.id.clone() })
        }
    }

    /// Constant-time comparison of this block's ID against a caller-supplied
    /// hex ID.  Malformed input compares unequal.
    pub fn id_eq(&self, other_id: &str) -> bool {
        match (hex::decode(self.id.as_bytes()), hex::decode(other_id.as_bytes())) {
            (Ok(own), Ok(theirs)) if own.len() == theirs.len() => own.ct_eq(&theirs).into(),
            _ => false,
        }
    }
}

/// Lowercase hex SHA-256 of `data` — the canonical block ID.
pub fn content_id(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Decode `stored_hex` and compare against `digest` without short-circuiting.
fn id_matches(stored_hex: &str, digest: &[u8; 32]) -> bool {
    match hex::decode(stored_hex.as_bytes()) {
        Ok(stored) if stored.len() == digest.len() => stored.ct_eq(digest).into(),
        _ => false,
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
