//! Universal block pool — the process-local registry of reusable blocks.
//!
//! Every randomizer that has ever masked a file is a candidate to mask the
//! next one; the pool tracks those candidates by CID together with the
//! metadata the reuse enforcer cares about: usage count, a bounded
//! popularity score, and a public-domain flag.  The pool owns the canonical
//! copy of each reusable block.
//!
//! Popularity is `min(1, ln(1 + usage) / ln(1 + K))` with `K` = 1000 — a
//! bounded, monotonically non-decreasing function of usage, so a block can
//! only ever become a better anonymity-set member.
//!
//! Read-heavy: lookups take a shared lock, writers serialize on the same
//! `RwLock`, and no lock is ever held across hashing (integrity is checked
//! before acquisition).  There is no process-global pool — callers construct
//! one and pass it explicitly to whatever shares it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::block::{Block, BlockError};

/// Calibration constant `K`: usage count at which popularity saturates at 1.
const POPULARITY_CALIBRATION: f64 = 1000.0;

/// Popularity threshold above which a block counts as popular.
pub const POPULAR_THRESHOLD: f64 = 0.5;

// ── Entries ──────────────────────────────────────────────────────────────────

/// A pooled block plus its reuse metadata.
#[derive(Debug, Clone)]
struct UniversalBlock {
    block:            Block,
    usage_count:      u64,
    popularity_score: f64,
    created_at:       DateTime<Utc>,
    is_public_domain: bool,
}

/// Copy of one pooled block's metadata, as consumed by the reuse enforcer.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMeta {
    pub usage_count:      u64,
    pub popularity_score: f64,
    pub is_public_domain: bool,
    pub created_at:       DateTime<Utc>,
}

// ── Pool ─────────────────────────────────────────────────────────────────────

/// Registry of reusable blocks keyed by CID.
#[derive(Debug, Default)]
pub struct UniversalBlockPool {
    blocks: RwLock<HashMap<String, UniversalBlock>>,
}

impl UniversalBlockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block, idempotently by CID.
    ///
    /// Returns `true` when the block was new.  An existing entry is left
    /// untouched — in particular its usage and public-domain status.  The
    /// block's integrity is verified before insertion; a corrupt block never
    /// enters the pool.
    pub fn register(&self, block: Block, is_public_domain: bool) -> Result<bool, BlockError> {
        block.ensure_integrity()?;
        let cid = block.id().to_string();

        let mut blocks = self.blocks.write();
        if blocks.contains_key(&cid) {
            return Ok(false);
        }
        debug!(%cid, is_public_domain, "block registered in universal pool");
        blocks.insert(
            cid,
            UniversalBlock {
                block,
                usage_count:      0,
                popularity_score: 0.0,
                created_at:       Utc::now(),
                is_public_domain,
            },
        );
        Ok(true)
    }

    /// Record one use of `cid`, bumping its popularity.  Returns `false`
    /// when the CID is unknown.
    pub fn touch(&self, cid: &str) -> bool {
        let mut blocks = self.blocks.write();
        match blocks.get_mut(cid) {
            Some(entry) => {
                entry.usage_count += 1;
                entry.popularity_score = popularity(entry.usage_count);
                true
            }
            None => false,
        }
    }

    pub fn is_known(&self, cid: &str) -> bool {
        self.blocks.read().contains_key(cid)
    }

    pub fn is_public_domain(&self, cid: &str) -> bool {
        self.blocks
            .read()
            .get(cid)
            .is_some_and(|e| e.is_public_domain)
    }

    pub fn is_popular(&self, cid: &str) -> bool {
        self.blocks
            .read()
            .get(cid)
            .is_some_and(|e| e.popularity_score > POPULAR_THRESHOLD)
    }

    /// Copy of the block payload for `cid`, if pooled.
    pub fn get(&self, cid: &str) -> Option<Block> {
        self.blocks.read().get(cid).map(|e| e.block.clone())
    }

    /// Metadata snapshot for `cid`, if pooled.
    pub fn meta(&self, cid: &str) -> Option<BlockMeta> {
        self.blocks.read().get(cid).map(|e| BlockMeta {
            usage_count:      e.usage_count,
            popularity_score: e.popularity_score,
            is_public_domain: e.is_public_domain,
            created_at:       e.created_at,
        })
    }

    /// Up to `limit` blocks of exactly `block_size`, most popular first.
    ///
    /// Ties (including the fresh-pool all-zero case) break on CID so the
    /// ordering is deterministic.
    pub fn popular_blocks(&self, block_size: usize, limit: usize) -> Vec<Block> {
        let blocks = self.blocks.read();
        let mut candidates: Vec<(&String, &UniversalBlock)> = blocks
            .iter()
            .filter(|(_, e)| e.block.size() == block_size)
            .collect();
        candidates.sort_by(|(cid_a, a), (cid_b, b)| {
            b.popularity_score
                .partial_cmp(&a.popularity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| cid_a.cmp(cid_b))
        });
        candidates
            .into_iter()
            .take(limit)
            .map(|(_, e)| e.block.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

fn popularity(usage_count: u64) -> f64 {
    let raw = ((1 + usage_count) as f64).ln() / (1.0 + POPULARITY_CALIBRATION).ln();
    raw.min(1.0)
}

// ── Tests ────────────────────────────────────────────────────────────────────
