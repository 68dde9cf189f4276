//! Upload descriptor — the per-file record of block triplets.
//!
//! Produced by the external upload layer, consumed read-only here: the
//! reuse enforcer extracts the CID set from it, and reassembly uses
//! `file_size` to trim the zero padding.  The serialized form is a
//! self-describing JSON document; this module only reads the triples and
//! the file metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One data block with the pair of randomizers that masked it.
///
/// `randomizer2_cid` is optional on the wire for compatibility with
/// single-randomizer descriptors; the engine always writes both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTriple {
    pub data_cid:        String,
    pub randomizer1_cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub randomizer2_cid: Option<String>,
}

/// Ordered list of triplets plus the file metadata reassembly needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub filename:   String,
    pub file_size:  u64,
    pub block_size: u64,
    pub created_at: DateTime<Utc>,
    pub blocks:     Vec<BlockTriple>,
}

impl Descriptor {
    pub fn new(filename: String, file_size: u64, block_size: u64) -> Self {
        Self {
            filename,
            file_size,
            block_size,
            created_at: Utc::now(),
            blocks: Vec::new(),
        }
    }

    /// Append one `(data, r1, r2)` triplet, in block-index order.
    pub fn push_triple(&mut self, data_cid: String, r1_cid: String, r2_cid: String) {
        self.blocks.push(BlockTriple {
            data_cid,
            randomizer1_cid: r1_cid,
            randomizer2_cid: Some(r2_cid),
        });
    }

    /// Every referenced CID — data and randomizers — deduplicated with
    /// first-occurrence order preserved.
    pub fn referenced_cids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut push = |cid: &str| {
            if !cid.is_empty() && seen.insert(cid.to_string()) {
                out.push(cid.to_string());
            }
        };
        for triple in &self.blocks {
            push(&triple.data_cid);
            push(&triple.randomizer1_cid);
            if let Some(r2) = &triple.randomizer2_cid {
                push(r2);
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
