//! Batch anonymization — parallel 3-tuple XOR over independent blocks.
//!
//! Each data block XORs against its own randomizer pair with no shared
//! state, so the work parallelizes embarrassingly well.  With the
//! `parallel` feature the batch fans out over Rayon's global pool; without
//! it the same loop runs sequentially.  Results come back index-tagged in
//! input order either way, and the first error aborts the batch.
//!
//! This is the bulk path for re-anonymizing a whole file at once (e.g. a
//! block-size migration or a randomizer rotation); the streaming path in
//! [`pipeline`](crate::pipeline) stays single-block for bounded memory.

use thiserror::Error;

use crate::block::{Block, BlockError};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("randomizer pair count {pairs} does not match block count {blocks}")]
    PairCount { blocks: usize, pairs: usize },
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// One anonymized output block, tagged with its source index.
#[derive(Debug, Clone)]
pub struct AnonymizedBlock {
    pub index: u64,
    pub block: Block,
}

/// XOR every `blocks[i]` against `pairs[i]`, concurrently when the
/// `parallel` feature is enabled.
///
/// Returns one [`AnonymizedBlock`] per input, in input order.  If any
/// single XOR fails (size mismatch), the first error is returned and the
/// remaining work is abandoned.
pub fn anonymize_blocks(
    blocks: &[Block],
    pairs: &[(Block, Block)],
) -> Result<Vec<AnonymizedBlock>, BatchError> {
    if blocks.len() != pairs.len() {
        return Err(BatchError::PairCount { blocks: blocks.len(), pairs: pairs.len() });
    }

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        let results: Vec<Result<AnonymizedBlock, BatchError>> = blocks
            .par_iter()
            .zip(pairs.par_iter())
            .enumerate()
            .map(|(i, (block, (r1, r2)))| {
                Ok(AnonymizedBlock { index: i as u64, block: block.xor(r1, r2)? })
            })
            .collect();

        let mut out = Vec::with_capacity(blocks.len());
        for r in results {
            out.push(r?);
        }
        Ok(out)
    }

    #[cfg(not(feature = "parallel"))]
    {
        blocks
            .iter()
            .zip(pairs.iter())
            .enumerate()
            .map(|(i, (block, (r1, r2)))| {
                Ok(AnonymizedBlock { index: i as u64, block: block.xor(r1, r2)? })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(size: usize) -> (Block, Block) {
        (Block::new_random(size).unwrap(), Block::new_random(size).unwrap())
    }

    #[test]
    fn batch_matches_streaming_xor() {
        let blocks: Vec<Block> = (0..8).map(|_| Block::new_random(64).unwrap()).collect();
        let pairs: Vec<(Block, Block)> = (0..8).map(|_| pair(64)).collect();

        let batch = anonymize_blocks(&blocks, &pairs).unwrap();
        assert_eq!(batch.len(), 8);
        for (i, anon) in batch.iter().enumerate() {
            assert_eq!(anon.index, i as u64);
            let expected = blocks[i].xor(&pairs[i].0, &pairs[i].1).unwrap();
            assert_eq!(anon.block, expected);
        }
    }

    #[test]
    fn batch_is_reversible() {
        let blocks: Vec<Block> = (0..4).map(|_| Block::new_random(32).unwrap()).collect();
        let pairs: Vec<(Block, Block)> = (0..4).map(|_| pair(32)).collect();

        let masked: Vec<Block> = anonymize_blocks(&blocks, &pairs)
            .unwrap()
            .into_iter()
            .map(|a| a.block)
            .collect();
        let unmasked = anonymize_blocks(&masked, &pairs).unwrap();
        for (got, want) in unmasked.iter().zip(&blocks) {
            assert_eq!(&got.block, want);
        }
    }

    #[test]
    fn mismatched_pair_count_rejected() {
        let blocks = vec![Block::new_random(16).unwrap()];
        assert!(matches!(
            anonymize_blocks(&blocks, &[]),
            Err(BatchError::PairCount { blocks: 1, pairs: 0 })
        ));
    }

    #[test]
    fn size_mismatch_propagates() {
        let blocks = vec![Block::new_random(16).unwrap()];
        let pairs = vec![pair(8)];
        assert!(matches!(
            anonymize_blocks(&blocks, &pairs),
            Err(BatchError::Block(BlockError::SizeMismatch { .. }))
        ));
    }
}
