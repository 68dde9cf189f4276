//! XOR pipeline — block-processor middleware and randomizer supply.
//!
//! The pipeline sits between the splitter and the external store: for each
//! `(index, block)` it obtains a pair of randomizer blocks from its
//! [`RandomizerProvider`], computes `block ^ r1 ^ r2`, and forwards the
//! anonymized result downstream.  Because XOR is an involution the same
//! middleware de-anonymizes on download: feed it the stored blocks with the
//! same provider and the original plaintext blocks come out.
//!
//! Randomizer reuse across unrelated files is the point of the design — it
//! is both the anonymity set and the storage amortization.  The pool-backed
//! provider prefers popular blocks from the [`UniversalBlockPool`] and mints
//! fresh random blocks (registering them for future reuse) only when the
//! pool cannot supply a pair.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::block::{Block, BlockError};
use crate::pool::UniversalBlockPool;

// ── Sink contract ────────────────────────────────────────────────────────────

/// Downstream failure type.  Sinks are externally implemented (the store
/// adapter, a test collector), so the error is opaque to the engine.
pub type SinkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Consumer of a single file's block stream, in index order.
pub trait BlockSink {
    fn process_block(&mut self, index: u64, block: Block) -> Result<(), SinkError>;
}

/// Any `FnMut(u64, Block)` closure is a sink.
impl<F> BlockSink for F
where
    F: FnMut(u64, Block) -> Result<(), SinkError>,
{
    fn process_block(&mut self, index: u64, block: Block) -> Result<(), SinkError> {
        self(index, block)
    }
}

/// Sink that collects `(index, block)` pairs in memory.  Handy as the tail
/// of a pipeline in tests and small callers.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub blocks: Vec<(u64, Block)>,
}

impl BlockSink for CollectSink {
    fn process_block(&mut self, index: u64, block: Block) -> Result<(), SinkError> {
        self.blocks.push((index, block));
        Ok(())
    }
}

// ── Randomizer provider ──────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ProviderError {
    /// The pool could not supply a same-size randomizer pair and the
    /// provider is configured not to mint new blocks.
    #[error("universal pool has no randomizer pair of size {block_size}")]
    PoolExhausted { block_size: usize },
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Supplies two randomizer blocks per data-block index.
///
/// For a given upload, `randomizers(index)` must be deterministic — the
/// descriptor records the pair's CIDs and download re-requests them from the
/// store, so repeated calls during one upload must agree.  The two blocks
/// need not differ from each other, but an identical pair degenerates the
/// 3-tuple XOR into a single-randomizer XOR.
pub trait RandomizerProvider {
    fn randomizers(&mut self, index: u64) -> Result<(Block, Block), ProviderError>;
}

/// Simplest provider: one fixed pair for every index.
///
/// The caller owns the distinctness decision; supplying `r1 == r2` is
/// accepted and weakens the masking to a single XOR.
#[derive(Debug, Clone)]
pub struct FixedRandomizerProvider {
    r1: Block,
    r2: Block,
}

impl FixedRandomizerProvider {
    pub fn new(r1: Block, r2: Block) -> Self {
        Self { r1, r2 }
    }

    /// Mint a fresh random pair of the given size.
    pub fn random(block_size: usize) -> Result<Self, BlockError> {
        Ok(Self {
            r1: Block::new_random(block_size)?,
            r2: Block::new_random(block_size)?,
        })
    }
}

impl RandomizerProvider for FixedRandomizerProvider {
    fn randomizers(&mut self, _index: u64) -> Result<(Block, Block), ProviderError> {
        Ok((self.r1.clone(), self.r2.clone()))
    }
}

/// Pool-backed provider: prefers popular blocks, mints and registers fresh
/// ones when the pool is thin.
///
/// Pairs are cached per index so the selection is stable within one upload,
/// and an identical pair is never handed out for a single index.
pub struct PoolRandomizerProvider {
    pool:       Arc<UniversalBlockPool>,
    block_size: usize,
    /// When false, a thin pool is an error instead of a generation trigger.
    generate:   bool,
    cache:      HashMap<u64, (Block, Block)>,
}

/// How many top-popularity candidates the provider rotates through.
const CANDIDATE_WINDOW: usize = 16;

impl PoolRandomizerProvider {
    pub fn new(pool: Arc<UniversalBlockPool>, block_size: usize) -> Self {
        Self { pool, block_size, generate: true, cache: HashMap::new() }
    }

    /// Disable minting: the provider only ever serves existing pool blocks.
    pub fn reuse_only(mut self) -> Self {
        self.generate = false;
        self
    }

    fn mint(&self) -> Result<Block, ProviderError> {
        let block = Block::new_random(self.block_size)?;
        self.pool.register(block.clone(), false)?;
        Ok(block)
    }

    fn select_pair(&mut self, index: u64) -> Result<(Block, Block), ProviderError> {
        let candidates = self.pool.popular_blocks(self.block_size, CANDIDATE_WINDOW);

        // Rotate through the candidate window by index so consecutive data
        // blocks of one file draw different randomizers.
        let pick = |offset: u64| -> Option<Block> {
            if candidates.is_empty() {
                return None;
            }
            let i = ((index.wrapping_mul(2).wrapping_add(offset)) % candidates.len() as u64)
                as usize;
            Some(candidates[i].clone())
        };

        let r1 = match pick(0) {
            Some(b) => b,
            None if self.generate => self.mint()?,
            None => return Err(ProviderError::PoolExhausted { block_size: self.block_size }),
        };

        let mut r2 = match pick(1) {
            Some(b) if !b.id_eq(r1.id()) => b,
            _ if self.generate => self.mint()?,
            Some(_) | None => {
                return Err(ProviderError::PoolExhausted { block_size: self.block_size })
            }
        };

        // A freshly minted block colliding with r1 is astronomically unlikely
        // but cheap to rule out.
        while r2.id_eq(r1.id()) {
            r2 = self.mint()?;
        }

        self.pool.touch(r1.id());
        self.pool.touch(r2.id());
        Ok((r1, r2))
    }
}

impl RandomizerProvider for PoolRandomizerProvider {
    fn randomizers(&mut self, index: u64) -> Result<(Block, Block), ProviderError> {
        if let Some(pair) = self.cache.get(&index) {
            return Ok(pair.clone());
        }
        let pair = self.select_pair(index)?;
        self.cache.insert(index, pair.clone());
        Ok(pair)
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("randomizer provider failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("randomizer size {got} does not match block size {expected}")]
    RandomizerSize { expected: usize, got: usize },
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("downstream sink failed: {0}")]
    Sink(#[source] SinkError),
}

/// Middleware sink: XORs each incoming block against a provider-supplied
/// randomizer pair and forwards the result downstream.
///
/// Wire it as the sink of [`Splitter::split_stream`] for upload, or feed it
/// stored blocks to recover plaintext on download.
///
/// [`Splitter::split_stream`]: crate::splitter::Splitter::split_stream
pub struct XorPipeline<P, S> {
    provider:   P,
    downstream: S,
    block_size: usize,
}

impl<P: RandomizerProvider, S: BlockSink> XorPipeline<P, S> {
    pub fn new(provider: P, downstream: S, block_size: usize) -> Self {
        Self { provider, downstream, block_size }
    }

    /// Tear down the pipeline, returning the downstream sink.
    pub fn into_downstream(self) -> S {
        self.downstream
    }

    /// Tear down the pipeline, returning provider and sink.  The provider's
    /// per-index pairs are what descriptor construction records.
    pub fn into_parts(self) -> (P, S) {
        (self.provider, self.downstream)
    }

    fn anonymize(&mut self, index: u64, block: Block) -> Result<(), PipelineError> {
        let (r1, r2) = self.provider.randomizers(index)?;
        for r in [&r1, &r2] {
            if r.size() != self.block_size {
                return Err(PipelineError::RandomizerSize {
                    expected: self.block_size,
                    got:      r.size(),
                });
            }
        }

        let anon = block.xor(&r1, &r2)?;
        trace!(index, id = anon.id(), "block anonymized");
        self.downstream
            .process_block(index, anon)
            .map_err(PipelineError::Sink)
    }
}

impl<P: RandomizerProvider, S: BlockSink> BlockSink for XorPipeline<P, S> {
    fn process_block(&mut self, index: u64, block: Block) -> Result<(), SinkError> {
        self.anonymize(index, block).map_err(Into::into)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
