//! Splitter — pad-and-chunk a byte source into uniform blocks.
//!
//! Every file becomes `⌈len / block_size⌉` blocks of exactly `block_size`
//! bytes; the final chunk is zero-padded.  The padding policy is absolute:
//! callers must retain the original file length (it lives in the descriptor)
//! to trim the padding on reassembly.  One fixed size across the whole
//! corpus is what makes the anonymity set a single pool instead of many.
//!
//! Three variants:
//! - [`Splitter::split_bytes`] — buffered, whole input in memory.
//! - [`Splitter::split`] — drain an `io::Read`, collecting blocks.
//! - [`Splitter::split_stream`] — never holds more than one block; feeds a
//!   [`BlockSink`], polls a [`CancellationToken`] between blocks, and
//!   reports `(bytes, blocks)` progress.

use std::io::{self, Read};

use thiserror::Error;
use tracing::debug;

use crate::block::{Block, BlockError, DEFAULT_BLOCK_SIZE};
use crate::cancel::CancellationToken;
use crate::pipeline::{BlockSink, SinkError};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("input must not be empty")]
    EmptyData,
    #[error("invalid block size {0} (must be > 0)")]
    BadSize(usize),
    #[error("split cancelled")]
    Cancelled,
    #[error("read failed: {0}")]
    Read(#[from] io::Error),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("block sink failed: {0}")]
    Sink(#[source] SinkError),
}

// ── Progress ─────────────────────────────────────────────────────────────────

/// Byte/block counters reported by the streaming splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplitSummary {
    pub bytes_processed:  u64,
    pub blocks_processed: u64,
}

/// Progress callback: `(bytes_processed, blocks_processed)` after each block.
pub type SplitProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

// ── Splitter ─────────────────────────────────────────────────────────────────

/// Fixed-size block splitter.  One configuration knob: the block size.
#[derive(Debug, Clone, Copy)]
pub struct Splitter {
    block_size: usize,
}

impl Default for Splitter {
    fn default() -> Self {
        Self { block_size: DEFAULT_BLOCK_SIZE }
    }
}

impl Splitter {
    /// Fails with [`SplitError::BadSize`] when `block_size == 0`.
    pub fn new(block_size: usize) -> Result<Self, SplitError> {
        if block_size == 0 {
            return Err(SplitError::BadSize(block_size));
        }
        Ok(Self { block_size })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Partition `data` into `⌈len / block_size⌉` blocks, zero-padding the
    /// final chunk.  Every returned block has `size() == block_size`.
    ///
    /// Fails with [`SplitError::EmptyData`] on zero-length input.
    pub fn split_bytes(&self, data: &[u8]) -> Result<Vec<Block>, SplitError> {
        if data.is_empty() {
            return Err(SplitError::EmptyData);
        }

        let mut blocks = Vec::with_capacity(data.len().div_ceil(self.block_size));
        for chunk in data.chunks(self.block_size) {
            let mut buf = vec![0u8; self.block_size];
            buf[..chunk.len()].copy_from_slice(chunk);
            blocks.push(Block::new(buf)?);
        }
        Ok(blocks)
    }

    /// Drain `reader`, emitting one padded block per `block_size` bytes read.
    ///
    /// An empty stream yields zero blocks.  Read errors propagate.  For any
    /// reader materializing bytes `d`, the result is bit-identical to
    /// `split_bytes(d)`.
    pub fn split<R: Read>(&self, mut reader: R) -> Result<Vec<Block>, SplitError> {
        let mut blocks = Vec::new();
        loop {
            // A fresh zeroed buffer per block: the unread suffix is the padding.
            let mut buf = vec![0u8; self.block_size];
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            blocks.push(Block::new(buf)?);
        }
        Ok(blocks)
    }

    /// Streaming split: never buffers more than one block.
    ///
    /// After each block is read it (a) polls `cancel` and aborts with
    /// [`SplitError::Cancelled`] if requested, (b) hands `(index, block)` to
    /// `sink`, (c) reports `(bytes, blocks)` to `progress`.  Indices are
    /// assigned sequentially from 0.
    pub fn split_stream<R: Read, S: BlockSink + ?Sized>(
        &self,
        mut reader: R,
        sink: &mut S,
        cancel: Option<&CancellationToken>,
        mut progress: Option<&mut SplitProgressFn<'_>>,
    ) -> Result<SplitSummary, SplitError> {
        let mut summary = SplitSummary::default();
        let mut index = 0u64;

        loop {
            let mut buf = vec![0u8; self.block_size];
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }

            if cancel.is_some_and(|c| c.is_cancelled()) {
                debug!(blocks = summary.blocks_processed, "streaming split cancelled");
                return Err(SplitError::Cancelled);
            }

            sink.process_block(index, Block::new(buf)?)
                .map_err(SplitError::Sink)?;

            summary.bytes_processed += n as u64;
            summary.blocks_processed += 1;
            if let Some(cb) = progress.as_deref_mut() {
                cb(summary.bytes_processed, summary.blocks_processed);
            }
            index += 1;
        }

        debug!(
            bytes = summary.bytes_processed,
            blocks = summary.blocks_processed,
            "streaming split complete"
        );
        Ok(summary)
    }
}

/// Fill `buf` from `reader` until full or EOF.  Returns bytes read.
///
/// A single `read` may return short mid-stream; looping here is what keeps
/// the reader-based variants bit-identical to `split_bytes`.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Tests ────────────────────────────────────────────────────────────────────
