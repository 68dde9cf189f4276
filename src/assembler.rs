//! Assembler — sequential and out-of-order block reconstruction.
//!
//! Download is the mirror of upload: the store hands back anonymized blocks
//! (de-anonymized by the XOR pipeline) in whatever order the network
//! delivers them, and the assembler turns them back into a contiguous byte
//! stream.  Two modes:
//!
//! - Buffered ([`assemble`], [`assemble_into`]): the caller already holds an
//!   in-order block list.
//! - Streaming ([`StreamingAssembler`]): `(index, block)` arrivals in any
//!   order; the assembler owns the writer and a sparse buffer, and writes
//!   strictly in index order.  A missing block stalls the writer without
//!   blocking further arrivals — that is the backpressure seam.
//!
//! The assembler writes padded block data verbatim; trimming the zero
//! padding back to the original file length is the caller's job (the length
//! lives in the descriptor).

use std::collections::BTreeMap;
use std::io::{self, Write};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::block::Block;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("no blocks to assemble")]
    EmptyInput,
    #[error("duplicate block index {0}")]
    Duplicate(u64),
    #[error("assembly is already complete")]
    Complete,
    #[error("expected total may only be set once")]
    TotalAlreadySet,
    #[error("write failed: {0}")]
    Write(#[from] io::Error),
}

// ── Buffered mode ────────────────────────────────────────────────────────────

/// Concatenate an in-order block list into a contiguous buffer.
///
/// Fails with [`AssembleError::EmptyInput`] on an empty list.
pub fn assemble(blocks: &[Block]) -> Result<Vec<u8>, AssembleError> {
    if blocks.is_empty() {
        return Err(AssembleError::EmptyInput);
    }
    let total: usize = blocks.iter().map(Block::size).sum();
    let mut out = Vec::with_capacity(total);
    for block in blocks {
        out.extend_from_slice(block.data());
    }
    Ok(out)
}

/// Write an in-order block list to `writer`.  Returns bytes written.
pub fn assemble_into<W: Write>(blocks: &[Block], mut writer: W) -> Result<u64, AssembleError> {
    if blocks.is_empty() {
        return Err(AssembleError::EmptyInput);
    }
    let mut written = 0u64;
    for block in blocks {
        writer.write_all(block.data())?;
        written += block.size() as u64;
    }
    Ok(written)
}

// ── Streaming mode ───────────────────────────────────────────────────────────

struct AssemblerState<W> {
    writer:         W,
    next_index:     u64,
    written:        u64,
    expected_total: Option<u64>,
    buffer:         BTreeMap<u64, Block>,
    complete:       bool,
}

/// Out-of-order reassembly with strictly sequential writes.
///
/// Internally synchronized: concurrent fetchers may call
/// [`add_block`](Self::add_block) from multiple threads.  Bytes reach the
/// writer in strictly increasing index order; arrivals ahead of a gap are
/// buffered until their predecessors land.
pub struct StreamingAssembler<W> {
    state: Mutex<AssemblerState<W>>,
}

impl<W: Write> StreamingAssembler<W> {
    pub fn new(writer: W) -> Self {
        Self {
            state: Mutex::new(AssemblerState {
                writer,
                next_index:     0,
                written:        0,
                expected_total: None,
                buffer:         BTreeMap::new(),
                complete:       false,
            }),
        }
    }

    /// Shorthand for [`new`](Self::new) followed by
    /// [`set_total`](Self::set_total).
    pub fn with_total(writer: W, total: u64) -> Self {
        let assembler = Self::new(writer);
        assembler.state.lock().expected_total = Some(total);
        assembler
    }

    /// Declare the expected block count.  May be called once; assembly
    /// transitions to complete as soon as that many blocks are written.
    pub fn set_total(&self, total: u64) -> Result<(), AssembleError> {
        let mut state = self.state.lock();
        if state.expected_total.is_some() {
            return Err(AssembleError::TotalAlreadySet);
        }
        state.expected_total = Some(total);
        if total > 0 && state.written >= total {
            state.complete = true;
        }
        Ok(())
    }

    /// Accept `(index, block)`, draining any now-contiguous run to the writer.
    ///
    /// Fails with [`AssembleError::Duplicate`] when `index` was already
    /// delivered (buffered or written) and [`AssembleError::Complete`] after
    /// the assembly finished.
    pub fn add_block(&self, index: u64, block: Block) -> Result<(), AssembleError> {
        let mut state = self.state.lock();
        if state.complete {
            return Err(AssembleError::Complete);
        }
        if index < state.next_index || state.buffer.contains_key(&index) {
            return Err(AssembleError::Duplicate(index));
        }

        state.buffer.insert(index, block);

        // Drain the contiguous prefix.
        loop {
            let head = state.next_index;
            let Some(next) = state.buffer.remove(&head) else { break };
            state.writer.write_all(next.data())?;
            trace!(index = head, "block drained to writer");
            state.next_index += 1;
            state.written += 1;
        }

        if let Some(total) = state.expected_total {
            if total > 0 && state.written >= total {
                state.complete = true;
            }
        }
        Ok(())
    }

    /// Flush whatever remains and mark the assembly complete.
    ///
    /// A no-op when already complete.  Otherwise the remaining buffered
    /// blocks are written in ascending index order — the caller is
    /// responsible for having validated completeness if gaps matter.
    pub fn finalize(&self) -> Result<(), AssembleError> {
        let mut state = self.state.lock();
        if state.complete {
            return Ok(());
        }
        let leftovers = std::mem::take(&mut state.buffer);
        for (index, block) in leftovers {
            state.writer.write_all(block.data())?;
            trace!(index, "block flushed during finalize");
            state.written += 1;
        }
        state.complete = true;
        state.writer.flush()?;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Blocks written to the underlying writer so far.
    pub fn written(&self) -> u64 {
        self.state.lock().written
    }

    /// Blocks parked while waiting for their predecessors.
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Tear down, returning the writer.
    pub fn into_writer(self) -> W {
        self.state.into_inner().writer
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
