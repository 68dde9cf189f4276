//! # noisefs-core — anonymizing block engine for NoiseFS
//!
//! Engine guarantees:
//! - Every block is content-addressed: `id = hex(SHA-256(data))`, verified
//!   with a constant-time comparison over decoded bytes
//! - Blocks are uniform-size (128 KiB default) and zero-padded; the original
//!   length lives in the descriptor, never in the block
//! - Stored blocks are `data ⊕ r1 ⊕ r2` against two pooled randomizers; no
//!   stored block in isolation reveals user content, and the same operation
//!   reverses it on download
//! - Randomizers are shared across unrelated files — the universal pool is
//!   one anonymity set, and the reuse enforcer keeps uploads feeding it
//! - Directory trees become per-directory encrypted manifests: AES-256-GCM
//!   filenames under HKDF-derived subkeys, manifests under the master key
//! - Out-of-order download reassembly writes strictly sequentially;
//!   duplicates are rejected, gaps stall the writer without stalling intake
//! - Every enforcement decision is recorded in an append-only audit log

pub mod assembler;
pub mod audit;
pub mod block;
pub mod cancel;
pub mod codec;
pub mod crypto;
pub mod descriptor;
pub mod enforcer;
pub mod manifest;
pub mod perf;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod splitter;

// Flat re-exports for the most common types.
pub use assembler::{assemble, assemble_into, AssembleError, StreamingAssembler};
pub use audit::{AuditAction, AuditEntry, AuditLog, PolicyCheck};
pub use block::{content_id, Block, BlockError, DEFAULT_BLOCK_SIZE};
pub use cancel::CancellationToken;
pub use codec::{decrypt_manifest, encrypt_manifest, open_manifest_block, seal_manifest_block,
                CodecError};
pub use crypto::{derive_directory_key, derive_master_key, CryptoError};
pub use descriptor::{BlockTriple, Descriptor};
pub use enforcer::{EnforcementLevel, EnforcerError, EnforcerStats, ReuseEnforcer, ReusePolicy,
                   ReuseProof, ValidationResult};
pub use manifest::{DirectoryEntry, DirectoryManifest, EntryType, ManifestSnapshot, SnapshotInfo,
                   MANIFEST_VERSION};
pub use pipeline::{BlockSink, FixedRandomizerProvider, PipelineError, PoolRandomizerProvider,
                   ProviderError, RandomizerProvider, SinkError, XorPipeline};
pub use pool::{BlockMeta, UniversalBlockPool};
pub use processor::{DirectoryBlockProcessor, DirectoryOutcome, DirectoryProcessor,
                    MemoryBoundedProcessor, ProcessError, ProcessReport, ProcessorConfig};
pub use splitter::{SplitError, SplitSummary, Splitter};
