//! Directory processor — concurrent traversal into encrypted manifests.
//!
//! # Phases
//!
//! 1. **Size phase**: one cheap walk counting files and bytes so progress
//!    has a denominator.
//! 2. **Process phase**: recursive descent on the calling thread.  Every
//!    file is streamed through the splitter on its own worker thread,
//!    bounded by a semaphore of `max_workers`; every subdirectory is
//!    processed to completion first so its manifest CID is known before the
//!    parent entry is written.  Filenames are encrypted under a subkey
//!    derived from the master key and the directory's path relative to the
//!    processing root.
//! 3. **Completion**: workers drain, the result channel closes, the
//!    collector hands back per-directory outcomes and accumulated errors.
//!
//! # Error routing
//!
//! Per-path errors consult the configured error handler.  "Continue" records
//! the error in the report and skips the entry; "abort" (or no handler)
//! cancels all outstanding work and surfaces that first error.  Cancellation
//! itself surfaces as [`ProcessError::Cancelled`].
//!
//! # Sink contract
//!
//! [`DirectoryBlockProcessor`] returns CIDs: `finish_file` after a file's
//! last block, `process_manifest` for each sealed manifest block.  Because
//! file workers interleave freely, `process_block` carries the file path so
//! the sink can attribute blocks to files.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::{Block, DEFAULT_BLOCK_SIZE};
use crate::cancel::CancellationToken;
use crate::codec::{self, CodecError};
use crate::crypto::{self, CryptoError};
use crate::manifest::{DirectoryEntry, DirectoryManifest, EntryType, ManifestError};
use crate::pipeline::SinkError;
use crate::splitter::{SplitError, Splitter};

/// Worker-pool size used when the config leaves `max_workers` at 0.
pub const DEFAULT_MAX_WORKERS: usize = 10;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("directory processing cancelled")]
    Cancelled,
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("sink failed for {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: SinkError,
    },
    #[error("a file worker panicked")]
    WorkerPanic,
}

// ── Sink contract ────────────────────────────────────────────────────────────

/// Downstream consumer of the traversal: typically an adapter over the
/// external content-addressed store plus the per-file descriptor builder.
///
/// Within one file, `process_block` calls arrive in index order; across
/// files they interleave freely, hence the path argument.
pub trait DirectoryBlockProcessor: Send + Sync {
    /// One padded data block of `file_path`.
    fn process_block(&self, file_path: &Path, index: u64, block: Block) -> Result<(), SinkError>;

    /// Called once after the file's final block; returns the CID the store
    /// filed the whole file under (its descriptor CID).
    fn finish_file(&self, file_path: &Path, file_size: u64) -> Result<String, SinkError>;

    /// One sealed manifest block for `dir_path`; returns its CID.
    fn process_manifest(&self, dir_path: &Path, manifest_block: Block) -> Result<String, SinkError>;
}

// ── Configuration ────────────────────────────────────────────────────────────

/// `(processed_files, total_files, current_path)` after each file completes.
pub type ProgressFn = Arc<dyn Fn(u64, u64, &Path) + Send + Sync>;

/// Per-path error decision: `true` records the error and continues, `false`
/// aborts the traversal.
pub type ErrorHandlerFn = Arc<dyn Fn(&Path, &ProcessError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ProcessorConfig {
    /// Splitter block size; 0 means [`DEFAULT_BLOCK_SIZE`].
    pub block_size:    usize,
    /// Concurrent file-processing budget; 0 means [`DEFAULT_MAX_WORKERS`].
    pub max_workers:   usize,
    /// Master key for filename and manifest encryption.
    pub master_key:    [u8; 32],
    pub progress:      Option<ProgressFn>,
    pub error_handler: Option<ErrorHandlerFn>,
}

impl ProcessorConfig {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self {
            block_size:    DEFAULT_BLOCK_SIZE,
            max_workers:   DEFAULT_MAX_WORKERS,
            master_key,
            progress:      None,
            error_handler: None,
        }
    }
}

// ── Progress counters ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ProgressCounters {
    processed_files: AtomicU64,
    processed_bytes: AtomicU64,
    total_files:     AtomicU64,
    total_bytes:     AtomicU64,
}

// ── Results ──────────────────────────────────────────────────────────────────

/// One processed directory: its path, the CID of its sealed manifest, and
/// how many entries the manifest holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryOutcome {
    pub dir_path:     PathBuf,
    pub manifest_cid: String,
    pub entry_count:  usize,
}

/// Aggregate result of one traversal.
#[derive(Debug)]
pub struct ProcessReport {
    /// Per-directory outcomes; the processing root is always among them.
    pub outcomes:          Vec<DirectoryOutcome>,
    /// CID of the processing root's manifest.
    pub root_manifest_cid: String,
    /// Errors the error handler chose to continue past.
    pub errors:            Vec<(PathBuf, ProcessError)>,
    pub processed_files:   u64,
    pub processed_bytes:   u64,
    pub total_files:       u64,
    pub total_bytes:       u64,
}

// ── Semaphore ────────────────────────────────────────────────────────────────

/// Counting semaphore bounding in-flight file workers.
#[derive(Debug)]
struct Semaphore {
    permits: Mutex<usize>,
    wakeup:  Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self { permits: Mutex::new(permits), wakeup: Condvar::new() }
    }

    fn acquire(self: &Arc<Self>) -> Permit {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.wakeup.wait(&mut permits);
        }
        *permits -= 1;
        Permit { semaphore: Arc::clone(self) }
    }
}

struct Permit {
    semaphore: Arc<Semaphore>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        *self.semaphore.permits.lock() += 1;
        self.semaphore.wakeup.notify_one();
    }
}

// ── Shared traversal state ───────────────────────────────────────────────────

struct Shared {
    sink:          Arc<dyn DirectoryBlockProcessor>,
    block_size:    usize,
    master_key:    [u8; 32],
    progress:      Option<ProgressFn>,
    error_handler: Option<ErrorHandlerFn>,
    cancel:        CancellationToken,
    semaphore:     Arc<Semaphore>,
    counters:      ProgressCounters,
    errors:        Mutex<Vec<(PathBuf, ProcessError)>>,
    /// First aborting error; its presence also triggers cancellation.
    fatal:         Mutex<Option<ProcessError>>,
}

impl Shared {
    /// Route a per-path error: record-and-continue if the handler says so,
    /// otherwise store it as the fatal error and cancel everything.
    /// Returns `true` when the traversal may continue.
    fn route_error(&self, path: &Path, err: ProcessError) -> bool {
        if matches!(err, ProcessError::Cancelled) {
            // Cancellation is not a per-path condition; it surfaces once,
            // from the walker.
            return false;
        }
        let keep_going = self
            .error_handler
            .as_ref()
            .is_some_and(|handler| handler(path, &err));
        if keep_going {
            warn!(path = %path.display(), error = %err, "continuing past error");
            self.errors.lock().push((path.to_path_buf(), err));
            true
        } else {
            warn!(path = %path.display(), error = %err, "aborting traversal");
            self.fatal.lock().get_or_insert(err);
            self.cancel.cancel();
            false
        }
    }
}

// ── DirectoryProcessor ───────────────────────────────────────────────────────

/// Recursive directory-to-manifest processor.
///
/// Single-use: a cancelled processor stays cancelled.  Construct one per
/// traversal.
pub struct DirectoryProcessor {
    config: ProcessorConfig,
    cancel: CancellationToken,
}

impl DirectoryProcessor {
    pub fn new(mut config: ProcessorConfig) -> Self {
        if config.block_size == 0 {
            config.block_size = DEFAULT_BLOCK_SIZE;
        }
        if config.max_workers == 0 {
            config.max_workers = DEFAULT_MAX_WORKERS;
        }
        Self { config, cancel: CancellationToken::new() }
    }

    /// Token for cancelling this traversal from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Walk `root`, streaming file blocks and sealed manifests into `sink`.
    pub fn process(
        &self,
        root: &Path,
        sink: Arc<dyn DirectoryBlockProcessor>,
    ) -> Result<ProcessReport, ProcessError> {
        let shared = Arc::new(Shared {
            sink,
            block_size:    self.config.block_size,
            master_key:    self.config.master_key,
            progress:      self.config.progress.clone(),
            error_handler: self.config.error_handler.clone(),
            cancel:        self.cancel.clone(),
            semaphore:     Arc::new(Semaphore::new(self.config.max_workers)),
            counters:      ProgressCounters::default(),
            errors:        Mutex::new(Vec::new()),
            fatal:         Mutex::new(None),
        });

        // Size phase.
        let (total_files, total_bytes) = measure_tree(root)?;
        shared.counters.total_files.store(total_files, Ordering::Relaxed);
        shared.counters.total_bytes.store(total_bytes, Ordering::Relaxed);
        info!(
            root = %root.display(),
            total_files,
            total_bytes,
            "directory traversal starting"
        );

        // Result collection runs concurrently with the traversal.
        let (tx, rx) = mpsc::channel::<DirectoryOutcome>();
        let outcomes: Arc<Mutex<Vec<DirectoryOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let collector = {
            let outcomes = Arc::clone(&outcomes);
            thread::spawn(move || {
                for outcome in rx {
                    outcomes.lock().push(outcome);
                }
            })
        };

        // Process phase.
        let walk = process_dir(&shared, root, root, &tx);

        drop(tx);
        if collector.join().is_err() {
            return Err(ProcessError::WorkerPanic);
        }

        // A worker-side abort takes precedence over the Cancelled the walker
        // saw as a consequence of it.
        if let Some(fatal) = shared.fatal.lock().take() {
            return Err(fatal);
        }
        let root_manifest_cid = walk?;

        let outcomes = std::mem::take(&mut *outcomes.lock());
        let errors = std::mem::take(&mut *shared.errors.lock());
        Ok(ProcessReport {
            outcomes,
            root_manifest_cid,
            errors,
            processed_files: shared.counters.processed_files.load(Ordering::Relaxed),
            processed_bytes: shared.counters.processed_bytes.load(Ordering::Relaxed),
            total_files,
            total_bytes,
        })
    }
}

// ── Traversal internals ──────────────────────────────────────────────────────

/// Count files and bytes under `root`, skipping dotfile entries.
fn measure_tree(root: &Path) -> Result<(u64, u64), ProcessError> {
    let mut files = 0u64;
    let mut bytes = 0u64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|e| ProcessError::Io { path: dir.clone(), source: e })?;
        for entry in entries {
            let entry = entry.map_err(|e| ProcessError::Io { path: dir.clone(), source: e })?;
            if is_dotfile(&entry.file_name()) {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| ProcessError::Io { path: entry.path(), source: e })?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                files += 1;
                bytes += meta.len();
            }
        }
    }
    Ok((files, bytes))
}

fn is_dotfile(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// The directory's identity for subkey derivation: its path relative to the
/// processing root, with the root itself deriving from the empty string.
/// Relative paths keep keys stable when the same tree is processed from a
/// different mount point.
fn relative_dir(root: &Path, dir: &Path) -> String {
    dir.strip_prefix(root)
        .unwrap_or(dir)
        .to_string_lossy()
        .into_owned()
}

fn modified_time(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Process one directory to completion and return its manifest CID.
///
/// Subdirectories recurse first — their manifest CID must exist before the
/// parent entry referencing it is built.  Files fan out onto the bounded
/// worker pool and land entries in this directory's manifest concurrently.
fn process_dir(
    shared: &Arc<Shared>,
    root: &Path,
    dir: &Path,
    tx: &mpsc::Sender<DirectoryOutcome>,
) -> Result<String, ProcessError> {
    if shared.cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }

    let manifest = Arc::new(DirectoryManifest::new());
    let dir_key = crypto::derive_directory_key(&shared.master_key, &relative_dir(root, dir));

    // Deterministic order: directory iteration order is filesystem-defined.
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)
        .map_err(|e| ProcessError::Io { path: dir.to_path_buf(), source: e })?
        .collect::<Result<_, _>>()
        .map_err(|e| ProcessError::Io { path: dir.to_path_buf(), source: e })?;
    entries.sort_by_key(|e| e.file_name());

    let mut workers = Vec::new();
    for entry in entries {
        if shared.cancel.is_cancelled() {
            join_workers(shared, &mut workers);
            return Err(ProcessError::Cancelled);
        }

        let name = entry.file_name();
        if is_dotfile(&name) {
            continue;
        }
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                let err = ProcessError::Io { path: path.clone(), source: e };
                if shared.route_error(&path, err) {
                    continue;
                }
                join_workers(shared, &mut workers);
                return Err(ProcessError::Cancelled);
            }
        };

        if meta.is_dir() {
            match process_dir(shared, root, &path, tx) {
                Ok(child_cid) => {
                    let encrypted_name =
                        crypto::encrypt_filename(&name.to_string_lossy(), &dir_key)?;
                    manifest.add_entry(DirectoryEntry {
                        encrypted_name,
                        cid:         child_cid,
                        kind:        EntryType::Directory,
                        size:        0,
                        modified_at: modified_time(&path),
                    })?;
                }
                Err(ProcessError::Cancelled) => {
                    join_workers(shared, &mut workers);
                    return Err(ProcessError::Cancelled);
                }
                Err(err) => {
                    if shared.route_error(&path, err) {
                        continue;
                    }
                    join_workers(shared, &mut workers);
                    return Err(ProcessError::Cancelled);
                }
            }
        } else if meta.is_file() {
            // Acquire before spawn: a saturated pool pauses the walk, which
            // bounds both threads and buffered blocks.
            let permit = shared.semaphore.acquire();
            let shared = Arc::clone(shared);
            let manifest = Arc::clone(&manifest);
            let file_name = name.to_string_lossy().into_owned();
            workers.push(thread::spawn(move || {
                let _permit = permit;
                match process_file(&shared, &path, &file_name, &dir_key, &manifest) {
                    Ok(()) => {}
                    Err(ProcessError::Cancelled) => {}
                    Err(err) => {
                        shared.route_error(&path, err);
                    }
                }
            }));
        }
        // Sockets, FIFOs, and dangling symlinks are skipped.
    }

    join_workers(shared, &mut workers);
    if shared.cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }

    // Every entry is in; seal and emit the manifest.
    let manifest_block = codec::seal_manifest_block(&manifest, &shared.master_key, shared.block_size)?;
    let manifest_cid = shared
        .sink
        .process_manifest(dir, manifest_block)
        .map_err(|e| ProcessError::Sink { path: dir.to_path_buf(), source: e })?;

    debug!(dir = %dir.display(), cid = %manifest_cid, entries = manifest.len(), "manifest sealed");
    let _ = tx.send(DirectoryOutcome {
        dir_path:     dir.to_path_buf(),
        manifest_cid: manifest_cid.clone(),
        entry_count:  manifest.len(),
    });
    Ok(manifest_cid)
}

fn join_workers(shared: &Arc<Shared>, workers: &mut Vec<thread::JoinHandle<()>>) {
    for handle in workers.drain(..) {
        if handle.join().is_err() {
            shared.fatal.lock().get_or_insert(ProcessError::WorkerPanic);
            shared.cancel.cancel();
        }
    }
}

/// Stream one file through the splitter into the sink, then append its
/// manifest entry.  Runs on a worker thread holding a semaphore permit.
fn process_file(
    shared: &Arc<Shared>,
    path: &Path,
    file_name: &str,
    dir_key: &[u8; 32],
    manifest: &DirectoryManifest,
) -> Result<(), ProcessError> {
    if shared.cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }

    let file = File::open(path)
        .map_err(|e| ProcessError::Io { path: path.to_path_buf(), source: e })?;
    let splitter = Splitter::new(shared.block_size)?;

    let sink = &shared.sink;
    let mut block_sink = |index: u64, block: Block| sink.process_block(path, index, block);

    let counters = &shared.counters;
    let mut last_bytes = 0u64;
    let mut on_progress = |bytes: u64, _blocks: u64| {
        counters
            .processed_bytes
            .fetch_add(bytes - last_bytes, Ordering::Relaxed);
        last_bytes = bytes;
    };

    let summary = splitter
        .split_stream(
            BufReader::new(file),
            &mut block_sink,
            Some(&shared.cancel),
            Some(&mut on_progress),
        )
        .map_err(|e| match e {
            SplitError::Cancelled => ProcessError::Cancelled,
            other => ProcessError::Split(other),
        })?;

    let cid = shared
        .sink
        .finish_file(path, summary.bytes_processed)
        .map_err(|e| ProcessError::Sink { path: path.to_path_buf(), source: e })?;

    let encrypted_name = crypto::encrypt_filename(file_name, dir_key)?;
    manifest.add_entry(DirectoryEntry {
        encrypted_name,
        cid,
        kind:        EntryType::File,
        size:        summary.bytes_processed,
        modified_at: modified_time(path),
    })?;

    let done = shared.counters.processed_files.fetch_add(1, Ordering::Relaxed) + 1;
    if let Some(progress) = &shared.progress {
        progress(done, shared.counters.total_files.load(Ordering::Relaxed), path);
    }
    Ok(())
}

// ── Memory-bounded variant ───────────────────────────────────────────────────

/// Memory-aware wrapper: derives the worker budget from a byte bound.
///
/// Each in-flight file worker buffers exactly one block, so capping workers
/// at `max_memory_bytes / block_size` keeps the block-buffer footprint
/// within the bound, overshooting by at most one in-flight block.  The
/// throttle only pauses admission of new file tasks; per-file block
/// ordering is untouched.
pub struct MemoryBoundedProcessor {
    inner:            DirectoryProcessor,
    max_memory_bytes: u64,
    effective_workers: usize,
}

impl MemoryBoundedProcessor {
    pub fn new(mut config: ProcessorConfig, max_memory_bytes: u64) -> Self {
        if config.block_size == 0 {
            config.block_size = DEFAULT_BLOCK_SIZE;
        }
        if config.max_workers == 0 {
            config.max_workers = DEFAULT_MAX_WORKERS;
        }
        let by_memory = (max_memory_bytes / config.block_size as u64).max(1) as usize;
        let effective = config.max_workers.min(by_memory);
        config.max_workers = effective;
        Self {
            inner: DirectoryProcessor::new(config),
            max_memory_bytes,
            effective_workers: effective,
        }
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    /// The worker budget after applying the memory bound.
    pub fn effective_workers(&self) -> usize {
        self.effective_workers
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation_token()
    }

    pub fn process(
        &self,
        root: &Path,
        sink: Arc<dyn DirectoryBlockProcessor>,
    ) -> Result<ProcessReport, ProcessError> {
        self.inner.process(root, sink)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::content_id;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// In-memory sink: content-addresses everything it receives and tracks
    /// worker concurrency.
    #[derive(Default)]
    struct MemorySink {
        blocks:          Mutex<HashMap<PathBuf, Vec<(u64, Block)>>>,
        files:           Mutex<HashMap<PathBuf, String>>,
        manifests:       Mutex<HashMap<PathBuf, Block>>,
        in_flight:       AtomicUsize,
        max_in_flight:   AtomicUsize,
        fail_finish_for: Option<PathBuf>,
    }

    impl DirectoryBlockProcessor for MemorySink {
        fn process_block(&self, path: &Path, index: u64, block: Block) -> Result<(), SinkError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            // Hold the slot briefly so overlapping workers overlap here too.
            thread::sleep(std::time::Duration::from_millis(2));
            self.blocks.lock().entry(path.to_path_buf()).or_default().push((index, block));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish_file(&self, path: &Path, size: u64) -> Result<String, SinkError> {
            if self.fail_finish_for.as_deref() == Some(path) {
                return Err("store rejected file".into());
            }
            let cid = format!("file-{}", content_id(path.to_string_lossy().as_bytes()));
            self.files.lock().insert(path.to_path_buf(), cid.clone());
            let _ = size;
            Ok(cid)
        }

        fn process_manifest(&self, dir: &Path, block: Block) -> Result<String, SinkError> {
            let cid = format!("manifest-{}", &block.id()[..16]);
            self.manifests.lock().insert(dir.to_path_buf(), block);
            Ok(cid)
        }
    }

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("sub/nested")).unwrap();
        fs::write(root.join("alpha.txt"), vec![b'a'; 100]).unwrap();
        fs::write(root.join("beta.bin"), vec![b'b'; 70]).unwrap();
        fs::write(root.join("sub/gamma.dat"), vec![b'c'; 40]).unwrap();
        fs::write(root.join("sub/nested/delta"), vec![b'd'; 10]).unwrap();
        fs::write(root.join(".hidden"), b"skip me").unwrap();
        fs::create_dir(root.join(".git")).unwrap();
        fs::write(root.join(".git/config"), b"skip me too").unwrap();
    }

    fn config(block_size: usize) -> ProcessorConfig {
        let mut c = ProcessorConfig::new([42u8; 32]);
        c.block_size = block_size;
        c
    }

    #[test]
    fn full_tree_traversal() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());

        let sink = Arc::new(MemorySink::default());
        let processor = DirectoryProcessor::new(config(32));
        let report = processor.process(dir.path(), sink.clone()).unwrap();

        // Three manifests: root, sub, sub/nested — dotdirs excluded.
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.errors.is_empty());
        assert_eq!(report.processed_files, 4);
        assert_eq!(report.total_files, 4);
        assert_eq!(report.processed_bytes, 220);
        assert_eq!(report.total_bytes, 220);

        // Every file was split with padding to 32-byte blocks.
        let blocks = sink.blocks.lock();
        assert_eq!(blocks[&dir.path().join("alpha.txt")].len(), 4); // 100 -> 4 blocks
        assert!(blocks[&dir.path().join("alpha.txt")]
            .iter()
            .all(|(_, b)| b.size() == 32));
        assert!(!blocks.contains_key(&dir.path().join(".hidden")));

        // The root manifest decrypts and names both files and `sub`.
        let manifests = sink.manifests.lock();
        let root_manifest =
            codec::open_manifest_block(&manifests[&dir.path().to_path_buf()], &[42u8; 32]).unwrap();
        assert_eq!(root_manifest.len(), 3);

        let root_key = crypto::derive_directory_key(&[42u8; 32], "");
        let mut names: Vec<String> = root_manifest
            .entries()
            .iter()
            .map(|e| crypto::decrypt_filename(&e.encrypted_name, &root_key).unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["alpha.txt", "beta.bin", "sub"]);

        // The `sub` entry carries the child manifest's real CID.
        let sub_outcome = report
            .outcomes
            .iter()
            .find(|o| o.dir_path == dir.path().join("sub"))
            .unwrap();
        let sub_entry = root_manifest
            .entries()
            .into_iter()
            .find(|e| e.kind == EntryType::Directory)
            .unwrap();
        assert_eq!(sub_entry.cid, sub_outcome.manifest_cid);
        assert_eq!(sub_entry.size, 0);
    }

    #[test]
    fn progress_reports_every_file() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());

        let seen = Arc::new(Mutex::new(Vec::<(u64, u64)>::new()));
        let mut cfg = config(64);
        {
            let seen = Arc::clone(&seen);
            cfg.progress = Some(Arc::new(move |done, total, _path| {
                seen.lock().push((done, total));
            }));
        }

        let processor = DirectoryProcessor::new(cfg);
        processor
            .process(dir.path(), Arc::new(MemorySink::default()))
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|&(_, total)| total == 4));
        let mut counts: Vec<u64> = seen.iter().map(|&(done, _)| done).collect();
        counts.sort_unstable();
        assert_eq!(counts, [1, 2, 3, 4]);
    }

    #[test]
    fn worker_pool_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            fs::write(dir.path().join(format!("f{i:02}")), vec![0u8; 256]).unwrap();
        }

        let mut cfg = config(64);
        cfg.max_workers = 2;
        let sink = Arc::new(MemorySink::default());
        DirectoryProcessor::new(cfg)
            .process(dir.path(), sink.clone())
            .unwrap();

        assert!(sink.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn cancellation_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            fs::write(dir.path().join(format!("f{i}")), vec![1u8; 512]).unwrap();
        }

        // The progress callback is installed before the processor exists, so
        // it learns the token through a shared slot filled in afterwards.
        let token_slot: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let mut cfg = config(32);
        {
            let token_slot = Arc::clone(&token_slot);
            cfg.progress = Some(Arc::new(move |done, _, _| {
                if done >= 2 {
                    if let Some(token) = token_slot.lock().as_ref() {
                        token.cancel();
                    }
                }
            }));
        }

        let processor = DirectoryProcessor::new(cfg);
        *token_slot.lock() = Some(processor.cancellation_token());

        let err = processor
            .process(dir.path(), Arc::new(MemorySink::default()))
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
    }

    #[test]
    fn error_handler_continue_records_and_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.txt"), vec![1u8; 32]).unwrap();
        fs::write(dir.path().join("poison.txt"), vec![2u8; 32]).unwrap();

        let sink = Arc::new(MemorySink {
            fail_finish_for: Some(dir.path().join("poison.txt")),
            ..MemorySink::default()
        });

        let mut cfg = config(32);
        cfg.error_handler = Some(Arc::new(|_path, _err| true));
        let report = DirectoryProcessor::new(cfg)
            .process(dir.path(), sink.clone())
            .unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, dir.path().join("poison.txt"));
        // The healthy file still made it into the manifest.
        let manifests = sink.manifests.lock();
        let manifest =
            codec::open_manifest_block(&manifests[&dir.path().to_path_buf()], &[42u8; 32]).unwrap();
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn error_without_handler_aborts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("poison.txt"), vec![2u8; 32]).unwrap();

        let sink = Arc::new(MemorySink {
            fail_finish_for: Some(dir.path().join("poison.txt")),
            ..MemorySink::default()
        });

        let err = DirectoryProcessor::new(config(32))
            .process(dir.path(), sink)
            .unwrap_err();
        assert!(matches!(err, ProcessError::Sink { .. }));
    }

    #[test]
    fn memory_bound_caps_workers() {
        let cfg = config(1024);
        let bounded = MemoryBoundedProcessor::new(cfg, 3 * 1024);
        assert_eq!(bounded.effective_workers(), 3);
        assert_eq!(bounded.max_memory_bytes(), 3 * 1024);

        // A generous bound falls back to max_workers.
        let roomy = MemoryBoundedProcessor::new(config(1024), 1024 * 1024);
        assert_eq!(roomy.effective_workers(), DEFAULT_MAX_WORKERS);

        // A bound below one block still admits a single worker.
        let tight = MemoryBoundedProcessor::new(config(1024), 10);
        assert_eq!(tight.effective_workers(), 1);
    }

    #[test]
    fn memory_bounded_processes_like_the_plain_one() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());

        let sink = Arc::new(MemorySink::default());
        let report = MemoryBoundedProcessor::new(config(32), 64)
            .process(dir.path(), sink.clone())
            .unwrap();
        assert_eq!(report.processed_files, 4);
        assert!(sink.max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}
