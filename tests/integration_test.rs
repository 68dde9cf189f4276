//! End-to-end flows against an in-memory content-addressed store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use noisefs_core::pipeline::{CollectSink, SinkError};
use noisefs_core::processor::DirectoryBlockProcessor;
use noisefs_core::{
    assemble, codec, crypto, Block, BlockSink, Descriptor, DirectoryProcessor, EnforcementLevel,
    EntryType, PoolRandomizerProvider, ProcessorConfig, RandomizerProvider, ReuseEnforcer,
    ReusePolicy, Splitter, StreamingAssembler, UniversalBlockPool, XorPipeline,
};

/// Minimal stand-in for the external content-addressed store.
#[derive(Default)]
struct MemoryStore {
    blocks: Mutex<HashMap<String, Block>>,
}

impl MemoryStore {
    fn put(&self, block: Block) -> String {
        let cid = block.id().to_string();
        self.blocks.lock().insert(cid.clone(), block);
        cid
    }

    fn get(&self, cid: &str) -> Option<Block> {
        self.blocks.lock().get(cid).cloned()
    }

    fn len(&self) -> usize {
        self.blocks.lock().len()
    }
}

#[test]
fn upload_then_download_round_trip() {
    let block_size = 64usize;
    let file_bytes: Vec<u8> = (0u8..=255).cycle().take(500).collect();

    let store = Arc::new(MemoryStore::default());
    let pool = Arc::new(UniversalBlockPool::new());

    // ── Upload: split → XOR against pooled randomizers → store ──────────────
    let splitter = Splitter::new(block_size).unwrap();
    let provider = PoolRandomizerProvider::new(Arc::clone(&pool), block_size);
    let mut pipeline = XorPipeline::new(provider, CollectSink::default(), block_size);
    splitter
        .split_stream(&file_bytes[..], &mut pipeline, None, None)
        .unwrap();

    let (mut provider, collected) = pipeline.into_parts();
    let mut descriptor = Descriptor::new("payload.bin".into(), file_bytes.len() as u64, block_size as u64);
    for (index, anon) in collected.blocks {
        let data_cid = store.put(anon);
        let (r1, r2) = provider.randomizers(index).unwrap();
        // Randomizers live in the store too; any peer may fetch them.
        let r1_cid = store.put(r1);
        let r2_cid = store.put(r2);
        descriptor.push_triple(data_cid, r1_cid, r2_cid);
    }
    assert_eq!(descriptor.blocks.len(), 8); // ceil(500 / 64)

    // No stored block contains file plaintext.
    for triple in &descriptor.blocks {
        let stored = store.get(&triple.data_cid).unwrap();
        assert!(!file_bytes
            .windows(block_size.min(stored.size()))
            .any(|w| stored.data().starts_with(w)));
    }

    // ── Download: fetch out of order → un-XOR → reassemble → trim ──────────
    let assembler = Arc::new(StreamingAssembler::with_total(
        Vec::new(),
        descriptor.blocks.len() as u64,
    ));
    {
        let assembler = Arc::clone(&assembler);
        let mut unxor = XorPipeline::new(
            StoredPairProvider::new(&store, &descriptor),
            move |index: u64, block: Block| -> Result<(), SinkError> {
                assembler.add_block(index, block).map_err(Into::into)
            },
            block_size,
        );

        // Deliver blocks in a scrambled order, as a real swarm would.
        let mut order: Vec<usize> = (0..descriptor.blocks.len()).collect();
        order.reverse();
        order.swap(0, 3);
        for i in order {
            let stored = store.get(&descriptor.blocks[i].data_cid).unwrap();
            unxor.process_block(i as u64, stored).unwrap();
        }
    }
    assert!(assembler.is_complete());

    let assembler = Arc::try_unwrap(assembler).unwrap_or_else(|_| panic!("assembler still shared"));
    let mut recovered = assembler.into_writer();
    recovered.truncate(file_bytes.len());
    assert_eq!(recovered, file_bytes);
}

/// Download-side provider: looks the randomizer pair up in the store via the
/// descriptor, exactly as a downloading peer would.
struct StoredPairProvider<'a> {
    store:      &'a MemoryStore,
    descriptor: &'a Descriptor,
}

impl<'a> StoredPairProvider<'a> {
    fn new(store: &'a MemoryStore, descriptor: &'a Descriptor) -> Self {
        Self { store, descriptor }
    }
}

impl RandomizerProvider for StoredPairProvider<'_> {
    fn randomizers(
        &mut self,
        index: u64,
    ) -> Result<(Block, Block), noisefs_core::ProviderError> {
        let triple = &self.descriptor.blocks[index as usize];
        let r1 = self.store.get(&triple.randomizer1_cid).expect("randomizer1 stored");
        let r2 = self
            .store
            .get(triple.randomizer2_cid.as_deref().expect("engine writes both"))
            .expect("randomizer2 stored");
        Ok((r1, r2))
    }
}

#[test]
fn randomizer_reuse_feeds_the_anonymity_set() {
    let block_size = 32usize;
    let pool = Arc::new(UniversalBlockPool::new());

    // Two unrelated uploads share one pool.
    for payload in [&b"first file body, long enough for two blocks"[..], &b"second, different file"[..]] {
        let splitter = Splitter::new(block_size).unwrap();
        let provider = PoolRandomizerProvider::new(Arc::clone(&pool), block_size);
        let mut pipeline = XorPipeline::new(provider, CollectSink::default(), block_size);
        splitter.split_stream(payload, &mut pipeline, None, None).unwrap();
    }

    // The pool never grew past what the first upload minted: later blocks
    // reused pooled randomizers instead of minting fresh ones.
    assert_eq!(pool.len(), 2);
}

#[test]
fn enforcer_gates_an_upload_and_proves_reuse() {
    let block_size = 32usize;
    let pool = Arc::new(UniversalBlockPool::new());
    let store = Arc::new(MemoryStore::default());

    let policy = ReusePolicy {
        min_reuse_ratio:       0.4,
        public_domain_ratio:   0.0,
        popular_block_ratio:   0.0,
        max_new_blocks:        4,
        min_file_associations: 0,
        enforcement_level:     EnforcementLevel::Strict,
    };
    let enforcer = ReuseEnforcer::new(policy, Arc::clone(&pool));

    let file_bytes = b"a modest file that becomes three data blocks, honest".to_vec();
    let splitter = Splitter::new(block_size).unwrap();
    let provider = PoolRandomizerProvider::new(Arc::clone(&pool), block_size);
    let mut pipeline = XorPipeline::new(provider, CollectSink::default(), block_size);
    splitter.split_stream(&file_bytes[..], &mut pipeline, None, None).unwrap();

    let (mut provider, collected) = pipeline.into_parts();
    let mut descriptor = Descriptor::new("gated.bin".into(), file_bytes.len() as u64, block_size as u64);
    for (index, anon) in collected.blocks {
        let data_cid = store.put(anon);
        let (r1, r2) = provider.randomizers(index).unwrap();
        descriptor.push_triple(data_cid, r1.id().to_string(), r2.id().to_string());
    }

    // 2 pooled randomizers + 2 data CIDs → reuse ratio 0.5 ≥ 0.4, 2 new ≤ 4.
    let result = enforcer.enforce_upload(&descriptor, &file_bytes).unwrap();
    assert!(result.valid);
    assert!(result.check.reuse_ratio >= 0.4);

    let cids = descriptor.referenced_cids();
    enforcer.register_file_blocks(&result.file_hash, &cids);
    let proof = enforcer.generate_reuse_proof(&result.file_hash, "descriptor-cid", &cids);
    assert!(proof.verify());
    assert_eq!(proof.reuse_evidence.len(), cids.len());

    let stats = enforcer.stats();
    assert_eq!(stats.accepted + stats.warnings, 1);
    assert_eq!(stats.files_registered, 1);
}

// ── Directory processing against the store ───────────────────────────────────

struct StoreSink {
    store: Arc<MemoryStore>,
    file_cids: Mutex<HashMap<PathBuf, String>>,
}

impl DirectoryBlockProcessor for StoreSink {
    fn process_block(&self, _path: &Path, _index: u64, block: Block) -> Result<(), SinkError> {
        self.store.put(block);
        Ok(())
    }

    fn finish_file(&self, path: &Path, size: u64) -> Result<String, SinkError> {
        // Stand-in for the upload layer's descriptor CID.
        let cid = format!("desc-{}-{}", size, path.file_name().unwrap().to_string_lossy());
        self.file_cids.lock().insert(path.to_path_buf(), cid.clone());
        Ok(cid)
    }

    fn process_manifest(&self, _dir: &Path, block: Block) -> Result<String, SinkError> {
        Ok(self.store.put(block))
    }
}

#[test]
fn directory_tree_round_trips_through_manifests() {
    let master_key = crypto::derive_master_key("correct horse", b"integration-salt").unwrap();

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("inner")).unwrap();
    // Non-repeating contents so every padded block is a distinct CID.
    let top: Vec<u8> = (0u8..90).collect();
    let leaf: Vec<u8> = (100u8..133).collect();
    std::fs::write(dir.path().join("top.txt"), &top).unwrap();
    std::fs::write(dir.path().join("inner/leaf.txt"), &leaf).unwrap();

    let store = Arc::new(MemoryStore::default());
    let sink = Arc::new(StoreSink { store: Arc::clone(&store), file_cids: Mutex::new(HashMap::new()) });

    let mut cfg = ProcessorConfig::new(master_key);
    cfg.block_size = 32;
    let report = DirectoryProcessor::new(cfg).process(dir.path(), sink.clone()).unwrap();
    assert_eq!(report.processed_files, 2);

    // Walk back down from the root manifest using only CIDs and keys.
    let root_block = store.get(&report.root_manifest_cid).unwrap();
    let root_manifest = codec::open_manifest_block(&root_block, &master_key).unwrap();
    let root_key = crypto::derive_directory_key(&master_key, "");

    let mut top_seen = false;
    for entry in root_manifest.entries() {
        let name = crypto::decrypt_filename(&entry.encrypted_name, &root_key).unwrap();
        match entry.kind {
            EntryType::File => {
                assert_eq!(name, "top.txt");
                assert_eq!(entry.size, 90);
                top_seen = true;
            }
            EntryType::Directory => {
                assert_eq!(name, "inner");
                let inner_block = store.get(&entry.cid).unwrap();
                let inner_manifest = codec::open_manifest_block(&inner_block, &master_key).unwrap();
                let inner_key = crypto::derive_directory_key(&master_key, "inner");
                let entries = inner_manifest.entries();
                assert_eq!(entries.len(), 1);
                let leaf = crypto::decrypt_filename(&entries[0].encrypted_name, &inner_key).unwrap();
                assert_eq!(leaf, "leaf.txt");
                assert_eq!(entries[0].size, 33);
            }
        }
    }
    assert!(top_seen);

    // Manifest blocks share the padded-size discipline of data blocks.
    assert_eq!(root_block.size() % 32, 0);
    assert_eq!(store.len(), 2 + 3 + 2); // 2 manifests + ceil(90/32) + ceil(33/32) data blocks

    // The sink's per-file CIDs are what the manifests recorded.
    let file_cids = sink.file_cids.lock();
    assert!(file_cids.contains_key(&dir.path().join("top.txt")));
    assert!(file_cids.contains_key(&dir.path().join("inner/leaf.txt")));
}

#[test]
fn snapshot_survives_seal_and_reopen() {
    let master_key = [13u8; 32];
    let manifest = noisefs_core::DirectoryManifest::new();
    manifest
        .add_entry(noisefs_core::DirectoryEntry {
            encrypted_name: b"sealed-entry".to_vec(),
            cid:            "cid-x".into(),
            kind:           EntryType::File,
            size:           7,
            modified_at:    chrono::Utc::now(),
        })
        .unwrap();
    let snap = noisefs_core::DirectoryManifest::new_snapshot_manifest(
        &manifest, "orig-cid", "nightly", "before the reorg",
    );

    let block = codec::seal_manifest_block(&snap, &master_key, 256).unwrap();
    let reopened = codec::open_manifest_block(&block, &master_key).unwrap();

    assert!(reopened.is_snapshot());
    assert_eq!(reopened.snapshot(), snap.snapshot());
    assert_eq!(reopened.snapshot_info().unwrap().snapshot_name, "nightly");

    // Buffered assembly of the sealed block round-trips bytewise.
    let copy = assemble(&[block.clone()]).unwrap();
    assert_eq!(copy, block.data());
}
