//! Directory manifest — encrypted entries plus provenance timestamps.
//!
//! A manifest is what a directory becomes in storage: an ordered list of
//! `{encrypted_name, cid, type, size, modified}` entries.  Names are
//! ciphertext (per-directory key, fresh nonce each time), CIDs point into
//! the external store, and nothing in the serialized form reveals the
//! directory structure to anyone without the key.
//!
//! Entry operations are serialized by an internal mutex; accessors hand out
//! deep copies, so callers can never observe or cause a partial update.
//! Entry order carries no semantics — removal swaps with the last element —
//! but the serialized form preserves whatever the stored order is, and
//! manifest equality is bytewise over that serialization.
//!
//! [`ManifestSnapshot`] is the detached, lock-free value: what gets
//! serialized, what snapshots are made of, and what equality is defined on.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Manifest format version written into every serialized manifest.
pub const MANIFEST_VERSION: &str = "1.0";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("entry name must not be empty")]
    EmptyName,
    #[error("entry cid must not be empty")]
    EmptyCid,
    #[error("entry not found")]
    NotFound,
    #[error("an entry with the same encrypted name already exists")]
    Duplicate,
    #[error("invalid entry type {0} (expected 0=file or 1=directory)")]
    InvalidEntryType(u8),
}

// ── Entry type ───────────────────────────────────────────────────────────────

/// Wire representation: `0` = file, `1` = directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EntryType {
    File,
    Directory,
}

impl From<EntryType> for u8 {
    fn from(t: EntryType) -> u8 {
        match t {
            EntryType::File      => 0,
            EntryType::Directory => 1,
        }
    }
}

impl TryFrom<u8> for EntryType {
    type Error = ManifestError;

    fn try_from(v: u8) -> Result<Self, ManifestError> {
        match v {
            0 => Ok(EntryType::File),
            1 => Ok(EntryType::Directory),
            other => Err(ManifestError::InvalidEntryType(other)),
        }
    }
}

// ── Entries ──────────────────────────────────────────────────────────────────

/// One directory entry.  `encrypted_name` is the AES-GCM ciphertext of the
/// plaintext name under the directory key; it uniquely identifies the entry
/// within its manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub encrypted_name: Vec<u8>,
    pub cid:            String,
    #[serde(rename = "type")]
    pub kind:           EntryType,
    /// Byte size for files; 0 for directories.
    pub size:           u64,
    #[serde(rename = "modified")]
    pub modified_at:    DateTime<Utc>,
}

impl DirectoryEntry {
    fn validate(&self) -> Result<(), ManifestError> {
        if self.encrypted_name.is_empty() {
            return Err(ManifestError::EmptyName);
        }
        if self.cid.is_empty() {
            return Err(ManifestError::EmptyCid);
        }
        Ok(())
    }
}

/// Provenance stamped onto snapshot manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub original_cid:  String,
    pub creation_time: DateTime<Utc>,
    pub snapshot_name: String,
    pub description:   String,
    pub is_snapshot:   bool,
}

// ── Snapshot (detached value) ────────────────────────────────────────────────

/// Detached manifest value: the serialized form and the unit of equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSnapshot {
    pub version:       String,
    pub entries:       Vec<DirectoryEntry>,
    #[serde(rename = "created")]
    pub created_at:    DateTime<Utc>,
    #[serde(rename = "modified")]
    pub modified_at:   DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_info: Option<SnapshotInfo>,
}

impl ManifestSnapshot {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            version:       MANIFEST_VERSION.to_string(),
            entries:       Vec::new(),
            created_at:    now,
            modified_at:   now,
            snapshot_info: None,
        }
    }
}

// ── DirectoryManifest ────────────────────────────────────────────────────────

/// Thread-safe directory manifest.
///
/// Any number of worker threads may add entries concurrently while the
/// enclosing traversal holds a reference.  Mutations bump `modified_at`.
#[derive(Debug)]
pub struct DirectoryManifest {
    inner: Mutex<ManifestSnapshot>,
}

impl Default for DirectoryManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryManifest {
    /// Fresh, empty manifest with now-timestamps.
    pub fn new() -> Self {
        Self { inner: Mutex::new(ManifestSnapshot::empty()) }
    }

    /// Rehydrate a manifest from a detached snapshot (e.g. after decryption).
    pub fn from_snapshot(snapshot: ManifestSnapshot) -> Self {
        Self { inner: Mutex::new(snapshot) }
    }

    /// Take a detached snapshot of `original`, stamp fresh [`SnapshotInfo`],
    /// and return the new manifest.
    ///
    /// The snapshot shares entry CIDs with its source — the underlying
    /// blocks deduplicate in the external store — but is an independent
    /// value: later mutations of either side do not affect the other.
    pub fn new_snapshot_manifest(
        original: &DirectoryManifest,
        original_cid: &str,
        name: &str,
        description: &str,
    ) -> Self {
        let mut snap = original.snapshot();
        let now = Utc::now();
        snap.snapshot_info = Some(SnapshotInfo {
            original_cid:  original_cid.to_string(),
            creation_time: now,
            snapshot_name: name.to_string(),
            description:   description.to_string(),
            is_snapshot:   true,
        });
        snap.created_at = now;
        snap.modified_at = now;
        Self::from_snapshot(snap)
    }

    /// Append a validated entry.  Rejects a second entry with the same
    /// encrypted name — equal names never coexist in one manifest.
    pub fn add_entry(&self, entry: DirectoryEntry) -> Result<(), ManifestError> {
        entry.validate()?;
        let mut inner = self.inner.lock();
        if inner.entries.iter().any(|e| e.encrypted_name == entry.encrypted_name) {
            return Err(ManifestError::Duplicate);
        }
        inner.entries.push(entry);
        inner.modified_at = Utc::now();
        Ok(())
    }

    /// Remove the entry with byte-equal `encrypted_name`.
    ///
    /// O(n) swap-with-last: entry order is not semantically significant.
    pub fn remove_entry(&self, encrypted_name: &[u8]) -> Result<(), ManifestError> {
        if encrypted_name.is_empty() {
            return Err(ManifestError::EmptyName);
        }
        let mut inner = self.inner.lock();
        let pos = inner
            .entries
            .iter()
            .position(|e| e.encrypted_name == encrypted_name)
            .ok_or(ManifestError::NotFound)?;
        inner.entries.swap_remove(pos);
        inner.modified_at = Utc::now();
        Ok(())
    }

    /// Replace the entry named `old_name` with `new_entry`, in place.
    pub fn update_entry(
        &self,
        old_name: &[u8],
        new_entry: DirectoryEntry,
    ) -> Result<(), ManifestError> {
        new_entry.validate()?;
        let mut inner = self.inner.lock();
        let pos = inner
            .entries
            .iter()
            .position(|e| e.encrypted_name == old_name)
            .ok_or(ManifestError::NotFound)?;
        // The replacement may rename, but never onto another existing entry.
        if new_entry.encrypted_name != old_name
            && inner.entries.iter().any(|e| e.encrypted_name == new_entry.encrypted_name)
        {
            return Err(ManifestError::Duplicate);
        }
        inner.entries[pos] = new_entry;
        inner.modified_at = Utc::now();
        Ok(())
    }

    /// Locate an entry by encrypted name, returning its index and a copy.
    pub fn find_entry(&self, encrypted_name: &[u8]) -> Result<(usize, DirectoryEntry), ManifestError> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .position(|e| e.encrypted_name == encrypted_name)
            .map(|i| (i, inner.entries[i].clone()))
            .ok_or(ManifestError::NotFound)
    }

    pub fn has_entry(&self, encrypted_name: &[u8]) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|e| e.encrypted_name == encrypted_name)
    }

    /// Deep copy of all entries.
    pub fn entries(&self) -> Vec<DirectoryEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Detached copy of the whole manifest, suitable for serialization or
    /// for starting a snapshot chain.
    pub fn snapshot(&self) -> ManifestSnapshot {
        self.inner.lock().clone()
    }

    pub fn is_snapshot(&self) -> bool {
        self.inner
            .lock()
            .snapshot_info
            .as_ref()
            .is_some_and(|s| s.is_snapshot)
    }

    pub fn snapshot_info(&self) -> Option<SnapshotInfo> {
        self.inner.lock().snapshot_info.clone()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
