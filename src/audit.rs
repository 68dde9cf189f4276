//! Audit log — append-only record of reuse-enforcement decisions.
//!
//! Every `validate_upload` call leaves exactly one entry: what was decided
//! (`accept`, `warning`, `reject`), for which file, why, and the measured
//! policy ratios that drove the decision.  Entries are never mutated or
//! removed; readers get snapshot copies.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Enforcement verdict recorded with each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Upload satisfied the policy.
    Accept,
    /// Upload accepted with warnings on record.
    Warning,
    /// Upload rejected.
    Reject,
}

/// The measured ratios behind one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PolicyCheck {
    pub reuse_ratio:         f64,
    pub public_domain_ratio: f64,
    pub popular_block_ratio: f64,
    pub new_block_count:     usize,
}

/// One enforcement decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp:        DateTime<Utc>,
    pub action:           AuditAction,
    pub file_hash:        String,
    pub descriptor_label: String,
    pub reason:           String,
    pub policy_check:     PolicyCheck,
    pub blocks_used:      Vec<String>,
}

/// Mutex-guarded append-only log.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }

    /// Snapshot copy of the whole log.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Entries with the given action, newest last.
    pub fn with_action(&self, action: AuditAction) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }

    /// The full log as a JSON document.
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&*self.entries.lock())
    }
}
