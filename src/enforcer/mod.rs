//! Reuse enforcer — policy validation, association registry, reuse proofs.
//!
//! An upload that mints all-new blocks contributes nothing to anyone else's
//! anonymity.  The enforcer is the gate: it measures how much of a
//! descriptor's CID set already exists in the universal pool, how much of it
//! is public-domain cover, and how popular the reused blocks are, then
//! decides per the configured [`ReusePolicy`] and enforcement level.  Every
//! decision lands in the append-only [`AuditLog`].
//!
//! Policy violations are data, not panics: [`validate_upload`] always
//! returns a [`ValidationResult`]; only the `?`-friendly
//! [`enforce_upload`] converts an invalid result into an error.
//!
//! [`validate_upload`]: ReuseEnforcer::validate_upload
//! [`enforce_upload`]: ReuseEnforcer::enforce_upload

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog, PolicyCheck};
use crate::block::content_id;
use crate::descriptor::Descriptor;
use crate::pool::UniversalBlockPool;

// ── Policy ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementLevel {
    /// Valid only with zero violations.
    Strict,
    /// Valid unless a critical violation is present.
    Moderate,
    /// Always valid; violations are logged only.
    Permissive,
}

/// Reuse requirements for uploads.  All ratios are in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReusePolicy {
    /// Fraction of referenced CIDs that must already be pooled.
    pub min_reuse_ratio:       f64,
    /// Fraction of referenced CIDs that must be public-domain.
    pub public_domain_ratio:   f64,
    /// Fraction that should be popular; shortfall is a warning only.
    pub popular_block_ratio:   f64,
    /// Hard cap on previously-unknown CIDs per upload.
    pub max_new_blocks:        usize,
    /// Reused blocks associated with fewer files than this draw a warning.
    pub min_file_associations: usize,
    pub enforcement_level:     EnforcementLevel,
}

impl Default for ReusePolicy {
    fn default() -> Self {
        Self {
            min_reuse_ratio:       0.3,
            public_domain_ratio:   0.1,
            popular_block_ratio:   0.2,
            max_new_blocks:        16,
            min_file_associations: 2,
            enforcement_level:     EnforcementLevel::Moderate,
        }
    }
}

// ── Violations and warnings ──────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Violation {
    #[error("reuse ratio {measured:.2} below required {required:.2}")]
    ReuseRatio { measured: f64, required: f64 },
    #[error("public-domain ratio {measured:.2} below required {required:.2}")]
    PublicDomainRatio { measured: f64, required: f64 },
    #[error("{count} new blocks exceeds the cap of {max}")]
    NewBlockCap { count: usize, max: usize },
}

impl Violation {
    /// Every current kind is critical; the distinction exists so `Moderate`
    /// gains meaning the day a non-critical kind is added.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Violation::ReuseRatio { .. }
                | Violation::PublicDomainRatio { .. }
                | Violation::NewBlockCap { .. }
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyWarning {
    #[error("popular-block ratio {measured:.2} below target {expected:.2}")]
    PopularRatio { measured: f64, expected: f64 },
    #[error("block {cid} is associated with only {associations} file(s), fewer than {min}")]
    LowFanout { cid: String, associations: usize, min: usize },
}

/// The full outcome of one validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub valid:      bool,
    pub file_hash:  String,
    pub check:      PolicyCheck,
    pub violations: Vec<Violation>,
    pub warnings:   Vec<PolicyWarning>,
}

#[derive(Error, Debug)]
pub enum EnforcerError {
    #[error("upload violates the reuse policy: {0:?}")]
    ReuseViolation(Vec<Violation>),
    #[error("audit export failed: {0}")]
    Audit(#[from] serde_json::Error),
}

// ── Reuse proof ──────────────────────────────────────────────────────────────

/// Per-CID evidence attached to a [`ReuseProof`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReuseEvidence {
    pub block_cid:         String,
    pub file_associations: Vec<String>,
    pub first_use:         DateTime<Utc>,
    pub total_usages:      u64,
    pub is_public_domain:  bool,
    pub popularity_score:  f64,
}

/// Commitment over a file's CID set demonstrating reuse compliance.
///
/// The signature is a deterministic hash commitment, not an authentication;
/// higher layers may replace it with a real signing scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReuseProof {
    pub file_hash:          String,
    pub descriptor_cid:     String,
    pub block_cids:         Vec<String>,
    pub reuse_evidence:     Vec<ReuseEvidence>,
    pub public_domain_proof: Vec<String>,
    pub timestamp:          DateTime<Utc>,
    pub signature:          String,
}

impl ReuseProof {
    /// Recompute the commitment and compare it to the stored signature.
    pub fn verify(&self) -> bool {
        proof_signature(&self.file_hash, &self.descriptor_cid, &self.block_cids, &self.timestamp)
            == self.signature
    }
}

fn proof_signature(
    file_hash: &str,
    descriptor_cid: &str,
    block_cids: &[String],
    timestamp: &DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_hash.as_bytes());
    hasher.update(descriptor_cid.as_bytes());
    for cid in block_cids {
        hasher.update(cid.as_bytes());
    }
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

// ── Statistics ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnforcerStats {
    pub accepted:           usize,
    pub rejected:           usize,
    pub warnings:           usize,
    pub acceptance_rate:    f64,
    pub files_registered:   usize,
    pub block_associations: usize,
    /// Mean number of files each associated block serves.
    pub avg_block_reuse:    f64,
}

// ── Enforcer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct AssociationRegistry {
    block_to_files: HashMap<String, Vec<String>>,
    file_to_blocks: HashMap<String, Vec<String>>,
}

/// Policy gate for uploads, with its audit trail and association registry.
pub struct ReuseEnforcer {
    policy:   ReusePolicy,
    pool:     Arc<UniversalBlockPool>,
    audit:    AuditLog,
    registry: Mutex<AssociationRegistry>,
}

impl ReuseEnforcer {
    pub fn new(policy: ReusePolicy, pool: Arc<UniversalBlockPool>) -> Self {
        Self {
            policy,
            pool,
            audit: AuditLog::new(),
            registry: Mutex::new(AssociationRegistry::default()),
        }
    }

    pub fn policy(&self) -> &ReusePolicy {
        &self.policy
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Measure `descriptor` against the policy and record the decision.
    ///
    /// Never fails on policy grounds — the verdict is data in the returned
    /// [`ValidationResult`], and one [`AuditEntry`] is appended per call.
    pub fn validate_upload(&self, descriptor: &Descriptor, file_bytes: &[u8]) -> ValidationResult {
        let file_hash = content_id(file_bytes);
        let cids = descriptor.referenced_cids();

        let total = cids.len();
        let mut reused = 0usize;
        let mut public_domain = 0usize;
        let mut popular = 0usize;
        for cid in &cids {
            if self.pool.is_known(cid) {
                reused += 1;
            }
            if self.pool.is_public_domain(cid) {
                public_domain += 1;
            }
            if self.pool.is_popular(cid) {
                popular += 1;
            }
        }
        let new_blocks = total - reused;

        // An empty CID set is vacuously compliant.
        let ratio = |count: usize| if total == 0 { 1.0 } else { count as f64 / total as f64 };
        let check = PolicyCheck {
            reuse_ratio:         ratio(reused),
            public_domain_ratio: ratio(public_domain),
            popular_block_ratio: ratio(popular),
            new_block_count:     new_blocks,
        };

        let mut violations = Vec::new();
        if check.reuse_ratio < self.policy.min_reuse_ratio {
            violations.push(Violation::ReuseRatio {
                measured: check.reuse_ratio,
                required: self.policy.min_reuse_ratio,
            });
        }
        if check.public_domain_ratio < self.policy.public_domain_ratio {
            violations.push(Violation::PublicDomainRatio {
                measured: check.public_domain_ratio,
                required: self.policy.public_domain_ratio,
            });
        }
        if new_blocks > self.policy.max_new_blocks {
            violations.push(Violation::NewBlockCap {
                count: new_blocks,
                max:   self.policy.max_new_blocks,
            });
        }

        let mut warnings = Vec::new();
        if check.popular_block_ratio < self.policy.popular_block_ratio {
            warnings.push(PolicyWarning::PopularRatio {
                measured: check.popular_block_ratio,
                expected: self.policy.popular_block_ratio,
            });
        }
        {
            let registry = self.registry.lock();
            for cid in &cids {
                if !self.pool.is_known(cid) {
                    continue;
                }
                let associations = registry
                    .block_to_files
                    .get(cid)
                    .map_or(0, Vec::len);
                if associations < self.policy.min_file_associations {
                    warnings.push(PolicyWarning::LowFanout {
                        cid:          cid.clone(),
                        associations,
                        min:          self.policy.min_file_associations,
                    });
                }
            }
        }

        let valid = match self.policy.enforcement_level {
            EnforcementLevel::Strict     => violations.is_empty(),
            EnforcementLevel::Moderate   => !violations.iter().any(Violation::is_critical),
            EnforcementLevel::Permissive => true,
        };

        let action = if !valid {
            AuditAction::Reject
        } else if !violations.is_empty() || !warnings.is_empty() {
            AuditAction::Warning
        } else {
            AuditAction::Accept
        };

        let reason = decision_reason(action, &violations, &warnings);
        match action {
            AuditAction::Reject => {
                warn!(file_hash = %file_hash, violations = violations.len(), "upload rejected")
            }
            _ => info!(file_hash = %file_hash, ?action, "upload validated"),
        }

        self.audit.append(AuditEntry {
            timestamp:        Utc::now(),
            action,
            file_hash:        file_hash.clone(),
            descriptor_label: descriptor.filename.clone(),
            reason,
            policy_check:     check.clone(),
            blocks_used:      cids,
        });

        ValidationResult { valid, file_hash, check, violations, warnings }
    }

    /// [`validate_upload`](Self::validate_upload) with error control flow:
    /// an invalid result becomes [`EnforcerError::ReuseViolation`].
    pub fn enforce_upload(
        &self,
        descriptor: &Descriptor,
        file_bytes: &[u8],
    ) -> Result<ValidationResult, EnforcerError> {
        let result = self.validate_upload(descriptor, file_bytes);
        if result.valid {
            Ok(result)
        } else {
            Err(EnforcerError::ReuseViolation(result.violations))
        }
    }

    /// Record `file_hash ↔ block_cids` associations, both directions,
    /// without duplication.
    pub fn register_file_blocks(&self, file_hash: &str, block_cids: &[String]) {
        let mut registry = self.registry.lock();
        for cid in block_cids {
            let files = registry.block_to_files.entry(cid.clone()).or_default();
            if !files.iter().any(|f| f == file_hash) {
                files.push(file_hash.to_string());
            }
        }
        let blocks = registry
            .file_to_blocks
            .entry(file_hash.to_string())
            .or_default();
        for cid in block_cids {
            if !blocks.iter().any(|b| b == cid) {
                blocks.push(cid.clone());
            }
        }
    }

    /// Files currently associated with `cid`.
    pub fn files_for_block(&self, cid: &str) -> Vec<String> {
        self.registry
            .lock()
            .block_to_files
            .get(cid)
            .cloned()
            .unwrap_or_default()
    }

    /// Build the signed reuse proof for an upload.
    pub fn generate_reuse_proof(
        &self,
        file_hash: &str,
        descriptor_cid: &str,
        block_cids: &[String],
    ) -> ReuseProof {
        let registry = self.registry.lock();
        let now = Utc::now();

        let mut evidence = Vec::with_capacity(block_cids.len());
        let mut public_domain_proof = Vec::new();
        for cid in block_cids {
            let meta = self.pool.meta(cid);
            let is_public_domain = meta.as_ref().is_some_and(|m| m.is_public_domain);
            if is_public_domain {
                public_domain_proof.push(cid.clone());
            }
            evidence.push(ReuseEvidence {
                block_cid:         cid.clone(),
                file_associations: registry.block_to_files.get(cid).cloned().unwrap_or_default(),
                first_use:         meta.as_ref().map_or(now, |m| m.created_at),
                total_usages:      meta.as_ref().map_or(0, |m| m.usage_count),
                is_public_domain,
                popularity_score:  meta.as_ref().map_or(0.0, |m| m.popularity_score),
            });
        }

        let signature = proof_signature(file_hash, descriptor_cid, block_cids, &now);
        ReuseProof {
            file_hash:      file_hash.to_string(),
            descriptor_cid: descriptor_cid.to_string(),
            block_cids:     block_cids.to_vec(),
            reuse_evidence: evidence,
            public_domain_proof,
            timestamp:      now,
            signature,
        }
    }

    /// Aggregate counters over the audit log and the association registry.
    pub fn stats(&self) -> EnforcerStats {
        let entries = self.audit.snapshot();
        let accepted = entries.iter().filter(|e| e.action == AuditAction::Accept).count();
        let rejected = entries.iter().filter(|e| e.action == AuditAction::Reject).count();
        let warnings = entries.iter().filter(|e| e.action == AuditAction::Warning).count();
        let decided = entries.len();

        let registry = self.registry.lock();
        let block_associations: usize =
            registry.block_to_files.values().map(Vec::len).sum();
        let associated_blocks = registry.block_to_files.len();

        EnforcerStats {
            accepted,
            rejected,
            warnings,
            acceptance_rate: if decided == 0 {
                0.0
            } else {
                (accepted + warnings) as f64 / decided as f64
            },
            files_registered: registry.file_to_blocks.len(),
            block_associations,
            avg_block_reuse: if associated_blocks == 0 {
                0.0
            } else {
                block_associations as f64 / associated_blocks as f64
            },
        }
    }
}

fn decision_reason(
    action: AuditAction,
    violations: &[Violation],
    warnings: &[PolicyWarning],
) -> String {
    match action {
        AuditAction::Accept => "all policy checks passed".to_string(),
        _ => {
            let mut reason = String::new();
            for v in violations {
                let _ = write!(reason, "violation: {v}; ");
            }
            for w in warnings {
                let _ = write!(reason, "warning: {w}; ");
            }
            reason.trim_end_matches("; ").to_string()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
