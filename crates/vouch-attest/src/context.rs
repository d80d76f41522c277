//! Per-run attestation context.
//!
//! The context owns the configured attestors, runs them phase by phase,
//! and aggregates the materials and products they report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use vouch_dsse::{DigestSet, DigestValue};

use crate::attestor::{Attestor, Product};
use crate::error::AttestationError;

/// Options for an [`AttestationContext`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Directory the attestors observe.
    pub working_dir: PathBuf,
    /// Digest algorithms used when hashing files.
    pub hashes: Vec<DigestValue>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            hashes: vec![DigestValue::SHA256],
        }
    }
}

impl ContextOptions {
    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Set the digest algorithms.
    #[must_use]
    pub fn with_hashes(mut self, hashes: Vec<DigestValue>) -> Self {
        self.hashes = hashes;
        self
    }
}

/// Audit record of one attestor run.
#[derive(Debug, Clone)]
pub struct CompletedAttestor {
    /// The attestor and its recorded state.
    pub attestor: Arc<dyn Attestor>,
    /// When `attest` was called.
    pub start_time: DateTime<Utc>,
    /// When `attest` returned.
    pub end_time: DateTime<Utc>,
    /// Error message if the attestor failed.
    pub error: Option<String>,
}

/// Mutable aggregator for a single attestation run.
pub struct AttestationContext {
    working_dir: PathBuf,
    hashes: Vec<DigestValue>,
    attestors: Vec<Box<dyn Attestor>>,
    completed: Vec<CompletedAttestor>,
    materials: BTreeMap<String, DigestSet>,
    products: BTreeMap<String, Product>,
}

impl AttestationContext {
    /// Create a context for `attestors`.
    #[must_use]
    pub fn new(attestors: Vec<Box<dyn Attestor>>, opts: ContextOptions) -> Self {
        Self {
            working_dir: opts.working_dir,
            hashes: opts.hashes,
            attestors,
            completed: Vec::new(),
            materials: BTreeMap::new(),
            products: BTreeMap::new(),
        }
    }

    /// Run every attestor, phase by phase.
    ///
    /// Attestors in the same phase run in configured order. The first
    /// failure aborts the run; its record (with the error) is still
    /// appended to [`completed_attestors`](Self::completed_attestors).
    pub fn run_attestors(&mut self) -> Result<(), AttestationError> {
        let mut attestors = std::mem::take(&mut self.attestors);
        attestors.sort_by_key(|a| a.run_type());

        for mut attestor in attestors {
            let name = attestor.name().to_owned();
            info!(attestor = %name, run_type = %attestor.run_type(), "starting attestor");

            let start_time = Utc::now();
            let result = attestor.attest(self);
            let end_time = Utc::now();

            if let Err(e) = result {
                warn!(attestor = %name, error = %e, "attestor failed, aborting run");
                self.completed.push(CompletedAttestor {
                    attestor: Arc::from(attestor),
                    start_time,
                    end_time,
                    error: Some(e.to_string()),
                });
                return Err(AttestationError::AttestorFailed {
                    name,
                    reason: e.to_string(),
                });
            }

            self.merge_evidence(attestor.as_ref());
            debug!(attestor = %name, "attestor finished");
            self.completed.push(CompletedAttestor {
                attestor: Arc::from(attestor),
                start_time,
                end_time,
                error: None,
            });
        }

        Ok(())
    }

    fn merge_evidence(&mut self, attestor: &dyn Attestor) {
        if let Some(materialer) = attestor.as_materialer() {
            self.materials.extend(materialer.materials());
        }
        if let Some(producer) = attestor.as_producer() {
            self.products.extend(producer.products());
        }
    }

    /// Directory the attestors observe.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Requested digest algorithms.
    #[must_use]
    pub fn hashes(&self) -> &[DigestValue] {
        &self.hashes
    }

    /// Audit trail of every attestor that ran, including a failure.
    #[must_use]
    pub fn completed_attestors(&self) -> &[CompletedAttestor] {
        &self.completed
    }

    /// Materials merged so far.
    #[must_use]
    pub fn materials(&self) -> &BTreeMap<String, DigestSet> {
        &self.materials
    }

    /// Products merged so far.
    #[must_use]
    pub fn products(&self) -> &BTreeMap<String, Product> {
        &self.products
    }
}
