//! In-process attestation store.
//!
//! Envelopes are indexed three ways at load time: collection name to
//! references, reference to subject digests, and reference to
//! attestation types. Searches then never re-decode payloads.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vouch_attest::Registry;
use vouch_dsse::Envelope;

use crate::error::SourceError;
use crate::{CollectionEnvelope, Sourcer};

/// Indexed, in-memory [`Sourcer`].
#[derive(Debug)]
pub struct MemorySource {
    registry: Arc<Registry>,
    envelopes: BTreeMap<String, CollectionEnvelope>,
    references_by_collection: HashMap<String, BTreeSet<String>>,
    subject_digests_by_reference: HashMap<String, HashSet<String>>,
    attestations_by_reference: HashMap<String, HashSet<String>>,
}

impl MemorySource {
    /// Empty source decoding collections through `registry`.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            envelopes: BTreeMap::new(),
            references_by_collection: HashMap::new(),
            subject_digests_by_reference: HashMap::new(),
            attestations_by_reference: HashMap::new(),
        }
    }

    /// Number of loaded envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    /// True when nothing is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Index `envelope` under `reference`.
    ///
    /// Each reference may be loaded once.
    pub fn load_envelope(&mut self, reference: &str, envelope: Envelope) -> Result<(), SourceError> {
        if self.envelopes.contains_key(reference) {
            return Err(SourceError::DuplicateReference(reference.to_owned()));
        }
        let loaded = CollectionEnvelope::from_envelope(reference, envelope, &self.registry)?;

        let digests: HashSet<String> = loaded
            .statement
            .subject_digest_values()
            .map(str::to_owned)
            .collect();
        let types: HashSet<String> = loaded.collection.attestation_types().into_iter().collect();

        tracing::debug!(
            reference = %reference,
            collection = %loaded.collection.name,
            subjects = digests.len(),
            attestations = types.len(),
            "indexed envelope"
        );

        self.references_by_collection
            .entry(loaded.collection.name.clone())
            .or_default()
            .insert(reference.to_owned());
        self.subject_digests_by_reference
            .insert(reference.to_owned(), digests);
        self.attestations_by_reference
            .insert(reference.to_owned(), types);
        self.envelopes.insert(reference.to_owned(), loaded);
        Ok(())
    }

    /// Decode envelope JSON and index it under `reference`.
    pub fn load_bytes(&mut self, reference: &str, bytes: &[u8]) -> Result<(), SourceError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| SourceError::InvalidEnvelope {
                reference: reference.to_owned(),
                reason: format!("not a DSSE envelope: {e}"),
            })?;
        self.load_envelope(reference, envelope)
    }

    /// Read an envelope file, using its path as the reference.
    pub fn load_file(&mut self, path: &Path) -> Result<(), SourceError> {
        let bytes = std::fs::read(path)?;
        self.load_bytes(&path.display().to_string(), &bytes)
    }

    fn matches(&self, reference: &str, subject_digests: &[String], attestations: &[String]) -> bool {
        let digest_hit = self
            .subject_digests_by_reference
            .get(reference)
            .is_some_and(|set| subject_digests.iter().any(|d| set.contains(d)));
        if !digest_hit {
            return false;
        }
        self.attestations_by_reference
            .get(reference)
            .is_some_and(|set| attestations.iter().all(|a| set.contains(a)))
    }
}

#[async_trait]
impl Sourcer for MemorySource {
    async fn search(
        &self,
        cancel: &CancellationToken,
        collection_name: &str,
        subject_digests: &[String],
        attestations: &[String],
    ) -> Result<Vec<CollectionEnvelope>, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        let Some(references) = self.references_by_collection.get(collection_name) else {
            return Ok(Vec::new());
        };

        let found: Vec<CollectionEnvelope> = references
            .iter()
            .filter(|r| self.matches(r, subject_digests, attestations))
            .filter_map(|r| self.envelopes.get(r).cloned())
            .collect();
        tracing::debug!(
            collection = %collection_name,
            found = found.len(),
            "memory search"
        );
        Ok(found)
    }
}
