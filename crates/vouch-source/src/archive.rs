//! Content-addressed archive client.
//!
//! An [`Archive`] stores envelopes under their gitoid and answers gitoid
//! queries. [`ArchiveSource`] turns that into a [`Sourcer`], remembering
//! which gitoids it already returned so repeated searches from the
//! policy loop only see new envelopes.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use vouch_attest::Registry;
use vouch_attest::statement::COLLECTION_PREDICATE_TYPE;
use vouch_dsse::digest::gitoid;
use vouch_dsse::{Envelope, HashAlgorithm};

use crate::error::SourceError;
use crate::{CollectionEnvelope, Sourcer};

/// Archive search parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitoidQuery {
    /// Collection (step) name.
    pub collection_name: String,
    /// Any of these subject digests must appear.
    pub subject_digests: Vec<String>,
    /// All of these attestation types must appear.
    pub attestations: Vec<String>,
    /// Gitoids the caller has already seen.
    pub exclude_gitoids: Vec<String>,
}

/// Backend storage for envelopes keyed by gitoid.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Gitoids of envelopes matching `query`.
    async fn search_gitoids(&self, query: &GitoidQuery) -> Result<Vec<String>, SourceError>;

    /// Raw envelope bytes stored under `gitoid`.
    async fn download(&self, gitoid: &str) -> Result<Vec<u8>, SourceError>;

    /// Store raw envelope bytes under `gitoid`.
    async fn store(&self, gitoid: &str, bytes: &[u8]) -> Result<(), SourceError>;
}

/// [`Sourcer`] over an [`Archive`].
pub struct ArchiveSource<A> {
    archive: A,
    registry: Arc<Registry>,
    seen: Mutex<HashSet<String>>,
}

impl<A: Archive> ArchiveSource<A> {
    /// Wrap `archive`, decoding collections through `registry`.
    #[must_use]
    pub fn new(archive: A, registry: Arc<Registry>) -> Self {
        Self {
            archive,
            registry,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// The wrapped archive.
    #[must_use]
    pub fn archive(&self) -> &A {
        &self.archive
    }

    fn seen_gitoids(&self) -> Vec<String> {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = seen.iter().cloned().collect();
        out.sort();
        out
    }

    fn mark_seen(&self, gitoid: &str) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gitoid.to_owned());
    }
}

impl<A> std::fmt::Debug for ArchiveSource<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<A: Archive> Sourcer for ArchiveSource<A> {
    async fn search(
        &self,
        cancel: &CancellationToken,
        collection_name: &str,
        subject_digests: &[String],
        attestations: &[String],
    ) -> Result<Vec<CollectionEnvelope>, SourceError> {
        let query = GitoidQuery {
            collection_name: collection_name.to_owned(),
            subject_digests: subject_digests.to_vec(),
            attestations: attestations.to_vec(),
            exclude_gitoids: self.seen_gitoids(),
        };

        let gitoids = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SourceError::Cancelled),
            found = self.archive.search_gitoids(&query) => found?,
        };
        tracing::debug!(
            collection = %collection_name,
            new = gitoids.len(),
            excluded = query.exclude_gitoids.len(),
            "archive search"
        );

        let mut out = Vec::with_capacity(gitoids.len());
        for id in gitoids {
            let bytes = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SourceError::Cancelled),
                bytes = self.archive.download(&id) => bytes?,
            };
            let loaded = CollectionEnvelope::from_slice(&id, &bytes, &self.registry)?;
            self.mark_seen(&id);
            out.push(loaded);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct StoredEnvelope {
    bytes: Vec<u8>,
    collection_name: String,
    subject_digests: HashSet<String>,
    attestations: HashSet<String>,
}

impl StoredEnvelope {
    /// Index raw bytes without a registry; only names, digests and types
    /// are needed to answer queries.
    fn index(gitoid: &str, bytes: &[u8]) -> Result<Self, SourceError> {
        let invalid = |reason: String| SourceError::InvalidEnvelope {
            reference: gitoid.to_owned(),
            reason,
        };
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| invalid(format!("not a DSSE envelope: {e}")))?;
        let statement: Value = serde_json::from_slice(&envelope.payload)
            .map_err(|e| invalid(format!("payload is not JSON: {e}")))?;
        if statement["predicateType"] != COLLECTION_PREDICATE_TYPE {
            return Err(invalid("predicate is not an attestation collection".to_owned()));
        }

        let predicate = &statement["predicate"];
        let collection_name = predicate["name"].as_str().unwrap_or_default().to_owned();
        let attestations = predicate["attestations"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|a| a["type"].as_str().map(str::to_owned))
            .collect();
        let subject_digests = statement["subject"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|s| s["digest"].as_object())
            .flat_map(|digests| digests.values())
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect();

        Ok(Self {
            bytes: bytes.to_vec(),
            collection_name,
            subject_digests,
            attestations,
        })
    }

    fn matches(&self, query: &GitoidQuery) -> bool {
        self.collection_name == query.collection_name
            && query
                .subject_digests
                .iter()
                .any(|d| self.subject_digests.contains(d))
            && query
                .attestations
                .iter()
                .all(|a| self.attestations.contains(a))
    }
}

/// In-process [`Archive`], for tests and offline use.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    objects: RwLock<BTreeMap<String, StoredEnvelope>>,
}

impl MemoryArchive {
    /// Empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize and store `envelope`, returning its gitoid.
    pub async fn store_envelope(&self, envelope: &Envelope) -> Result<String, SourceError> {
        let bytes = serde_json::to_vec(envelope)?;
        let id = gitoid(HashAlgorithm::Sha256, &bytes);
        self.store(&id, &bytes).await?;
        Ok(id)
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    async fn search_gitoids(&self, query: &GitoidQuery) -> Result<Vec<String>, SourceError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .iter()
            .filter(|(id, _)| !query.exclude_gitoids.contains(*id))
            .filter(|(_, stored)| stored.matches(query))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn download(&self, gitoid: &str) -> Result<Vec<u8>, SourceError> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(gitoid)
            .map(|stored| stored.bytes.clone())
            .ok_or_else(|| SourceError::NotFound(gitoid.to_owned()))
    }

    async fn store(&self, gitoid: &str, bytes: &[u8]) -> Result<(), SourceError> {
        let stored = StoredEnvelope::index(gitoid, bytes)?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gitoid.to_owned(), stored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vouch_attest::attestors::{git, product};
    use vouch_dsse::{EcdsaSigner, Signer};

    use super::*;
    use crate::test_support::signed_collection;

    async fn archive_with(steps: &[(&str, &str)]) -> MemoryArchive {
        let signer: Arc<dyn Signer> = Arc::new(EcdsaSigner::generate().unwrap());
        let archive = MemoryArchive::new();
        for (step, sha) in steps {
            archive
                .store_envelope(&signed_collection(step, sha, &signer).await)
                .await
                .unwrap();
        }
        archive
    }

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::with_builtins().unwrap())
    }

    #[tokio::test]
    async fn query_filters_name_digest_and_types() {
        let archive = archive_with(&[("build", "aa"), ("build", "bb"), ("test", "aa")]).await;
        assert_eq!(archive.len(), 3);

        let mut query = GitoidQuery {
            collection_name: "build".to_owned(),
            subject_digests: vec!["aa".to_owned()],
            ..GitoidQuery::default()
        };
        assert_eq!(archive.search_gitoids(&query).await.unwrap().len(), 1);

        query.attestations = vec![product::TYPE_URI.to_owned()];
        assert_eq!(archive.search_gitoids(&query).await.unwrap().len(), 1);

        query.attestations.push(git::TYPE_URI.to_owned());
        assert!(archive.search_gitoids(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_search_skips_seen_gitoids() {
        let source = ArchiveSource::new(archive_with(&[("build", "aa")]).await, registry());
        let cancel = CancellationToken::new();
        let digests = ["aa".to_owned()];

        let first = source.search(&cancel, "build", &digests, &[]).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].reference.starts_with("gitoid:blob:sha256:"));

        let second = source.search(&cancel, "build", &digests, &[]).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn download_of_unknown_gitoid_fails() {
        let archive = MemoryArchive::new();
        let err = archive.download("gitoid:blob:sha256:00").await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[tokio::test]
    async fn non_collection_payloads_rejected_on_store() {
        let archive = MemoryArchive::new();
        let envelope = Envelope {
            payload: br#"{"_type":"x","predicateType":"other","subject":[]}"#.to_vec(),
            payload_type: "application/vnd.in-toto+json".to_owned(),
            signatures: Vec::new(),
        };
        let err = archive.store_envelope(&envelope).await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidEnvelope { .. }));
        assert!(archive.is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_search() {
        let source = ArchiveSource::new(archive_with(&[("build", "aa")]).await, registry());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = source
            .search(&cancel, "build", &["aa".to_owned()], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Cancelled));
    }
}
