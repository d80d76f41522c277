//! Attestation sources for vouch.
//!
//! A source answers one question: which signed collections for a step
//! mention any of these subject digests and carry all of these
//! attestation types? Backends:
//!
//! - [`memory::MemorySource`]: indexed in-process store
//! - [`archive::ArchiveSource`]: content-addressed archive client with
//!   a per-instance seen set
//! - [`multi::MultiSource`]: concurrent fan-out, all-or-nothing
//! - [`verified::VerifiedSource`]: drops envelopes that fail DSSE
//!   verification

pub mod archive;
pub mod error;
pub mod memory;
pub mod multi;
pub mod verified;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vouch_attest::statement::{COLLECTION_PREDICATE_TYPE, Statement};
use vouch_attest::{Collection, Registry};
use vouch_dsse::{Envelope, PassedVerifier};

pub use archive::{Archive, ArchiveSource, GitoidQuery, MemoryArchive};
pub use error::SourceError;
pub use memory::MemorySource;
pub use multi::MultiSource;
pub use verified::VerifiedSource;

/// A decoded collection together with the envelope it came in.
#[derive(Debug, Clone)]
pub struct CollectionEnvelope {
    /// The signed envelope as loaded.
    pub envelope: Envelope,
    /// The statement decoded from the payload.
    pub statement: Statement,
    /// The collection decoded from the statement predicate.
    pub collection: Collection,
    /// Where the envelope came from (file path, gitoid, ...).
    pub reference: String,
}

impl CollectionEnvelope {
    /// Decode `envelope` into a collection.
    ///
    /// Only statements whose predicate is an attestation collection are
    /// accepted.
    pub fn from_envelope(
        reference: &str,
        envelope: Envelope,
        registry: &Registry,
    ) -> Result<Self, SourceError> {
        let statement: Statement =
            serde_json::from_slice(&envelope.payload).map_err(|e| SourceError::InvalidEnvelope {
                reference: reference.to_owned(),
                reason: format!("payload is not a statement: {e}"),
            })?;
        if statement.predicate_type != COLLECTION_PREDICATE_TYPE {
            return Err(SourceError::InvalidEnvelope {
                reference: reference.to_owned(),
                reason: format!("unexpected predicate type `{}`", statement.predicate_type),
            });
        }
        let collection = Collection::from_json(statement.predicate.clone(), registry)?;
        Ok(Self {
            envelope,
            statement,
            collection,
            reference: reference.to_owned(),
        })
    }

    /// Decode raw envelope JSON.
    pub fn from_slice(
        reference: &str,
        bytes: &[u8],
        registry: &Registry,
    ) -> Result<Self, SourceError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| SourceError::InvalidEnvelope {
                reference: reference.to_owned(),
                reason: format!("not a DSSE envelope: {e}"),
            })?;
        Self::from_envelope(reference, envelope, registry)
    }
}

/// A collection whose envelope passed verification.
#[derive(Debug, Clone)]
pub struct VerifiedCollection {
    /// Verifiers that accepted the envelope.
    pub verifiers: Vec<PassedVerifier>,
    /// The verified collection.
    pub collection_envelope: CollectionEnvelope,
}

/// Search for unverified collection envelopes.
#[async_trait]
pub trait Sourcer: Send + Sync {
    /// Envelopes for `collection_name` whose subjects overlap
    /// `subject_digests` and that carry every type in `attestations`.
    async fn search(
        &self,
        cancel: &CancellationToken,
        collection_name: &str,
        subject_digests: &[String],
        attestations: &[String],
    ) -> Result<Vec<CollectionEnvelope>, SourceError>;
}

/// Search for collections that passed signature verification.
#[async_trait]
pub trait VerifiedSourcer: Send + Sync {
    /// Like [`Sourcer::search`], keeping only verified envelopes.
    async fn search(
        &self,
        cancel: &CancellationToken,
        collection_name: &str,
        subject_digests: &[String],
        attestations: &[String],
    ) -> Result<Vec<VerifiedCollection>, SourceError>;
}
