//! Error types for attestation sources.

use vouch_attest::AttestationError;
use vouch_dsse::DsseError;

/// Errors from searching or loading attestation sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The caller cancelled the search.
    #[error("search cancelled")]
    Cancelled,

    /// A reference was loaded twice into the same source.
    #[error("duplicate reference `{0}`")]
    DuplicateReference(String),

    /// An envelope could not be decoded into a collection.
    #[error("invalid envelope `{reference}`: {reason}")]
    InvalidEnvelope {
        /// Where the envelope came from.
        reference: String,
        /// What was wrong with it.
        reason: String,
    },

    /// An archive had no object under the requested id.
    #[error("object `{0}` not found")]
    NotFound(String),

    /// A background search task panicked or was aborted.
    #[error("search task failed: {0}")]
    TaskFailed(String),

    /// The archive backend failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// Rebuilding a collection failed.
    #[error(transparent)]
    Attestation(#[from] AttestationError),

    /// Envelope handling failed.
    #[error(transparent)]
    Dsse(#[from] DsseError),

    /// I/O error while loading attestations.
    #[error("source I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON decoding failed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
