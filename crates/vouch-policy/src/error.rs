//! Error types for policy evaluation.

use chrono::{DateTime, Utc};
use vouch_dsse::DsseError;
use vouch_source::SourceError;

/// Errors from loading or evaluating a policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Verification options or policy content are unusable.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The policy is past its expiry.
    #[error("policy expired at {0}")]
    Expired(DateTime<Utc>),

    /// No search depth satisfied the policy; wraps the last failure.
    #[error("policy denied: {0}")]
    Denied(Box<PolicyError>),

    /// A step has no acceptable collection.
    #[error("no acceptable attestations for step `{0}`")]
    NoAttestations(String),

    /// A material does not match what a predecessor step produced.
    #[error("material `{path}` of step `{step}` does not match artifacts of step `{predecessor}`")]
    MismatchArtifact {
        /// Consuming step.
        step: String,
        /// Producing step.
        predecessor: String,
        /// Artifact path.
        path: String,
    },

    /// No functionary of the step matches the signer.
    #[error("signer does not match any functionary of step `{0}`")]
    FunctionaryMismatch(String),

    /// A certificate field failed its constraint.
    #[error("certificate constraint failed: {0}")]
    ConstraintFailed(String),

    /// A rego policy produced deny messages.
    #[error("rego policy `{policy}` denied: {}", reasons.join("; "))]
    RegoDenied {
        /// Name of the rego module.
        policy: String,
        /// Collected deny messages.
        reasons: Vec<String>,
    },

    /// A rego module failed to load or evaluate.
    #[error("rego evaluation error: {0}")]
    RegoError(String),

    /// `artifactsFrom` names a step the policy does not define.
    #[error("unknown step `{0}`")]
    UnknownStep(String),

    /// Trust material in the policy is malformed.
    #[error("certificate error: {0}")]
    CertificateError(String),

    /// The attestation source failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Envelope or key handling failed.
    #[error(transparent)]
    Dsse(#[from] DsseError),

    /// I/O error while loading a policy.
    #[error("policy I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON decoding failed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl PolicyError {
    /// True for business denials, false for malfunctions.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::Expired(_)
                | Self::Denied(_)
                | Self::NoAttestations(_)
                | Self::MismatchArtifact { .. }
                | Self::FunctionaryMismatch(_)
                | Self::ConstraintFailed(_)
                | Self::RegoDenied { .. }
        )
    }
}
