//! DSSE envelopes and the signing primitives under them.
//!
//! This crate is the leaf of the vouch workspace:
//!
//! - [`digest`]: multi-algorithm digest sets with overlap matching
//! - [`crypto`]: signer and verifier capabilities over `aws-lc-rs`
//! - [`x509`]: certificate-backed verifiers with chain validation
//! - [`timestamp`]: timestamp authority seams
//! - [`envelope`]: DSSE sign and two-track verify

pub mod crypto;
pub mod digest;
pub mod envelope;
pub mod error;
pub mod pem;
pub mod timestamp;
pub mod x509;

pub use crypto::{EcdsaSigner, Ed25519Signer, PublicKeyVerifier, Signer, Verifier};
pub use digest::{DigestSet, DigestValue, HashAlgorithm};
pub use envelope::{
    Envelope, PassedVerifier, SignOptions, Signature, VerificationOptions, VerificationPath,
};
pub use error::DsseError;
pub use timestamp::{TimestampVerifier, Timestamper};
pub use x509::{X509Signer, X509Verifier};

/// Re-exported so downstream crates name certificates without a direct
/// `x509-cert` dependency.
pub use x509_cert::Certificate;
