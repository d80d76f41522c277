//! Verification filter over any [`Sourcer`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vouch_dsse::VerificationOptions;

use crate::error::SourceError;
use crate::{Sourcer, VerifiedCollection, VerifiedSourcer};

/// Runs DSSE verification on every envelope a source returns and keeps
/// only the ones that pass.
#[derive(Debug)]
pub struct VerifiedSource<S> {
    source: S,
    options: VerificationOptions,
}

impl<S: Sourcer> VerifiedSource<S> {
    /// Verify results of `source` against `options`.
    #[must_use]
    pub fn new(source: S, options: VerificationOptions) -> Self {
        Self { source, options }
    }

    /// The verification options applied to each envelope.
    #[must_use]
    pub fn options(&self) -> &VerificationOptions {
        &self.options
    }
}

#[async_trait]
impl<S: Sourcer> VerifiedSourcer for VerifiedSource<S> {
    async fn search(
        &self,
        cancel: &CancellationToken,
        collection_name: &str,
        subject_digests: &[String],
        attestations: &[String],
    ) -> Result<Vec<VerifiedCollection>, SourceError> {
        let candidates = self
            .source
            .search(cancel, collection_name, subject_digests, attestations)
            .await?;

        let mut verified = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match candidate.envelope.verify(&self.options).await {
                Ok(verifiers) => verified.push(VerifiedCollection {
                    verifiers,
                    collection_envelope: candidate,
                }),
                Err(e) => tracing::warn!(
                    reference = %candidate.reference,
                    collection = %collection_name,
                    error = %e,
                    "dropping envelope that failed verification"
                ),
            }
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vouch_attest::Registry;
    use vouch_dsse::{EcdsaSigner, Signer};

    use super::*;
    use crate::memory::MemorySource;
    use crate::test_support::signed_collection;

    #[tokio::test]
    async fn only_trusted_envelopes_survive() {
        let trusted: Arc<dyn Signer> = Arc::new(EcdsaSigner::generate().unwrap());
        let stranger: Arc<dyn Signer> = Arc::new(EcdsaSigner::generate().unwrap());

        let mut memory = MemorySource::new(Arc::new(Registry::with_builtins().unwrap()));
        memory
            .load_envelope("good", signed_collection("build", "aa", &trusted).await)
            .unwrap();
        memory
            .load_envelope("bad", signed_collection("build", "aa", &stranger).await)
            .unwrap();

        let source = VerifiedSource::new(
            memory,
            VerificationOptions {
                verifiers: vec![trusted.verifier().unwrap()],
                ..VerificationOptions::default()
            },
        );
        let found = source
            .search(&CancellationToken::new(), "build", &["aa".to_owned()], &[])
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].collection_envelope.reference, "good");
        assert_eq!(found[0].verifiers[0].verifier.key_id(), trusted.key_id());
    }

    #[tokio::test]
    async fn source_errors_propagate() {
        let memory = MemorySource::new(Arc::new(Registry::with_builtins().unwrap()));
        let source = VerifiedSource::new(memory, VerificationOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = source
            .search(&cancel, "build", &["aa".to_owned()], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Cancelled));
    }
}
