//! Policy documents and the search loop that evaluates them.
//!
//! Verification is a bounded iterative deepening over the attestation
//! source. Each depth searches every step with the current digest pool,
//! keeps collections that pass the functionary and rego checks, and
//! grows the pool with their back references. Artifact chaining is
//! checked after every depth; the first depth that satisfies every step
//! wins.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use vouch_dsse::x509::parse_certificate;
use vouch_dsse::{Certificate, PublicKeyVerifier, TimestampVerifier, VerificationOptions, Verifier};
use vouch_source::{VerifiedCollection, VerifiedSourcer};

use crate::error::PolicyError;
use crate::step::{Step, check_step_references, verify_artifacts};

/// Default number of search rounds.
pub const DEFAULT_SEARCH_DEPTH: usize = 3;

pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

mod b64_list {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(items: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(items.iter().map(|item| BASE64.encode(item)))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|text| BASE64.decode(text).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// A supply-chain policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// The policy is rejected after this instant.
    pub expires: DateTime<Utc>,
    /// Trusted certificate roots by name.
    #[serde(default)]
    pub roots: BTreeMap<String, Root>,
    /// Trusted timestamp authorities by name.
    #[serde(default)]
    pub timestamp_authorities: BTreeMap<String, Root>,
    /// Trusted public keys by key id.
    #[serde(default)]
    pub public_keys: BTreeMap<String, PublicKey>,
    /// Steps by name.
    #[serde(default)]
    pub steps: BTreeMap<String, Step>,
}

/// A root certificate with optional intermediates (base64 PEM or DER).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// The root certificate.
    #[serde(with = "b64")]
    pub certificate: Vec<u8>,
    /// Intermediates issued under the root.
    #[serde(default, with = "b64_list", skip_serializing_if = "Vec::is_empty")]
    pub intermediates: Vec<Vec<u8>>,
}

/// A trusted public key (base64 PEM or DER).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Expected key id.
    pub keyid: String,
    /// The key.
    #[serde(with = "b64")]
    pub key: Vec<u8>,
}

/// A parsed root and its intermediates.
#[derive(Debug, Clone)]
pub struct TrustBundle {
    /// Root certificate.
    pub root: Certificate,
    /// Intermediate certificates.
    pub intermediates: Vec<Certificate>,
}

/// Inputs to [`Policy::verify`].
pub struct VerifyOptions {
    /// Number of search rounds; at least 1.
    pub search_depth: usize,
    /// Digests of the artifacts being verified.
    pub subject_digests: Vec<String>,
    /// Where verified collections come from.
    pub verified_source: Option<Arc<dyn VerifiedSourcer>>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            search_depth: DEFAULT_SEARCH_DEPTH,
            subject_digests: Vec::new(),
            verified_source: None,
        }
    }
}

impl std::fmt::Debug for VerifyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyOptions")
            .field("search_depth", &self.search_depth)
            .field("subject_digests", &self.subject_digests)
            .field("verified_source", &self.verified_source.is_some())
            .finish()
    }
}

impl VerifyOptions {
    /// Set the search depth.
    #[must_use]
    pub fn with_search_depth(mut self, depth: usize) -> Self {
        self.search_depth = depth;
        self
    }

    /// Set the subject digests.
    #[must_use]
    pub fn with_subject_digests(mut self, digests: Vec<String>) -> Self {
        self.subject_digests = digests;
        self
    }

    /// Set the verified source.
    #[must_use]
    pub fn with_verified_source(mut self, source: Arc<dyn VerifiedSourcer>) -> Self {
        self.verified_source = Some(source);
        self
    }
}

fn parse_bundles(roots: &BTreeMap<String, Root>) -> Result<BTreeMap<String, TrustBundle>, PolicyError> {
    roots
        .iter()
        .map(|(name, root)| {
            let cert_err =
                |e: vouch_dsse::DsseError| PolicyError::CertificateError(format!("root `{name}`: {e}"));
            let bundle = TrustBundle {
                root: parse_certificate(&root.certificate).map_err(cert_err)?,
                intermediates: root
                    .intermediates
                    .iter()
                    .map(|der| parse_certificate(der).map_err(cert_err))
                    .collect::<Result<_, _>>()?,
            };
            Ok((name.clone(), bundle))
        })
        .collect()
}

impl Policy {
    /// Parse a policy; step names default to their map keys.
    pub fn from_json(bytes: &[u8]) -> Result<Self, PolicyError> {
        let mut policy: Self = serde_json::from_slice(bytes)?;
        for (name, step) in &mut policy.steps {
            if step.name.is_empty() {
                step.name.clone_from(name);
            }
        }
        Ok(policy)
    }

    /// Read and parse a policy file.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let bytes = std::fs::read(path)?;
        Self::from_json(&bytes)
    }

    /// Certificate roots, parsed.
    pub fn trust_bundles(&self) -> Result<BTreeMap<String, TrustBundle>, PolicyError> {
        parse_bundles(&self.roots)
    }

    /// Timestamp authority roots, parsed.
    pub fn timestamp_authority_trust_bundles(
        &self,
    ) -> Result<BTreeMap<String, TrustBundle>, PolicyError> {
        parse_bundles(&self.timestamp_authorities)
    }

    /// Verifiers for every public key, keyed by key id.
    ///
    /// The computed key id must equal the declared one.
    pub fn public_key_verifiers(&self) -> Result<BTreeMap<String, Arc<dyn Verifier>>, PolicyError> {
        self.public_keys
            .iter()
            .map(|(name, key)| {
                let verifier = PublicKeyVerifier::from_pem(&key.key)?;
                if verifier.key_id() != key.keyid {
                    return Err(PolicyError::InvalidOption(format!(
                        "public key `{name}` has key id `{}`, policy declares `{}`",
                        verifier.key_id(),
                        key.keyid
                    )));
                }
                Ok((key.keyid.clone(), Arc::new(verifier) as Arc<dyn Verifier>))
            })
            .collect()
    }

    /// DSSE verification options trusting this policy's keys and roots.
    ///
    /// A policy that names timestamp authorities needs at least one
    /// timestamp verifier for them.
    pub fn verification_options(
        &self,
        timestamp_verifiers: Vec<Arc<dyn TimestampVerifier>>,
    ) -> Result<VerificationOptions, PolicyError> {
        let tsa_bundles = self.timestamp_authority_trust_bundles()?;
        if !tsa_bundles.is_empty() && timestamp_verifiers.is_empty() {
            return Err(PolicyError::InvalidOption(format!(
                "policy trusts {} timestamp authorities but no timestamp verifier was supplied",
                tsa_bundles.len()
            )));
        }
        let bundles = self.trust_bundles()?;
        Ok(VerificationOptions {
            roots: bundles.values().map(|b| b.root.clone()).collect(),
            intermediates: bundles
                .values()
                .flat_map(|b| b.intermediates.iter().cloned())
                .collect(),
            verifiers: self.public_key_verifiers()?.into_values().collect(),
            timestamp_verifiers,
            ..VerificationOptions::default()
        })
    }

    fn validate(&self, opts: &VerifyOptions) -> Result<Arc<dyn VerifiedSourcer>, PolicyError> {
        if opts.search_depth == 0 {
            return Err(PolicyError::InvalidOption(
                "search depth must be at least 1".to_owned(),
            ));
        }
        if opts.subject_digests.is_empty() {
            return Err(PolicyError::InvalidOption(
                "at least one subject digest is required".to_owned(),
            ));
        }
        let Some(source) = &opts.verified_source else {
            return Err(PolicyError::InvalidOption(
                "a verified source is required".to_owned(),
            ));
        };
        if self.steps.is_empty() {
            return Err(PolicyError::InvalidOption("policy has no steps".to_owned()));
        }
        if Utc::now() > self.expires {
            return Err(PolicyError::Expired(self.expires));
        }
        check_step_references(&self.steps)?;
        Ok(Arc::clone(source))
    }

    /// Evaluate the policy for `opts.subject_digests`.
    ///
    /// Returns the accepted collections per step, or
    /// [`PolicyError::Denied`] wrapping the last depth's failure.
    pub async fn verify(
        &self,
        cancel: &CancellationToken,
        opts: VerifyOptions,
    ) -> Result<BTreeMap<String, Vec<VerifiedCollection>>, PolicyError> {
        let source = self.validate(&opts)?;
        let bundles = self.trust_bundles()?;
        let tsa_bundles = self.timestamp_authority_trust_bundles()?;
        tracing::debug!(
            roots = bundles.len(),
            timestamp_authorities = tsa_bundles.len(),
            steps = self.steps.len(),
            "evaluating policy"
        );

        let mut pool: BTreeSet<String> = opts.subject_digests.iter().cloned().collect();
        let mut passed_by_step: BTreeMap<String, Vec<VerifiedCollection>> = BTreeMap::new();
        let mut last_error = None;

        for depth in 0..opts.search_depth {
            let digests: Vec<String> = pool.iter().cloned().collect();
            let mut frontier = BTreeSet::new();

            for (name, step) in &self.steps {
                let found = source
                    .search(cancel, name, &digests, &step.required_attestations())
                    .await?;
                let found = step.check_functionaries(found, &bundles, !tsa_bundles.is_empty());
                let found = step.validate_attestations(found)?;

                let passed = passed_by_step.entry(name.clone()).or_default();
                for collection in found {
                    let reference = &collection.collection_envelope.reference;
                    if passed
                        .iter()
                        .any(|p| &p.collection_envelope.reference == reference)
                    {
                        continue;
                    }
                    for digest in collection.collection_envelope.collection.back_refs().values() {
                        frontier.extend(digest.values().map(str::to_owned));
                    }
                    passed.push(collection);
                }
            }

            let new_digests = frontier.difference(&pool).count();
            pool.extend(frontier);
            tracing::info!(
                depth,
                new_digests,
                passed = passed_by_step.values().map(Vec::len).sum::<usize>(),
                "policy search round complete"
            );

            match verify_artifacts(&self.steps, &passed_by_step) {
                Ok(accepted) => {
                    tracing::info!(depth, "policy satisfied");
                    return Ok(accepted);
                }
                Err(e) => {
                    tracing::debug!(depth, error = %e, "policy not yet satisfied");
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| PolicyError::InvalidOption("no search performed".to_owned()));
        tracing::warn!(error = %last, "policy denied");
        Err(PolicyError::Denied(Box::new(last)))
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use chrono::Duration;
    use vouch_attest::Registry;
    use vouch_dsse::envelope::SignOptions;
    use vouch_dsse::timestamp::{FakeTimestampVerifier, FakeTimestamper};
    use vouch_dsse::{EcdsaSigner, Signer};
    use vouch_source::{MemorySource, VerifiedSource};

    use super::*;
    use crate::constraint::CertConstraint;
    use crate::step::Functionary;
    use crate::test_support::{TestCa, signed_envelope, signed_envelope_with};

    struct Fixture {
        signer: Arc<dyn Signer>,
        policy: Policy,
    }

    fn fixture() -> Fixture {
        let ecdsa = EcdsaSigner::generate().unwrap();
        let pem = ecdsa.public_key_pem();
        let signer: Arc<dyn Signer> = Arc::new(ecdsa);
        let keyid = signer.key_id();

        let functionary = Functionary {
            kind: "publickey".to_owned(),
            public_key_id: keyid.clone(),
            cert_constraint: None,
        };
        let step = |name: &str, from: &[&str]| Step {
            name: name.to_owned(),
            functionaries: vec![functionary.clone()],
            attestations: Vec::new(),
            artifacts_from: from.iter().map(|s| (*s).to_owned()).collect(),
        };

        let policy = Policy {
            expires: Utc::now() + Duration::days(1),
            roots: BTreeMap::new(),
            timestamp_authorities: BTreeMap::new(),
            public_keys: BTreeMap::from([(
                keyid.clone(),
                PublicKey {
                    keyid,
                    key: pem.into_bytes(),
                },
            )]),
            steps: BTreeMap::from([
                ("step1".to_owned(), step("step1", &[])),
                ("step2".to_owned(), step("step2", &["step1"])),
            ]),
        };
        Fixture { signer, policy }
    }

    async fn source(policy: &Policy, envelopes: Vec<vouch_dsse::Envelope>) -> Arc<dyn VerifiedSourcer> {
        let mut memory = MemorySource::new(Arc::new(Registry::with_builtins().unwrap()));
        for (i, envelope) in envelopes.into_iter().enumerate() {
            memory.load_envelope(&format!("env-{i}"), envelope).unwrap();
        }
        Arc::new(VerifiedSource::new(
            memory,
            policy.verification_options(Vec::new()).unwrap(),
        ))
    }

    fn opts(source: Arc<dyn VerifiedSourcer>, depth: usize) -> VerifyOptions {
        VerifyOptions::default()
            .with_search_depth(depth)
            .with_subject_digests(vec!["p1".to_owned()])
            .with_verified_source(source)
    }

    #[tokio::test]
    async fn artifact_chain_passes_through_back_refs() {
        let f = fixture();
        let step1 = signed_envelope("step1", &[("src", "s1")], &[("bin", "b1")], "c0ffee", &f.signer).await;
        let step2 = signed_envelope("step2", &[("bin", "b1")], &[("pkg", "p1")], "c0ffee", &f.signer).await;
        let source = source(&f.policy, vec![step1, step2]).await;

        let accepted = f
            .policy
            .verify(&CancellationToken::new(), opts(Arc::clone(&source), 3))
            .await
            .unwrap();
        assert_eq!(accepted["step1"].len(), 1);
        assert_eq!(accepted["step2"].len(), 1);

        // step1 is only reachable through step2's commit back reference.
        let err = f
            .policy
            .verify(&CancellationToken::new(), opts(source, 1))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, PolicyError::Denied(inner) if matches!(inner.as_ref(), PolicyError::NoAttestations(s) if s == "step1"))
        );
    }

    #[tokio::test]
    async fn mutated_material_denies_second_step() {
        let f = fixture();
        let step1 = signed_envelope("step1", &[("src", "s1")], &[("bin", "b1")], "c0ffee", &f.signer).await;
        let step2 = signed_envelope("step2", &[("bin", "tampered")], &[("pkg", "p1")], "c0ffee", &f.signer).await;
        let source = source(&f.policy, vec![step1, step2]).await;

        let err = f
            .policy
            .verify(&CancellationToken::new(), opts(source, 3))
            .await
            .unwrap_err();
        assert!(err.is_denial());
        match err {
            PolicyError::Denied(inner) => {
                assert!(matches!(*inner, PolicyError::NoAttestations(ref s) if s == "step2"));
            }
            other => panic!("expected denial, got {other}"),
        }
    }

    #[tokio::test]
    async fn untrusted_signer_is_not_a_functionary() {
        let f = fixture();
        let stranger: Arc<dyn Signer> = Arc::new(EcdsaSigner::generate().unwrap());
        let step1 = signed_envelope("step1", &[("src", "s1")], &[("bin", "b1")], "c0ffee", &stranger).await;
        let step2 = signed_envelope("step2", &[("bin", "b1")], &[("pkg", "p1")], "c0ffee", &f.signer).await;
        let source = source(&f.policy, vec![step1, step2]).await;

        let err = f
            .policy
            .verify(&CancellationToken::new(), opts(source, 3))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, PolicyError::Denied(inner) if matches!(inner.as_ref(), PolicyError::NoAttestations(s) if s == "step1"))
        );
    }

    #[tokio::test]
    async fn expired_policy_rejected() {
        let mut f = fixture();
        f.policy.expires = Utc::now() - Duration::seconds(1);
        let source = source(&f.policy, Vec::new()).await;
        let err = f
            .policy
            .verify(&CancellationToken::new(), opts(source, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Expired(_)));
    }

    #[tokio::test]
    async fn options_validated() {
        let f = fixture();
        let source = source(&f.policy, Vec::new()).await;
        let cancel = CancellationToken::new();

        let err = f.policy.verify(&cancel, opts(Arc::clone(&source), 0)).await.unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOption(_)));

        let no_digests = VerifyOptions::default().with_verified_source(source);
        let err = f.policy.verify(&cancel, no_digests).await.unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOption(_)));

        let no_source = VerifyOptions::default().with_subject_digests(vec!["p1".to_owned()]);
        let err = f.policy.verify(&cancel, no_source).await.unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOption(_)));
    }

    #[test]
    fn json_round_trip_fills_step_names() {
        let f = fixture();
        let mut json = serde_json::to_value(&f.policy).unwrap();
        assert!(json["publicKeys"].is_object());
        assert!(json["expires"].is_string());
        json["steps"]["step1"]["name"] = serde_json::Value::String(String::new());

        let parsed = Policy::from_json(&serde_json::to_vec(&json).unwrap()).unwrap();
        assert_eq!(parsed.steps["step1"].name, "step1");
        assert_eq!(parsed.public_key_verifiers().unwrap().len(), 1);
    }

    #[test]
    fn mismatched_key_id_rejected() {
        let mut f = fixture();
        for key in f.policy.public_keys.values_mut() {
            key.keyid = "not-the-key-id".to_owned();
        }
        let err = f.policy.public_key_verifiers().unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOption(_)));
    }

    #[test]
    fn roots_decode_from_base64_pem() {
        let ca = crate::test_support::TestCa::root("Policy Root");
        let pem = vouch_dsse::pem::der_to_pem(&ca.der(), "CERTIFICATE");
        let json = serde_json::json!({
            "expires": "2099-01-01T00:00:00Z",
            "roots": {"main": {"certificate": BASE64.encode(pem)}},
            "steps": {}
        });
        let policy = Policy::from_json(&serde_json::to_vec(&json).unwrap()).unwrap();
        let bundles = policy.trust_bundles().unwrap();
        assert!(bundles.contains_key("main"));
        assert_eq!(policy.verification_options(Vec::new()).unwrap().roots.len(), 1);
    }

    fn timestamped_policy(ca: &TestCa, tsa: &TestCa) -> Policy {
        let functionary = Functionary {
            kind: "root".to_owned(),
            public_key_id: String::new(),
            cert_constraint: Some(CertConstraint {
                roots: vec!["main".to_owned()],
                ..CertConstraint::default()
            }),
        };
        let root = |ca: &TestCa| Root {
            certificate: ca.der(),
            intermediates: Vec::new(),
        };
        Policy {
            expires: Utc::now() + Duration::days(1),
            roots: BTreeMap::from([("main".to_owned(), root(ca))]),
            timestamp_authorities: BTreeMap::from([("tsa".to_owned(), root(tsa))]),
            public_keys: BTreeMap::new(),
            steps: BTreeMap::from([(
                "build".to_owned(),
                Step {
                    name: "build".to_owned(),
                    functionaries: vec![functionary],
                    ..Step::default()
                },
            )]),
        }
    }

    #[test]
    fn timestamp_authorities_need_a_verifier() {
        let policy = timestamped_policy(&TestCa::root("Root"), &TestCa::root("TSA"));
        let err = policy.verification_options(Vec::new()).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOption(_)), "got: {err}");

        let opts = policy
            .verification_options(vec![Arc::new(FakeTimestampVerifier)])
            .unwrap();
        assert_eq!(opts.timestamp_verifiers.len(), 1);
    }

    #[tokio::test]
    async fn timestamp_authorities_require_attested_certificates() {
        let ca = TestCa::root("Root");
        let policy = timestamped_policy(&ca, &TestCa::root("TSA"));
        let (leaf, _) = ca.leaf("builder", "Org", "build.example.com", &[]);
        let leaf: Arc<dyn Signer> = Arc::new(leaf);

        let stamped = SignOptions {
            signers: vec![Arc::clone(&leaf)],
            timestampers: vec![Arc::new(FakeTimestamper::new(Utc::now() - Duration::minutes(5)))],
        };
        let stamped = signed_envelope_with("build", &[], &[("pkg", "p1")], "c0ffee", &stamped).await;
        let unstamped = signed_envelope("build", &[], &[("pkg", "p1")], "c0ffee", &leaf).await;

        let dsse = policy
            .verification_options(vec![Arc::new(FakeTimestampVerifier)])
            .unwrap();
        let source_with = |envelope: vouch_dsse::Envelope, options: VerificationOptions| {
            let mut memory = MemorySource::new(Arc::new(Registry::with_builtins().unwrap()));
            memory.load_envelope("env", envelope).unwrap();
            Arc::new(VerifiedSource::new(memory, options)) as Arc<dyn VerifiedSourcer>
        };

        let accepted = policy
            .verify(&CancellationToken::new(), opts(source_with(stamped, dsse.clone()), 1))
            .await
            .unwrap();
        assert_eq!(accepted["build"].len(), 1);

        // A chain validated at wall-clock time does not satisfy the policy.
        let wall_clock = VerificationOptions {
            timestamp_verifiers: Vec::new(),
            ..dsse
        };
        let err = policy
            .verify(&CancellationToken::new(), opts(source_with(unstamped, wall_clock), 1))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, PolicyError::Denied(inner) if matches!(inner.as_ref(), PolicyError::NoAttestations(s) if s == "build")),
            "got: {err}"
        );
    }
}
