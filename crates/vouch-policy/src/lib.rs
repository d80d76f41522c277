//! Policy evaluation for vouch attestations.
//!
//! `vouch-policy` decides whether a set of artifacts is backed by
//! trustworthy attestations:
//!
//! 1. **Functionaries**: who may sign each step (bare keys or X.509
//!    identities with glob constraints)
//! 2. **Attestations**: which attestation types each step must carry,
//!    with optional rego modules over their content
//! 3. **Artifact chaining**: a step's materials must match what its
//!    predecessors produced
//!
//! Collections are discovered through a
//! [`VerifiedSourcer`](vouch_source::VerifiedSourcer) by iterative
//! deepening over subject digests and back references.

pub mod constraint;
pub mod error;
pub mod policy;
pub mod rego;
pub mod step;

pub use constraint::{CertConstraint, FulcioExtensions};
pub use error::PolicyError;
pub use policy::{Policy, PublicKey, Root, TrustBundle, VerifyOptions};
pub use step::{AttestationPolicy, Functionary, RegoPolicy, Step};

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixtures: a throwaway PKI and collection builders.

    use std::sync::Arc;

    use chrono::Utc;
    use rcgen::{
        BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType, IsCa,
        KeyPair, SanType,
    };
    use vouch_attest::attestors::{GitAttestor, MaterialAttestor, ProductAttestor};
    use vouch_attest::collection::CollectionAttestation;
    use vouch_attest::statement::{COLLECTION_PREDICATE_TYPE, PAYLOAD_TYPE};
    use vouch_attest::{Attestor, Collection, Product, Statement};
    use vouch_dsse::envelope::SignOptions;
    use vouch_dsse::x509::parse_certificate;
    use vouch_dsse::{DigestSet, EcdsaSigner, Envelope, Signer, X509Signer};
    use vouch_source::{CollectionEnvelope, VerifiedCollection};

    use crate::policy::TrustBundle;

    pub(crate) struct TestCa {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    impl TestCa {
        pub(crate) fn root(cn: &str) -> Self {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.distinguished_name = DistinguishedName::new();
            params.distinguished_name.push(DnType::CommonName, cn);
            let cert = params.self_signed(&key).unwrap();
            Self { cert, key }
        }

        pub(crate) fn der(&self) -> Vec<u8> {
            self.cert.der().to_vec()
        }

        /// Leaf signer issued by this CA. `extensions` are (dotted OID,
        /// UTF-8 value) pairs.
        pub(crate) fn leaf(
            &self,
            cn: &str,
            org: &str,
            dns: &str,
            extensions: &[(String, &str)],
        ) -> (X509Signer, Vec<u8>) {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::default();
            params.distinguished_name = DistinguishedName::new();
            params.distinguished_name.push(DnType::CommonName, cn);
            params.distinguished_name.push(DnType::OrganizationName, org);
            params.subject_alt_names = vec![SanType::DnsName(dns.try_into().unwrap())];
            for (oid, value) in extensions {
                let arcs: Vec<u64> = oid.split('.').map(|a| a.parse().unwrap()).collect();
                let mut content = vec![0x0c, u8::try_from(value.len()).unwrap()];
                content.extend_from_slice(value.as_bytes());
                params
                    .custom_extensions
                    .push(CustomExtension::from_oid_content(&arcs, content));
            }
            let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

            let inner = EcdsaSigner::from_pkcs8_der(&key.serialize_der()).unwrap();
            let der = cert.der().to_vec();
            let signer = X509Signer::new(Arc::new(inner), &der, Vec::new()).unwrap();
            (signer, der)
        }
    }

    pub(crate) fn bundle(ca: &TestCa) -> TrustBundle {
        TrustBundle {
            root: parse_certificate(&ca.der()).unwrap(),
            intermediates: Vec::new(),
        }
    }

    fn record(attestor: Arc<dyn Attestor>) -> CollectionAttestation {
        let now = Utc::now();
        CollectionAttestation {
            type_uri: attestor.type_uri().to_owned(),
            attestation: attestor,
            start_time: now,
            end_time: now,
        }
    }

    /// Collection with a commit, materials and products (path, sha256).
    pub(crate) fn collection(
        step: &str,
        materials: &[(&str, &str)],
        products: &[(&str, &str)],
        commit: &str,
        extra: Vec<Arc<dyn Attestor>>,
    ) -> Collection {
        let git = GitAttestor {
            commit_hash: commit.to_owned(),
            ..GitAttestor::default()
        };
        let mut material = MaterialAttestor::default();
        for (path, sha) in materials {
            material
                .materials
                .insert((*path).to_owned(), DigestSet::sha256(*sha));
        }
        let mut product = ProductAttestor::default();
        for (path, sha) in products {
            product.products.insert(
                (*path).to_owned(),
                Product {
                    mime_type: "application/octet-stream".to_owned(),
                    digest: DigestSet::sha256(*sha),
                },
            );
        }

        let mut attestations = vec![
            record(Arc::new(git)),
            record(Arc::new(material)),
            record(Arc::new(product)),
        ];
        attestations.extend(extra.into_iter().map(record));
        Collection {
            name: step.to_owned(),
            attestations,
        }
    }

    fn statement(collection: &Collection) -> Statement {
        Statement::new(
            collection.subjects(),
            COLLECTION_PREDICATE_TYPE,
            collection.to_json().unwrap(),
        )
    }

    /// Unsigned, already "verified" collection for step-level checks.
    pub(crate) fn verified(collection: Collection) -> VerifiedCollection {
        let statement = statement(&collection);
        let envelope = Envelope {
            payload: serde_json::to_vec(&statement).unwrap(),
            payload_type: PAYLOAD_TYPE.to_owned(),
            signatures: Vec::new(),
        };
        VerifiedCollection {
            verifiers: Vec::new(),
            collection_envelope: CollectionEnvelope {
                envelope,
                statement,
                reference: collection.name.clone(),
                collection,
            },
        }
    }

    pub(crate) fn collection_from(
        step: &str,
        materials: &[(&str, &str)],
        products: &[(&str, &str)],
        commit: &str,
    ) -> VerifiedCollection {
        verified(collection(step, materials, products, commit, Vec::new()))
    }

    pub(crate) async fn signed_envelope(
        step: &str,
        materials: &[(&str, &str)],
        products: &[(&str, &str)],
        commit: &str,
        signer: &Arc<dyn Signer>,
    ) -> Envelope {
        let opts = SignOptions {
            signers: vec![Arc::clone(signer)],
            ..SignOptions::default()
        };
        signed_envelope_with(step, materials, products, commit, &opts).await
    }

    pub(crate) async fn signed_envelope_with(
        step: &str,
        materials: &[(&str, &str)],
        products: &[(&str, &str)],
        commit: &str,
        opts: &SignOptions,
    ) -> Envelope {
        let statement = statement(&collection(step, materials, products, commit, Vec::new()));
        Envelope::sign(PAYLOAD_TYPE, serde_json::to_vec(&statement).unwrap(), opts)
            .await
            .unwrap()
    }
}
