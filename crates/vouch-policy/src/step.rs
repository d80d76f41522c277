//! Policy steps and the per-step checks.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use vouch_attest::statement::COLLECTION_PREDICATE_TYPE;
use vouch_dsse::Verifier;
use vouch_source::VerifiedCollection;

use crate::constraint::CertConstraint;
use crate::error::PolicyError;
use crate::policy::{TrustBundle, b64};
use crate::rego;

/// One step of the supply chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Collection name the step's attestations carry.
    #[serde(default)]
    pub name: String,
    /// Who may sign for this step.
    #[serde(default)]
    pub functionaries: Vec<Functionary>,
    /// Attestations the step's collections must contain.
    #[serde(default)]
    pub attestations: Vec<AttestationPolicy>,
    /// Steps whose artifacts this step consumes.
    #[serde(default)]
    pub artifacts_from: Vec<String>,
}

/// A trusted signing identity.
///
/// Either a bare key (`publickeyid`) or an X.509 identity
/// (`certConstraint`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Functionary {
    /// `publickey` or `root`; informational.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Key id of a policy public key.
    #[serde(rename = "publickeyid", default, skip_serializing_if = "String::is_empty")]
    pub public_key_id: String,
    /// Certificate identity constraints.
    #[serde(rename = "certConstraint", default, skip_serializing_if = "Option::is_none")]
    pub cert_constraint: Option<CertConstraint>,
}

/// A required attestation type and the rego modules applied to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationPolicy {
    /// Attestation type URI.
    #[serde(rename = "type")]
    pub type_uri: String,
    /// Rego modules evaluated against the attestation.
    #[serde(rename = "regopolicies", default)]
    pub rego_policies: Vec<RegoPolicy>,
}

/// A named rego module (base64 on the wire).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegoPolicy {
    /// Module name used in messages.
    pub name: String,
    /// Rego source.
    #[serde(with = "b64")]
    pub module: Vec<u8>,
}

impl Functionary {
    /// Whether `verifier` is this functionary.
    pub fn check(
        &self,
        verifier: &dyn Verifier,
        bundles: &BTreeMap<String, TrustBundle>,
    ) -> Result<(), PolicyError> {
        if !self.public_key_id.is_empty() {
            return if verifier.key_id() == self.public_key_id {
                Ok(())
            } else {
                Err(PolicyError::ConstraintFailed(format!(
                    "key id `{}` is not `{}`",
                    verifier.key_id(),
                    self.public_key_id
                )))
            };
        }

        let Some(constraint) = &self.cert_constraint else {
            return Err(PolicyError::InvalidOption(
                "functionary has neither a key id nor a certificate constraint".to_owned(),
            ));
        };
        let Some(cert) = verifier.as_x509() else {
            return Err(PolicyError::ConstraintFailed(
                "verifier has no certificate".to_owned(),
            ));
        };
        if bundles.is_empty() {
            return Err(PolicyError::ConstraintFailed(
                "policy has no trusted roots".to_owned(),
            ));
        }
        constraint.check(cert, bundles)
    }
}

impl Step {
    /// Attestation types the step requires.
    #[must_use]
    pub fn required_attestations(&self) -> Vec<String> {
        self.attestations.iter().map(|a| a.type_uri.clone()).collect()
    }

    /// Keep collections signed by at least one functionary.
    ///
    /// With `require_timestamp`, a certificate functionary only accepts a
    /// chain that was validated at a timestamp-attested time.
    #[must_use]
    pub fn check_functionaries(
        &self,
        collections: Vec<VerifiedCollection>,
        bundles: &BTreeMap<String, TrustBundle>,
        require_timestamp: bool,
    ) -> Vec<VerifiedCollection> {
        collections
            .into_iter()
            .filter(|collection| {
                let envelope = &collection.collection_envelope;
                if envelope.statement.predicate_type != COLLECTION_PREDICATE_TYPE {
                    tracing::debug!(reference = %envelope.reference, "skipping non-collection statement");
                    return false;
                }
                let accepted = collection.verifiers.iter().any(|passed| {
                    self.functionaries.iter().any(|f| {
                        let untimed_certificate =
                            f.public_key_id.is_empty() && passed.timestamp_verifiers().is_empty();
                        if require_timestamp && untimed_certificate {
                            tracing::debug!(
                                step = %self.name,
                                key_id = %passed.verifier.key_id(),
                                "certificate signature carries no trusted timestamp"
                            );
                            return false;
                        }
                        f.check(passed.verifier.as_ref(), bundles)
                            .inspect_err(|e| {
                                tracing::debug!(
                                    step = %self.name,
                                    key_id = %passed.verifier.key_id(),
                                    error = %e,
                                    "functionary did not match"
                                );
                            })
                            .is_ok()
                    })
                });
                if !accepted {
                    tracing::info!(
                        step = %self.name,
                        reference = %envelope.reference,
                        "rejected collection: {}",
                        PolicyError::FunctionaryMismatch(self.name.clone())
                    );
                }
                accepted
            })
            .collect()
    }

    /// Keep collections carrying every required attestation and passing
    /// its rego modules.
    ///
    /// Rego denials reject the collection; a broken module fails the
    /// whole evaluation.
    pub fn validate_attestations(
        &self,
        collections: Vec<VerifiedCollection>,
    ) -> Result<Vec<VerifiedCollection>, PolicyError> {
        let mut kept = Vec::with_capacity(collections.len());
        'collections: for collection in collections {
            let envelope = &collection.collection_envelope;
            for required in &self.attestations {
                let Some(attestation) = envelope.collection.attestation(&required.type_uri) else {
                    tracing::info!(
                        step = %self.name,
                        reference = %envelope.reference,
                        attestation = %required.type_uri,
                        "rejected collection: missing attestation"
                    );
                    continue 'collections;
                };
                if required.rego_policies.is_empty() {
                    continue;
                }
                let input = attestation.attestation.to_json()?;
                match rego::evaluate(&required.rego_policies, &input) {
                    Ok(()) => {}
                    Err(e) if e.is_denial() => {
                        tracing::info!(
                            step = %self.name,
                            reference = %envelope.reference,
                            error = %e,
                            "rejected collection"
                        );
                        continue 'collections;
                    }
                    Err(e) => return Err(e),
                }
            }
            kept.push(collection);
        }
        Ok(kept)
    }
}

/// Check one candidate's materials against a predecessor's artifacts.
fn materials_agree(
    step: &str,
    predecessor: &str,
    candidate: &VerifiedCollection,
    produced: &VerifiedCollection,
) -> Result<(), PolicyError> {
    let artifacts = produced.collection_envelope.collection.artifacts();
    for (path, digest) in candidate.collection_envelope.collection.materials() {
        let Some(artifact) = artifacts.get(&path) else {
            continue;
        };
        if !digest.matches(artifact) {
            return Err(PolicyError::MismatchArtifact {
                step: step.to_owned(),
                predecessor: predecessor.to_owned(),
                path,
            });
        }
    }
    Ok(())
}

/// Require a passed collection for every step, and artifact agreement
/// with every `artifactsFrom` predecessor.
///
/// Returns the accepted collections per step.
pub fn verify_artifacts(
    steps: &BTreeMap<String, Step>,
    passed: &BTreeMap<String, Vec<VerifiedCollection>>,
) -> Result<BTreeMap<String, Vec<VerifiedCollection>>, PolicyError> {
    let mut accepted = BTreeMap::new();
    for (name, step) in steps {
        let candidates = passed.get(name).map(Vec::as_slice).unwrap_or_default();
        if candidates.is_empty() {
            return Err(PolicyError::NoAttestations(name.clone()));
        }

        let mut kept = Vec::new();
        for candidate in candidates {
            let ok = step.artifacts_from.iter().all(|predecessor| {
                let produced = passed.get(predecessor).map(Vec::as_slice).unwrap_or_default();
                produced.iter().any(|p| {
                    materials_agree(name, predecessor, candidate, p)
                        .inspect_err(|e| tracing::debug!(error = %e, "artifact mismatch"))
                        .is_ok()
                })
            });
            if ok {
                kept.push(candidate.clone());
            } else {
                tracing::info!(
                    step = %name,
                    reference = %candidate.collection_envelope.reference,
                    "rejected collection: materials do not match predecessor artifacts"
                );
            }
        }
        if kept.is_empty() {
            return Err(PolicyError::NoAttestations(name.clone()));
        }
        accepted.insert(name.clone(), kept);
    }
    Ok(accepted)
}

/// Check that every `artifactsFrom` entry names a defined step.
pub(crate) fn check_step_references(steps: &BTreeMap<String, Step>) -> Result<(), PolicyError> {
    let known: BTreeSet<&str> = steps.keys().map(String::as_str).collect();
    for step in steps.values() {
        if let Some(missing) = step
            .artifacts_from
            .iter()
            .find(|p| !known.contains(p.as_str()))
        {
            return Err(PolicyError::UnknownStep(missing.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vouch_attest::Attestor;
    use vouch_attest::attestors::{CommandRunAttestor, command_run};
    use vouch_dsse::{EcdsaSigner, Signer, X509Verifier};

    use super::*;
    use crate::test_support::{TestCa, bundle, collection, collection_from, verified};

    #[test]
    fn public_key_functionary_matches_key_id() {
        let signer = EcdsaSigner::generate().unwrap();
        let verifier = signer.verifier().unwrap();
        let functionary = Functionary {
            kind: "publickey".to_owned(),
            public_key_id: signer.key_id(),
            cert_constraint: None,
        };
        functionary.check(verifier.as_ref(), &BTreeMap::new()).unwrap();

        let other = EcdsaSigner::generate().unwrap().verifier().unwrap();
        assert!(functionary.check(other.as_ref(), &BTreeMap::new()).is_err());
    }

    #[test]
    fn cert_functionary_needs_roots_and_certificate() {
        let ca = TestCa::root("Root");
        let (_, der) = ca.leaf("foo", "Org", "foo.example.com", &[]);
        let cert = X509Verifier::new(&der, Vec::new(), Vec::new()).unwrap();
        let bundles = BTreeMap::from([("root".to_owned(), bundle(&ca))]);

        let functionary = |cn: &str| Functionary {
            kind: "root".to_owned(),
            public_key_id: String::new(),
            cert_constraint: Some(CertConstraint {
                common_name: cn.to_owned(),
                ..CertConstraint::default()
            }),
        };

        functionary("foo*").check(&cert, &bundles).unwrap();
        functionary("*").check(&cert, &bundles).unwrap();
        assert!(functionary("bar").check(&cert, &bundles).is_err());
        assert!(functionary("foo*").check(&cert, &BTreeMap::new()).is_err());

        let bare = EcdsaSigner::generate().unwrap().verifier().unwrap();
        assert!(functionary("*").check(bare.as_ref(), &bundles).is_err());
    }

    #[test]
    fn unknown_predecessor_is_reported() {
        let steps = BTreeMap::from([(
            "package".to_owned(),
            Step {
                name: "package".to_owned(),
                artifacts_from: vec!["compile".to_owned()],
                ..Step::default()
            },
        )]);
        let err = check_step_references(&steps).unwrap_err();
        assert!(matches!(err, PolicyError::UnknownStep(s) if s == "compile"));
    }

    #[test]
    fn artifacts_must_agree_with_predecessor() {
        let steps = BTreeMap::from([
            ("build".to_owned(), Step::default()),
            (
                "package".to_owned(),
                Step {
                    artifacts_from: vec!["build".to_owned()],
                    ..Step::default()
                },
            ),
        ]);
        let build = collection_from("build", &[("src", "s1")], &[("bin", "b1")], "c0");
        let good = collection_from("package", &[("bin", "b1")], &[("pkg", "p1")], "c0");
        let bad = collection_from("package", &[("bin", "evil")], &[("pkg", "p2")], "c0");

        let passed = BTreeMap::from([
            ("build".to_owned(), vec![build.clone()]),
            ("package".to_owned(), vec![good, bad.clone()]),
        ]);
        let accepted = verify_artifacts(&steps, &passed).unwrap();
        assert_eq!(accepted["package"].len(), 1);

        let only_bad = BTreeMap::from([
            ("build".to_owned(), vec![build]),
            ("package".to_owned(), vec![bad]),
        ]);
        let err = verify_artifacts(&steps, &only_bad).unwrap_err();
        assert!(matches!(err, PolicyError::NoAttestations(s) if s == "package"));
    }

    #[test]
    fn every_step_needs_a_collection() {
        let steps = BTreeMap::from([("build".to_owned(), Step::default())]);
        let err = verify_artifacts(&steps, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, PolicyError::NoAttestations(s) if s == "build"));
    }

    const EXIT_CODE: &str = r#"package vouch.commandrun

import rego.v1

deny contains msg if {
    input.exitCode != 0
    msg := "command exited non-zero"
}
"#;

    fn with_command(exit_code: i32) -> VerifiedCollection {
        let run = CommandRunAttestor {
            cmd: vec!["make".to_owned()],
            exit_code,
            ..CommandRunAttestor::default()
        };
        let extra: Vec<Arc<dyn Attestor>> = vec![Arc::new(run)];
        verified(collection("build", &[], &[("bin", "b1")], "c0", extra))
    }

    #[test]
    fn rego_and_required_types_filter_collections() {
        let step = Step {
            name: "build".to_owned(),
            attestations: vec![AttestationPolicy {
                type_uri: command_run::TYPE_URI.to_owned(),
                rego_policies: vec![RegoPolicy {
                    name: "exit-code".to_owned(),
                    module: EXIT_CODE.as_bytes().to_vec(),
                }],
            }],
            ..Step::default()
        };

        let kept = step
            .validate_attestations(vec![
                with_command(0),
                with_command(1),
                collection_from("build", &[], &[("bin", "b1")], "c0"),
            ])
            .unwrap();
        assert_eq!(kept.len(), 1);
        let state = kept[0]
            .collection_envelope
            .collection
            .attestation(command_run::TYPE_URI)
            .unwrap()
            .attestation
            .to_json()
            .unwrap();
        assert_eq!(state["exitCode"], 0);
    }

    #[test]
    fn broken_rego_module_aborts() {
        let step = Step {
            attestations: vec![AttestationPolicy {
                type_uri: command_run::TYPE_URI.to_owned(),
                rego_policies: vec![RegoPolicy {
                    name: "broken".to_owned(),
                    module: b"package broken\n\ndeny contains if {".to_vec(),
                }],
            }],
            ..Step::default()
        };
        let err = step.validate_attestations(vec![with_command(0)]).unwrap_err();
        assert!(matches!(err, PolicyError::RegoError(_)));
    }

    #[test]
    fn policy_json_shape() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "name": "build",
            "functionaries": [{"type": "publickey", "publickeyid": "abc"}],
            "attestations": [{"type": "https://vouch.dev/attestations/material/v0.1"}],
            "artifactsFrom": ["fetch"]
        }))
        .unwrap();
        assert_eq!(step.functionaries[0].public_key_id, "abc");
        assert_eq!(step.artifacts_from, vec!["fetch"]);
        assert!(step.attestations[0].rego_policies.is_empty());
    }
}
