//! Collections: the ordered attestations of one build step.
//!
//! A collection is the predicate of a signed statement. Evidence views
//! (materials, products, artifacts, back references, subjects) are
//! derived from the capabilities of the contained attestations.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vouch_dsse::DigestSet;

use crate::attestor::{Attestor, Product, RunType};
use crate::context::{AttestationContext, CompletedAttestor};
use crate::error::AttestationError;
use crate::registry::Registry;

/// One attestation inside a collection.
#[derive(Debug, Clone)]
pub struct CollectionAttestation {
    /// Predicate type URI of the attestation.
    pub type_uri: String,
    /// The attestation state.
    pub attestation: Arc<dyn Attestor>,
    /// When the attestor started.
    pub start_time: DateTime<Utc>,
    /// When the attestor finished.
    pub end_time: DateTime<Utc>,
}

/// Named, ordered set of attestations for one step.
#[derive(Debug, Clone)]
pub struct Collection {
    /// Step name.
    pub name: String,
    /// Attestations in run order.
    pub attestations: Vec<CollectionAttestation>,
}

#[derive(Serialize, Deserialize)]
struct RawCollection {
    name: String,
    #[serde(default)]
    attestations: Vec<RawAttestation>,
}

#[derive(Serialize, Deserialize)]
struct RawAttestation {
    #[serde(rename = "type")]
    type_uri: String,
    attestation: Value,
    starttime: DateTime<Utc>,
    endtime: DateTime<Utc>,
}

impl Collection {
    /// Build from an audit trail, keeping only successful attestors.
    #[must_use]
    pub fn new(name: &str, completed: &[CompletedAttestor]) -> Self {
        let attestations = completed
            .iter()
            .filter(|c| c.error.is_none())
            .map(|c| CollectionAttestation {
                type_uri: c.attestor.type_uri().to_owned(),
                attestation: Arc::clone(&c.attestor),
                start_time: c.start_time,
                end_time: c.end_time,
            })
            .collect();
        Self {
            name: name.to_owned(),
            attestations,
        }
    }

    /// Materials of every attestation, later attestations winning.
    #[must_use]
    pub fn materials(&self) -> BTreeMap<String, DigestSet> {
        let mut out = BTreeMap::new();
        for a in &self.attestations {
            if let Some(m) = a.attestation.as_materialer() {
                out.extend(m.materials());
            }
        }
        out
    }

    /// Products of every attestation, later attestations winning.
    #[must_use]
    pub fn products(&self) -> BTreeMap<String, Product> {
        let mut out = BTreeMap::new();
        for a in &self.attestations {
            if let Some(p) = a.attestation.as_producer() {
                out.extend(p.products());
            }
        }
        out
    }

    /// Materials and products by path; products win on collision.
    #[must_use]
    pub fn artifacts(&self) -> BTreeMap<String, DigestSet> {
        let mut out = self.materials();
        out.extend(
            self.products()
                .into_iter()
                .map(|(path, product)| (path, product.digest)),
        );
        out
    }

    /// Back references of every attestation.
    #[must_use]
    pub fn back_refs(&self) -> BTreeMap<String, DigestSet> {
        let mut out = BTreeMap::new();
        for a in &self.attestations {
            if let Some(b) = a.attestation.as_back_reffer() {
                out.extend(b.back_refs());
            }
        }
        out
    }

    /// Statement subjects of every attestation.
    #[must_use]
    pub fn subjects(&self) -> BTreeMap<String, DigestSet> {
        let mut out = BTreeMap::new();
        for a in &self.attestations {
            if let Some(s) = a.attestation.as_subjecter() {
                out.extend(s.subjects());
            }
        }
        out
    }

    /// Type URIs present, in order.
    #[must_use]
    pub fn attestation_types(&self) -> Vec<String> {
        self.attestations.iter().map(|a| a.type_uri.clone()).collect()
    }

    /// First attestation of `type_uri`.
    #[must_use]
    pub fn attestation(&self, type_uri: &str) -> Option<&CollectionAttestation> {
        self.attestations.iter().find(|a| a.type_uri == type_uri)
    }

    /// Serialize to the collection JSON predicate.
    pub fn to_json(&self) -> Result<Value, AttestationError> {
        let raw = RawCollection {
            name: self.name.clone(),
            attestations: self
                .attestations
                .iter()
                .map(|a| {
                    Ok(RawAttestation {
                        type_uri: a.type_uri.clone(),
                        attestation: a.attestation.to_json()?,
                        starttime: a.start_time,
                        endtime: a.end_time,
                    })
                })
                .collect::<Result<_, serde_json::Error>>()?,
        };
        Ok(serde_json::to_value(raw)?)
    }

    /// Parse a collection predicate, rebuilding attestations through
    /// `registry`. Unknown types are kept as [`OpaqueAttestor`]s.
    pub fn from_json(value: Value, registry: &Registry) -> Result<Self, AttestationError> {
        let raw: RawCollection = serde_json::from_value(value)?;
        let attestations = raw
            .attestations
            .into_iter()
            .map(|a| {
                let attestation: Arc<dyn Attestor> = match registry.factory_by_type(&a.type_uri) {
                    Some(mut attestor) => {
                        attestor.load_json(a.attestation)?;
                        Arc::from(attestor)
                    }
                    None => {
                        tracing::debug!(type_uri = %a.type_uri, "keeping unknown attestation opaque");
                        Arc::new(OpaqueAttestor {
                            type_uri: a.type_uri.clone(),
                            value: a.attestation,
                        })
                    }
                };
                Ok(CollectionAttestation {
                    type_uri: a.type_uri,
                    attestation,
                    start_time: a.starttime,
                    end_time: a.endtime,
                })
            })
            .collect::<Result<_, AttestationError>>()?;

        Ok(Self {
            name: raw.name,
            attestations,
        })
    }
}

/// An attestation of a type the registry does not know.
///
/// Holds the raw JSON and exposes no capabilities.
#[derive(Debug, Clone, Default)]
pub struct OpaqueAttestor {
    type_uri: String,
    value: Value,
}

impl Serialize for OpaqueAttestor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OpaqueAttestor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            type_uri: String::new(),
            value: Value::deserialize(deserializer)?,
        })
    }
}

impl OpaqueAttestor {
    /// The recorded JSON.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl Attestor for OpaqueAttestor {
    fn name(&self) -> &str {
        &self.type_uri
    }

    fn type_uri(&self) -> &str {
        &self.type_uri
    }

    fn run_type(&self) -> RunType {
        RunType::PostProduct
    }

    fn attest(&mut self, _ctx: &AttestationContext) -> Result<(), AttestationError> {
        Err(AttestationError::UnknownAttestor(self.type_uri.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestors::{GitAttestor, MaterialAttestor, ProductAttestor, git, material, product};

    fn product_attestor(path: &str, sha: &str) -> ProductAttestor {
        let mut p = ProductAttestor::default();
        p.products.insert(
            path.to_owned(),
            Product {
                mime_type: "text/plain".to_owned(),
                digest: DigestSet::sha256(sha),
            },
        );
        p
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

    fn sample() -> Collection {
        let mut material = MaterialAttestor::default();
        material
            .materials
            .insert("src.c".to_owned(), DigestSet::sha256("aaa"));
        material
            .materials
            .insert("out.o".to_owned(), DigestSet::sha256("old"));
        let git = GitAttestor {
            commit_hash: "c0ffee".to_owned(),
            ..GitAttestor::default()
        };

        Collection {
            name: "build".to_owned(),
            attestations: vec![
                record(Arc::new(git)),
                record(Arc::new(material)),
                record(Arc::new(product_attestor("out.o", "new"))),
            ],
        }
    }

    #[test]
    fn artifacts_prefer_products() {
        let collection = sample();
        let artifacts = collection.artifacts();
        assert_eq!(artifacts["out.o"], DigestSet::sha256("new"));
        assert_eq!(artifacts["src.c"], DigestSet::sha256("aaa"));
        assert_eq!(collection.materials()["out.o"], DigestSet::sha256("old"));
    }

    #[test]
    fn derived_views() {
        let collection = sample();
        assert!(collection.back_refs().contains_key("commithash:c0ffee"));
        let subjects = collection.subjects();
        assert!(subjects.contains_key("commithash:c0ffee"));
        assert!(subjects.contains_key("file:out.o"));
        assert_eq!(
            collection.attestation_types(),
            vec![git::TYPE_URI, material::TYPE_URI, product::TYPE_URI]
        );
    }

    #[test]
    fn json_reload_restores_capabilities() {
        let registry = Registry::with_builtins().unwrap();
        let collection = sample();
        let json = collection.to_json().unwrap();

        assert_eq!(json["name"], "build");
        assert_eq!(json["attestations"][0]["type"], git::TYPE_URI);
        assert!(json["attestations"][0]["starttime"].is_string());

        let back = Collection::from_json(json, &registry).unwrap();
        assert_eq!(back.artifacts(), collection.artifacts());
        assert_eq!(back.back_refs(), collection.back_refs());
    }

    #[test]
    fn unknown_types_stay_opaque() {
        let registry = Registry::with_builtins().unwrap();
        let json = serde_json::json!({
            "name": "build",
            "attestations": [{
                "type": "https://example.com/custom/v1",
                "attestation": {"anything": [1, 2, 3]},
                "starttime": "2024-01-01T00:00:00Z",
                "endtime": "2024-01-01T00:00:01Z"
            }]
        });

        let collection = Collection::from_json(json, &registry).unwrap();
        let a = collection.attestation("https://example.com/custom/v1").unwrap();
        assert!(a.attestation.as_materialer().is_none());
        assert_eq!(a.attestation.to_json().unwrap()["anything"][1], 2);
        assert!(collection.artifacts().is_empty());
    }
}
