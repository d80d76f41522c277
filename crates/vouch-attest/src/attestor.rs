//! The attestor plugin contract.
//!
//! An [`Attestor`] observes one aspect of a build step and records it as
//! serializable state. Optional capabilities ([`Subjecter`],
//! [`Materialer`], [`Producer`], [`BackReffer`]) expose evidence the
//! context, collection, and policy engine know how to use.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use vouch_dsse::DigestSet;

use crate::context::AttestationContext;
use crate::error::AttestationError;

/// Execution phase of an attestor.
///
/// Phases form a total order; the context runs them in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunType {
    /// Before inputs are recorded (environment, VCS state).
    PreMaterial,
    /// Records inputs.
    Material,
    /// Runs the step itself.
    Execute,
    /// Records outputs.
    Product,
    /// After outputs are recorded.
    PostProduct,
}

impl RunType {
    /// Every phase, in execution order.
    pub const ALL: [Self; 5] = [
        Self::PreMaterial,
        Self::Material,
        Self::Execute,
        Self::Product,
        Self::PostProduct,
    ];

    /// Kebab-case name used in logs and JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreMaterial => "pre-material",
            Self::Material => "material",
            Self::Execute => "execute",
            Self::Product => "product",
            Self::PostProduct => "post-product",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialization and downcasting for attestor state.
///
/// Implemented for every `Serialize + DeserializeOwned` type, so
/// attestors only derive serde.
pub trait AttestorState {
    /// Serialize the attestor's recorded state.
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
    /// Replace the attestor's state from JSON.
    fn load_json(&mut self, value: serde_json::Value) -> Result<(), serde_json::Error>;
    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
    /// Mutable upcast for downcasting to the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> AttestorState for T
where
    T: Serialize + DeserializeOwned + Any,
{
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn load_json(&mut self, value: serde_json::Value) -> Result<(), serde_json::Error> {
        *self = serde_json::from_value(value)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A pluggable producer of attestation evidence.
pub trait Attestor: AttestorState + Send + Sync + fmt::Debug {
    /// Short registry name (`git`, `material`, ...).
    fn name(&self) -> &str;

    /// Predicate type URI identifying this attestation's schema.
    fn type_uri(&self) -> &str;

    /// Phase this attestor runs in.
    fn run_type(&self) -> RunType;

    /// Observe the step and record state.
    fn attest(&mut self, ctx: &AttestationContext) -> Result<(), AttestationError>;

    /// Subjects this attestation is about.
    fn as_subjecter(&self) -> Option<&dyn Subjecter> {
        None
    }

    /// Inputs this attestation recorded.
    fn as_materialer(&self) -> Option<&dyn Materialer> {
        None
    }

    /// Outputs this attestation recorded.
    fn as_producer(&self) -> Option<&dyn Producer> {
        None
    }

    /// Digests usable to discover linked attestations.
    fn as_back_reffer(&self) -> Option<&dyn BackReffer> {
        None
    }
}

/// Exposes statement subjects, keyed by subject name.
pub trait Subjecter {
    /// Subject name to digests.
    fn subjects(&self) -> BTreeMap<String, DigestSet>;
}

/// Exposes recorded inputs, keyed by path.
pub trait Materialer {
    /// Path to digests.
    fn materials(&self) -> BTreeMap<String, DigestSet>;
}

/// Exposes recorded outputs, keyed by path.
pub trait Producer {
    /// Path to product.
    fn products(&self) -> BTreeMap<String, Product>;
}

/// Exposes back references, keyed by a descriptive name.
pub trait BackReffer {
    /// Name to digests.
    fn back_refs(&self) -> BTreeMap<String, DigestSet>;
}

/// One output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    /// Best-effort MIME type.
    pub mime_type: String,
    /// Content digests.
    pub digest: DigestSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_types_are_totally_ordered() {
        let mut shuffled = vec![
            RunType::Product,
            RunType::PreMaterial,
            RunType::PostProduct,
            RunType::Execute,
            RunType::Material,
        ];
        shuffled.sort();
        assert_eq!(shuffled, RunType::ALL.to_vec());
    }

    #[test]
    fn run_type_serializes_kebab_case() {
        let json = serde_json::to_string(&RunType::PreMaterial).unwrap();
        assert_eq!(json, "\"pre-material\"");
        assert_eq!(RunType::PostProduct.to_string(), "post-product");
    }

    #[test]
    fn product_uses_camel_case() {
        let product = Product {
            mime_type: "text/plain".to_owned(),
            digest: DigestSet::sha256("abc"),
        };
        let json = serde_json::to_value(&product).unwrap();
        assert_eq!(json["mimeType"], "text/plain");
        assert_eq!(json["digest"]["sha256"], "abc");
    }
}
