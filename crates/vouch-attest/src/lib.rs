//! Attestation production for vouch.
//!
//! `vouch-attest` runs pluggable [`Attestor`](attestor::Attestor)s in a
//! fixed phase order, aggregates their material and product evidence,
//! and packages the results as a [`Collection`](collection::Collection)
//! inside an in-toto statement ready to sign.

pub mod attestor;
pub mod attestors;
pub mod collection;
pub mod context;
pub mod error;
pub mod metadata;
pub mod registry;
pub mod run;
pub mod statement;

pub use attestor::{Attestor, BackReffer, Materialer, Producer, Product, RunType, Subjecter};
pub use collection::Collection;
pub use context::{AttestationContext, CompletedAttestor, ContextOptions};
pub use error::AttestationError;
pub use registry::{AttestorOption, Registry};
pub use statement::Statement;
