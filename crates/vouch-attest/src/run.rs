//! One-call attestation: run attestors, collect, sign.

use std::sync::Arc;

use vouch_dsse::envelope::SignOptions;
use vouch_dsse::{Envelope, Signer, Timestamper};

use crate::attestor::Attestor;
use crate::collection::Collection;
use crate::context::{AttestationContext, ContextOptions, CompletedAttestor};
use crate::error::AttestationError;
use crate::statement::{COLLECTION_PREDICATE_TYPE, PAYLOAD_TYPE, Statement};

/// Inputs for [`run`].
#[derive(Default)]
pub struct RunOptions {
    /// Collection name; the step this run attests.
    pub step_name: String,
    /// Attestors to run.
    pub attestors: Vec<Box<dyn Attestor>>,
    /// Context configuration.
    pub context: ContextOptions,
    /// Signers for the envelope.
    pub signers: Vec<Arc<dyn Signer>>,
    /// Optional timestampers.
    pub timestampers: Vec<Arc<dyn Timestamper>>,
    /// Allow producing an unsigned result.
    pub insecure: bool,
}

/// Output of [`run`].
#[derive(Debug)]
pub struct RunResult {
    /// Every attestor record, in execution order.
    pub completed: Vec<CompletedAttestor>,
    /// The attestation collection.
    pub collection: Collection,
    /// The statement wrapping the collection.
    pub statement: Statement,
    /// The signed envelope; `None` only for insecure unsigned runs.
    pub envelope: Option<Envelope>,
}

/// Run attestors, wrap the result in a statement, and sign it.
///
/// Attestors run synchronously on the calling task.
pub async fn run(opts: RunOptions) -> Result<RunResult, AttestationError> {
    if opts.signers.is_empty() && !opts.insecure {
        return Err(AttestationError::KeyError(
            "at least one signer is required unless running insecure".to_owned(),
        ));
    }

    let mut ctx = AttestationContext::new(opts.attestors, opts.context);
    ctx.run_attestors()?;
    let completed = ctx.completed_attestors().to_vec();

    let collection = Collection::new(&opts.step_name, &completed);
    let statement = Statement::new(
        collection.subjects(),
        COLLECTION_PREDICATE_TYPE,
        collection.to_json()?,
    );

    let envelope = if opts.signers.is_empty() {
        tracing::warn!(step = %opts.step_name, "producing unsigned attestation");
        None
    } else {
        let payload = serde_json::to_vec(&statement)?;
        let sign_opts = SignOptions {
            signers: opts.signers,
            timestampers: opts.timestampers,
        };
        Some(Envelope::sign(PAYLOAD_TYPE, payload, &sign_opts).await?)
    };

    tracing::info!(
        step = %opts.step_name,
        attestations = collection.attestations.len(),
        subjects = statement.subject.len(),
        "attestation run complete"
    );

    Ok(RunResult {
        completed,
        collection,
        statement,
        envelope,
    })
}
