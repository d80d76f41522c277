//! The `vouch verify` subcommand.
//!
//! Loads a policy (raw JSON or a signed envelope), indexes the given
//! attestation envelopes in memory, and evaluates the policy for the
//! artifact's digest. Exits 1 when the policy denies.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{Result, WrapErr, bail};
use tokio_util::sync::CancellationToken;
use vouch_attest::registry::Registry;
use vouch_dsse::{DigestSet, DigestValue, Envelope, PublicKeyVerifier, VerificationOptions, Verifier};
use vouch_policy::{Policy, VerifyOptions};
use vouch_source::{MemorySource, VerifiedSource};

use crate::config::Config;

/// Arguments for `vouch verify`.
#[derive(Args)]
pub struct VerifyArgs {
    /// Policy file: policy JSON or a DSSE envelope carrying it.
    #[arg(short, long, value_name = "PATH")]
    pub policy: PathBuf,

    /// Attestation envelope to consider (repeatable).
    #[arg(short, long = "attestation", value_name = "PATH", required = true)]
    pub attestations: Vec<PathBuf>,

    /// Public key that must have signed an enveloped policy (repeatable).
    #[arg(long = "public-key", value_name = "PATH")]
    pub public_keys: Vec<PathBuf>,

    /// Artifact whose sha256 digest is verified.
    #[arg(long, value_name = "PATH")]
    pub artifact: Option<PathBuf>,

    /// Additional subject digest (repeatable).
    #[arg(long = "subject", value_name = "DIGEST")]
    pub subjects: Vec<String>,

    /// Number of search rounds (default from config, else 3).
    #[arg(long)]
    pub search_depth: Option<usize>,

    /// Output the result as JSON.
    #[arg(long)]
    pub json: bool,
}

async fn load_policy(args: &VerifyArgs) -> Result<Policy> {
    let bytes = std::fs::read(&args.policy)
        .wrap_err_with(|| format!("failed to read policy {}", args.policy.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .wrap_err_with(|| format!("policy {} is not JSON", args.policy.display()))?;

    let is_envelope = value.get("payloadType").is_some() && value.get("payload").is_some();
    if !is_envelope {
        return Ok(Policy::from_json(&bytes)?);
    }

    if args.public_keys.is_empty() {
        bail!("policy is a signed envelope; pass --public-key to verify it");
    }
    let mut verifiers: Vec<Arc<dyn Verifier>> = Vec::with_capacity(args.public_keys.len());
    for path in &args.public_keys {
        let pem = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read public key {}", path.display()))?;
        verifiers.push(Arc::new(PublicKeyVerifier::from_pem(&pem)?));
    }

    let envelope: Envelope = serde_json::from_value(value)?;
    let passed = envelope
        .verify(&VerificationOptions {
            verifiers,
            ..VerificationOptions::default()
        })
        .await
        .wrap_err("policy signature verification failed")?;
    tracing::info!(signers = passed.len(), "policy envelope verified");
    Ok(Policy::from_json(&envelope.payload)?)
}

fn subject_digests(args: &VerifyArgs) -> Result<Vec<String>> {
    let mut digests = args.subjects.clone();
    if let Some(artifact) = &args.artifact {
        let set = DigestSet::calculate_from_file(artifact, &[DigestValue::SHA256])
            .wrap_err_with(|| format!("failed to hash {}", artifact.display()))?;
        digests.extend(set.values().map(str::to_owned));
    }
    if digests.is_empty() {
        bail!("nothing to verify: pass --artifact or --subject");
    }
    Ok(digests)
}

/// Execute the verify command.
pub async fn execute(args: VerifyArgs, config: &Config) -> Result<()> {
    let policy = load_policy(&args).await?;
    let digests = subject_digests(&args)?;

    let mut memory = MemorySource::new(Arc::new(Registry::with_builtins()?));
    for path in &args.attestations {
        memory
            .load_file(path)
            .wrap_err_with(|| format!("failed to load attestation {}", path.display()))?;
    }
    let source = VerifiedSource::new(memory, policy.verification_options(Vec::new())?);

    let opts = VerifyOptions::default()
        .with_search_depth(config.search_depth(args.search_depth))
        .with_subject_digests(digests)
        .with_verified_source(Arc::new(source));

    match policy.verify(&CancellationToken::new(), opts).await {
        Ok(accepted) => {
            if args.json {
                let steps: serde_json::Map<String, serde_json::Value> = accepted
                    .iter()
                    .map(|(step, collections)| {
                        let refs: Vec<&str> = collections
                            .iter()
                            .map(|c| c.collection_envelope.reference.as_str())
                            .collect();
                        (step.clone(), serde_json::json!(refs))
                    })
                    .collect();
                let report = serde_json::json!({ "passed": true, "steps": steps });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Verification PASSED");
                for (step, collections) in &accepted {
                    println!("  {step}: {} collection(s)", collections.len());
                }
            }
            Ok(())
        }
        Err(err) if err.is_denial() => {
            if args.json {
                let report = serde_json::json!({ "passed": false, "reason": err.to_string() });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Verification FAILED: {err}");
            }
            process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

