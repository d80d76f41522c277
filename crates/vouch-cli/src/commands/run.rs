//! The `vouch run` subcommand.
//!
//! Runs the configured attestors around an optional command, then
//! writes the signed collection envelope.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use vouch_attest::context::ContextOptions;
use vouch_attest::registry::Registry;
use vouch_attest::run::{RunOptions, run};
use vouch_dsse::{DigestValue, EcdsaSigner, Signer};

use crate::config::Config;

/// Arguments for `vouch run`.
#[derive(Args)]
pub struct RunArgs {
    /// Step name recorded in the collection.
    #[arg(short, long)]
    pub step: String,

    /// Attestor to run (repeatable; default from config or
    /// environment, material, product).
    #[arg(short, long = "attestor", value_name = "NAME")]
    pub attestors: Vec<String>,

    /// PKCS#8 PEM signing key; generated if missing.
    #[arg(long, value_name = "PATH")]
    pub signing_key: Option<PathBuf>,

    /// Where to write the envelope (default: `<step>.attestation.json`).
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Directory the attestors observe.
    #[arg(long, value_name = "PATH", default_value = ".")]
    pub workdir: PathBuf,

    /// Digest algorithm (repeatable; default sha256).
    #[arg(long = "hash", value_name = "ALGORITHM")]
    pub hashes: Vec<String>,

    /// Command to run between material and product collection.
    #[arg(last = true)]
    pub cmd: Vec<String>,
}

/// Execute the run command.
pub async fn execute(args: RunArgs, config: &Config) -> Result<()> {
    let registry = Registry::with_builtins()?;

    let names = config.attestors(&args.attestors);
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut attestors = registry.attestors(&name_refs)?;
    if !args.cmd.is_empty() {
        let overrides = BTreeMap::from([("cmd".to_owned(), serde_json::to_value(&args.cmd)?)]);
        attestors.push(registry.instantiate("command-run", &overrides)?);
    }

    let hashes = config
        .hashes(&args.hashes)
        .iter()
        .map(|name| DigestValue::from_name(name))
        .collect::<Result<Vec<_>, _>>()?;

    let key_path = config.signing_key(args.signing_key);
    let signer = EcdsaSigner::load_or_generate(&key_path)
        .wrap_err_with(|| format!("failed to load signing key {}", key_path.display()))?;
    tracing::info!(key_id = %signer.key_id(), path = %key_path.display(), "using signing key");

    let result = run(RunOptions {
        step_name: args.step.clone(),
        attestors,
        context: ContextOptions::default()
            .with_working_dir(args.workdir.clone())
            .with_hashes(hashes),
        signers: vec![Arc::new(signer) as Arc<dyn Signer>],
        ..RunOptions::default()
    })
    .await?;

    for record in &result.completed {
        if let Some(error) = &record.error {
            tracing::warn!(attestor = %record.attestor.name(), error = %error, "attestor failed");
        }
    }

    let envelope = result
        .envelope
        .ok_or_else(|| color_eyre::eyre::eyre!("run produced no envelope"))?;
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{}.attestation.json", args.step)));
    std::fs::write(&output, serde_json::to_string_pretty(&envelope)?)
        .wrap_err_with(|| format!("failed to write {}", output.display()))?;

    eprintln!(
        "Attested step `{}`: {} attestations, {} subjects -> {}",
        args.step,
        result.collection.attestations.len(),
        result.statement.subject.len(),
        output.display()
    );
    Ok(())
}
