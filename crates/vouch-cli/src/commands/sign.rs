//! The `vouch sign` subcommand.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{Result, WrapErr};
use vouch_dsse::envelope::SignOptions;
use vouch_dsse::{EcdsaSigner, Envelope, Signer};

use crate::config::Config;

/// Arguments for `vouch sign`.
#[derive(Args)]
pub struct SignArgs {
    /// File whose bytes become the envelope payload.
    #[arg(short, long, value_name = "PATH")]
    pub input: PathBuf,

    /// DSSE payload type.
    #[arg(long, default_value = "application/octet-stream")]
    pub payload_type: String,

    /// PKCS#8 PEM signing key; generated if missing.
    #[arg(long, value_name = "PATH")]
    pub signing_key: Option<PathBuf>,

    /// Where to write the envelope (default: `<input>.signed.json`).
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

/// Execute the sign command.
pub async fn execute(args: SignArgs, config: &Config) -> Result<()> {
    let payload = std::fs::read(&args.input)
        .wrap_err_with(|| format!("failed to read {}", args.input.display()))?;

    let key_path = config.signing_key(args.signing_key);
    let signer = EcdsaSigner::load_or_generate(&key_path)
        .wrap_err_with(|| format!("failed to load signing key {}", key_path.display()))?;
    let key_id = signer.key_id();

    let opts = SignOptions {
        signers: vec![Arc::new(signer) as Arc<dyn Signer>],
        ..SignOptions::default()
    };
    let envelope = Envelope::sign(&args.payload_type, payload, &opts).await?;

    let output = args.output.unwrap_or_else(|| {
        let mut name = args.input.clone().into_os_string();
        name.push(".signed.json");
        PathBuf::from(name)
    });
    std::fs::write(&output, serde_json::to_string_pretty(&envelope)?)
        .wrap_err_with(|| format!("failed to write {}", output.display()))?;

    tracing::info!(key_id = %key_id, output = %output.display(), "signed payload");
    eprintln!("Signed {} -> {}", args.input.display(), output.display());
    Ok(())
}
