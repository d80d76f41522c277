//! vouch CLI: attest build steps, sign payloads, verify supply-chain
//! policies.

mod commands;
mod config;

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Result;

use crate::config::Config;

/// vouch: signed attestations for every step of a build.
///
/// Record what a step consumed and produced, sign it, and later check a
/// chain of such records against a policy.
#[derive(Parser)]
#[command(name = "vouch", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (repeat for more detail: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output logs as JSON (for machine consumption).
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (default: `~/.config/vouch/config.toml`).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run attestors around a build step and write a signed collection.
    Run(commands::run::RunArgs),
    /// Wrap an arbitrary file in a signed DSSE envelope.
    Sign(commands::sign::SignArgs),
    /// Verify attestations against a policy.
    Verify(commands::verify::VerifyArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => commands::run::execute(args, &config).await,
        Commands::Sign(args) => commands::sign::execute(args, &config).await,
        Commands::Verify(args) => commands::verify::execute(args, &config).await,
    }
}
