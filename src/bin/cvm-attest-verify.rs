//! Verifies a base64-encoded binary attestation against the server nonce.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cvm_attestation::options::Format;
use cvm_attestation::verify::Verifier;

const NONCE: &[u8] = b"fixed-deterministic-nonce-for-server";

#[derive(Debug, Parser)]
#[command(name = "cvm-attest-verify", about = "Verify a confidential VM attestation")]
struct Args {
    /// File holding the base64-encoded binarypb attestation.
    #[arg(long, value_name = "FILE", default_value = "attestation.txt")]
    file: PathBuf,

    /// Print the verified machine state.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            error!("{}", msg);
            eprintln!("verification failed: {}", msg);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), String> {
    let encoded = tokio::fs::read_to_string(&args.file).await
        .map_err(|e| format!("failed to read {}: {}", args.file.display(), e))?;
    let attestation = base64::decode(encoded.trim())
        .map_err(|e| format!("{} is not base64: {}", args.file.display(), e))?;

    info!(bytes = attestation.len(), "verifying attestation");

    let state = Verifier::default()
        .verify_attestation(&attestation, Format::Binary, NONCE, &[]).await
        .map_err(|e| e.to_string())?;

    println!("attestation verified");

    if args.verbose {
        let pretty = serde_json::to_string_pretty(&state)
            .map_err(|e| format!("failed to render machine state: {}", e))?;
        println!("{}", pretty);
    }

    Ok(())
}
