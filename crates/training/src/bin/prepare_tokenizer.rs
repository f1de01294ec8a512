use std::path::PathBuf;

use clap::Parser;
use nmt_training::{tokenizer::bootstrap_tokenizer, TrainingConfig, TrainingError};
use tracing_subscriber::EnvFilter;

/// Register `<pad>`, `<s>`, `</s>`, the mask token and one `<2xx>` tag per
/// configured language in an existing `tokenizer.json`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Training config; languages and the mask token are read from it.
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Base tokenizer to extend.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,

    /// Defaults to the config's `tokenizer.tokenizer_json`.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run() {
        tracing::error!(error = %err, "tokenizer preparation failed");
        std::process::exit(1);
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    let config = TrainingConfig::load(&args.config)?;
    let output = args
        .output
        .unwrap_or_else(|| config.tokenizer.tokenizer_json.clone());
    let languages = config.languages();

    let added = bootstrap_tokenizer(&args.input, &output, &languages, &config.masking.mask_token)?;
    tracing::info!(
        added,
        languages = languages.join(","),
        output = %output.display(),
        "tokenizer ready"
    );
    Ok(())
}
