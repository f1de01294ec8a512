use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use nmt_training::{
    checkpoint::{apply_model_weights, resolve_weights_path},
    decode::{decode_file, TranslationSettings},
    overrides::{apply_overrides, ConfigOverride},
    scoring::Metric,
    tokenizer::{load_tokenizer, SpecialTokens, TextTokenizer},
    trainer::select_device,
    MarianTranslator, TrainingConfig, TrainingError,
};
use parallel_data::LanguagePair;
use tracing_subscriber::EnvFilter;

/// Translate a text file with a trained checkpoint, optionally scoring it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Training config the model was built from")]
    config: PathBuf,

    /// Safetensors file or checkpoint directory. Defaults to the rolling record.
    #[arg(long, value_name = "PATH")]
    weights: Option<PathBuf>,

    #[arg(long)]
    source_lang: String,

    #[arg(long)]
    target_lang: String,

    #[arg(long, value_name = "PATH")]
    source: PathBuf,

    #[arg(long, value_name = "PATH")]
    output: PathBuf,

    /// Reference translations, aligned with `--source`.
    #[arg(long, value_name = "PATH")]
    reference: Option<PathBuf>,

    #[arg(long)]
    beam_size: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long = "override", value_name = "KEY=VALUE")]
    overrides: Vec<ConfigOverride>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run() {
        tracing::error!(error = %err, "decoding failed");
        std::process::exit(1);
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    let config = apply_overrides(TrainingConfig::load(&args.config)?, &args.overrides)?;

    let device = select_device(config.runtime.device)?;
    let tokenizer: Arc<dyn TextTokenizer> =
        Arc::new(load_tokenizer(&config.tokenizer.tokenizer_json)?);
    let special =
        SpecialTokens::resolve(tokenizer.as_ref(), &config.languages(), &config.masking.mask_token)?;

    let hparams = config.resolve_model_hyperparameters(&config.model, tokenizer.vocab_size())?;
    let mut model = MarianTranslator::new(&hparams, &device)?;
    let weights = args
        .weights
        .clone()
        .unwrap_or_else(|| config.runtime.checkpoint_dir.join("latest"));
    let weights = resolve_weights_path(&weights)?;
    apply_model_weights(&model, &weights, true)?;
    tracing::info!(weights = %weights.display(), "loaded model");

    let metric = Metric::for_task(config.data.is_summarization);
    let scorer = metric.scorer();
    let settings = TranslationSettings {
        beam_size: args.beam_size.unwrap_or(config.decoding.beam_size),
        batch_size: args.batch_size.unwrap_or(config.data.dev_batch_size),
        max_src_length: config.data.max_src_length,
    };

    let report = decode_file(
        &mut model,
        &tokenizer,
        &special,
        &config.decoding,
        &LanguagePair::new(args.source_lang.as_str(), args.target_lang.as_str()),
        &args.source,
        &args.output,
        args.reference
            .as_deref()
            .map(|path| (path, scorer.as_ref())),
        &settings,
    )?;

    tracing::info!(
        sentences = report.sentences,
        seconds = format_args!("{:.1}", report.seconds),
        output = %args.output.display(),
        "wrote translations"
    );
    if let Some((metric, score)) = report.score {
        tracing::info!(metric, score = format_args!("{score:.2}"), "score");
    }
    Ok(())
}
