use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use nmt_training::{
    overrides::{apply_overrides, ConfigOverride},
    SingleProcess, StopReason, Trainer, TrainingConfig, TrainingError,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run() {
        tracing::error!(error = %err, "training failed");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Multilingual NMT fine-tuning", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<ConfigOverride>,

    #[arg(long, help = "Resume from the rolling checkpoint if one exists")]
    resume: bool,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = apply_overrides(TrainingConfig::load(&args.config)?, &args.overrides)?;
    if args.resume {
        config.init.resume = true;
        config.init.pretrained_model = None;
    }

    let mut trainer = Trainer::new(config, Arc::new(SingleProcess))?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let report = trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    match report.stop {
        StopReason::Converged => {
            let best = report.best_global.unwrap_or_default();
            tracing::info!(
                steps = report.steps,
                best_score = best.score,
                best_step = best.step,
                "converged"
            );
        }
        StopReason::BudgetExhausted => {
            tracing::info!(steps = report.steps, "step budget exhausted")
        }
        StopReason::ShutdownRequested => {
            tracing::info!(steps = report.steps, "stopped on request; rolling checkpoint saved")
        }
    }
    Ok(())
}
