use clap::Parser;
use parallel_data::shard_parallel_corpus;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Split aligned corpus files into per-worker shards (`<file>.00`, `<file>.01`, ...).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Source-side corpus file.
    #[arg(long)]
    source: PathBuf,

    /// Target-side corpus file, aligned line by line with `--source`.
    #[arg(long)]
    target: PathBuf,

    /// Number of data-parallel workers.
    #[arg(long)]
    world_size: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let shards = shard_parallel_corpus(&args.source, &args.target, args.world_size)?;

    for (rank, (source, target)) in shards.iter().enumerate() {
        tracing::info!(
            rank,
            source = %source.display(),
            target = %target.display(),
            "wrote shard"
        );
    }

    Ok(())
}
