//! Parallel corpus handling crate

pub mod corpora;
pub mod cycler;
pub mod sharding;

// Re-export main types
pub use corpora::{read_lines, LanguagePair, ParallelCorpus, ParallelExample};
pub use cycler::CorpusCycler;
pub use sharding::{shard_parallel_corpus, shard_path, shard_text_by_count};
