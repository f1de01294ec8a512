pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod data;
pub mod decode;
pub mod distributed;
pub mod error;
pub mod generation;
pub mod logging;
pub mod loss;
pub mod marian;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod overrides;
pub mod scheduler;
pub mod scoring;
pub mod tokenizer;
pub mod trainer;

#[cfg(test)]
mod testing;

pub use config::TrainingConfig;
pub use controller::{EvaluationController, Phase};
pub use data::{Batch, BlockingDataLoader, DataLoader, MultilingualBatchSampler, SequentialBatcher};
pub use distributed::{SingleProcess, SyncPort, ThreadGroup};
pub use error::{TrainingError, TrainingStepError};
pub use loss::{LabelSmoothedLoss, LossMetrics, LossOutput};
pub use marian::MarianTranslator;
pub use model::Seq2SeqModel;
pub use optimizer::{OptimizerState, TrainerOptimizer, TrainerOptimizerOptions};
pub use scheduler::LRScheduler;
pub use trainer::{StopReason, Trainer, TrainingReport};
