use std::{path::Path, sync::Arc, time::Instant};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use parallel_data::{shard_parallel_corpus, shard_path, LanguagePair, ParallelCorpus};

use crate::{
    checkpoint::{apply_model_weights, resolve_weights_path, CheckpointStore, SnapshotKind, TrainingState},
    config::{DevicePreference, TrainingConfig},
    controller::{BestScore, ControlFlow, ControllerHost, ControllerSettings, EvaluationController},
    data::{Batch, BlockingDataLoader, MultilingualBatchSampler, SamplerSettings, SamplerStats, SpanMasker},
    decode::{translate_lines, TranslationSettings},
    distributed::SyncPort,
    error::{TrainingError, TrainingStepError},
    logging::{Logger, LoggingSettings},
    loss::{LabelSmoothedLoss, LossMetrics},
    marian::MarianTranslator,
    metrics::{EvaluationSummary, TrainingMetrics},
    model::Seq2SeqModel,
    optimizer::{AdamWConfig, GradientScaler, TrainerOptimizer, TrainerOptimizerOptions, UpdateReport},
    scheduler::{anneal, build_scheduler, skip_negligible_warmup, AnnealOutcome, LRScheduler},
    scoring::{Metric, Scorer},
    tokenizer::{load_tokenizer, SpecialTokens, TextTokenizer},
};

/// Pre-built pieces handed to [`Trainer::from_components`].
pub struct TrainerComponents {
    pub device: Device,
    pub tokenizer: Arc<dyn TextTokenizer>,
    pub model: Box<dyn Seq2SeqModel>,
    /// Frozen model whose logits feed the distillation term.
    pub parent: Option<Box<dyn Seq2SeqModel>>,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub loss: LossMetrics,
    pub learning_rate: f64,
    /// `None` when the scaled gradients overflowed and the update was dropped.
    pub update: Option<UpdateReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Converged,
    BudgetExhausted,
    ShutdownRequested,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub steps: usize,
    pub stop: StopReason,
    pub skipped_steps: usize,
    pub best_global: Option<BestScore>,
}

struct DevSet {
    pair: LanguagePair,
    sources: Vec<String>,
    references: Vec<String>,
}

/// Everything the step loop mutates. Kept apart from the controller so the
/// controller can drive it through [`ControllerHost`] while both are borrowed.
pub struct TrainerCore {
    config: TrainingConfig,
    sync: Arc<dyn SyncPort>,
    tokenizer: Arc<dyn TextTokenizer>,
    special: SpecialTokens,
    model: Box<dyn Seq2SeqModel>,
    parent: Option<Box<dyn Seq2SeqModel>>,
    loader: BlockingDataLoader<MultilingualBatchSampler>,
    loss: LabelSmoothedLoss,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    scaler: GradientScaler,
    store: CheckpointStore,
    dev_sets: Vec<DevSet>,
    scorer: Box<dyn Scorer>,
    logger: Logger,
    metrics: TrainingMetrics,
    step: usize,
}

pub struct Trainer {
    core: TrainerCore,
    controller: EvaluationController,
}

impl Trainer {
    /// Loads the tokenizer, builds the Marian model (and the distillation
    /// parent, when configured) and wires up the rest of the run.
    pub fn new(config: TrainingConfig, sync: Arc<dyn SyncPort>) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.device)?;

        let tokenizer: Arc<dyn TextTokenizer> =
            Arc::new(load_tokenizer(&config.tokenizer.tokenizer_json)?);
        let vocab_size = tokenizer.vocab_size();

        let hparams = config.resolve_model_hyperparameters(&config.model, vocab_size)?;
        let model = MarianTranslator::new(&hparams, &device)?;
        let parent = build_parent(&config, vocab_size, &device)?;

        Self::from_components(
            config,
            sync,
            TrainerComponents {
                device,
                tokenizer,
                model: Box::new(model),
                parent,
            },
        )
    }

    pub fn from_components(
        config: TrainingConfig,
        sync: Arc<dyn SyncPort>,
        components: TrainerComponents,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let TrainerComponents {
            device,
            tokenizer,
            mut model,
            mut parent,
        } = components;

        let special =
            SpecialTokens::resolve(tokenizer.as_ref(), &config.languages(), &config.masking.mask_token)?;

        let loss = LabelSmoothedLoss::from_config(&config, special.pad)?;
        if loss.uses_distillation() != parent.is_some() {
            return Err(TrainingError::initialization(
                "distillation needs both a configured loss weight and a parent model",
            ));
        }
        if let Some(parent) = parent.as_mut() {
            // Parent logits are detached, but its dropout stays active.
            parent.set_training(true);
        }

        let corpora = load_training_corpora(&config, sync.as_ref())?;
        let masker = SpanMasker::new(
            config.masking.span_lambda,
            config.masking.candidate_pool,
            config.masking.mask_token.clone(),
        )?;
        let rank_seed = config
            .runtime
            .seed
            .wrapping_add((sync.rank() as u64) << 32);
        let sampler = MultilingualBatchSampler::from_corpora(
            corpora,
            config.data.sampling_temperature,
            Arc::clone(&tokenizer),
            masker,
            SamplerSettings::from_config(&config, special.pad),
            device.clone(),
            rank_seed,
        )?;

        let mut scheduler = build_scheduler(&config.scheduler, config.optimizer.learning_rate)?;
        let total_steps = scheduler.total_steps();
        let skipped = skip_negligible_warmup(scheduler.as_mut(), total_steps.max(1))?;
        if skipped > 0 {
            tracing::info!(
                scheduler_steps = skipped,
                lr = scheduler.learning_rate(),
                "skipped warmup steps with a negligible learning rate"
            );
        }

        let store = CheckpointStore::new(&config.runtime.checkpoint_dir, &config)?;
        let resume = config.init.resume && store.has_rolling();
        if config.init.resume && !resume {
            tracing::info!(
                dir = %store.root().display(),
                "no rolling checkpoint to resume from; starting fresh"
            );
        }
        if !resume {
            if let Some(path) = config.init.pretrained_model.as_ref() {
                load_pretrained(model.as_ref(), path)?;
            }
        }

        let mut optimizer = TrainerOptimizer::new(
            model.parameters(),
            AdamWConfig::from(&config.optimizer),
            TrainerOptimizerOptions::from_config(&config.optimizer),
        )?;
        let mut scaler = GradientScaler::new(config.runtime.precision);

        let mut step = 0;
        if resume {
            step = store.restore_rolling(
                model.as_ref(),
                &mut optimizer,
                scheduler.as_mut(),
                &mut scaler,
            )?;
            tracing::info!(step, dir = %store.rolling_dir().display(), "resumed from rolling checkpoint");
        }
        model.set_training(true);

        let dev_sets = if config.evaluation.enabled {
            load_dev_sets(&config)?
        } else {
            Vec::new()
        };
        let scorer = Metric::for_task(config.data.is_summarization).scorer();

        let mut logging = LoggingSettings::from_config(&config.runtime.logging);
        if !sync.is_primary_rank() {
            logging.tensorboard_dir = None;
        }
        let logger = Logger::new(logging)?;

        let controller = EvaluationController::new(
            ControllerSettings::from_config(&config.evaluation, total_steps, scorer.name()),
            Arc::clone(&sync),
        );

        tracing::info!(
            rank = sync.rank(),
            world_size = sync.world_size(),
            parameters = optimizer.trainable_parameters().count(),
            distillation = parent.is_some(),
            metric = scorer.name(),
            start_step = step,
            total_steps,
            "trainer ready"
        );

        Ok(Self {
            core: TrainerCore {
                config,
                sync,
                tokenizer,
                special,
                model,
                parent,
                loader: BlockingDataLoader::new(sampler),
                loss,
                optimizer,
                scheduler,
                scaler,
                store,
                dev_sets,
                scorer,
                logger,
                metrics: TrainingMetrics::new(),
                step,
            },
            controller,
        })
    }

    pub fn step(&self) -> usize {
        self.core.step
    }

    pub fn controller(&self) -> &EvaluationController {
        &self.controller
    }

    pub fn sampler_stats(&self) -> SamplerStats {
        self.core.loader.inner().stats()
    }

    pub fn learning_rate(&self) -> f64 {
        self.core.scheduler.learning_rate()
    }

    pub fn model(&self) -> &dyn Seq2SeqModel {
        self.core.model.as_ref()
    }

    /// One optimisation step on `batch`. Does not advance the schedule.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutcome, TrainingStepError> {
        self.core.train_step(batch)
    }

    pub fn train(&mut self) -> Result<TrainingReport, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs until the dev score converges, the step budget is spent or
    /// `should_stop` returns true.
    pub fn train_with_shutdown<F>(&mut self, should_stop: F) -> Result<TrainingReport, TrainingError>
    where
        F: Fn() -> bool,
    {
        let total_steps = self.core.scheduler.total_steps();
        let log_every = self.core.config.runtime.log_every_n_steps.max(1);
        let primary = self.core.sync.is_primary_rank();
        tracing::info!(
            start_step = self.core.step,
            total_steps,
            rank = self.core.sync.rank(),
            "starting training loop"
        );

        let stop = loop {
            if should_stop() {
                tracing::warn!(step = self.core.step, "shutdown requested");
                break StopReason::ShutdownRequested;
            }
            let step = self.core.step;
            if step >= total_steps {
                break StopReason::BudgetExhausted;
            }

            if self.controller.is_due(step)
                && self.controller.on_cadence(step, &mut self.core)? == ControlFlow::Converged
            {
                break StopReason::Converged;
            }

            let batch = self
                .core
                .loader
                .next_batch()?
                .ok_or_else(|| TrainingError::runtime("training sampler stopped producing batches"))?;

            match self.core.train_step(&batch) {
                Ok(StepOutcome {
                    loss,
                    learning_rate,
                    update: Some(update),
                }) => {
                    let snapshot = self.core.metrics.record_step(&loss, update.grad_norm);
                    if primary && step % log_every == 0 {
                        self.core
                            .logger
                            .log_training_step(step, learning_rate, &snapshot);
                    }
                }
                Ok(StepOutcome { update: None, .. }) => {
                    let skipped = self.core.metrics.record_skip();
                    self.core
                        .logger
                        .log_skipped_step(step, skipped, "gradient overflow");
                }
                Err(TrainingStepError::Optimizer(err)) => return Err(err),
                Err(err) => {
                    let skipped = self.core.metrics.record_skip();
                    self.core
                        .logger
                        .log_skipped_step(step, skipped, &err.to_string());
                }
            }

            self.core.scheduler.step();
            self.core.step += 1;
        };

        if stop != StopReason::Converged {
            let step = self.core.step;
            let written = if primary {
                Some(ControllerHost::write_rolling(&mut self.core, step))
            } else {
                None
            };
            let failed = self
                .core
                .sync
                .broadcast_flag(matches!(written, Some(Err(_))))?;
            match written {
                Some(result) => result?,
                None if failed => {
                    return Err(TrainingError::runtime(
                        "primary rank failed to write the final rolling checkpoint",
                    ))
                }
                None => {}
            }
        }
        self.core.logger.flush();

        let best_global = self
            .core
            .config
            .evaluation
            .enabled
            .then(|| self.controller.state().best_global());
        let report = TrainingReport {
            steps: self.core.step,
            stop,
            skipped_steps: self.core.metrics.skipped_steps(),
            best_global,
        };
        tracing::info!(
            steps = report.steps,
            stop = ?report.stop,
            skipped = report.skipped_steps,
            "training finished"
        );
        Ok(report)
    }
}

impl TrainerCore {
    fn train_step(&mut self, batch: &Batch) -> Result<StepOutcome, TrainingStepError> {
        if batch.examples() == 0 {
            return Err(TrainingStepError::Batch("batch has no examples".to_string()));
        }
        let learning_rate = self.scheduler.learning_rate();

        let logits = self
            .model
            .forward(
                &batch.encoder_input_ids,
                &batch.encoder_attention_mask,
                &batch.decoder_input_ids,
            )
            .map_err(TrainingStepError::Forward)?;
        let parent_logits = match self.parent.as_mut() {
            Some(parent) => Some(
                parent
                    .forward(
                        &batch.encoder_input_ids,
                        &batch.encoder_attention_mask,
                        &batch.decoder_input_ids,
                    )
                    .map_err(TrainingStepError::Forward)?
                    .detach(),
            ),
            None => None,
        };

        let output = self
            .loss
            .compute_with_parent(&logits, &batch.labels, parent_logits.as_ref())
            .map_err(TrainingStepError::Loss)?;
        let value = output.metrics.average_loss();
        if !value.is_finite() {
            return Err(TrainingStepError::NonFiniteLoss(value));
        }

        let inverse_scale = self.scaler.inverse_scale();
        let scaled = self
            .scaler
            .scale(&output.loss)
            .map_err(TrainingStepError::Loss)?;
        let mut grads = scaled.backward().map_err(TrainingStepError::Backward)?;

        let overflow = self
            .optimizer
            .has_non_finite_gradients(&grads, &self.scaler)
            .map_err(TrainingStepError::Optimizer)?;
        self.scaler.update(overflow);
        if overflow {
            self.optimizer.zero_grad(&mut grads);
            return Ok(StepOutcome {
                loss: output.metrics,
                learning_rate,
                update: None,
            });
        }

        let update = self
            .optimizer
            .step(&mut grads, learning_rate, inverse_scale)
            .map_err(TrainingStepError::Optimizer)?;
        Ok(StepOutcome {
            loss: output.metrics,
            learning_rate,
            update: Some(update),
        })
    }

    fn training_state(&self, step: usize) -> TrainingState<'_> {
        TrainingState {
            model: self.model.as_ref(),
            optimizer: &self.optimizer,
            scheduler: self.scheduler.as_ref(),
            scaler: &self.scaler,
            step,
        }
    }

    fn score_dev_sets(&mut self) -> Result<(Vec<(LanguagePair, f64)>, usize), TrainingError> {
        let settings = TranslationSettings {
            beam_size: self.config.evaluation.beam_size,
            batch_size: self.config.data.dev_batch_size,
            max_src_length: self.config.data.max_src_length,
        };
        let mut scores = Vec::with_capacity(self.dev_sets.len());
        let mut hypotheses_total = 0;
        for dev in &self.dev_sets {
            let hypotheses = translate_lines(
                self.model.as_mut(),
                &self.tokenizer,
                &self.special,
                &self.config.decoding,
                &dev.pair,
                dev.sources.clone(),
                &settings,
            )?;
            hypotheses_total += hypotheses.len();
            let score = self.scorer.score(&hypotheses, &dev.references)?;
            scores.push((dev.pair.clone(), score));
        }
        Ok((scores, hypotheses_total))
    }
}

impl ControllerHost for TrainerCore {
    fn evaluate(&mut self, step: usize) -> Result<Vec<(LanguagePair, f64)>, TrainingError> {
        let started = Instant::now();
        self.model.set_training(false);
        let scored = self.score_dev_sets();
        self.model.set_training(true);
        let (pairs, hypotheses) = scored?;

        self.logger.log_evaluation(
            step,
            &EvaluationSummary {
                metric: self.scorer.name(),
                pairs: pairs.clone(),
                hypotheses,
                elapsed: started.elapsed(),
            },
        );
        Ok(pairs)
    }

    fn write_snapshot(&mut self, kind: &SnapshotKind, step: usize) -> Result<(), TrainingError> {
        let directory = self.store.snapshot_dir(kind, step);
        if directory.exists() {
            // A resumed run replays the tick it was saved at.
            tracing::warn!(dir = %directory.display(), "snapshot already exists; keeping it");
            return Ok(());
        }
        self.store
            .write_snapshot(kind, &self.training_state(step))
            .map(|_| ())
    }

    fn write_rolling(&mut self, step: usize) -> Result<(), TrainingError> {
        self.store
            .write_rolling(&self.training_state(step))
            .map(|_| ())
    }

    fn reload_rolling(&mut self) -> Result<(), TrainingError> {
        let step = self.store.restore_rolling(
            self.model.as_ref(),
            &mut self.optimizer,
            self.scheduler.as_mut(),
            &mut self.scaler,
        )?;
        if step != self.step {
            return Err(TrainingError::runtime(format!(
                "rolling checkpoint is at step {step}, expected {}",
                self.step
            )));
        }
        Ok(())
    }

    fn anneal_learning_rate(
        &mut self,
        factor: f64,
        cap: usize,
    ) -> Result<AnnealOutcome, TrainingError> {
        let outcome = anneal(self.scheduler.as_mut(), factor, cap)?;
        self.logger.log_annealing(self.step, &outcome);
        Ok(outcome)
    }
}

pub fn select_device(preference: DevicePreference) -> Result<Device, TrainingError> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => Device::new_cuda(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize CUDA device: {err}"))
        }),
        DevicePreference::Metal => Device::new_metal(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize Metal device: {err}"))
        }),
        DevicePreference::Auto => {
            let cuda_available = cuda_is_available();
            let metal_available = metal_is_available();
            tracing::info!(cuda_available, metal_available, "device detection");

            let device = if cuda_available {
                Device::new_cuda(0)
            } else if metal_available {
                Device::new_metal(0)
            } else {
                Ok(Device::Cpu)
            };
            match device {
                Ok(device) => {
                    tracing::info!(device = ?device, "selected device");
                    Ok(device)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to initialize accelerator, falling back to CPU");
                    Ok(Device::Cpu)
                }
            }
        }
    }
}

fn build_parent(
    config: &TrainingConfig,
    vocab_size: usize,
    device: &Device,
) -> Result<Option<Box<dyn Seq2SeqModel>>, TrainingError> {
    let Some(distillation) = config.distillation.as_ref() else {
        return Ok(None);
    };
    let hparams = config.resolve_model_hyperparameters(&distillation.parent, vocab_size)?;
    let parent = MarianTranslator::new(&hparams, device)?;
    let weights = resolve_weights_path(&distillation.parent_model)?;
    let report = apply_model_weights(&parent, &weights, false)?;
    if !report.missing.is_empty() {
        return Err(TrainingError::initialization(format!(
            "parent model {} is missing parameters: {}",
            weights.display(),
            report.missing.join(", ")
        )));
    }
    if !report.unused.is_empty() {
        tracing::warn!(unused = ?report.unused, "parent checkpoint has unused tensors");
    }
    tracing::info!(path = %weights.display(), tensors = report.loaded, "loaded distillation parent");
    Ok(Some(Box::new(parent)))
}

fn load_pretrained(model: &dyn Seq2SeqModel, path: &Path) -> Result<(), TrainingError> {
    let weights = resolve_weights_path(path)?;
    let report = apply_model_weights(model, &weights, false)?;
    if !report.missing.is_empty() {
        tracing::warn!(missing = ?report.missing, "pretrained checkpoint lacks parameters; they keep their initial values");
    }
    if !report.unused.is_empty() {
        tracing::warn!(unused = ?report.unused, "pretrained checkpoint has unused tensors");
    }
    tracing::info!(path = %weights.display(), tensors = report.loaded, "initialized from pretrained model");
    Ok(())
}

/// Each rank reads its own `{file}.{rank:02}` shard whenever sharding is on or
/// more than one rank is running.
fn load_training_corpora(
    config: &TrainingConfig,
    sync: &dyn SyncPort,
) -> Result<Vec<ParallelCorpus>, TrainingError> {
    let rank = sync.rank();
    let world_size = sync.world_size();

    if config.data.shard_files {
        if sync.is_primary_rank() {
            for corpus in &config.data.train {
                let shards = shard_parallel_corpus(&corpus.source, &corpus.target, world_size)
                    .map_err(|err| {
                        TrainingError::initialization(format!(
                            "failed to shard {}: {err}",
                            corpus.source.display()
                        ))
                    })?;
                tracing::info!(pair = %corpus.pair(), shards = shards.len(), "sharded training corpus");
            }
        }
        sync.barrier()?;
    }

    let sharded = config.data.shard_files || world_size > 1;
    config
        .data
        .train
        .iter()
        .map(|corpus| {
            let (source, target) = if sharded {
                (shard_path(&corpus.source, rank), shard_path(&corpus.target, rank))
            } else {
                (corpus.source.clone(), corpus.target.clone())
            };
            ParallelCorpus::load(corpus.pair(), &source, &target).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to load {} corpus from {}: {err}",
                    corpus.pair(),
                    source.display()
                ))
            })
        })
        .collect()
}

fn load_dev_sets(config: &TrainingConfig) -> Result<Vec<DevSet>, TrainingError> {
    config
        .data
        .dev
        .iter()
        .map(|corpus| {
            let sources = parallel_data::read_lines(&corpus.source)?;
            let references = parallel_data::read_lines(&corpus.target)?;
            if sources.len() != references.len() {
                return Err(TrainingError::initialization(format!(
                    "dev set {} has {} sources but {} references",
                    corpus.pair(),
                    sources.len(),
                    references.len()
                )));
            }
            tracing::info!(pair = %corpus.pair(), sentences = sources.len(), "loaded dev set");
            Ok(DevSet {
                pair: corpus.pair(),
                sources,
                references,
            })
        })
        .collect()
}
