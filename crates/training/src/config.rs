use candle_core::DType;
use parallel_data::LanguagePair;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use crate::data::masking::MaskRatio;
use crate::error::TrainingError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelOverrides,
    pub tokenizer: TokenizerConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub masking: MaskingConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub distillation: Option<DistillationConfig>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub decoding: DecodingOptions,
    #[serde(default)]
    pub init: InitConfig,
    pub runtime: RuntimeConfig,
}

/// Marian-style encoder/decoder dimensions after defaults are filled in.
#[derive(Debug, Clone)]
pub struct ModelHyperparameters {
    pub vocab_size: usize,
    pub d_model: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub decoder_ffn_dim: usize,
    pub max_position_embeddings: usize,
    pub activation: String,
    pub scale_embedding: bool,
    pub dropout: f64,
    pub attention_dropout: f64,
    pub dtype: DType,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.train.is_empty() {
            errors.push("data.train must list at least one corpus".to_string());
        }

        if self.evaluation.enabled && self.data.dev.is_empty() {
            errors.push(
                "data.dev must list at least one corpus when evaluation is enabled".to_string(),
            );
        }

        let mut seen = BTreeSet::new();
        for corpus in &self.data.train {
            if !seen.insert(corpus.pair()) {
                errors.push(format!("data.train lists pair {} twice", corpus.pair()));
            }
        }
        let mut seen = BTreeSet::new();
        for corpus in &self.data.dev {
            if !seen.insert(corpus.pair()) {
                errors.push(format!("data.dev lists pair {} twice", corpus.pair()));
            }
        }

        for (name, value) in [
            ("model.dropout", self.model.dropout),
            ("model.attention_dropout", self.model.attention_dropout),
        ] {
            if let Some(p) = value {
                if !(0.0..1.0).contains(&p) {
                    errors.push(format!("{name} must be in [0, 1) (got {p})"));
                }
            }
        }

        if self.data.batch_tokens == 0 {
            errors.push("data.batch_tokens must be greater than 0".to_string());
        }

        if self.data.dev_batch_size == 0 {
            errors.push("data.dev_batch_size must be greater than 0".to_string());
        }

        if self.data.max_src_length == 0 || self.data.max_tgt_length == 0 {
            errors.push("data.max_src_length and data.max_tgt_length must be > 0".to_string());
        }

        if !(self.data.sampling_temperature > 0.0) {
            errors.push("data.sampling_temperature must be greater than 0".to_string());
        }

        match self.masking.ratio {
            MaskRatio::Fixed(value) if !(0.0..=1.0).contains(&value) => {
                errors.push("masking.ratio must be in [0, 1]".to_string());
            }
            MaskRatio::Range(low, high)
                if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high =>
            {
                errors.push("masking.ratio range must satisfy 0 <= low <= high <= 1".to_string());
            }
            _ => {}
        }

        if !(self.masking.span_lambda > 0.0) {
            errors.push("masking.span_lambda must be greater than 0".to_string());
        }

        if self.masking.candidate_pool == 0 {
            errors.push("masking.candidate_pool must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.loss.label_smoothing) {
            errors.push("loss.label_smoothing must be in [0, 1)".to_string());
        }

        if !(self.loss.softmax_temperature > 0.0) {
            errors.push("loss.softmax_temperature must be greater than 0".to_string());
        }

        if let Some(weight) = self.loss.max_ent_weight {
            if !(0.0..=1.0).contains(&weight) {
                errors.push("loss.max_ent_weight must be in [0, 1]".to_string());
            }
        }

        if let Some(distillation) = &self.distillation {
            if !(0.0..=1.0).contains(&distillation.loss_weight) {
                errors.push("distillation.loss_weight must be in [0, 1]".to_string());
            }
            if distillation.styles.is_empty() {
                errors.push("distillation.styles must not be empty".to_string());
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if self.optimizer.max_grad_norm < 0.0 {
            errors.push("optimizer.max_grad_norm must be >= 0 (0 disables clipping)".to_string());
        }

        if self.scheduler.total_steps == 0 {
            errors.push("scheduler.total_steps must be greater than 0".to_string());
        }

        if self.scheduler.warmup_steps > self.scheduler.total_steps {
            errors.push("scheduler.warmup_steps cannot exceed scheduler.total_steps".to_string());
        }

        if let Some(min_lr) = self.scheduler.min_lr {
            if min_lr < 0.0 {
                errors.push("scheduler.min_lr must be >= 0".to_string());
            }
            if min_lr > self.optimizer.learning_rate {
                errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
            }
        }

        if self.evaluation.every_n_steps == 0 {
            errors.push("evaluation.every_n_steps must be greater than 0".to_string());
        }

        if self.evaluation.save_every_n_steps_without_eval == 0 {
            errors.push(
                "evaluation.save_every_n_steps_without_eval must be greater than 0".to_string(),
            );
        }

        if !(self.evaluation.learning_rate_scaling > 1.0) {
            errors.push("evaluation.learning_rate_scaling must be greater than 1".to_string());
        }

        if let Some(0) = self.evaluation.anneal_step_cap {
            errors.push("evaluation.anneal_step_cap must be greater than 0".to_string());
        }

        if self.evaluation.enabled
            && self.evaluation.max_annealing_attempts > 0
            && matches!(self.scheduler.strategy, LearningRateSchedule::Constant)
        {
            errors.push(
                "scheduler.strategy `constant` never decays, so annealing cannot lower the \
                 learning rate; set evaluation.max_annealing_attempts = 0"
                    .to_string(),
            );
        }

        if self.evaluation.beam_size == 0 || self.decoding.beam_size == 0 {
            errors.push("beam sizes must be greater than 0".to_string());
        }

        if !(self.decoding.max_length_multiplier > 0.0)
            || self.decoding.min_length_multiplier < 0.0
            || self.decoding.min_length_multiplier > self.decoding.max_length_multiplier
        {
            errors.push(
                "decoding length multipliers must satisfy 0 <= min <= max and max > 0".to_string(),
            );
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.checkpoint_dir.as_os_str().is_empty() {
            errors.push("runtime.checkpoint_dir must not be empty".to_string());
        }

        if self.init.resume && self.init.pretrained_model.is_some() {
            errors.push("init.resume and init.pretrained_model are mutually exclusive".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.tokenizer.apply_base_path(base);
        self.data.apply_base_path(base);
        self.init.apply_base_path(base);
        self.runtime.apply_base_path(base);
        if let Some(distillation) = self.distillation.as_mut() {
            absolutize_in_place(&mut distillation.parent_model, base);
        }
    }

    /// Every language code that needs a `<2xx>` tag, in sorted order.
    pub fn languages(&self) -> Vec<String> {
        let mut languages = BTreeSet::new();
        for corpus in self.data.train.iter().chain(self.data.dev.iter()) {
            languages.insert(corpus.source_lang.clone());
            languages.insert(corpus.target_lang.clone());
        }
        languages.into_iter().collect()
    }

    pub fn resolve_model_hyperparameters(
        &self,
        overrides: &ModelOverrides,
        detected_vocab_size: usize,
    ) -> Result<ModelHyperparameters, TrainingError> {
        let vocab_size = overrides.vocab_size.unwrap_or(detected_vocab_size);
        if vocab_size < detected_vocab_size {
            return Err(TrainingError::initialization(format!(
                "model.vocab_size {} is smaller than the tokenizer vocabulary {}",
                vocab_size, detected_vocab_size
            )));
        }

        let d_model = overrides.d_model.unwrap_or(DEFAULT_D_MODEL);
        let encoder_attention_heads = overrides
            .encoder_attention_heads
            .unwrap_or(DEFAULT_ATTENTION_HEADS);
        let decoder_attention_heads = overrides
            .decoder_attention_heads
            .unwrap_or(DEFAULT_ATTENTION_HEADS);

        for heads in [encoder_attention_heads, decoder_attention_heads] {
            if heads == 0 || d_model % heads != 0 {
                return Err(TrainingError::initialization(format!(
                    "d_model {} must be divisible by the attention head count {}",
                    d_model, heads
                )));
            }
        }

        let max_position_embeddings = overrides
            .max_position_embeddings
            .unwrap_or(DEFAULT_MAX_POSITION_EMBEDDINGS);
        let longest = self.data.max_src_length.max(self.data.max_tgt_length);
        if max_position_embeddings < longest {
            return Err(TrainingError::initialization(format!(
                "model.max_position_embeddings {} is shorter than the longest allowed sequence {}",
                max_position_embeddings, longest
            )));
        }

        Ok(ModelHyperparameters {
            vocab_size,
            d_model,
            encoder_layers: overrides.encoder_layers.unwrap_or(DEFAULT_LAYERS),
            decoder_layers: overrides.decoder_layers.unwrap_or(DEFAULT_LAYERS),
            encoder_attention_heads,
            decoder_attention_heads,
            encoder_ffn_dim: overrides.encoder_ffn_dim.unwrap_or(DEFAULT_FFN_DIM),
            decoder_ffn_dim: overrides.decoder_ffn_dim.unwrap_or(DEFAULT_FFN_DIM),
            max_position_embeddings,
            activation: overrides
                .activation
                .clone()
                .unwrap_or_else(|| DEFAULT_ACTIVATION.to_string()),
            scale_embedding: overrides.scale_embedding.unwrap_or(true),
            dropout: overrides.dropout.unwrap_or(DEFAULT_DROPOUT),
            attention_dropout: overrides.attention_dropout.unwrap_or(DEFAULT_DROPOUT),
            dtype: precision_to_dtype(self.runtime.precision),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub d_model: Option<usize>,
    #[serde(default)]
    pub encoder_layers: Option<usize>,
    #[serde(default)]
    pub decoder_layers: Option<usize>,
    #[serde(default)]
    pub encoder_attention_heads: Option<usize>,
    #[serde(default)]
    pub decoder_attention_heads: Option<usize>,
    #[serde(default)]
    pub encoder_ffn_dim: Option<usize>,
    #[serde(default)]
    pub decoder_ffn_dim: Option<usize>,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub activation: Option<String>,
    #[serde(default)]
    pub scale_embedding: Option<bool>,
    #[serde(default)]
    pub dropout: Option<f64>,
    #[serde(default)]
    pub attention_dropout: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub tokenizer_json: PathBuf,
}

impl TokenizerConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.tokenizer_json, base);
    }
}

/// One aligned pair of corpus files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusConfig {
    pub source_lang: String,
    pub target_lang: String,
    pub source: PathBuf,
    pub target: PathBuf,
}

impl CorpusConfig {
    pub fn pair(&self) -> LanguagePair {
        LanguagePair::new(self.source_lang.clone(), self.target_lang.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train: Vec<CorpusConfig>,
    #[serde(default)]
    pub dev: Vec<CorpusConfig>,
    /// Token budget per batch: `max(encoder_len, decoder_len) * examples`.
    #[serde(default = "default_batch_tokens")]
    pub batch_tokens: usize,
    /// Sentences per evaluation/decoding batch.
    #[serde(default = "default_dev_batch_size")]
    pub dev_batch_size: usize,
    #[serde(default = "default_max_length")]
    pub max_src_length: usize,
    #[serde(default = "default_max_length")]
    pub max_tgt_length: usize,
    #[serde(default = "default_sampling_temperature")]
    pub sampling_temperature: f64,
    #[serde(default)]
    pub is_summarization: bool,
    /// Split every training corpus into one shard per worker before loading.
    #[serde(default)]
    pub shard_files: bool,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for corpus in self.train.iter_mut().chain(self.dev.iter_mut()) {
            absolutize_in_place(&mut corpus.source, base);
            absolutize_in_place(&mut corpus.target, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskingConfig {
    #[serde(default = "default_mask_ratio")]
    pub ratio: MaskRatio,
    #[serde(default = "default_span_lambda")]
    pub span_lambda: f64,
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,
    #[serde(default = "default_mask_token")]
    pub mask_token: String,
    /// Also mask the source side of bilingual pairs, using a ratio drawn from
    /// `[0, low)` of the configured range.
    #[serde(default)]
    pub always_mask_bilingual: bool,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            ratio: default_mask_ratio(),
            span_lambda: default_span_lambda(),
            candidate_pool: default_candidate_pool(),
            mask_token: default_mask_token(),
            always_mask_bilingual: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f64,
    #[serde(default = "default_softmax_temperature")]
    pub softmax_temperature: f64,
    #[serde(default)]
    pub max_ent_weight: Option<f64>,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            label_smoothing: default_label_smoothing(),
            softmax_temperature: default_softmax_temperature(),
            max_ent_weight: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillationStyle {
    CrossEntropy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationConfig {
    /// Weights of the frozen parent: a checkpoint directory or a safetensors file.
    pub parent_model: PathBuf,
    #[serde(default)]
    pub parent: ModelOverrides,
    #[serde(default = "default_distillation_loss_weight")]
    pub loss_weight: f64,
    #[serde(default = "default_distillation_styles")]
    pub styles: Vec<DistillationStyle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default = "default_weight_decay_exclude")]
    pub weight_decay_exclude: Vec<String>,
    /// Parameter-name patterns that receive no updates (e.g. `embed_tokens`, `encoder.`).
    #[serde(default)]
    pub frozen_parameters: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
            weight_decay_exclude: default_weight_decay_exclude(),
            frozen_parameters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    /// Training step budget (`num_batches`).
    #[serde(default = "default_total_steps")]
    pub total_steps: usize,
    #[serde(default)]
    pub min_lr: Option<f64>,
    #[serde(default)]
    pub power: Option<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            warmup_steps: default_warmup_steps(),
            total_steps: default_total_steps(),
            min_lr: None,
            power: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Linear,
    Constant,
    Cosine,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_eval_every")]
    pub every_n_steps: usize,
    #[serde(default = "default_beam_size_eval")]
    pub beam_size: usize,
    #[serde(default = "default_early_stop_checkpoints")]
    pub early_stop_checkpoints: usize,
    #[serde(default = "default_learning_rate_scaling")]
    pub learning_rate_scaling: f64,
    #[serde(default = "default_max_annealing_attempts")]
    pub max_annealing_attempts: usize,
    #[serde(default = "default_additional_checkpoints_per_anneal")]
    pub additional_early_stop_checkpoints_per_anneal: usize,
    /// Upper bound on scheduler steps taken by a single anneal. Defaults to
    /// `scheduler.total_steps`.
    #[serde(default)]
    pub anneal_step_cap: Option<usize>,
    #[serde(default = "default_save_every_without_eval")]
    pub save_every_n_steps_without_eval: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_steps: default_eval_every(),
            beam_size: default_beam_size_eval(),
            early_stop_checkpoints: default_early_stop_checkpoints(),
            learning_rate_scaling: default_learning_rate_scaling(),
            max_annealing_attempts: default_max_annealing_attempts(),
            additional_early_stop_checkpoints_per_anneal: default_additional_checkpoints_per_anneal(),
            anneal_step_cap: None,
            save_every_n_steps_without_eval: default_save_every_without_eval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodingOptions {
    #[serde(default = "default_beam_size")]
    pub beam_size: usize,
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f64,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,
    #[serde(default)]
    pub no_repeat_ngram_size: usize,
    #[serde(default)]
    pub encoder_no_repeat_ngram_size: usize,
    #[serde(default = "default_true")]
    pub early_stopping: bool,
    #[serde(default = "default_max_length_multiplier")]
    pub max_length_multiplier: f64,
    #[serde(default = "default_min_length_multiplier")]
    pub min_length_multiplier: f64,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            beam_size: default_beam_size(),
            length_penalty: default_length_penalty(),
            repetition_penalty: default_repetition_penalty(),
            no_repeat_ngram_size: 0,
            encoder_no_repeat_ngram_size: 0,
            early_stopping: true,
            max_length_multiplier: default_max_length_multiplier(),
            min_length_multiplier: default_min_length_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitConfig {
    /// Model weights to start from (safetensors file or checkpoint directory).
    #[serde(default)]
    pub pretrained_model: Option<PathBuf>,
    /// Resume model, optimizer, scheduler and step counter from the rolling checkpoint.
    #[serde(default)]
    pub resume: bool,
}

impl InitConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.pretrained_model.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint_dir, base);
        if let Some(dir) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

pub fn precision_to_dtype(precision: Precision) -> DType {
    match precision {
        Precision::Fp32 => DType::F32,
        Precision::Fp16 => DType::F16,
        Precision::Bf16 => DType::BF16,
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

const DEFAULT_D_MODEL: usize = 512;
const DEFAULT_LAYERS: usize = 6;
const DEFAULT_ATTENTION_HEADS: usize = 8;
const DEFAULT_FFN_DIM: usize = 2_048;
const DEFAULT_MAX_POSITION_EMBEDDINGS: usize = 1_024;
const DEFAULT_ACTIVATION: &str = "gelu";
const DEFAULT_DROPOUT: f64 = 0.1;

fn default_true() -> bool {
    true
}

fn default_batch_tokens() -> usize {
    1_024
}

fn default_dev_batch_size() -> usize {
    1_024
}

fn default_max_length() -> usize {
    256
}

fn default_sampling_temperature() -> f64 {
    5.0
}

fn default_mask_ratio() -> MaskRatio {
    MaskRatio::Range(0.30, 0.40)
}

fn default_span_lambda() -> f64 {
    3.5
}

fn default_candidate_pool() -> usize {
    1_000
}

fn default_mask_token() -> String {
    "[MASK]".to_string()
}

fn default_label_smoothing() -> f64 {
    0.1
}

fn default_softmax_temperature() -> f64 {
    1.0
}

fn default_distillation_loss_weight() -> f64 {
    0.7
}

fn default_distillation_styles() -> Vec<DistillationStyle> {
    vec![DistillationStyle::CrossEntropy]
}

fn default_learning_rate() -> f64 {
    7e-4
}

fn default_weight_decay() -> f64 {
    1e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-9
}

fn default_max_grad_norm() -> f64 {
    1.0
}

fn default_weight_decay_exclude() -> Vec<String> {
    vec!["bias".to_string(), "layer_norm".to_string()]
}

fn default_warmup_steps() -> usize {
    16_000
}

fn default_total_steps() -> usize {
    1_000_000
}

fn default_eval_every() -> usize {
    1_000
}

fn default_beam_size_eval() -> usize {
    1
}

fn default_early_stop_checkpoints() -> usize {
    10
}

fn default_learning_rate_scaling() -> f64 {
    2.0
}

fn default_max_annealing_attempts() -> usize {
    2
}

fn default_additional_checkpoints_per_anneal() -> usize {
    5
}

fn default_save_every_without_eval() -> usize {
    10_000
}

fn default_beam_size() -> usize {
    4
}

fn default_length_penalty() -> f64 {
    1.0
}

fn default_repetition_penalty() -> f64 {
    1.0
}

fn default_max_length_multiplier() -> f64 {
    1.5
}

fn default_min_length_multiplier() -> f64 {
    0.25
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_tensorboard_flush() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [tokenizer]
        tokenizer_json = "tok/tokenizer.json"

        [data]
        train = [
            { source_lang = "en", target_lang = "hi", source = "train.en", target = "train.hi" },
            { source_lang = "hi", target_lang = "hi", source = "mono.hi", target = "mono.hi" },
        ]
        dev = [
            { source_lang = "en", target_lang = "hi", source = "dev.en", target = "dev.hi" },
        ]

        [runtime]
        checkpoint_dir = "ckpt"
    "#;

    fn write_config(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_follow_training_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "train.toml", MINIMAL);
        let config = TrainingConfig::from_path(&path).unwrap();

        assert_eq!(config.data.batch_tokens, 1024);
        assert_eq!(config.data.max_src_length, 256);
        assert_eq!(config.data.sampling_temperature, 5.0);
        assert!(matches!(config.masking.ratio, MaskRatio::Range(lo, hi) if lo == 0.30 && hi == 0.40));
        assert_eq!(config.optimizer.learning_rate, 7e-4);
        assert_eq!(config.scheduler.warmup_steps, 16_000);
        assert_eq!(config.evaluation.every_n_steps, 1_000);
        assert_eq!(config.evaluation.early_stop_checkpoints, 10);
        assert_eq!(config.evaluation.max_annealing_attempts, 2);
        assert!(config.distillation.is_none());
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "train.toml", MINIMAL);
        let config = TrainingConfig::from_path(&path).unwrap();

        assert_eq!(config.tokenizer.tokenizer_json, dir.path().join("tok/tokenizer.json"));
        assert_eq!(config.data.train[0].source, dir.path().join("train.en"));
        assert_eq!(config.runtime.checkpoint_dir, dir.path().join("ckpt"));
    }

    #[test]
    fn languages_cover_train_and_dev() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "train.toml", MINIMAL);
        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.languages(), vec!["en".to_string(), "hi".to_string()]);
    }

    #[test]
    fn validation_collects_every_problem() {
        let body = format!(
            "{MINIMAL}\n[loss]\nlabel_smoothing = 1.5\nmax_ent_weight = 2.0\n\n[scheduler]\nstrategy = \"constant\"\n"
        );
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "bad.toml", &body);

        match TrainingConfig::from_path(&path) {
            Err(TrainingError::Validation(messages)) => {
                assert!(messages.iter().any(|m| m.contains("label_smoothing")));
                assert!(messages.iter().any(|m| m.contains("max_ent_weight")));
                assert!(messages.iter().any(|m| m.contains("constant")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn evaluation_requires_dev_sets() {
        let body = MINIMAL.replace(
            r#"dev = [
            { source_lang = "en", target_lang = "hi", source = "dev.en", target = "dev.hi" },
        ]"#,
            "",
        );
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "nodev.toml", &body);
        assert!(matches!(
            TrainingConfig::from_path(&path),
            Err(TrainingError::Validation(_))
        ));
    }

    #[test]
    fn json_configs_are_accepted() {
        let json = r#"{
            "tokenizer": { "tokenizer_json": "tokenizer.json" },
            "data": {
                "train": [{ "source_lang": "en", "target_lang": "ta", "source": "a", "target": "b" }],
                "batch_tokens": 2048
            },
            "masking": { "ratio": 0.2 },
            "evaluation": { "enabled": false },
            "runtime": { "checkpoint_dir": "out" }
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "train.json", json);
        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.data.batch_tokens, 2048);
        assert!(matches!(config.masking.ratio, MaskRatio::Fixed(r) if r == 0.2));
        assert!(!config.evaluation.enabled);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "train.yaml", MINIMAL);
        assert!(matches!(
            TrainingConfig::from_path(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
