use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::config::{DistillationStyle, TrainingConfig};
use crate::error::{to_runtime_error, TrainingError};

#[derive(Debug, Clone)]
struct Distillation {
    loss_weight: f64,
    styles: Vec<DistillationStyle>,
}

/// Label-smoothed cross entropy over temperature-scaled logits, with optional
/// entropy maximisation and distillation from a parent model.
///
/// The smoothed loss is computed on `log_softmax(logits / T)` and multiplied
/// back by `T`. Averages run over non-ignored target positions.
#[derive(Debug, Clone)]
pub struct LabelSmoothedLoss {
    label_smoothing: f64,
    softmax_temperature: f64,
    ignore_index: Option<u32>,
    entropy_weight: Option<f64>,
    distillation: Option<Distillation>,
}

impl LabelSmoothedLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &TrainingConfig, pad_id: u32) -> Result<Self, TrainingError> {
        let mut loss = Self::new()
            .with_label_smoothing(config.loss.label_smoothing)?
            .with_softmax_temperature(config.loss.softmax_temperature)?
            .with_ignore_index(Some(pad_id));
        if let Some(weight) = config.loss.max_ent_weight {
            loss = loss.with_entropy_weight(weight)?;
        }
        if let Some(distillation) = &config.distillation {
            loss = loss.with_distillation(distillation.loss_weight, distillation.styles.clone())?;
        }
        Ok(loss)
    }

    pub fn with_label_smoothing(mut self, smoothing: f64) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn with_softmax_temperature(mut self, temperature: f64) -> Result<Self, TrainingError> {
        if !(temperature > 0.0) {
            return Err(TrainingError::initialization(
                "softmax temperature must be greater than zero",
            ));
        }
        self.softmax_temperature = temperature;
        Ok(self)
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// `loss * (1 - w) - entropy * w`, entropy taken over untempered logits.
    pub fn with_entropy_weight(mut self, weight: f64) -> Result<Self, TrainingError> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(TrainingError::initialization(
                "entropy weight must be in [0, 1]",
            ));
        }
        self.entropy_weight = Some(weight);
        Ok(self)
    }

    /// `w * distillation + (1 - w) * loss`.
    pub fn with_distillation(
        mut self,
        loss_weight: f64,
        styles: Vec<DistillationStyle>,
    ) -> Result<Self, TrainingError> {
        if !(0.0..=1.0).contains(&loss_weight) {
            return Err(TrainingError::initialization(
                "distillation loss weight must be in [0, 1]",
            ));
        }
        if styles.is_empty() {
            return Err(TrainingError::initialization(
                "distillation needs at least one style",
            ));
        }
        self.distillation = Some(Distillation {
            loss_weight,
            styles,
        });
        Ok(self)
    }

    pub fn uses_distillation(&self) -> bool {
        self.distillation.is_some()
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        self.compute_with_parent(logits, targets, None)
    }

    /// `parent_logits` must be supplied exactly when distillation is enabled.
    pub fn compute_with_parent(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        parent_logits: Option<&Tensor>,
    ) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }

        let vocab_size = *dims
            .last()
            .ok_or_else(|| TrainingError::runtime("logits tensor missing vocabulary dimension"))?;
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }

        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(TrainingError::runtime(
                "target tensor must match logits batch/sequence dimensions",
            ));
        }

        let token_count: usize = token_dims.iter().copied().product();
        if token_count == 0 {
            return Err(TrainingError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let device = logits.device();
        let logits_flat = logits
            .reshape((token_count, vocab_size))
            .and_then(|t| t.to_dtype(DType::F32))
            .map_err(to_runtime_error)?;

        let targets_flat = targets
            .to_device(device)
            .and_then(|t| t.reshape((token_count,)))
            .map_err(to_runtime_error)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let valid_mask = if let Some(ignore_index) = self.ignore_index {
            targets_flat
                .ne(ignore_index)
                .and_then(|mask| mask.to_dtype(DType::F32))
                .map_err(to_runtime_error)?
        } else {
            Tensor::ones((token_count,), DType::F32, device).map_err(to_runtime_error)?
        };

        let total_tokens = scalar(&valid_mask.sum_all().map_err(to_runtime_error)?)?.round() as usize;
        if total_tokens == 0 {
            return Err(TrainingError::runtime(
                "no valid tokens remain after applying ignore_index",
            ));
        }
        let masked_mean = |per_token: &Tensor| -> Result<Tensor, TrainingError> {
            (per_token * &valid_mask)
                .and_then(|t| t.sum_all())
                .and_then(|t| t.affine(1.0 / total_tokens as f64, 0.0))
                .map_err(to_runtime_error)
        };

        let temperature = self.softmax_temperature;
        let log_probs = logits_flat
            .affine(1.0 / temperature, 0.0)
            .and_then(|scaled| ops::log_softmax(&scaled, D::Minus1))
            .map_err(to_runtime_error)?;

        let target_indices = targets_flat.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .and_then(|t| t.squeeze(1))
            .and_then(|t| t.neg())
            .map_err(to_runtime_error)?;

        let per_token_loss = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing;
            let smooth = log_probs
                .sum(1)
                .and_then(|t| t.neg())
                .and_then(|t| t.affine(smoothing / vocab_size as f64, 0.0))
                .map_err(to_runtime_error)?;
            nll.affine(1.0 - smoothing, 0.0)
                .and_then(|t| t + smooth)
                .map_err(to_runtime_error)?
        } else {
            nll.clone()
        };

        let nll_loss = masked_mean(&nll)?;
        let mut loss = masked_mean(&per_token_loss)?
            .affine(temperature, 0.0)
            .map_err(to_runtime_error)?;

        let mut entropy_value = None;
        if let Some(weight) = self.entropy_weight {
            let entropy = self.entropy(&logits_flat, &masked_mean, vocab_size)?;
            entropy_value = Some(scalar(&entropy)?);
            let kept = loss.affine(1.0 - weight, 0.0).map_err(to_runtime_error)?;
            let bonus = entropy.affine(weight, 0.0).map_err(to_runtime_error)?;
            loss = (kept - bonus).map_err(to_runtime_error)?;
        }

        let mut distillation_value = None;
        match (&self.distillation, parent_logits) {
            (Some(distillation), Some(parent)) => {
                if parent.dims() != dims {
                    return Err(TrainingError::runtime(format!(
                        "parent logits {:?} do not match child logits {:?}",
                        parent.dims(),
                        dims
                    )));
                }
                let parent_flat = parent
                    .detach()
                    .reshape((token_count, vocab_size))
                    .and_then(|t| t.to_dtype(DType::F32))
                    .map_err(to_runtime_error)?;
                let distill = self.distillation_loss(
                    distillation,
                    &log_probs,
                    &parent_flat,
                    &masked_mean,
                )?;
                distillation_value = Some(scalar(&distill)?);
                let weight = distillation.loss_weight;
                let parent_term = distill.affine(weight, 0.0).map_err(to_runtime_error)?;
                let data_term = loss.affine(1.0 - weight, 0.0).map_err(to_runtime_error)?;
                loss = (parent_term + data_term).map_err(to_runtime_error)?;
            }
            (Some(_), None) => {
                return Err(TrainingError::runtime(
                    "distillation is enabled but no parent logits were provided",
                ));
            }
            (None, _) => {}
        }

        let average_loss = scalar(&loss)?;
        let nll_value = scalar(&nll_loss)?;

        let correct_tokens = logits_flat
            .argmax(D::Minus1)
            .and_then(|predictions| predictions.eq(&targets_flat))
            .and_then(|hits| hits.to_dtype(DType::F32))
            .and_then(|hits| hits * &valid_mask)
            .and_then(|hits| hits.sum_all())
            .map_err(to_runtime_error)
            .and_then(|hits| scalar(&hits))?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                nll_loss: nll_value,
                total_tokens,
                correct_tokens,
                entropy: entropy_value,
                distillation: distillation_value,
            },
        })
    }

    /// Mean of `-p log p` over non-ignored positions and the vocabulary.
    fn entropy(
        &self,
        logits_flat: &Tensor,
        masked_mean: &dyn Fn(&Tensor) -> Result<Tensor, TrainingError>,
        vocab_size: usize,
    ) -> Result<Tensor, TrainingError> {
        let raw = ops::log_softmax(logits_flat, D::Minus1).map_err(to_runtime_error)?;
        let per_token = raw
            .exp()
            .and_then(|probs| probs * &raw)
            .and_then(|plogp| plogp.sum(1))
            .map_err(to_runtime_error)?;
        masked_mean(&per_token)?
            .affine(-1.0 / vocab_size as f64, 0.0)
            .map_err(to_runtime_error)
    }

    fn distillation_loss(
        &self,
        distillation: &Distillation,
        child_log_probs: &Tensor,
        parent_logits: &Tensor,
        masked_mean: &dyn Fn(&Tensor) -> Result<Tensor, TrainingError>,
    ) -> Result<Tensor, TrainingError> {
        let temperature = self.softmax_temperature;
        let mut terms = Vec::with_capacity(distillation.styles.len());
        for style in &distillation.styles {
            match style {
                DistillationStyle::CrossEntropy => {
                    let parent_probs = parent_logits
                        .affine(1.0 / temperature, 0.0)
                        .and_then(|scaled| ops::softmax_last_dim(&scaled))
                        .map_err(to_runtime_error)?;
                    let per_token = (parent_probs * child_log_probs)
                        .and_then(|t| t.sum(1))
                        .map_err(to_runtime_error)?;
                    let term = masked_mean(&per_token)?
                        .affine(temperature * temperature, 0.0)
                        .map_err(to_runtime_error)?;
                    terms.push(term);
                }
            }
        }

        let count = terms.len() as f64;
        Tensor::stack(&terms, 0)
            .and_then(|stacked| stacked.sum_all())
            .and_then(|total| total.affine(-1.0 / count, 0.0))
            .map_err(to_runtime_error)
    }
}

impl Default for LabelSmoothedLoss {
    fn default() -> Self {
        Self {
            label_smoothing: 0.0,
            softmax_temperature: 1.0,
            ignore_index: None,
            entropy_weight: None,
            distillation: None,
        }
    }
}

fn scalar(tensor: &Tensor) -> Result<f32, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    nll_loss: f32,
    total_tokens: usize,
    correct_tokens: usize,
    entropy: Option<f32>,
    distillation: Option<f32>,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    /// Unsmoothed negative log-likelihood at the configured temperature.
    pub fn nll_loss(&self) -> f32 {
        self.nll_loss
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn correct_tokens(&self) -> usize {
        self.correct_tokens
    }

    pub fn entropy(&self) -> Option<f32> {
        self.entropy
    }

    pub fn distillation(&self) -> Option<f32> {
        self.distillation
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f32 / self.total_tokens as f32
        }
    }

    pub fn perplexity(&self) -> f32 {
        self.nll_loss.exp()
    }
}
