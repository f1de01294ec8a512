use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::{to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    pub use_master_weights: bool,
    /// `None` disables clipping.
    pub clip_global_norm: Option<f64>,
    pub weight_decay_exclude: Vec<String>,
    pub frozen_parameters: Vec<String>,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            use_master_weights: true,
            clip_global_norm: None,
            weight_decay_exclude: vec![],
            frozen_parameters: vec![],
        }
    }
}

impl TrainerOptimizerOptions {
    pub fn from_config(cfg: &config::OptimizerConfig) -> Self {
        Self {
            use_master_weights: true,
            clip_global_norm: (cfg.max_grad_norm > 0.0).then_some(cfg.max_grad_norm),
            weight_decay_exclude: cfg.weight_decay_exclude.clone(),
            frozen_parameters: cfg.frozen_parameters.clone(),
        }
    }
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

/// What one optimizer update did, for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateReport {
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub clipped: bool,
    pub parameters_updated: usize,
}

/// AdamW with decoupled weight decay, fp32 master copies for half-precision
/// parameters and optional global-norm clipping. The learning rate is handed in
/// on every step by the caller's scheduler.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<TrackedParameter>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct TrackedParameter {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        let mut params = Vec::with_capacity(named_parameters.len());
        let mut frozen = 0usize;
        for (name, var) in named_parameters {
            if matches_any(&name, &options.frozen_parameters) {
                frozen += 1;
                continue;
            }

            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let master = if options.use_master_weights && dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(TrackedParameter {
                apply_weight_decay: !matches_any(&name, &options.weight_decay_exclude),
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
            });
        }

        if params.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one trainable parameter",
            ));
        }
        if frozen > 0 {
            tracing::info!(frozen, trainable = params.len(), "froze parameters");
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn trainable_parameters(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    /// True when any gradient of a trainable parameter is NaN or infinite.
    pub fn has_non_finite_gradients(
        &self,
        grads: &GradStore,
        scaler: &GradientScaler,
    ) -> Result<bool, TrainingError> {
        let present = self
            .params
            .iter()
            .filter_map(|slot| grads.get(slot.param.as_tensor()));
        scaler.has_overflow(present)
    }

    /// Applies one AdamW update. Gradients are multiplied by `grad_scale`
    /// (the inverse loss scale) before clipping.
    pub fn step(
        &mut self,
        grads: &mut GradStore,
        learning_rate: f64,
        grad_scale: f64,
    ) -> Result<UpdateReport, TrainingError> {
        let mut processed = Vec::new();

        for (idx, slot) in self.params.iter().enumerate() {
            let grad = match grads.remove(slot.param.as_tensor()) {
                Some(grad) => grad,
                None => continue,
            };

            let mut grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            if (grad_scale - 1.0).abs() > f64::EPSILON {
                grad = grad.affine(grad_scale, 0.0).map_err(to_runtime_error)?;
            }
            let norm = tensor_l2_norm(&grad)?;

            processed.push(ProcessedGradient {
                index: idx,
                grad,
                norm,
            });
        }

        if processed.is_empty() {
            return Ok(UpdateReport {
                grad_norm: 0.0,
                clipped: false,
                parameters_updated: 0,
            });
        }

        let total_norm = processed
            .iter()
            .map(|g| g.norm * g.norm)
            .sum::<f64>()
            .sqrt();
        let mut clipped = false;
        if let Some(max_norm) = self.clip_global_norm {
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
                clipped = true;
            }
        }

        let parameters_updated = processed.len();
        self.step += 1;
        self.apply_adamw(learning_rate, processed)?;

        Ok(UpdateReport {
            grad_norm: total_norm,
            clipped,
            parameters_updated,
        })
    }

    fn apply_adamw(
        &mut self,
        learning_rate: f64,
        processed: Vec<ProcessedGradient>,
    ) -> Result<(), TrainingError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m + item.grad.affine(1.0 - cfg.beta1, 0.0)?)
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v + item.grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)
                .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = new_m
                .affine(scale_m, 0.0)
                .and_then(|m| m.div(&denom))
                .and_then(|u| u.affine(learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };

            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Drops any gradients left over from a skipped update.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    /// Re-reads master weights from the live parameters, e.g. after a model reload.
    pub fn sync_master_weights(&mut self) -> Result<(), TrainingError> {
        for slot in &mut self.params {
            if let Some(master) = slot.master.as_ref() {
                let fp32 = slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?;
                master.set(&fp32).map_err(to_runtime_error)?;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            let master = match &slot.master {
                Some(master) => Some(flatten_to_vec(master.as_tensor(), numel)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                shape,
                master,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            if dims != state.shape {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected = numel(&dims);
            if expected != state.first_moment.len()
                || expected != state.second_moment.len()
                || state.master.as_ref().map_or(false, |m| m.len() != expected)
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            let restore = |values: Vec<f32>| {
                Tensor::from_vec(values, dims.as_slice(), &device).map_err(to_runtime_error)
            };
            slot.first_moment = restore(state.first_moment)?;
            slot.second_moment = restore(state.second_moment)?;

            match (&slot.master, state.master) {
                (Some(master), Some(values)) => {
                    master.set(&restore(values)?).map_err(to_runtime_error)?;
                }
                (None, None) => {}
                (Some(_), None) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )))
                }
                (None, Some(_)) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state contains master weights for '{}' but optimizer is not using them",
                        slot.name
                    )))
                }
            }
        }

        if !by_name.is_empty() {
            let mut extra: Vec<String> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        Ok(())
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

fn matches_any(name: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .sqr()
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn adamw() -> AdamWConfig {
        AdamWConfig {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-9,
            weight_decay: 0.0,
        }
    }

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    fn grads_for(vars: &[&Var], scale: f64) -> GradStore {
        let loss = vars
            .iter()
            .map(|v| v.as_tensor().sqr().unwrap().sum_all().unwrap())
            .reduce(|a, b| (a + b).unwrap())
            .unwrap()
            .affine(scale, 0.0)
            .unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn first_step_moves_against_gradient_by_lr() {
        let weight = var(&[1.0, -2.0]);
        let mut optimizer = TrainerOptimizer::new(
            vec![("encoder.weight".into(), weight.clone())],
            adamw(),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();

        let mut grads = grads_for(&[&weight], 1.0);
        let report = optimizer.step(&mut grads, 0.1, 1.0).unwrap();
        assert_eq!(report.parameters_updated, 1);

        // Bias-corrected Adam's first step has magnitude ~lr per coordinate.
        let values = weight.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.9).abs() < 1e-4);
        assert!((values[1] + 1.9).abs() < 1e-4);
    }

    #[test]
    fn frozen_parameters_are_not_updated() {
        let embed = var(&[1.0, 1.0]);
        let head = var(&[1.0, 1.0]);
        let mut optimizer = TrainerOptimizer::new(
            vec![
                ("model.shared.embed_tokens.weight".into(), embed.clone()),
                ("model.lm_head.weight".into(), head.clone()),
            ],
            adamw(),
            TrainerOptimizerOptions {
                frozen_parameters: vec!["embed_tokens".into()],
                ..TrainerOptimizerOptions::default()
            },
        )
        .unwrap();
        assert_eq!(optimizer.trainable_parameters().count(), 1);

        let mut grads = grads_for(&[&embed, &head], 1.0);
        optimizer.step(&mut grads, 0.1, 1.0).unwrap();
        assert_eq!(embed.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
        assert!(head.as_tensor().to_vec1::<f32>().unwrap()[0] < 1.0);
    }

    #[test]
    fn clipping_reports_pre_clip_norm() {
        let weight = var(&[3.0, 4.0]);
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), weight.clone())],
            adamw(),
            TrainerOptimizerOptions {
                clip_global_norm: Some(1.0),
                ..TrainerOptimizerOptions::default()
            },
        )
        .unwrap();

        // d/dw of sum(w^2) is 2w, norm 10; halved by the grad scale.
        let mut grads = grads_for(&[&weight], 1.0);
        let report = optimizer.step(&mut grads, 0.01, 0.5).unwrap();
        assert!((report.grad_norm - 5.0).abs() < 1e-4);
        assert!(report.clipped);
    }

    #[test]
    fn weight_decay_skips_excluded_names() {
        let weight = var(&[1.0]);
        let bias = var(&[1.0]);
        let mut optimizer = TrainerOptimizer::new(
            vec![
                ("layer.weight".into(), weight.clone()),
                ("layer.bias".into(), bias.clone()),
            ],
            AdamWConfig {
                weight_decay: 0.5,
                ..adamw()
            },
            TrainerOptimizerOptions {
                weight_decay_exclude: vec!["bias".into()],
                ..TrainerOptimizerOptions::default()
            },
        )
        .unwrap();

        let mut grads = grads_for(&[&weight, &bias], 1.0);
        optimizer.step(&mut grads, 0.1, 1.0).unwrap();
        let w = weight.as_tensor().to_vec1::<f32>().unwrap()[0];
        let b = bias.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!(w < b);
    }

    #[test]
    fn state_restores_moments() {
        let weight = var(&[0.5, 0.25]);
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), weight.clone())],
            adamw(),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let mut grads = grads_for(&[&weight], 1.0);
        optimizer.step(&mut grads, 0.01, 1.0).unwrap();
        let saved = optimizer.state().unwrap();

        let mut fresh = TrainerOptimizer::new(
            vec![("w".into(), weight.clone())],
            adamw(),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        fresh.load_state(saved.clone()).unwrap();
        assert_eq!(fresh.steps_taken(), 1);
        assert_eq!(
            fresh.state().unwrap().parameters[0].first_moment,
            saved.parameters[0].first_moment
        );

        let mut renamed = saved;
        renamed.parameters[0].name = "other".into();
        assert!(fresh.load_state(renamed).is_err());
    }
}
