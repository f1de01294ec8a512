use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::Precision;
use crate::error::{to_runtime_error, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2_000,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Persisted part of the scaler, stored next to the optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub enabled: bool,
    pub loss_scale: f32,
    pub stable_steps: usize,
}

/// Dynamic loss scaling for fp16 training. Scaled gradients that overflow
/// cause the step to be skipped and the scale to back off; a run of clean
/// steps grows it again. bf16 and fp32 share fp32's exponent range, so the
/// scaler is a no-op for them.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if precision != Precision::Fp16 {
            return Self {
                state: ScalerState::Disabled,
            };
        }

        let config = sanitize_config(config);
        Self {
            state: ScalerState::Enabled(EnabledState {
                loss_scale: config.initial_scale,
                stable_steps: 0,
                config,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    /// Multiplier that undoes [`Self::scale`] on gradients.
    pub fn inverse_scale(&self) -> f64 {
        1.0 / self.loss_scale() as f64
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => tensor
                .affine(state.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        for tensor in tensors {
            if contains_non_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Enabled(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }

    pub fn state(&self) -> GradientScalerState {
        match &self.state {
            ScalerState::Disabled => GradientScalerState {
                enabled: false,
                loss_scale: 1.0,
                stable_steps: 0,
            },
            ScalerState::Enabled(state) => GradientScalerState {
                enabled: true,
                loss_scale: state.loss_scale,
                stable_steps: state.stable_steps,
            },
        }
    }

    /// Restores the scale of an enabled scaler. A state saved under another
    /// precision is ignored rather than rejected.
    pub fn load_state(&mut self, saved: &GradientScalerState) {
        match &mut self.state {
            ScalerState::Enabled(state) if saved.enabled => {
                state.loss_scale = saved
                    .loss_scale
                    .clamp(state.config.min_scale, state.config.max_scale);
                state.stable_steps = saved.stable_steps;
            }
            _ => {
                if saved.enabled != self.is_enabled() {
                    tracing::warn!(
                        saved = saved.enabled,
                        current = self.is_enabled(),
                        "loss scaler state was saved under a different precision"
                    );
                }
            }
        }
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.abs())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn tensor_from(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap()
    }

    fn fp16_scaler(initial_scale: f32, growth_interval: usize) -> GradientScaler {
        GradientScaler::with_config(
            LossScaleConfig {
                initial_scale,
                growth_interval,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        )
    }

    #[test]
    fn grows_after_clean_interval_and_backs_off_on_overflow() {
        let mut scaler = fp16_scaler(512.0, 2);
        assert!(scaler.is_enabled());
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 1024.0);
        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 512.0);
    }

    #[test]
    fn detects_non_finite_gradients_in_any_precision() {
        let scaler = GradientScaler::new(Precision::Fp32);
        let finite = tensor_from(&[1.0, -3.0]);
        let overflow = tensor_from(&[f32::INFINITY]);
        let nan = tensor_from(&[0.0, f32::NAN]);
        assert!(!scaler.has_overflow([&finite]).unwrap());
        assert!(scaler.has_overflow([&finite, &overflow]).unwrap());
        assert!(scaler.has_overflow([&nan]).unwrap());
    }

    #[test]
    fn bf16_and_fp32_do_not_scale() {
        for precision in [Precision::Fp32, Precision::Bf16] {
            let scaler = GradientScaler::new(precision);
            assert!(!scaler.is_enabled());
            assert_eq!(scaler.inverse_scale(), 1.0);
            let tensor = tensor_from(&[2.0, 4.0]);
            let scaled = scaler.scale(&tensor).unwrap();
            assert_eq!(scaled.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
        }
    }

    #[test]
    fn state_survives_restart() {
        let mut scaler = fp16_scaler(4096.0, 10);
        scaler.update(true);
        scaler.update(false);
        let saved = scaler.state();

        let mut restored = fp16_scaler(4096.0, 10);
        restored.load_state(&saved);
        assert_eq!(restored.state(), saved);
        assert_eq!(restored.loss_scale(), 2048.0);
    }
}
