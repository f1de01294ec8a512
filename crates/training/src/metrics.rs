use std::time::{Duration, Instant};

use parallel_data::LanguagePair;

use crate::loss::LossMetrics;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Smoothed loss, gradient norm and target-token throughput across steps.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    target_tokens: u64,
    skipped_steps: usize,
    loss_ema: ExponentialMovingAverage,
    accuracy_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            target_tokens: 0,
            skipped_steps: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            accuracy_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, loss: &LossMetrics, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        let tokens = loss.total_tokens() as u64;
        self.target_tokens = self.target_tokens.saturating_add(tokens);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        let step_loss = loss.average_loss() as f64;

        StepSnapshot {
            loss: self.loss_ema.update(step_loss),
            step_loss,
            accuracy: self.accuracy_ema.update(loss.accuracy() as f64),
            entropy: loss.entropy().map(f64::from),
            distillation: loss.distillation().map(f64::from),
            tokens,
            step_tokens_per_sec,
            tokens_per_sec: self.throughput_ema.update(step_tokens_per_sec),
            grad_norm: self.grad_norm_ema.update(grad_norm),
            raw_grad_norm: grad_norm,
            total_tokens: self.target_tokens,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }

    /// Counts a step whose update was dropped; the step timer restarts so the
    /// next throughput sample is not diluted.
    pub fn record_skip(&mut self) -> usize {
        self.step_timer = Instant::now();
        self.skipped_steps += 1;
        self.skipped_steps
    }

    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub step_loss: f64,
    pub accuracy: f64,
    pub entropy: Option<f64>,
    pub distillation: Option<f64>,
    pub tokens: u64,
    pub step_tokens_per_sec: f64,
    pub tokens_per_sec: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub total_tokens: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

/// Dev scores of one evaluation tick.
#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub metric: &'static str,
    pub pairs: Vec<(LanguagePair, f64)>,
    pub hypotheses: usize,
    pub elapsed: Duration,
}

impl EvaluationSummary {
    pub fn global_score(&self) -> Option<f64> {
        if self.pairs.is_empty() {
            None
        } else {
            Some(self.pairs.iter().map(|(_, score)| score).sum::<f64>() / self.pairs.len() as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
    }

    #[test]
    fn global_score_is_the_pair_mean() {
        let summary = EvaluationSummary {
            metric: "bleu",
            pairs: vec![
                (LanguagePair::new("en", "hi"), 15.0),
                (LanguagePair::new("en", "ta"), 20.0),
            ],
            hypotheses: 4,
            elapsed: Duration::ZERO,
        };
        assert_eq!(summary.global_score(), Some(17.5));
    }

    #[test]
    fn skips_are_counted() {
        let mut metrics = TrainingMetrics::new();
        metrics.record_skip();
        assert_eq!(metrics.record_skip(), 2);
        assert_eq!(metrics.skipped_steps(), 2);
    }
}
