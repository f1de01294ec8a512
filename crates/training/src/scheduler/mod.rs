use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::config::{self, LearningRateSchedule};
use crate::error::TrainingError;

/// Learning rate below which training never starts; the schedule is stepped
/// forward past it once at start-up.
pub const MIN_INITIAL_LEARNING_RATE: f64 = 1e-7;

/// Step-indexed learning-rate schedule. `learning_rate()` is the rate for the
/// current step count; `step()` advances the count by one.
pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn steps_taken(&self) -> usize;
    fn total_steps(&self) -> usize;
    fn state(&self) -> SchedulerState;
    fn load_state(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub step: usize,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecayShape {
    Linear,
    Constant,
    Cosine,
    Polynomial { power: f64 },
}

/// Linear warmup from zero to `base_lr`, followed by the configured decay down
/// to `min_lr` at `total_steps`.
#[derive(Debug, Clone)]
pub struct WarmupDecayScheduler {
    shape: DecayShape,
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupDecayScheduler {
    pub fn new(
        shape: DecayShape,
        base_lr: f64,
        min_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if min_lr < 0.0 || min_lr > base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }

        let mut scheduler = Self {
            shape,
            base_lr,
            min_lr,
            warmup_steps: warmup_steps.min(total_steps),
            total_steps,
            step: 0,
            current_lr: 0.0,
        };
        scheduler.current_lr = scheduler.compute_lr(0);
        Ok(scheduler)
    }

    pub fn from_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
    ) -> Result<Self, TrainingError> {
        let shape = match cfg.strategy {
            LearningRateSchedule::Linear => DecayShape::Linear,
            LearningRateSchedule::Constant => DecayShape::Constant,
            LearningRateSchedule::Cosine => DecayShape::Cosine,
            LearningRateSchedule::Polynomial => {
                let power = cfg.power.unwrap_or(1.0);
                DecayShape::Polynomial {
                    power: if power <= 0.0 { 1.0 } else { power },
                }
            }
        };
        Self::new(
            shape,
            base_lr,
            cfg.min_lr.unwrap_or(0.0),
            cfg.warmup_steps,
            cfg.total_steps,
        )
    }

    fn compute_lr(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }

        if matches!(self.shape, DecayShape::Constant) {
            return self.base_lr;
        }

        if self.total_steps <= self.warmup_steps {
            return self.min_lr;
        }

        let effective = step.saturating_sub(self.warmup_steps) as f64;
        let denom = (self.total_steps - self.warmup_steps) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        let decay = match self.shape {
            DecayShape::Linear => 1.0 - progress,
            DecayShape::Cosine => 0.5 * (1.0 + f64::cos(PI * progress)),
            DecayShape::Polynomial { power } => (1.0 - progress).powf(power),
            DecayShape::Constant => 1.0,
        };
        self.min_lr + (self.base_lr - self.min_lr) * decay
    }
}

impl LRScheduler for WarmupDecayScheduler {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.compute_lr(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn steps_taken(&self) -> usize {
        self.step
    }

    fn total_steps(&self) -> usize {
        self.total_steps
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            step: self.step,
            learning_rate: self.current_lr,
        }
    }

    fn load_state(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        self.step = state.step;
        self.current_lr = self.compute_lr(state.step);
        if (self.current_lr - state.learning_rate).abs() > 1e-12 * self.base_lr.max(1.0) {
            tracing::warn!(
                saved = state.learning_rate,
                recomputed = self.current_lr,
                step = state.step,
                "scheduler state was saved under a different schedule"
            );
        }
        Ok(())
    }
}

pub fn build_scheduler(
    cfg: &config::SchedulerConfig,
    base_lr: f64,
) -> Result<Box<dyn LRScheduler>, TrainingError> {
    Ok(Box::new(WarmupDecayScheduler::from_config(cfg, base_lr)?))
}

/// Steps the schedule until the rate reaches [`MIN_INITIAL_LEARNING_RATE`].
/// Returns the number of steps taken.
pub fn skip_negligible_warmup(
    scheduler: &mut dyn LRScheduler,
    cap: usize,
) -> Result<usize, TrainingError> {
    let mut steps = 0;
    while scheduler.learning_rate() < MIN_INITIAL_LEARNING_RATE {
        if steps >= cap {
            return Err(TrainingError::configuration(format!(
                "learning rate stayed below {MIN_INITIAL_LEARNING_RATE:e} for {cap} scheduler steps"
            )));
        }
        scheduler.step();
        steps += 1;
    }
    Ok(steps)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnealOutcome {
    pub before: f64,
    pub after: f64,
    pub steps: usize,
}

/// Divides the current rate by `factor` by stepping the schedule forward until
/// the rate is at or below the target. Exceeding `cap` steps means the schedule
/// cannot decay that far, which is a configuration error.
pub fn anneal(
    scheduler: &mut dyn LRScheduler,
    factor: f64,
    cap: usize,
) -> Result<AnnealOutcome, TrainingError> {
    if !(factor > 1.0) {
        return Err(TrainingError::configuration(format!(
            "annealing factor must be greater than 1 (got {factor})"
        )));
    }

    let before = scheduler.learning_rate();
    let target = before / factor;
    let mut steps = 0;
    while scheduler.learning_rate() > target {
        if steps >= cap {
            return Err(TrainingError::configuration(format!(
                "learning rate {:.3e} did not fall to {:.3e} within {} scheduler steps; \
                 the schedule cannot be annealed by a factor of {}",
                scheduler.learning_rate(),
                target,
                cap,
                factor
            )));
        }
        scheduler.step();
        steps += 1;
    }

    Ok(AnnealOutcome {
        before,
        after: scheduler.learning_rate(),
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(warmup: usize, total: usize) -> WarmupDecayScheduler {
        WarmupDecayScheduler::new(DecayShape::Linear, 1e-3, 0.0, warmup, total).unwrap()
    }

    #[test]
    fn linear_warmup_then_decay() {
        let mut scheduler = linear(10, 110);
        assert_eq!(scheduler.learning_rate(), 0.0);
        for _ in 0..5 {
            scheduler.step();
        }
        assert!((scheduler.learning_rate() - 5e-4).abs() < 1e-12);
        for _ in 0..5 {
            scheduler.step();
        }
        assert!((scheduler.learning_rate() - 1e-3).abs() < 1e-12);
        for _ in 0..50 {
            scheduler.step();
        }
        assert!((scheduler.learning_rate() - 5e-4).abs() < 1e-12);
        for _ in 0..100 {
            scheduler.step();
        }
        assert_eq!(scheduler.learning_rate(), 0.0);
    }

    #[test]
    fn cosine_and_polynomial_reach_min_lr() {
        for shape in [DecayShape::Cosine, DecayShape::Polynomial { power: 2.0 }] {
            let mut scheduler = WarmupDecayScheduler::new(shape, 1e-3, 1e-5, 0, 20).unwrap();
            assert!((scheduler.learning_rate() - 1e-3).abs() < 1e-12);
            let mut previous = scheduler.learning_rate();
            for _ in 0..20 {
                let lr = scheduler.step();
                assert!(lr <= previous);
                previous = lr;
            }
            assert!((scheduler.learning_rate() - 1e-5).abs() < 1e-12);
        }
    }

    #[test]
    fn warmup_skip_reaches_threshold() {
        let mut scheduler = WarmupDecayScheduler::new(DecayShape::Linear, 7e-4, 0.0, 16_000, 1_000_000)
            .unwrap();
        let steps = skip_negligible_warmup(&mut scheduler, 1_000_000).unwrap();
        assert_eq!(steps, 3);
        assert!(scheduler.learning_rate() >= MIN_INITIAL_LEARNING_RATE);
    }

    #[test]
    fn anneal_halves_decaying_rate() {
        let mut scheduler = linear(0, 100);
        for _ in 0..20 {
            scheduler.step();
        }
        let outcome = anneal(&mut scheduler, 2.0, 100).unwrap();
        assert!((outcome.before - 8e-4).abs() < 1e-12);
        assert!(outcome.after <= outcome.before / 2.0);
        assert!((40..=41).contains(&outcome.steps));
        assert_eq!(scheduler.steps_taken(), 20 + outcome.steps);
    }

    #[test]
    fn anneal_on_constant_schedule_is_a_configuration_error() {
        let mut scheduler =
            WarmupDecayScheduler::new(DecayShape::Constant, 1e-3, 0.0, 0, 100).unwrap();
        let err = anneal(&mut scheduler, 2.0, 1_000).unwrap_err();
        assert!(matches!(err, TrainingError::Configuration(_)));
        assert_eq!(scheduler.steps_taken(), 1_000);
    }

    #[test]
    fn state_round_trip_restores_position() {
        let mut scheduler = linear(10, 100);
        for _ in 0..42 {
            scheduler.step();
        }
        let state = scheduler.state();

        let mut restored = linear(10, 100);
        restored.load_state(&state).unwrap();
        assert_eq!(restored.steps_taken(), 42);
        assert_eq!(restored.learning_rate(), scheduler.learning_rate());
    }
}
