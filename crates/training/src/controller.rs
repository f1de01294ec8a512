//! Evaluation cadence, best-score snapshots, annealing and early stopping.
//!
//! [`ConvergenceState::record`] is the pure transition over one evaluation
//! tick. [`EvaluationController`] wraps it with the side effects of a tick
//! (decoding the dev sets, writing checkpoints, annealing the schedule,
//! synchronising workers) through the [`ControllerHost`] capability.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parallel_data::LanguagePair;

use crate::checkpoint::SnapshotKind;
use crate::config::EvaluationConfig;
use crate::distributed::SyncPort;
use crate::error::TrainingError;
use crate::scheduler::AnnealOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergencePolicy {
    pub early_stop_checkpoints: usize,
    pub additional_per_anneal: usize,
    pub max_annealing_attempts: usize,
}

impl ConvergencePolicy {
    pub fn from_config(cfg: &EvaluationConfig) -> Self {
        Self {
            early_stop_checkpoints: cfg.early_stop_checkpoints,
            additional_per_anneal: cfg.additional_early_stop_checkpoints_per_anneal,
            max_annealing_attempts: cfg.max_annealing_attempts,
        }
    }

    /// Ticks without a global improvement tolerated after `attempts` anneals.
    pub fn patience(&self, attempts: usize) -> usize {
        self.early_stop_checkpoints + attempts * self.additional_per_anneal
    }
}

/// Best score seen so far and the tick/step at which it was reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestScore {
    pub score: f64,
    pub tick: usize,
    pub step: usize,
}

impl Default for BestScore {
    fn default() -> Self {
        Self {
            score: 0.0,
            tick: 0,
            step: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Anneal,
    Converge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: usize,
    pub step: usize,
    pub global_score: f64,
    pub improved_pairs: Vec<LanguagePair>,
    pub global_improved: bool,
    pub ticks_since_improvement: usize,
    pub patience: usize,
    pub decision: Decision,
}

/// Score bookkeeping across evaluation ticks. Scores start at zero, so the
/// first positive score for a pair is always an improvement.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceState {
    tick: usize,
    best_global: BestScore,
    best_pairs: BTreeMap<String, BestScore>,
    annealing_attempts: usize,
    global_history: Vec<(usize, f64)>,
    pair_history: BTreeMap<String, Vec<(usize, f64)>>,
}

impl ConvergenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> usize {
        self.tick
    }

    pub fn annealing_attempts(&self) -> usize {
        self.annealing_attempts
    }

    pub fn best_global(&self) -> BestScore {
        self.best_global
    }

    pub fn best_for(&self, pair: &LanguagePair) -> Option<BestScore> {
        self.best_pairs.get(&pair.id()).copied()
    }

    /// `(step, score)` per tick, oldest first.
    pub fn global_history(&self) -> &[(usize, f64)] {
        &self.global_history
    }

    pub fn pair_history(&self) -> &BTreeMap<String, Vec<(usize, f64)>> {
        &self.pair_history
    }

    /// Folds one tick's per-pair scores into the state and decides what the
    /// run does next. An `Anneal` decision has already consumed an attempt.
    pub fn record(
        &mut self,
        step: usize,
        scores: &[(LanguagePair, f64)],
        policy: &ConvergencePolicy,
    ) -> Result<TickReport, TrainingError> {
        if scores.is_empty() {
            return Err(TrainingError::runtime(
                "an evaluation tick needs at least one dev pair score",
            ));
        }
        let tick = self.tick;

        let mut improved_pairs = Vec::new();
        for (pair, score) in scores {
            let id = pair.id();
            self.pair_history
                .entry(id.clone())
                .or_default()
                .push((step, *score));
            let best = self.best_pairs.entry(id).or_default();
            if *score > best.score {
                *best = BestScore {
                    score: *score,
                    tick,
                    step,
                };
                improved_pairs.push(pair.clone());
            }
        }

        let global_score = scores.iter().map(|(_, score)| score).sum::<f64>() / scores.len() as f64;
        self.global_history.push((step, global_score));
        let global_improved = global_score > self.best_global.score;
        if global_improved {
            self.best_global = BestScore {
                score: global_score,
                tick,
                step,
            };
        }

        let ticks_since_improvement = tick - self.best_global.tick;
        let patience = policy.patience(self.annealing_attempts);
        let decision = if ticks_since_improvement > patience {
            if self.annealing_attempts < policy.max_annealing_attempts {
                self.annealing_attempts += 1;
                Decision::Anneal
            } else {
                Decision::Converge
            }
        } else {
            Decision::Continue
        };

        self.tick += 1;
        Ok(TickReport {
            tick,
            step,
            global_score,
            improved_pairs,
            global_improved,
            ticks_since_improvement,
            patience,
            decision,
        })
    }
}

/// Side effects the controller needs from the training loop.
pub trait ControllerHost {
    /// Decodes every dev pair and returns one score per pair.
    fn evaluate(&mut self, step: usize) -> Result<Vec<(LanguagePair, f64)>, TrainingError>;
    fn write_snapshot(&mut self, kind: &SnapshotKind, step: usize) -> Result<(), TrainingError>;
    fn write_rolling(&mut self, step: usize) -> Result<(), TrainingError>;
    /// Restores model, optimizer and scheduler from the rolling record.
    fn reload_rolling(&mut self) -> Result<(), TrainingError>;
    fn anneal_learning_rate(&mut self, factor: f64, cap: usize)
        -> Result<AnnealOutcome, TrainingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Training,
    Evaluating,
    Annealing,
    Converged,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Training => "training",
            Phase::Evaluating => "evaluating",
            Phase::Annealing => "annealing",
            Phase::Converged => "converged",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Converged,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub evaluation_enabled: bool,
    pub every_n_steps: usize,
    pub policy: ConvergencePolicy,
    pub learning_rate_scaling: f64,
    pub anneal_step_cap: usize,
    pub save_every_n_steps_without_eval: usize,
    pub metric_name: &'static str,
}

impl ControllerSettings {
    pub fn from_config(
        cfg: &EvaluationConfig,
        total_steps: usize,
        metric_name: &'static str,
    ) -> Self {
        Self {
            evaluation_enabled: cfg.enabled,
            every_n_steps: cfg.every_n_steps.max(1),
            policy: ConvergencePolicy::from_config(cfg),
            learning_rate_scaling: cfg.learning_rate_scaling,
            anneal_step_cap: cfg.anneal_step_cap.unwrap_or(total_steps).max(1),
            save_every_n_steps_without_eval: cfg.save_every_n_steps_without_eval.max(1),
            metric_name,
        }
    }
}

pub struct EvaluationController {
    settings: ControllerSettings,
    state: ConvergenceState,
    sync: Arc<dyn SyncPort>,
    phase: Phase,
}

impl EvaluationController {
    pub fn new(settings: ControllerSettings, sync: Arc<dyn SyncPort>) -> Self {
        Self {
            settings,
            state: ConvergenceState::new(),
            sync,
            phase: Phase::Training,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &ConvergenceState {
        &self.state
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Step zero counts, so a run is scored before its first update.
    pub fn is_due(&self, step: usize) -> bool {
        step % self.settings.every_n_steps == 0
    }

    /// Runs one cadence tick. Every rank must call this at the same step.
    pub fn on_cadence(
        &mut self,
        step: usize,
        host: &mut dyn ControllerHost,
    ) -> Result<ControlFlow, TrainingError> {
        if self.phase == Phase::Converged {
            return Ok(ControlFlow::Converged);
        }

        let outcome = if self.sync.is_primary_rank() {
            Some(self.primary_tick(step, host))
        } else {
            None
        };

        // Secondary ranks must learn about a primary failure instead of
        // waiting at the next barrier.
        let failed = self
            .sync
            .broadcast_flag(matches!(outcome, Some(Err(_))))?;
        let converged = match outcome {
            Some(outcome) => outcome?,
            None if failed => {
                return Err(TrainingError::runtime(format!(
                    "primary rank failed during the evaluation tick at step {step}"
                )))
            }
            None => false,
        };

        let converged = self.sync.broadcast_flag(converged)?;
        self.sync.barrier()?;
        if self.sync.world_size() > 1 {
            host.reload_rolling()?;
        }

        if converged {
            self.phase = Phase::Converged;
            Ok(ControlFlow::Converged)
        } else {
            self.phase = Phase::Training;
            Ok(ControlFlow::Continue)
        }
    }

    /// Evaluation, snapshots and the rolling record; primary rank only.
    fn primary_tick(
        &mut self,
        step: usize,
        host: &mut dyn ControllerHost,
    ) -> Result<bool, TrainingError> {
        let mut converged = false;
        if self.settings.evaluation_enabled {
            converged = self.evaluate_and_decide(step, host)?;
        } else if step % self.settings.save_every_n_steps_without_eval == 0 {
            tracing::info!(step, "evaluation disabled; writing periodic snapshot");
            host.write_snapshot(&SnapshotKind::Periodic, step)?;
        }
        host.write_rolling(step)?;
        Ok(converged)
    }

    fn evaluate_and_decide(
        &mut self,
        step: usize,
        host: &mut dyn ControllerHost,
    ) -> Result<bool, TrainingError> {
        self.phase = Phase::Evaluating;
        let metric = self.settings.metric_name;
        let scores = host.evaluate(step)?;
        for (pair, score) in &scores {
            tracing::info!(step, pair = %pair, metric, score, "dev score");
        }

        let report = self.state.record(step, &scores, &self.settings.policy)?;
        tracing::info!(
            step,
            tick = report.tick,
            metric,
            global = report.global_score,
            best = self.state.best_global().score,
            ticks_since_improvement = report.ticks_since_improvement,
            patience = report.patience,
            "global dev score"
        );

        for pair in &report.improved_pairs {
            tracing::info!(step, pair = %pair, "new best for pair; saving snapshot");
            host.write_snapshot(&SnapshotKind::Pair(pair.clone()), step)?;
        }
        if report.global_improved {
            tracing::info!(step, "new global best; saving snapshot");
            host.write_snapshot(&SnapshotKind::Global, step)?;
        }

        match report.decision {
            Decision::Continue => Ok(false),
            Decision::Anneal => {
                self.phase = Phase::Annealing;
                let outcome = host.anneal_learning_rate(
                    self.settings.learning_rate_scaling,
                    self.settings.anneal_step_cap,
                )?;
                tracing::info!(
                    step,
                    attempt = self.state.annealing_attempts(),
                    lr_before = outcome.before,
                    lr_after = outcome.after,
                    scheduler_steps = outcome.steps,
                    "annealed learning rate"
                );
                Ok(false)
            }
            Decision::Converge => {
                self.report_convergence(report.patience);
                Ok(true)
            }
        }
    }

    fn report_convergence(&self, patience: usize) {
        let metric = self.settings.metric_name;
        let best = self.state.best_global();
        tracing::info!(
            metric,
            patience,
            best_score = best.score,
            best_step = best.step,
            "dev score stopped improving and annealing attempts are exhausted; converged"
        );
        tracing::info!(metric, history = ?self.state.global_history(), "global dev history");
        for (pair, history) in self.state.pair_history() {
            tracing::info!(metric, pair = %pair, history = ?history, "dev history");
        }
    }
}
