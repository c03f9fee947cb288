use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{
    config::{self, LearningRateSchedule},
    TrainingError,
};

pub trait LRScheduler: Send {
    /// Advances one step and returns the learning rate now in effect.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn state(&self) -> SchedulerState;
    fn load_state(&mut self, state: SchedulerState) -> Result<(), TrainingError>;
}

/// Serialized form written to `scheduler.pt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerState {
    pub strategy: LearningRateSchedule,
    pub base_lr: f64,
    pub min_lr: f64,
    pub total_steps: usize,
    pub warmup_steps: usize,
    pub step: usize,
}

/// Linear warm-up from zero over `warmup_steps`, then the chosen decay
/// towards `min_lr` at `total_steps`.
#[derive(Debug, Clone)]
pub struct WarmupScheduler {
    strategy: LearningRateSchedule,
    base_lr: f64,
    min_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    step: usize,
}

impl WarmupScheduler {
    pub fn new(
        strategy: LearningRateSchedule,
        base_lr: f64,
        min_lr: f64,
        total_steps: usize,
        warmup_proportion: f64,
    ) -> Result<Self, TrainingError> {
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
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
        Ok(Self {
            strategy,
            base_lr,
            min_lr,
            total_steps,
            warmup_steps: compute_warmup_steps(total_steps, warmup_proportion),
            step: 0,
        })
    }

    pub fn from_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        Self::new(
            cfg.strategy,
            base_lr,
            cfg.min_lr,
            total_steps,
            cfg.warmup_proportion,
        )
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    fn compute_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }
        if self.total_steps <= self.warmup_steps {
            return self.base_lr;
        }

        let progress = (step - self.warmup_steps) as f64
            / (self.total_steps - self.warmup_steps) as f64;
        let progress = progress.clamp(0.0, 1.0);
        let factor = match self.strategy {
            LearningRateSchedule::Constant => return self.base_lr,
            LearningRateSchedule::Linear => 1.0 - progress,
            LearningRateSchedule::Cosine => 0.5 * (1.0 + f64::cos(PI * progress)),
        };
        self.min_lr + (self.base_lr - self.min_lr) * factor
    }
}

impl LRScheduler for WarmupScheduler {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.compute_lr(self.step)
    }

    fn learning_rate(&self) -> f64 {
        self.compute_lr(self.step)
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            strategy: self.strategy,
            base_lr: self.base_lr,
            min_lr: self.min_lr,
            total_steps: self.total_steps,
            warmup_steps: self.warmup_steps,
            step: self.step,
        }
    }

    fn load_state(&mut self, state: SchedulerState) -> Result<(), TrainingError> {
        if state.total_steps == 0 || state.warmup_steps > state.total_steps {
            return Err(TrainingError::runtime(format!(
                "scheduler state is inconsistent: warmup {} of {} total steps",
                state.warmup_steps, state.total_steps
            )));
        }
        self.strategy = state.strategy;
        self.base_lr = state.base_lr;
        self.min_lr = state.min_lr;
        self.total_steps = state.total_steps;
        self.warmup_steps = state.warmup_steps;
        self.step = state.step;
        Ok(())
    }
}

fn compute_warmup_steps(total_steps: usize, proportion: f64) -> usize {
    let clamped = proportion.clamp(0.0, 1.0);
    let steps = (clamped * total_steps as f64).round() as usize;
    steps.min(total_steps)
}
