use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{adversarial::NormType, checkpoint::MonitorMode, metrics::Markup, TrainingError};

/// Everything a training run needs besides the model and the data.
///
/// Loaded from TOML or JSON; a serialized copy lands in every checkpoint as
/// `training_args.bin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    #[serde(default = "default_task_name")]
    pub task_name: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub adversarial: AdversarialConfig,
    #[serde(default)]
    pub distillation: DistillationConfig,
    #[serde(default)]
    pub labels: LabelConfig,
}

impl TrainingArgs {
    /// Minimal arguments rooted at `output_dir`, everything else defaulted.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            task_name: default_task_name(),
            model_name: None,
            seed: default_seed(),
            train: TrainConfig::default(),
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
            checkpoint: CheckpointConfig::default(),
            adversarial: AdversarialConfig::default(),
            distillation: DistillationConfig::default(),
            labels: LabelConfig::default(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut args: TrainingArgs = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        args.apply_base_path(base_dir);
        args.validate()?;

        Ok(args)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.output_dir.as_os_str().is_empty() {
            errors.push("output_dir must not be empty".to_string());
        }

        if self.train.num_train_epochs == 0 && self.train.max_steps.is_none() {
            errors.push("train.num_train_epochs must be greater than 0".to_string());
        }
        if let Some(0) = self.train.max_steps {
            errors.push("train.max_steps must be greater than 0".to_string());
        }
        if self.train.gradient_accumulation_steps == 0 {
            errors.push("train.gradient_accumulation_steps must be greater than 0".to_string());
        }
        if self.train.replicas == 0 {
            errors.push("train.replicas must be greater than 0".to_string());
        }
        if let Some(norm) = self.train.max_grad_norm {
            if norm <= 0.0 {
                errors.push("train.max_grad_norm must be greater than 0".to_string());
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

        if !(0.0..=1.0).contains(&self.scheduler.warmup_proportion) {
            errors.push("scheduler.warmup_proportion must be in [0, 1]".to_string());
        }
        if self.scheduler.min_lr < 0.0 || self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr must be in [0, optimizer.learning_rate]".to_string());
        }

        if self.checkpoint.monitor.trim().is_empty() {
            errors.push("checkpoint.monitor must not be empty".to_string());
        }

        if self.adversarial.k == 0 {
            errors.push("adversarial.k must be greater than 0".to_string());
        }
        if self.adversarial.gamma <= 0.0 {
            errors.push("adversarial.gamma must be greater than 0".to_string());
        }
        if self.adversarial.var < 0.0 {
            errors.push("adversarial.var must be >= 0".to_string());
        }

        if !(0.0..1.0).contains(&self.distillation.decay) {
            errors.push("distillation.decay must be in [0, 1)".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// File-name prefix shared by every artifact of the run, `<model>_<task>`.
    pub fn prefix(&self) -> String {
        match self.model_name.as_deref() {
            Some(model) if !model.is_empty() => format!("{}_{}", model, self.task_name),
            _ => self.task_name.clone(),
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.output_dir, base);
        if let Some(dir) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: usize,
    /// Overrides `num_train_epochs` when set.
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,
    /// Data-parallel replicas producing one loss each.
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_train_epochs: default_num_train_epochs(),
            max_steps: None,
            gradient_accumulation_steps: default_gradient_accumulation_steps(),
            max_grad_norm: default_max_grad_norm(),
            replicas: default_replicas(),
            shuffle: true,
        }
    }
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
    /// Parameter-name fragments that skip weight decay.
    #[serde(default = "default_no_decay")]
    pub no_decay: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            no_decay: default_no_decay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default = "default_warmup_proportion")]
    pub warmup_proportion: f64,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default)]
    pub step_on: SchedulerStepOn,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            warmup_proportion: default_warmup_proportion(),
            min_lr: 0.0,
            step_on: SchedulerStepOn::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant,
    #[default]
    Linear,
    Cosine,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStepOn {
    #[default]
    Batch,
    Epoch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Evaluate (and log) every n optimizer steps; 0 disables.
    #[serde(default)]
    pub logging_steps: usize,
    #[serde(default)]
    pub evaluate_during_training: bool,
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logging_steps: 0,
            evaluate_during_training: false,
            enable_stdout: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_flush_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Save every n optimizer steps; 0 disables.
    #[serde(default)]
    pub save_steps: usize,
    #[serde(default = "default_monitor")]
    pub monitor: String,
    #[serde(default)]
    pub mode: MonitorMode,
    #[serde(default)]
    pub save_best_only: bool,
    /// Step of the checkpoint to evaluate or predict with; 0 means none.
    #[serde(default)]
    pub checkpoint_number: usize,
    #[serde(default)]
    pub eval_all_checkpoints: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_steps: 0,
            monitor: default_monitor(),
            mode: MonitorMode::default(),
            save_best_only: false,
            checkpoint_number: 0,
            eval_all_checkpoints: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdversarialConfig {
    #[serde(default = "default_adv_lr")]
    pub lr: f64,
    /// Perturbation iterations per step.
    #[serde(default = "default_adv_k")]
    pub k: usize,
    #[serde(default = "default_adv_alpha")]
    pub alpha: f64,
    /// Scale of the initial gaussian perturbation.
    #[serde(default = "default_adv_var")]
    pub var: f64,
    /// Added to projection denominators.
    #[serde(default = "default_adv_gamma")]
    pub gamma: f64,
    #[serde(default)]
    pub norm_type: NormType,
}

impl Default for AdversarialConfig {
    fn default() -> Self {
        Self {
            lr: default_adv_lr(),
            k: default_adv_k(),
            alpha: default_adv_alpha(),
            var: default_adv_var(),
            gamma: default_adv_gamma(),
            norm_type: NormType::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationConfig {
    /// Upper bound of the moving-average decay.
    #[serde(default = "default_kd_decay")]
    pub decay: f64,
    #[serde(default = "default_kd_coeff")]
    pub coeff: f64,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            decay: default_kd_decay(),
            coeff: default_kd_coeff(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Label names indexed by label id.
    #[serde(default)]
    pub id2label: Vec<String>,
    #[serde(default)]
    pub markup: Markup,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_task_name() -> String {
    "task".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

fn default_num_train_epochs() -> usize {
    3
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_max_grad_norm() -> Option<f64> {
    Some(1.0)
}

fn default_replicas() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    5e-5
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_no_decay() -> Vec<String> {
    vec!["bias".to_string(), "LayerNorm.weight".to_string()]
}

fn default_warmup_proportion() -> f64 {
    0.1
}

fn default_flush_every() -> usize {
    1
}

fn default_monitor() -> String {
    "eval_loss".to_string()
}

fn default_adv_lr() -> f64 {
    1e-3
}

fn default_adv_k() -> usize {
    1
}

fn default_adv_alpha() -> f64 {
    1.0
}

fn default_adv_var() -> f64 {
    1e-5
}

fn default_adv_gamma() -> f64 {
    1e-6
}

fn default_kd_decay() -> f64 {
    0.999
}

fn default_kd_coeff() -> f64 {
    1.0
}
