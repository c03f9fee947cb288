pub mod adversarial;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distill;
pub mod error;
pub mod evaluation;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use adversarial::{AdversarialStep, NormType};
pub use checkpoint::{
    load_checkpoint, save_checkpoint, BestMetricTracker, CheckpointManager, LoadedCheckpoint,
    MonitorMode, TrainingState,
};
pub use config::TrainingArgs;
pub use data::{Batch, BlockingDataLoader, DataLoader, InMemoryDataLoader};
pub use distill::SelfDistillationStep;
pub use error::TrainingError;
pub use evaluation::{EvaluationRecord, EvaluationResult, PredictionPolicy};
pub use logging::TrainLogger;
pub use metrics::AverageMeter;
pub use model::{ModelInputs, ModelOutput, ModelSaveHook, TaskModel};
pub use optimizer::{OptimizerState, TrainerOptimizer};
pub use scheduler::{LRScheduler, SchedulerState, WarmupScheduler};
pub use trainer::{StandardStep, StepContext, StepOutput, TrainStep, Trainer};
