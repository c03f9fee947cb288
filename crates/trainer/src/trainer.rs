use std::collections::BTreeMap;

use candle_core::{backprop::GradStore, DType, Tensor};

use crate::{
    checkpoint::{self, CheckpointManager, TrainingState},
    config::SchedulerStepOn,
    data::{Batch, BlockingDataLoader, DataLoader},
    error::to_runtime_error,
    evaluation::{self, EvaluationResult, PredictionPolicy, EVAL_RESULTS_NAME},
    logging::TrainLogger,
    metrics::AverageMeter,
    model::{apply_model_weights, ModelInputs, TaskModel, WEIGHTS_NAME},
    optimizer::TrainerOptimizer,
    scheduler::{LRScheduler, WarmupScheduler},
    TrainingArgs, TrainingError,
};

/// Loss reduction settings shared by every step variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
    pub gradient_accumulation_steps: usize,
    pub replicas: usize,
}

impl StepContext {
    pub fn from_args(args: &TrainingArgs) -> Self {
        Self {
            gradient_accumulation_steps: args.train.gradient_accumulation_steps.max(1),
            replicas: args.train.replicas.max(1),
        }
    }
}

impl Default for StepContext {
    fn default() -> Self {
        Self {
            gradient_accumulation_steps: 1,
            replicas: 1,
        }
    }
}

/// Loss for logging plus the gradients it produced, not yet applied.
pub struct StepOutput {
    pub loss: f64,
    pub grads: GradStore,
}

/// One micro-batch worth of forward and backward work.
pub trait TrainStep<M: TaskModel> {
    fn train_step(
        &mut self,
        model: &M,
        inputs: &ModelInputs,
        ctx: &StepContext,
    ) -> Result<StepOutput, TrainingError>;

    /// Re-seeds any randomness the step draws on.
    fn reseed(&mut self, _seed: u64) {}

    /// Runs after each optimizer update.
    fn after_update(&mut self, _model: &M, _global_step: usize) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Plain supervised step: the model's own loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardStep;

impl<M: TaskModel> TrainStep<M> for StandardStep {
    fn train_step(
        &mut self,
        model: &M,
        inputs: &ModelInputs,
        ctx: &StepContext,
    ) -> Result<StepOutput, TrainingError> {
        let output = model.forward(inputs).map_err(to_runtime_error)?;
        let loss = reduce_loss(output.require_loss()?, ctx)?;
        let grads = loss.backward().map_err(to_runtime_error)?;
        Ok(StepOutput {
            loss: scalar_value(&loss)?,
            grads,
        })
    }
}

/// Averages per-replica losses and divides by the accumulation factor.
///
/// A non-scalar loss must hold exactly one value per replica.
pub fn reduce_loss(loss: &Tensor, ctx: &StepContext) -> Result<Tensor, TrainingError> {
    let mut loss = if loss.rank() > 0 {
        if loss.elem_count() != ctx.replicas {
            return Err(TrainingError::runtime(format!(
                "loss carries {} values for {} replicas",
                loss.elem_count(),
                ctx.replicas
            )));
        }
        loss.mean_all().map_err(to_runtime_error)?
    } else {
        loss.clone()
    };
    if ctx.gradient_accumulation_steps > 1 {
        loss = loss
            .affine(1.0 / ctx.gradient_accumulation_steps as f64, 0.0)
            .map_err(to_runtime_error)?;
    }
    Ok(loss)
}

pub fn scalar_value(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.mean_all())
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(to_runtime_error)?;
    Ok(value as f64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub global_step: usize,
    pub average_loss: f64,
}

/// Epoch/batch driver for one model and one step strategy.
pub struct Trainer<M, S>
where
    M: TaskModel,
    S: TrainStep<M>,
{
    args: TrainingArgs,
    model: M,
    step: S,
    policy: PredictionPolicy,
    logger: TrainLogger,
    global_step: usize,
    loss_meter: AverageMeter,
    last_eval: BTreeMap<String, f64>,
}

impl<M, S> Trainer<M, S>
where
    M: TaskModel,
    S: TrainStep<M>,
{
    pub fn new(
        args: TrainingArgs,
        model: M,
        mut step: S,
        policy: PredictionPolicy,
    ) -> Result<Self, TrainingError> {
        args.validate()?;
        std::fs::create_dir_all(&args.output_dir)?;
        let logger = TrainLogger::new(&args.logging)?;
        step.reseed(args.seed);

        Ok(Self {
            args,
            model,
            step,
            policy,
            logger,
            global_step: 0,
            loss_meter: AverageMeter::new(),
            last_eval: BTreeMap::new(),
        })
    }

    pub fn with_logger(mut self, logger: TrainLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn step_strategy(&self) -> &S {
        &self.step
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn logger(&self) -> &TrainLogger {
        &self.logger
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn train<L>(
        &mut self,
        train_loader: &mut BlockingDataLoader<L>,
    ) -> Result<TrainSummary, TrainingError>
    where
        L: DataLoader,
    {
        self.run::<L, L>(train_loader, None)
    }

    /// Trains, evaluating on `eval_loader` every `logging_steps` when
    /// `evaluate_during_training` is set.
    pub fn train_with_eval<L, E>(
        &mut self,
        train_loader: &mut BlockingDataLoader<L>,
        eval_loader: &mut BlockingDataLoader<E>,
    ) -> Result<TrainSummary, TrainingError>
    where
        L: DataLoader,
        E: DataLoader,
    {
        self.run(train_loader, Some(eval_loader))
    }

    fn run<L, E>(
        &mut self,
        train_loader: &mut BlockingDataLoader<L>,
        mut eval_loader: Option<&mut BlockingDataLoader<E>>,
    ) -> Result<TrainSummary, TrainingError>
    where
        L: DataLoader,
        E: DataLoader,
    {
        let accumulation = self.args.train.gradient_accumulation_steps.max(1);
        let max_steps = self.args.train.max_steps;
        let epochs = self.args.train.num_train_epochs;
        let total_steps = match (max_steps, train_loader.num_batches()) {
            (Some(steps), _) => steps,
            (None, Some(batches)) => batches.div_ceil(accumulation) * epochs,
            (None, None) => {
                return Err(TrainingError::initialization(
                    "train loader must report its length when max_steps is unset",
                ))
            }
        };

        let parameters = self.model.named_parameters();
        let parameter_tensors: Vec<Tensor> = parameters
            .iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();
        let mut optimizer = TrainerOptimizer::from_args(parameters, &self.args)?;
        let mut scheduler = WarmupScheduler::from_config(
            &self.args.scheduler,
            self.args.optimizer.learning_rate,
            total_steps,
        )?;
        optimizer.set_learning_rate(scheduler.learning_rate());

        let mut checkpoints = if self.args.checkpoint.save_steps > 0 {
            Some(CheckpointManager::from_args(&self.args)?)
        } else {
            None
        };
        let ctx = StepContext::from_args(&self.args);

        log::info!("***** Running training *****");
        if let Some(batches) = train_loader.num_batches() {
            log::info!("  Num batches = {batches}");
        }
        log::info!("  Num epochs = {epochs}");
        log::info!("  Gradient accumulation steps = {accumulation}");
        log::info!("  Total optimization steps = {total_steps}");

        self.model.set_training(true);
        self.loss_meter.reset();

        let mut epoch = 0;
        'epochs: loop {
            if max_steps.is_none() && epoch >= epochs {
                break;
            }
            train_loader.start_epoch(epoch)?;

            let mut accumulated: Option<GradStore> = None;
            let mut micro_batches = 0usize;
            let mut step_loss = 0.0;

            loop {
                let batch = train_loader.next_batch()?;
                let end_of_epoch = batch.is_none();
                if let Some(batch) = batch {
                    let StepOutput { loss, grads } = self.micro_step(&batch, &ctx)?;
                    step_loss += loss;
                    match accumulated.as_mut() {
                        Some(existing) => {
                            merge_gradient_store(&parameter_tensors, existing, grads)?
                        }
                        None => accumulated = Some(grads),
                    }
                    micro_batches += 1;
                    if micro_batches % accumulation != 0 {
                        continue;
                    }
                }
                // A trailing partial window is flushed as its own update.
                let Some(mut grads) = accumulated.take() else {
                    break;
                };
                if end_of_epoch {
                    log::debug!(
                        "flushing {} trailing micro-batches at end of epoch {epoch}",
                        micro_batches % accumulation
                    );
                }

                let grad_norm = optimizer.step(&mut grads)?;
                if self.args.scheduler.step_on == SchedulerStepOn::Batch {
                    optimizer.set_learning_rate(scheduler.step());
                }
                optimizer.zero_grad(&mut grads);
                self.global_step += 1;

                let global_step = self.global_step;
                self.loss_meter.update(step_loss, 1);
                self.logger.add_value("loss", step_loss, global_step);
                self.logger
                    .add_value("learning_rate", optimizer.learning_rate(), global_step);
                log::debug!(
                    "step {global_step}: loss={step_loss:.5} grad_norm={grad_norm:.4} lr={:.3e}",
                    optimizer.learning_rate()
                );
                step_loss = 0.0;

                self.step.after_update(&self.model, global_step)?;

                let logging_steps = self.args.logging.logging_steps;
                if logging_steps > 0
                    && global_step % logging_steps == 0
                    && self.args.logging.evaluate_during_training
                {
                    if let Some(loader) = eval_loader.as_deref_mut() {
                        let result = evaluation::evaluate(
                            &mut self.model,
                            loader,
                            &self.args,
                            self.policy,
                            "",
                            false,
                        )?;
                        self.logger.log_results("", &result.results, global_step);
                        self.last_eval = result.results;
                        self.model.set_training(true);
                    }
                }

                let save_steps = self.args.checkpoint.save_steps;
                if let Some(manager) = checkpoints.as_mut() {
                    if global_step % save_steps == 0 {
                        let current = self.monitored_value(manager.monitor());
                        let mut state = TrainingState::new(global_step)
                            .with_model(self.model.save_hook())
                            .with_optimizer(&optimizer)
                            .with_scheduler(&scheduler)
                            .with_args(&self.args);
                        manager.step(&mut state, current)?;
                    }
                }

                if max_steps.is_some_and(|limit| global_step >= limit) {
                    break 'epochs;
                }
                if end_of_epoch {
                    break;
                }
            }

            if self.args.scheduler.step_on == SchedulerStepOn::Epoch {
                optimizer.set_learning_rate(scheduler.step());
            }
            if micro_batches == 0 {
                log::warn!("train loader produced no batches in epoch {epoch}; stopping");
                break;
            }
            epoch += 1;
        }

        self.logger.flush();
        let history = self
            .args
            .output_dir
            .join(format!("{}_training_history.json", self.args.prefix()));
        self.logger.save(&history)?;

        Ok(TrainSummary {
            global_step: self.global_step,
            average_loss: self.loss_meter.average(),
        })
    }

    fn micro_step(
        &mut self,
        batch: &Batch,
        ctx: &StepContext,
    ) -> Result<StepOutput, TrainingError> {
        let inputs = ModelInputs::from_batch(batch)?;
        self.step.train_step(&self.model, &inputs, ctx)
    }

    /// Latest evaluation value for `monitor`, else the running training loss.
    fn monitored_value(&self, monitor: &str) -> f64 {
        match self.last_eval.get(monitor) {
            Some(value) => *value,
            None => {
                if monitor != "loss" {
                    log::debug!("'{monitor}' not evaluated yet; monitoring training loss");
                }
                self.loss_meter.average()
            }
        }
    }

    /// Evaluates and writes the decoded predictions next to the results.
    pub fn evaluate<E>(
        &mut self,
        loader: &mut BlockingDataLoader<E>,
        tag: &str,
    ) -> Result<EvaluationResult, TrainingError>
    where
        E: DataLoader,
    {
        evaluation::evaluate(&mut self.model, loader, &self.args, self.policy, tag, true)
    }

    pub fn predict<E>(
        &mut self,
        loader: &mut BlockingDataLoader<E>,
        tag: &str,
    ) -> Result<Vec<serde_json::Value>, TrainingError>
    where
        E: DataLoader,
    {
        evaluation::predict(&mut self.model, loader, &self.args, self.policy, tag)
    }

    /// Evaluates the checkpoints picked by `checkpoint_number` /
    /// `eval_all_checkpoints` and writes every result to `eval_results.txt`,
    /// keys prefixed with the checkpoint step.
    pub fn evaluate_checkpoints<E>(
        &mut self,
        loader: &mut BlockingDataLoader<E>,
    ) -> Result<BTreeMap<String, f64>, TrainingError>
    where
        E: DataLoader,
    {
        let selected = checkpoint::select_checkpoints(
            &self.args.output_dir,
            self.args.checkpoint.checkpoint_number,
            self.args.checkpoint.eval_all_checkpoints,
        )?;

        let mut results = BTreeMap::new();
        for directory in selected {
            self.load_weights_from(&directory)?;
            let step = checkpoint::checkpoint_step(&directory);
            let tag = step.map(|step| step.to_string()).unwrap_or_default();
            let result = self.evaluate(loader, &tag)?;
            for (key, value) in result.results {
                let key = match step {
                    Some(step) => format!("{step}_{key}"),
                    None => key,
                };
                results.insert(key, value);
            }
        }

        evaluation::write_results_text(&self.args.output_dir.join(EVAL_RESULTS_NAME), &results)?;
        Ok(results)
    }

    /// Predicts with the checkpoint named by `checkpoint_number`.
    pub fn predict_checkpoint<E>(
        &mut self,
        loader: &mut BlockingDataLoader<E>,
    ) -> Result<Vec<serde_json::Value>, TrainingError>
    where
        E: DataLoader,
    {
        let number = self.args.checkpoint.checkpoint_number;
        let directory = checkpoint::select_for_prediction(&self.args.output_dir, number)?;
        self.load_weights_from(&directory)?;
        self.predict(loader, &number.to_string())
    }

    fn load_weights_from(&mut self, directory: &std::path::Path) -> Result<(), TrainingError> {
        let weights = if directory.join(checkpoint::MANIFEST_FILENAME).is_file() {
            checkpoint::load_checkpoint(directory)?.model_weights_path
        } else {
            let path = directory.join(WEIGHTS_NAME);
            path.is_file().then_some(path)
        };
        match weights {
            Some(path) => {
                log::info!("Loading model weights from {}", path.display());
                apply_model_weights(&self.model.named_parameters(), &path)
            }
            None => {
                log::info!(
                    "no weights under {}; using the in-memory model",
                    directory.display()
                );
                Ok(())
            }
        }
    }
}

/// Adds `new_grads` into `accum` for every tracked parameter.
fn merge_gradient_store(
    parameters: &[Tensor],
    accum: &mut GradStore,
    mut new_grads: GradStore,
) -> Result<(), TrainingError> {
    for tensor in parameters {
        if let Some(grad) = new_grads.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn loss_is_averaged_then_divided() {
        let per_replica = Tensor::new(&[1.0f32, 3.0], &Device::Cpu).unwrap();
        let ctx = StepContext {
            gradient_accumulation_steps: 4,
            replicas: 2,
        };
        let reduced = reduce_loss(&per_replica, &ctx).unwrap();
        assert_eq!(reduced.rank(), 0);
        assert!((scalar_value(&reduced).unwrap() - 0.5).abs() < 1e-7);

        let scalar = Tensor::new(2.0f32, &Device::Cpu).unwrap();
        let same = reduce_loss(&scalar, &StepContext::default()).unwrap();
        assert_eq!(scalar_value(&same).unwrap(), 2.0);
    }

    #[test]
    fn loss_must_match_replica_count() {
        let per_replica = Tensor::new(&[1.0f32, 3.0], &Device::Cpu).unwrap();
        let ctx = StepContext {
            gradient_accumulation_steps: 1,
            replicas: 3,
        };
        assert!(reduce_loss(&per_replica, &ctx).is_err());
        assert!(reduce_loss(&per_replica, &StepContext::default()).is_err());

        let single = Tensor::new(&[4.0f32], &Device::Cpu).unwrap();
        let reduced = reduce_loss(&single, &StepContext::default()).unwrap();
        assert_eq!(scalar_value(&reduced).unwrap(), 4.0);
    }

    #[test]
    fn gradient_stores_are_summed() {
        let w = candle_core::Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        let first = w.as_tensor().sum_all().unwrap().backward().unwrap();
        let second = w.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        let mut accum = first;
        merge_gradient_store(&[w.as_tensor().clone()], &mut accum, second).unwrap();
        let merged = accum.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(merged, vec![3.0, 5.0]);
    }
}
