//! Self-distillation against a moving-average copy of the model.

use std::collections::HashMap;

use candle_core::{DType, Var};

use crate::{
    config::DistillationConfig,
    error::to_runtime_error,
    model::{ModelInputs, TaskModel},
    trainer::{reduce_loss, scalar_value, StepContext, StepOutput, TrainStep},
    TrainingError,
};

/// Warm-started decay: small early on so the teacher catches up quickly.
pub fn ema_decay(max_decay: f64, step: usize) -> f64 {
    let step = step as f64;
    max_decay.min((1.0 + step) / (10.0 + step))
}

/// `t -= (1 - decay) * (t - s)` for every teacher parameter with a student
/// parameter of the same name and shape. Returns how many were updated.
pub fn ema_update(
    teacher: &[(String, Var)],
    student: &[(String, Var)],
    decay: f64,
) -> Result<usize, TrainingError> {
    let by_name: HashMap<&str, &Var> = student
        .iter()
        .map(|(name, var)| (name.as_str(), var))
        .collect();

    let mut updated = 0;
    for (name, target) in teacher {
        let Some(source) = by_name.get(name.as_str()) else {
            log::warn!("teacher parameter '{name}' has no student counterpart");
            continue;
        };
        let t = target.as_tensor();
        let s = source.as_tensor();
        if t.dims() != s.dims() {
            log::warn!(
                "teacher parameter '{name}' shape {:?} differs from student {:?}",
                t.dims(),
                s.dims()
            );
            continue;
        }

        let dtype = t.dtype();
        let next = t
            .to_dtype(DType::F32)
            .and_then(|t32| {
                let s32 = s.to_dtype(DType::F32)?.detach();
                let diff = t32.sub(&s32)?.affine(1.0 - decay, 0.0)?;
                t32.sub(&diff)
            })
            .and_then(|next| next.to_dtype(dtype))
            .map_err(to_runtime_error)?;
        target.set(&next).map_err(to_runtime_error)?;
        updated += 1;
    }
    Ok(updated)
}

/// Training step adding `coeff * mse(student, teacher)` to the task loss and
/// moving the teacher towards the student after every optimizer update.
pub struct SelfDistillationStep<T: TaskModel> {
    teacher: T,
    config: DistillationConfig,
}

impl<T: TaskModel> SelfDistillationStep<T> {
    /// `teacher` should start as a copy of the student; it is switched to
    /// inference mode and only ever changed by the moving average.
    pub fn new(mut teacher: T, config: DistillationConfig) -> Self {
        teacher.set_training(false);
        Self { teacher, config }
    }

    pub fn teacher(&self) -> &T {
        &self.teacher
    }

    pub fn into_teacher(self) -> T {
        self.teacher
    }
}

impl<M: TaskModel, T: TaskModel> TrainStep<M> for SelfDistillationStep<T> {
    fn train_step(
        &mut self,
        model: &M,
        inputs: &ModelInputs,
        ctx: &StepContext,
    ) -> Result<StepOutput, TrainingError> {
        let output = model.forward(inputs).map_err(to_runtime_error)?;
        let loss = output.require_loss()?;
        let teacher_logits = self
            .teacher
            .forward(inputs)
            .map_err(to_runtime_error)?
            .logits
            .detach();

        let kd_loss = output
            .logits
            .sub(&teacher_logits)
            .and_then(|diff| diff.sqr())
            .and_then(|sq| sq.mean_all())
            .and_then(|mse| mse.affine(self.config.coeff, 0.0))
            .map_err(to_runtime_error)?;
        let total = loss.broadcast_add(&kd_loss).map_err(to_runtime_error)?;
        let loss = reduce_loss(&total, ctx)?;

        let grads = loss.backward().map_err(to_runtime_error)?;
        Ok(StepOutput {
            loss: scalar_value(&loss)?,
            grads,
        })
    }

    fn after_update(&mut self, model: &M, global_step: usize) -> Result<(), TrainingError> {
        let decay = ema_decay(self.config.decay, global_step);
        let updated = ema_update(
            &self.teacher.named_parameters(),
            &model.named_parameters(),
            decay,
        )?;
        log::debug!("ema step {global_step}: decay={decay:.5} parameters={updated}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::*;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn decay_warms_up_to_ceiling() {
        assert!((ema_decay(0.999, 0) - 0.1).abs() < 1e-12);
        assert!((ema_decay(0.999, 990) - 0.991).abs() < 1e-12);
        assert_eq!(ema_decay(0.999, 1_000_000), 0.999);
    }

    #[test]
    fn update_moves_teacher_towards_student() {
        let teacher = vec![
            ("w".to_string(), var(&[1.0, 1.0])),
            ("extra".to_string(), var(&[5.0])),
        ];
        let student = vec![("w".to_string(), var(&[3.0, -1.0]))];

        let updated = ema_update(&teacher, &student, 0.75).unwrap();
        assert_eq!(updated, 1);
        let w = teacher[0].1.as_tensor().to_vec1::<f32>().unwrap();
        assert!((w[0] - 1.5).abs() < 1e-6);
        assert!((w[1] - 0.5).abs() < 1e-6);
        assert_eq!(teacher[1].1.as_tensor().to_vec1::<f32>().unwrap(), vec![5.0]);
    }

    #[test]
    fn shape_mismatch_is_skipped() {
        let teacher = vec![("w".to_string(), var(&[1.0, 1.0]))];
        let student = vec![("w".to_string(), var(&[3.0]))];
        assert_eq!(ema_update(&teacher, &student, 0.5).unwrap(), 0);
    }
}
