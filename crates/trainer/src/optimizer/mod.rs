use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

/// Hyper-parameters of decoupled-weight-decay Adam.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

/// AdamW over a model's named parameters.
///
/// Parameters whose name contains one of the `no_decay` fragments form the
/// zero-decay group. Moments are kept in f32 regardless of parameter dtype.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        no_decay: &[String],
        clip_global_norm: Option<f64>,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "AdamW needs at least one trainable parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "parameter '{name}' is not floating point"
                )));
            }
            let first_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())
                .map_err(to_runtime_error)?;
            let second_moment = first_moment.zeros_like().map_err(to_runtime_error)?;
            let apply_weight_decay = !no_decay
                .iter()
                .any(|fragment| !fragment.is_empty() && name.contains(fragment.as_str()));

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        log::debug!(
            "optimizer built over {} parameters ({} without weight decay)",
            params.len(),
            params.iter().filter(|slot| !slot.apply_weight_decay).count()
        );

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm,
        })
    }

    pub fn from_args(
        named_parameters: Vec<(String, Var)>,
        args: &config::TrainingArgs,
    ) -> Result<Self, TrainingError> {
        Self::new(
            named_parameters,
            AdamWConfig::from(&args.optimizer),
            &args.optimizer.no_decay,
            args.train.max_grad_norm,
        )
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn decays(&self, name: &str) -> Option<bool> {
        self.params
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.apply_weight_decay)
    }

    /// Applies one update from the gradients in `grads`, consuming them.
    ///
    /// Returns the global gradient norm measured before clipping.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<f64, TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm_sq = grad
                .sqr()
                .and_then(|sq| sq.sum_all())
                .and_then(|sum| sum.to_vec0::<f32>())
                .map_err(to_runtime_error)? as f64;
            processed.push((index, grad, norm_sq));
        }

        if processed.is_empty() {
            return Ok(0.0);
        }

        let total_norm = processed
            .iter()
            .map(|(_, _, norm_sq)| norm_sq)
            .sum::<f64>()
            .sqrt();
        if let Some(max_norm) = self.clip_global_norm {
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for (_, grad, _) in &mut processed {
                    *grad = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
            }
        }

        self.step += 1;
        let cfg = self.config;
        let scale_m = 1.0 / (1.0 - cfg.beta1.powi(self.step as i32)).max(EPS);
        let scale_v = 1.0 / (1.0 - cfg.beta2.powi(self.step as i32)).max(EPS);

        for (index, grad, _) in processed {
            let slot = &mut self.params[index];

            let grad_term = grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?;
            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m.add(&grad_term))
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad
                .sqr()
                .and_then(|sq| sq.affine(1.0 - cfg.beta2, 0.0))
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v.add(&grad_sq_term))
                .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = new_m
                .affine(scale_m, 0.0)
                .and_then(|m| m.div(&denom))
                .and_then(|m| m.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let dtype = slot.param.as_tensor().dtype();
            let mut base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base = base
                    .affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?;
            }
            let next = base
                .sub(&update)
                .and_then(|next| next.to_dtype(dtype))
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(total_norm)
    }

    /// Drops any gradient still held for the optimizer's parameters.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                first_moment: flatten(&slot.first_moment)?,
                second_moment: flatten(&slot.second_moment)?,
            });
        }
        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("no saved moments for '{}'", slot.name))
            })?;
            let dims = slot.param.as_tensor().dims().to_vec();
            if dims != saved.shape {
                return Err(TrainingError::runtime(format!(
                    "saved moments for '{}' have shape {:?}, expected {:?}",
                    slot.name, saved.shape, dims
                )));
            }
            let device = slot.param.as_tensor().device();
            slot.first_moment = Tensor::from_vec(saved.first_moment, dims.as_slice(), device)
                .map_err(to_runtime_error)?;
            slot.second_moment = Tensor::from_vec(saved.second_moment, dims.as_slice(), device)
                .map_err(to_runtime_error)?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "saved moments name parameters the model does not have",
            ));
        }

        self.step = state.step;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }
}

fn flatten(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    tensor
        .flatten_all()
        .and_then(|flat| flat.to_vec1::<f32>())
        .map_err(to_runtime_error)
}

/// Serialized form written to `optimizer.pt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    fn config(weight_decay: f64) -> AdamWConfig {
        AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
        }
    }

    #[test]
    fn first_step_moves_against_gradient_sign() {
        let weight = var(&[1.0, -1.0]);
        let mut optimizer = TrainerOptimizer::new(
            vec![("dense.weight".into(), weight.clone())],
            config(0.0),
            &[],
            None,
        )
        .unwrap();

        let loss = weight.as_tensor().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        // Bias-corrected first Adam step is lr * sign(grad).
        let values = weight.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.9).abs() < 1e-4);
        assert!((values[1] + 1.1).abs() < 1e-4);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn no_decay_group_by_name() {
        let exclusions = vec!["bias".to_string(), "LayerNorm.weight".to_string()];
        let optimizer = TrainerOptimizer::new(
            vec![
                ("encoder.dense.weight".into(), var(&[1.0])),
                ("encoder.dense.bias".into(), var(&[1.0])),
                ("encoder.LayerNorm.weight".into(), var(&[1.0])),
            ],
            config(0.01),
            &exclusions,
            None,
        )
        .unwrap();

        assert_eq!(optimizer.decays("encoder.dense.weight"), Some(true));
        assert_eq!(optimizer.decays("encoder.dense.bias"), Some(false));
        assert_eq!(optimizer.decays("encoder.LayerNorm.weight"), Some(false));
    }

    #[test]
    fn state_restores_moments() {
        let weight = var(&[0.5, 0.25]);
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), weight.clone())],
            config(0.0),
            &[],
            Some(1.0),
        )
        .unwrap();
        let mut grads = weight.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        let state = optimizer.state().unwrap();

        let mut restored =
            TrainerOptimizer::new(vec![("w".into(), var(&[0.0, 0.0]))], config(0.0), &[], None)
                .unwrap();
        restored.load_state(state.clone()).unwrap();
        assert_eq!(restored.state().unwrap(), state);

        let mut wrong =
            TrainerOptimizer::new(vec![("v".into(), var(&[0.0, 0.0]))], config(0.0), &[], None)
                .unwrap();
        assert!(wrong.load_state(state).is_err());
    }
}
