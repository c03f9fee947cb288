//! Virtual adversarial training on the word-embedding space.
//!
//! A small random perturbation is pushed along the gradient of the
//! divergence between perturbed and clean predictions, and a symmetric KL
//! between the two is added to the task loss.

use std::str::FromStr;

use candle_core::{Tensor, Var, D};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::{
    config::AdversarialConfig,
    error::to_runtime_error,
    model::{ModelInputs, TaskModel},
    trainer::{reduce_loss, scalar_value, StepContext, StepOutput, TrainStep},
    TrainingError,
};

/// How a perturbation gradient is turned into a direction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NormType {
    /// Divide by the largest magnitude along the hidden dimension.
    #[default]
    Inf,
    L2,
    /// Element-wise sign.
    L1,
}

impl FromStr for NormType {
    type Err = TrainingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inf" => Ok(Self::Inf),
            "l2" => Ok(Self::L2),
            "l1" => Ok(Self::L1),
            other => Err(TrainingError::validation(vec![format!(
                "norm type must be one of inf, l2, l1; got '{other}'"
            )])),
        }
    }
}

/// Normalises `grad` along its last dimension. `eps` keeps zero rows finite.
pub fn project(grad: &Tensor, norm_type: NormType, eps: f64) -> candle_core::Result<Tensor> {
    match norm_type {
        NormType::L2 => {
            let norm = grad
                .sqr()?
                .sum_keepdim(D::Minus1)?
                .sqrt()?
                .affine(1.0, eps)?;
            grad.broadcast_div(&norm)
        }
        NormType::L1 => {
            let zeros = grad.zeros_like()?;
            let positive = grad.gt(&zeros)?.to_dtype(grad.dtype())?;
            let negative = grad.lt(&zeros)?.to_dtype(grad.dtype())?;
            positive.sub(&negative)
        }
        NormType::Inf => {
            let max = grad.abs()?.max_keepdim(D::Minus1)?.affine(1.0, eps)?;
            grad.broadcast_div(&max)
        }
    }
}

/// `KL(softmax(target) || softmax(input))` summed over every element.
pub fn kl_divergence(input: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    let log_p = candle_nn::ops::log_softmax(input, D::Minus1)?;
    let log_q = candle_nn::ops::log_softmax(target, D::Minus1)?;
    let q = candle_nn::ops::softmax_last_dim(target)?;
    q.mul(&log_q.sub(&log_p)?)?.sum_all()
}

/// Training step adding the adversarial regulariser to the task loss.
#[derive(Debug, Clone)]
pub struct AdversarialStep {
    config: AdversarialConfig,
    rng: StdRng,
}

impl AdversarialStep {
    pub fn new(config: AdversarialConfig) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &AdversarialConfig {
        &self.config
    }

    /// Gaussian noise scaled by `var`, zero wherever `mask` is zero.
    fn initial_delta(&mut self, embeds: &Tensor, mask: &Tensor) -> candle_core::Result<Var> {
        let noise: Vec<f32> = (0..embeds.elem_count())
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        let noise = Tensor::from_vec(noise, embeds.dims(), embeds.device())?
            .to_dtype(embeds.dtype())?
            .affine(self.config.var, 0.0)?
            .broadcast_mul(mask)?;
        Var::from_tensor(&noise)
    }
}

impl<M: TaskModel> TrainStep<M> for AdversarialStep {
    fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    fn train_step(
        &mut self,
        model: &M,
        inputs: &ModelInputs,
        ctx: &StepContext,
    ) -> Result<StepOutput, TrainingError> {
        let output = model.forward(inputs).map_err(to_runtime_error)?;
        let mut loss = output.require_loss()?.clone();
        let logits = output.logits;
        let clean = logits.detach();

        let input_ids = inputs.input_ids()?;
        let mut embeds_init = model.word_embeddings(input_ids).map_err(to_runtime_error)?;
        let mask = inputs
            .attention_mask
            .to_dtype(embeds_init.dtype())
            .and_then(|mask| mask.unsqueeze(2))
            .map_err(to_runtime_error)?;
        let delta = self
            .initial_delta(&embeds_init, &mask)
            .map_err(to_runtime_error)?;

        for _ in 0..self.config.k {
            let perturbed = embeds_init
                .add(delta.as_tensor())
                .map_err(to_runtime_error)?;
            let adv_logits = model
                .forward(&inputs.with_embeddings(perturbed))
                .map_err(to_runtime_error)?
                .logits;
            let adv_loss = kl_divergence(&adv_logits, &clean).map_err(to_runtime_error)?;
            let delta_grads = adv_loss.backward().map_err(to_runtime_error)?;
            let delta_grad = delta_grads
                .get(delta.as_tensor())
                .ok_or_else(|| {
                    TrainingError::runtime(
                        "model forward ignored inputs_embeds; no perturbation gradient",
                    )
                })?
                .detach();
            let direction = project(&delta_grad, self.config.norm_type, self.config.gamma)
                .and_then(|dir| dir.affine(self.config.lr, 0.0))
                .map_err(to_runtime_error)?;

            let adv_embeds = embeds_init.add(&direction).map_err(to_runtime_error)?;
            let adv_logits = model
                .forward(&inputs.with_embeddings(adv_embeds))
                .map_err(to_runtime_error)?
                .logits;
            let forward_kl = kl_divergence(&adv_logits, &clean).map_err(to_runtime_error)?;
            let backward_kl =
                kl_divergence(&logits, &adv_logits.detach()).map_err(to_runtime_error)?;
            let adv_loss = forward_kl
                .add(&backward_kl)
                .and_then(|sum| sum.affine(self.config.alpha, 0.0))
                .map_err(to_runtime_error)?;

            let total = loss.add(&adv_loss).map_err(to_runtime_error)?;
            loss = reduce_loss(&total, ctx)?;
            embeds_init = model.word_embeddings(input_ids).map_err(to_runtime_error)?;
        }

        let grads = loss.backward().map_err(to_runtime_error)?;
        Ok(StepOutput {
            loss: scalar_value(&loss)?,
            grads,
        })
    }
}
