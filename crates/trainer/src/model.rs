//! The seam between the harness and a concrete network.
//!
//! Architectures live elsewhere; the harness only needs a forward pass over
//! [`ModelInputs`], access to the word-embedding lookup (for adversarial
//! perturbation), the named trainable parameters, and a way to persist
//! weights.

use std::{collections::HashMap, fs, path::Path};

use candle_core::{Tensor, Var};

use crate::{
    data::{Batch, INPUT_KEYS},
    error::to_runtime_error,
    TrainingError,
};

pub const WEIGHTS_NAME: &str = "model.safetensors";
pub const CONFIG_NAME: &str = "config.json";

/// Keyword inputs of a forward pass. Exactly one of `input_ids` /
/// `inputs_embeds` is expected to be set.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    pub input_ids: Option<Tensor>,
    pub inputs_embeds: Option<Tensor>,
    pub attention_mask: Tensor,
    pub token_type_ids: Option<Tensor>,
    pub labels: Option<Tensor>,
    pub start_positions: Option<Tensor>,
    pub end_positions: Option<Tensor>,
}

impl ModelInputs {
    pub fn from_batch(batch: &Batch) -> Result<Self, TrainingError> {
        for key in batch.keys() {
            if !INPUT_KEYS.contains(&key) {
                log::debug!("ignoring batch feature '{key}'");
            }
        }
        let input_ids = batch.require("input_ids")?.clone();
        let attention_mask = match batch.get("attention_mask") {
            Some(mask) => mask.clone(),
            None => input_ids.ones_like().map_err(to_runtime_error)?,
        };
        Ok(Self {
            input_ids: Some(input_ids),
            inputs_embeds: None,
            attention_mask,
            token_type_ids: batch.get("token_type_ids").cloned(),
            labels: batch.get("labels").cloned(),
            start_positions: batch.get("start_positions").cloned(),
            end_positions: batch.get("end_positions").cloned(),
        })
    }

    /// Same inputs fed through precomputed embeddings instead of ids.
    pub fn with_embeddings(&self, embeds: Tensor) -> Self {
        Self {
            input_ids: None,
            inputs_embeds: Some(embeds),
            ..self.clone()
        }
    }

    pub fn has_targets(&self) -> bool {
        self.labels.is_some() || self.start_positions.is_some()
    }

    pub fn input_ids(&self) -> Result<&Tensor, TrainingError> {
        self.input_ids
            .as_ref()
            .ok_or_else(|| TrainingError::runtime("model inputs carry no input_ids"))
    }
}

/// `(loss, logits, ...)` when targets were supplied, `(logits, ...)` otherwise.
/// Span models put start logits in `logits` and end logits in `end_logits`.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub loss: Option<Tensor>,
    pub logits: Tensor,
    pub end_logits: Option<Tensor>,
}

impl ModelOutput {
    pub fn require_loss(&self) -> Result<&Tensor, TrainingError> {
        self.loss
            .as_ref()
            .ok_or_else(|| TrainingError::runtime("model returned no loss; batch has no targets"))
    }
}

/// Structured decoding over emission scores, e.g. a CRF layer.
pub trait TagDecoder {
    /// One tag sequence per batch row, honouring `mask`.
    fn decode(&self, emissions: &Tensor, mask: &Tensor) -> candle_core::Result<Vec<Vec<u32>>>;
}

/// Models that write their own artifacts.
pub trait SaveModel {
    fn save(&self, directory: &Path) -> Result<(), TrainingError>;
}

/// How a model persists itself into a checkpoint directory.
pub enum ModelSaveHook<'a> {
    Save(&'a dyn SaveModel),
    /// `model.safetensors`, plus `config.json` unless `config` is null.
    Pretrained {
        parameters: Vec<(String, Var)>,
        config: serde_json::Value,
    },
}

impl ModelSaveHook<'_> {
    pub fn write(&self, directory: &Path) -> Result<(), TrainingError> {
        match self {
            ModelSaveHook::Save(model) => model.save(directory),
            ModelSaveHook::Pretrained { parameters, config } => {
                save_named_parameters(parameters, &directory.join(WEIGHTS_NAME))?;
                if !config.is_null() {
                    let data = serde_json::to_vec_pretty(config).map_err(|err| {
                        TrainingError::runtime(format!("failed to serialize model config: {err}"))
                    })?;
                    fs::write(directory.join(CONFIG_NAME), data)?;
                }
                Ok(())
            }
        }
    }
}

pub trait TaskModel {
    fn forward(&self, inputs: &ModelInputs) -> candle_core::Result<ModelOutput>;

    /// Word-embedding lookup, shaped `(batch, seq, hidden)`.
    fn word_embeddings(&self, input_ids: &Tensor) -> candle_core::Result<Tensor>;

    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&mut self, _training: bool) {}

    fn tag_decoder(&self) -> Option<&dyn TagDecoder> {
        None
    }

    fn save_hook(&self) -> ModelSaveHook<'_> {
        ModelSaveHook::Pretrained {
            parameters: self.named_parameters(),
            config: serde_json::Value::Null,
        }
    }
}

pub fn save_named_parameters(
    parameters: &[(String, Var)],
    path: &Path,
) -> Result<(), TrainingError> {
    if parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, Tensor> = parameters
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

/// Loads safetensors weights into `parameters` by name. Missing and unused
/// names are both errors.
pub fn apply_model_weights(
    parameters: &[(String, Var)],
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let Some((_, first)) = parameters.first() else {
        return Err(TrainingError::runtime("model has no parameters to load"));
    };
    let device = first.as_tensor().device().clone();
    let tensors =
        candle_core::safetensors::load(weights_path, &device).map_err(to_runtime_error)?;
    let mut by_name: HashMap<String, Tensor> = tensors.into_iter().collect();

    for (name, var) in parameters {
        let tensor = by_name.remove(name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == dtype {
            tensor
        } else {
            tensor.to_dtype(dtype).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !by_name.is_empty() {
        let mut extra: Vec<_> = by_name.into_keys().collect();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}
