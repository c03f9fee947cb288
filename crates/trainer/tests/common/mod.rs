#![allow(dead_code)]

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use task_trainer::{
    model::{ModelInputs, ModelOutput, SaveModel, TagDecoder},
    Batch, TaskModel, TrainingError,
};

pub const VOCAB: usize = 8;
pub const HIDDEN: usize = 4;

fn sorted_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap.data().lock().expect("varmap lock");
    let mut vars: Vec<_> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

fn embed(embedding: &Embedding, inputs: &ModelInputs) -> candle_core::Result<Tensor> {
    match (&inputs.inputs_embeds, &inputs.input_ids) {
        (Some(embeds), _) => Ok(embeds.clone()),
        (None, Some(ids)) => embedding.forward(ids),
        (None, None) => candle_core::bail!("either input_ids or inputs_embeds is required"),
    }
}

/// Copies every parameter of `source` into the same-named parameter of `target`.
pub fn copy_weights(target: &impl TaskModel, source: &impl TaskModel) {
    let source = source.named_parameters();
    for (name, var) in target.named_parameters() {
        let (_, src) = source
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .expect("matching parameter");
        var.set(src.as_tensor()).expect("copy parameter");
    }
}

/// Mean-pooled embeddings followed by a linear head.
pub struct ToyClassifier {
    varmap: VarMap,
    embedding: Embedding,
    head: Linear,
    pub training: bool,
}

impl ToyClassifier {
    pub fn new(num_labels: usize) -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embedding = candle_nn::embedding(VOCAB, HIDDEN, vb.pp("embeddings.word_embeddings"))
            .expect("embedding");
        let head = candle_nn::linear(HIDDEN, num_labels, vb.pp("classifier")).expect("linear");
        Self {
            varmap,
            embedding,
            head,
            training: false,
        }
    }
}

impl TaskModel for ToyClassifier {
    fn forward(&self, inputs: &ModelInputs) -> candle_core::Result<ModelOutput> {
        let embeds = embed(&self.embedding, inputs)?;
        let mask = inputs
            .attention_mask
            .to_dtype(DType::F32)?
            .unsqueeze(2)?;
        let summed = embeds.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?;
        let pooled = summed.broadcast_div(&counts)?;
        let logits = self.head.forward(&pooled)?;
        let loss = match inputs.labels.as_ref() {
            Some(labels) => Some(candle_nn::loss::cross_entropy(&logits, labels)?),
            None => None,
        };
        Ok(ModelOutput {
            loss,
            logits,
            end_logits: None,
        })
    }

    fn word_embeddings(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        self.embedding.forward(input_ids)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        sorted_vars(&self.varmap)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// Per-position linear tagger, optionally decoding through a fixed decoder.
pub struct ToyTagger {
    varmap: VarMap,
    embedding: Embedding,
    head: Linear,
    decoder: Option<FixedDecoder>,
}

impl ToyTagger {
    pub fn new(num_tags: usize) -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embedding = candle_nn::embedding(VOCAB, HIDDEN, vb.pp("embeddings.word_embeddings"))
            .expect("embedding");
        let head = candle_nn::linear(HIDDEN, num_tags, vb.pp("classifier")).expect("linear");
        Self {
            varmap,
            embedding,
            head,
            decoder: None,
        }
    }

    pub fn with_decoder(mut self, tags: Vec<u32>) -> Self {
        self.decoder = Some(FixedDecoder { tags });
        self
    }
}

impl TaskModel for ToyTagger {
    fn forward(&self, inputs: &ModelInputs) -> candle_core::Result<ModelOutput> {
        let embeds = embed(&self.embedding, inputs)?;
        let logits = self.head.forward(&embeds)?;
        let loss = match inputs.labels.as_ref() {
            Some(labels) => {
                let num_tags = logits.dim(D::Minus1)?;
                Some(candle_nn::loss::cross_entropy(
                    &logits.reshape(((), num_tags))?,
                    &labels.flatten_all()?,
                )?)
            }
            None => None,
        };
        Ok(ModelOutput {
            loss,
            logits,
            end_logits: None,
        })
    }

    fn word_embeddings(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        self.embedding.forward(input_ids)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        sorted_vars(&self.varmap)
    }

    fn tag_decoder(&self) -> Option<&dyn TagDecoder> {
        self.decoder.as_ref().map(|decoder| decoder as &dyn TagDecoder)
    }
}

/// Returns the same tag sequence for every row.
pub struct FixedDecoder {
    tags: Vec<u32>,
}

impl TagDecoder for FixedDecoder {
    fn decode(&self, emissions: &Tensor, _mask: &Tensor) -> candle_core::Result<Vec<Vec<u32>>> {
        let rows = emissions.dim(0)?;
        Ok(vec![self.tags.clone(); rows])
    }
}

/// Emits preset logits regardless of its inputs.
pub struct FixedOutputModel {
    pub logits: Tensor,
    pub end_logits: Option<Tensor>,
    pub loss: f32,
    weight: Var,
}

impl FixedOutputModel {
    pub fn new(logits: Tensor, end_logits: Option<Tensor>, loss: f32) -> Self {
        let weight = Var::new(&[1f32, 2.0], &Device::Cpu).expect("var");
        Self {
            logits,
            end_logits,
            loss,
            weight,
        }
    }

    /// One-hot logits over `num_labels` for every id in `ids`.
    pub fn one_hot(ids: &[Vec<u32>], num_labels: usize) -> Tensor {
        let rows: Vec<f32> = ids
            .iter()
            .flatten()
            .flat_map(|&id| {
                (0..num_labels).map(move |label| if label as u32 == id { 5.0 } else { 0.0 })
            })
            .collect();
        Tensor::from_vec(rows, (ids.len(), ids[0].len(), num_labels), &Device::Cpu)
            .expect("one-hot")
    }
}

impl TaskModel for FixedOutputModel {
    fn forward(&self, inputs: &ModelInputs) -> candle_core::Result<ModelOutput> {
        let loss = if inputs.has_targets() {
            Some(Tensor::new(self.loss, &Device::Cpu)?)
        } else {
            None
        };
        Ok(ModelOutput {
            loss,
            logits: self.logits.clone(),
            end_logits: self.end_logits.clone(),
        })
    }

    fn word_embeddings(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        input_ids.to_dtype(DType::F32)?.unsqueeze(2)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![("weight".to_string(), self.weight.clone())]
    }
}

/// Writes a marker file instead of safetensors weights.
pub struct MarkerSaver;

impl SaveModel for MarkerSaver {
    fn save(&self, directory: &Path) -> Result<(), TrainingError> {
        std::fs::write(directory.join("custom_model.bin"), b"weights")?;
        Ok(())
    }
}

fn ids(rows: &[[u32; 4]; 2]) -> Tensor {
    Tensor::new(rows, &Device::Cpu).expect("ids")
}

/// Two-class batches: label 1 iff token 1 appears.
pub fn classification_batches() -> Vec<Batch> {
    let rows = [
        ([[2, 1, 3, 0], [2, 4, 3, 0]], [1u32, 0]),
        ([[2, 5, 1, 3], [2, 6, 5, 3]], [1, 0]),
        ([[2, 4, 3, 0], [2, 1, 1, 3]], [0, 1]),
        ([[2, 7, 3, 0], [2, 1, 6, 3]], [0, 1]),
    ];
    rows.iter()
        .map(|(input_ids, labels)| {
            let input_ids = ids(input_ids);
            let attention_mask = input_ids
                .ne(0u32)
                .and_then(|mask| mask.to_dtype(DType::U32))
                .expect("mask");
            Batch::new()
                .with("input_ids", input_ids)
                .with("attention_mask", attention_mask)
                .with("labels", Tensor::new(labels, &Device::Cpu).expect("labels"))
        })
        .collect()
}

/// Tagging batches with `O`/`B-PER`/`I-PER` labels.
pub fn tagging_batches() -> Vec<Batch> {
    let input_ids = ids(&[[2, 1, 4, 3], [2, 5, 3, 0]]);
    let attention_mask = Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 1, 0]], &Device::Cpu).expect("mask");
    let labels = Tensor::new(&[[0u32, 1, 2, 0], [0, 1, 0, 0]], &Device::Cpu).expect("labels");
    vec![Batch::new()
        .with("input_ids", input_ids)
        .with("attention_mask", attention_mask)
        .with("labels", labels)]
}
