//! Forward-only passes over a loader: scoring for evaluation, JSON records
//! for prediction.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use candle_core::{DType, Tensor, D};
use serde::Serialize;
use serde_json::json;

use crate::{
    checkpoint::write_json,
    data::{BlockingDataLoader, DataLoader},
    error::to_runtime_error,
    metrics::{
        get_spans, AverageMeter, Entity, EntityScore, MatthewsCorrcoef, MetricReport,
        SequenceLabelingScore,
    },
    model::{ModelInputs, ModelOutput, TaskModel},
    trainer::scalar_value,
    TrainingArgs, TrainingError,
};

pub const EVAL_RESULTS_NAME: &str = "eval_results.txt";

/// How raw model outputs become predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionPolicy {
    /// Argmax over the label dimension, one label per row.
    Classification,
    /// One tag per position, from the model's decoder when it has one.
    TagSequence,
    /// Start and end labels per position.
    Span,
}

/// One row's prediction or gold value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Decoded {
    Label(u32),
    Tags(Vec<u32>),
    Span { start: Vec<u32>, end: Vec<u32> },
}

/// Everything gathered during one pass.
#[derive(Debug, Clone, Default)]
pub struct EvaluationRecord {
    pub loss: AverageMeter,
    pub preds: Vec<Decoded>,
    pub targets: Vec<Decoded>,
    /// Unpadded length of every row, `sum(attention_mask)`.
    pub input_lens: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// `eval_loss` plus `eval_<metric>` rounded to five decimals.
    pub results: BTreeMap<String, f64>,
    pub report: MetricReport,
    pub record: EvaluationRecord,
}

/// Spans read from start/end label sequences.
///
/// Both sequences are cut to `len` and stripped of their first and last
/// position. For every non-zero start label the first end position at or
/// after it carrying the same label closes the span.
pub fn extract_spans(start: &[u32], end: &[u32], len: usize) -> Vec<(u32, usize, usize)> {
    let start = trim_special(start, len);
    let end = trim_special(end, len);

    let mut spans = Vec::new();
    for (i, &label) in start.iter().enumerate() {
        if label == 0 {
            continue;
        }
        if let Some(offset) = end.iter().skip(i).position(|&candidate| candidate == label) {
            spans.push((label, i, i + offset));
        }
    }
    spans
}

/// `seq[..len][1..len - 1]`, empty when fewer than two positions remain.
pub fn trim_special(seq: &[u32], len: usize) -> &[u32] {
    let len = len.min(seq.len());
    if len < 2 {
        &[]
    } else {
        &seq[1..len - 1]
    }
}

/// Scores the model over `loader`; with `save_preds` the decoded
/// predictions also go to `<prefix>_predict_eval_logits.json`.
pub fn evaluate<M, L>(
    model: &mut M,
    loader: &mut BlockingDataLoader<L>,
    args: &TrainingArgs,
    policy: PredictionPolicy,
    tag: &str,
    save_preds: bool,
) -> Result<EvaluationResult, TrainingError>
where
    M: TaskModel,
    L: DataLoader,
{
    log::info!("***** Running evaluation {tag} *****");
    if let Some(batches) = loader.num_batches() {
        log::info!("  Num batches = {batches}");
    }

    model.set_training(false);
    let record = collect(model, loader, policy)?;

    let report = score(&record, args, policy);
    let mut results = BTreeMap::new();
    results.insert("eval_loss".to_string(), record.loss.average());
    for (key, value) in &report.scores {
        results.insert(format!("eval_{key}"), round5(*value));
    }

    log::info!("***** Eval results {tag} *****");
    for (key, value) in &results {
        log::info!("  {key} = {value:.5}");
    }
    if !report.per_label.is_empty() {
        log::info!("***** Eval label results of {} *****", args.task_name);
        for (label, scores) in &report.per_label {
            let line = scores
                .iter()
                .map(|(key, value)| format!("{key}: {value:.4}"))
                .collect::<Vec<_>>()
                .join(" - ");
            log::info!(" {label} result: {line}");
        }
    }

    if save_preds {
        let path = output_file(args, tag, "predict_eval_logits.json")?;
        write_json(&path, &record.preds)?;
    }

    Ok(EvaluationResult {
        results,
        report,
        record,
    })
}

/// Runs the model over `loader` and writes `<prefix>_predict_test.json`
/// plus the raw predictions to `<prefix>_predict_test_logits.json`.
pub fn predict<M, L>(
    model: &mut M,
    loader: &mut BlockingDataLoader<L>,
    args: &TrainingArgs,
    policy: PredictionPolicy,
    tag: &str,
) -> Result<Vec<serde_json::Value>, TrainingError>
where
    M: TaskModel,
    L: DataLoader,
{
    log::info!("***** Running prediction {tag} *****");
    model.set_training(false);
    let record = collect(model, loader, policy)?;

    let id2label = &args.labels.id2label;
    let mut outputs = Vec::with_capacity(record.preds.len());
    for (id, (pred, &len)) in record.preds.iter().zip(&record.input_lens).enumerate() {
        let item = match pred {
            Decoded::Label(label) => json!({
                "id": id,
                "label": label_name(id2label, *label),
            }),
            Decoded::Tags(tags) => {
                let tags = trim_special(tags, len);
                let sequence = tags
                    .iter()
                    .map(|&tag| label_name(id2label, tag))
                    .collect::<Vec<_>>()
                    .join(" ");
                json!({
                    "id": id,
                    "tag_sequence": sequence,
                    "entities": get_spans(tags, id2label, args.labels.markup),
                })
            }
            Decoded::Span { start, end } => json!({
                "id": id,
                "entities": named_spans(start, end, len, id2label),
            }),
        };
        outputs.push(item);
    }

    write_json(&output_file(args, tag, "predict_test.json")?, &outputs)?;
    write_json(
        &output_file(args, tag, "predict_test_logits.json")?,
        &record.preds,
    )?;
    Ok(outputs)
}

/// Writes one `key = value` line per result to `path`.
pub fn write_results_text(
    path: &Path,
    results: &BTreeMap<String, f64>,
) -> Result<(), TrainingError> {
    let mut file = fs::File::create(path)?;
    for (key, value) in results {
        writeln!(file, "{key} = {value}")?;
    }
    Ok(())
}

fn collect<M, L>(
    model: &M,
    loader: &mut BlockingDataLoader<L>,
    policy: PredictionPolicy,
) -> Result<EvaluationRecord, TrainingError>
where
    M: TaskModel,
    L: DataLoader,
{
    let mut record = EvaluationRecord::default();
    loader.start_epoch(0)?;
    while let Some(batch) = loader.next_batch()? {
        let inputs = ModelInputs::from_batch(&batch)?;
        let output = model.forward(&inputs).map_err(to_runtime_error)?;
        if let Some(loss) = output.loss.as_ref() {
            record.loss.update(scalar_value(&loss.detach())?, 1);
        }

        record
            .preds
            .extend(decode_predictions(model, policy, &output, &inputs)?);
        if let Some(targets) = decode_targets(policy, &inputs)? {
            record.targets.extend(targets);
        }
        record.input_lens.extend(input_lengths(&inputs.attention_mask)?);
    }
    Ok(record)
}

fn decode_predictions<M: TaskModel>(
    model: &M,
    policy: PredictionPolicy,
    output: &ModelOutput,
    inputs: &ModelInputs,
) -> Result<Vec<Decoded>, TrainingError> {
    let logits = output.logits.detach();
    let decoded = match policy {
        PredictionPolicy::Classification => argmax_rows(&logits)?
            .into_iter()
            .map(Decoded::Label)
            .collect(),
        PredictionPolicy::TagSequence => {
            let tags = match model.tag_decoder() {
                Some(decoder) => decoder
                    .decode(&logits, &inputs.attention_mask)
                    .map_err(to_runtime_error)?,
                None => argmax_positions(&logits)?,
            };
            tags.into_iter().map(Decoded::Tags).collect()
        }
        PredictionPolicy::Span => {
            let end_logits = output.end_logits.as_ref().ok_or_else(|| {
                TrainingError::runtime("span prediction needs end logits from the model")
            })?;
            let starts = argmax_positions(&logits)?;
            let ends = argmax_positions(&end_logits.detach())?;
            starts
                .into_iter()
                .zip(ends)
                .map(|(start, end)| Decoded::Span { start, end })
                .collect()
        }
    };
    Ok(decoded)
}

fn decode_targets(
    policy: PredictionPolicy,
    inputs: &ModelInputs,
) -> Result<Option<Vec<Decoded>>, TrainingError> {
    let targets = match policy {
        PredictionPolicy::Classification => {
            let Some(labels) = inputs.labels.as_ref() else {
                return Ok(None);
            };
            to_u32(labels)?
                .flatten_all()
                .and_then(|flat| flat.to_vec1::<u32>())
                .map_err(to_runtime_error)?
                .into_iter()
                .map(Decoded::Label)
                .collect()
        }
        PredictionPolicy::TagSequence => {
            let Some(labels) = inputs.labels.as_ref() else {
                return Ok(None);
            };
            rows(labels)?.into_iter().map(Decoded::Tags).collect()
        }
        PredictionPolicy::Span => {
            let (Some(start), Some(end)) = (
                inputs.start_positions.as_ref(),
                inputs.end_positions.as_ref(),
            ) else {
                return Ok(None);
            };
            rows(start)?
                .into_iter()
                .zip(rows(end)?)
                .map(|(start, end)| Decoded::Span { start, end })
                .collect()
        }
    };
    Ok(Some(targets))
}

fn score(record: &EvaluationRecord, args: &TrainingArgs, policy: PredictionPolicy) -> MetricReport {
    let id2label = &args.labels.id2label;
    match policy {
        PredictionPolicy::Classification => {
            let (preds, targets): (Vec<u32>, Vec<u32>) = record
                .preds
                .iter()
                .zip(&record.targets)
                .filter_map(|pair| match pair {
                    (Decoded::Label(pred), Decoded::Label(target)) => Some((*pred, *target)),
                    _ => None,
                })
                .unzip();
            let mut metric = MatthewsCorrcoef::new();
            metric.update(&preds, &targets);
            metric.value()
        }
        PredictionPolicy::TagSequence => {
            let mut metric = SequenceLabelingScore::new(id2label.clone(), args.labels.markup);
            for ((pred, target), &len) in record
                .preds
                .iter()
                .zip(&record.targets)
                .zip(&record.input_lens)
            {
                if let (Decoded::Tags(pred), Decoded::Tags(target)) = (pred, target) {
                    metric.update(
                        &[trim_special(pred, len).to_vec()],
                        &[trim_special(target, len).to_vec()],
                    );
                }
            }
            metric.value()
        }
        PredictionPolicy::Span => {
            let mut metric = EntityScore::new();
            for ((pred, target), &len) in record
                .preds
                .iter()
                .zip(&record.targets)
                .zip(&record.input_lens)
            {
                if let (
                    Decoded::Span { start, end },
                    Decoded::Span {
                        start: gold_start,
                        end: gold_end,
                    },
                ) = (pred, target)
                {
                    metric.update(
                        &named_spans(start, end, len, id2label),
                        &named_spans(gold_start, gold_end, len, id2label),
                    );
                }
            }
            metric.value()
        }
    }
}

fn named_spans(start: &[u32], end: &[u32], len: usize, id2label: &[String]) -> Vec<Entity> {
    extract_spans(start, end, len)
        .into_iter()
        .map(|(label, i, j)| (label_name(id2label, label), i, j))
        .collect()
}

fn label_name(id2label: &[String], id: u32) -> String {
    id2label
        .get(id as usize)
        .cloned()
        .unwrap_or_else(|| id.to_string())
}

fn output_file(args: &TrainingArgs, tag: &str, suffix: &str) -> Result<PathBuf, TrainingError> {
    fs::create_dir_all(&args.output_dir)?;
    let stem = if tag.is_empty() {
        args.prefix()
    } else {
        format!("{}_{}", args.prefix(), tag)
    };
    Ok(args.output_dir.join(format!("{stem}_{suffix}")))
}

fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

fn to_u32(tensor: &Tensor) -> Result<Tensor, TrainingError> {
    if tensor.dtype() == DType::U32 {
        return Ok(tensor.clone());
    }
    tensor.to_dtype(DType::U32).map_err(to_runtime_error)
}

fn rows(tensor: &Tensor) -> Result<Vec<Vec<u32>>, TrainingError> {
    to_u32(tensor)?.to_vec2::<u32>().map_err(to_runtime_error)
}

fn argmax_rows(logits: &Tensor) -> Result<Vec<u32>, TrainingError> {
    logits
        .argmax(D::Minus1)
        .and_then(|ids| ids.flatten_all())
        .and_then(|ids| ids.to_vec1::<u32>())
        .map_err(to_runtime_error)
}

fn argmax_positions(logits: &Tensor) -> Result<Vec<Vec<u32>>, TrainingError> {
    logits
        .argmax(D::Minus1)
        .and_then(|ids| ids.to_vec2::<u32>())
        .map_err(to_runtime_error)
}

fn input_lengths(mask: &Tensor) -> Result<Vec<usize>, TrainingError> {
    let lens = mask
        .to_dtype(DType::F32)
        .and_then(|mask| mask.sum(D::Minus1))
        .and_then(|lens| lens.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    Ok(lens.into_iter().map(|len| len.round() as usize).collect())
}
