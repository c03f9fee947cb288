use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::MetricReport;

/// `(label, start, end)` with an inclusive end position.
pub type Entity = (String, usize, usize);

/// Tagging scheme used to read entities out of a tag sequence.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Markup {
    Bio,
    #[default]
    Bios,
}

/// Reads entities out of a tag id sequence.
///
/// Ids without a name in `id2label` are treated as `O`. Under BIOS a lone
/// `B-` tag is not an entity; under BIO it is.
pub fn get_spans(tags: &[u32], id2label: &[String], markup: Markup) -> Vec<Entity> {
    let mut spans = Vec::new();
    let mut open: Option<(String, usize, Option<usize>)> = None;

    let close = |open: &mut Option<(String, usize, Option<usize>)>, spans: &mut Vec<Entity>| {
        if let Some((label, start, Some(end))) = open.take() {
            spans.push((label, start, end));
        }
    };

    for (idx, &tag) in tags.iter().enumerate() {
        let name = id2label.get(tag as usize).map(String::as_str).unwrap_or("O");
        let (prefix, label) = match name.split_once('-') {
            Some((prefix, label)) => (prefix, label),
            None => (name, ""),
        };

        match prefix {
            "S" if markup == Markup::Bios => {
                close(&mut open, &mut spans);
                spans.push((label.to_string(), idx, idx));
            }
            "B" => {
                close(&mut open, &mut spans);
                let end = match markup {
                    Markup::Bio => Some(idx),
                    Markup::Bios => None,
                };
                open = Some((label.to_string(), idx, end));
            }
            "I" if open.is_some() => {
                if let Some((open_label, _, end)) = open.as_mut() {
                    if open_label.as_str() == label {
                        *end = Some(idx);
                    }
                }
            }
            _ => close(&mut open, &mut spans),
        }
    }
    close(&mut open, &mut spans);

    spans
}

/// Entity-level precision / recall / f1, overall and per label.
#[derive(Debug, Clone, Default)]
pub struct EntityScore {
    origins: Vec<Entity>,
    founds: Vec<Entity>,
    rights: Vec<Entity>,
}

impl EntityScore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, preds: &[Entity], targets: &[Entity]) {
        self.origins.extend(targets.iter().cloned());
        self.founds.extend(preds.iter().cloned());
        self.rights
            .extend(preds.iter().filter(|pred| targets.contains(pred)).cloned());
    }

    pub fn value(&self) -> MetricReport {
        let mut report = MetricReport::default();
        report.scores = scores(self.origins.len(), self.founds.len(), self.rights.len());

        let mut labels: Vec<&String> = self.origins.iter().map(|(label, _, _)| label).collect();
        labels.sort();
        labels.dedup();
        for label in labels {
            let count = |items: &[Entity]| items.iter().filter(|(l, _, _)| l == label).count();
            report.per_label.insert(
                label.clone(),
                scores(
                    count(self.origins.as_slice()),
                    count(self.founds.as_slice()),
                    count(self.rights.as_slice()),
                ),
            );
        }
        report
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn scores(origin: usize, found: usize, right: usize) -> BTreeMap<String, f64> {
    let recall = if origin == 0 {
        0.0
    } else {
        right as f64 / origin as f64
    };
    let precision = if found == 0 {
        0.0
    } else {
        right as f64 / found as f64
    };
    let f1 = if recall + precision == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    BTreeMap::from([
        ("precision".to_string(), precision),
        ("recall".to_string(), recall),
        ("f1".to_string(), f1),
    ])
}

/// [`EntityScore`] fed with tag sequences.
#[derive(Debug, Clone)]
pub struct SequenceLabelingScore {
    id2label: Vec<String>,
    markup: Markup,
    inner: EntityScore,
}

impl SequenceLabelingScore {
    pub fn new(id2label: Vec<String>, markup: Markup) -> Self {
        Self {
            id2label,
            markup,
            inner: EntityScore::new(),
        }
    }

    pub fn update(&mut self, preds: &[Vec<u32>], targets: &[Vec<u32>]) {
        for (pred, target) in preds.iter().zip(targets) {
            let pred_spans = get_spans(pred, &self.id2label, self.markup);
            let gold_spans = get_spans(target, &self.id2label, self.markup);
            self.inner.update(&pred_spans, &gold_spans);
        }
    }

    pub fn value(&self) -> MetricReport {
        self.inner.value()
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }
}
