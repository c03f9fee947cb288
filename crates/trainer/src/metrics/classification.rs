use std::collections::BTreeMap;

use super::MetricReport;

/// Matthews correlation coefficient over integer class labels, multi-class form.
#[derive(Debug, Clone, Default)]
pub struct MatthewsCorrcoef {
    confusion: BTreeMap<(u32, u32), u64>,
}

impl MatthewsCorrcoef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairs beyond the shorter slice are ignored.
    pub fn update(&mut self, preds: &[u32], targets: &[u32]) {
        for (&pred, &target) in preds.iter().zip(targets) {
            *self.confusion.entry((target, pred)).or_default() += 1;
        }
    }

    pub fn score(&self) -> f64 {
        let mut true_counts: BTreeMap<u32, f64> = BTreeMap::new();
        let mut pred_counts: BTreeMap<u32, f64> = BTreeMap::new();
        let mut correct = 0.0;
        let mut total = 0.0;
        for (&(target, pred), &count) in &self.confusion {
            let count = count as f64;
            *true_counts.entry(target).or_default() += count;
            *pred_counts.entry(pred).or_default() += count;
            if target == pred {
                correct += count;
            }
            total += count;
        }

        let cross: f64 = true_counts
            .iter()
            .map(|(label, t)| t * pred_counts.get(label).copied().unwrap_or(0.0))
            .sum();
        let pred_sq: f64 = pred_counts.values().map(|p| p * p).sum();
        let true_sq: f64 = true_counts.values().map(|t| t * t).sum();

        let denom = ((total * total - pred_sq) * (total * total - true_sq)).sqrt();
        if denom == 0.0 || !denom.is_finite() {
            return 0.0;
        }
        (correct * total - cross) / denom
    }

    pub fn value(&self) -> MetricReport {
        let mut report = MetricReport::default();
        report.scores.insert("mcc".to_string(), self.score());
        report
    }

    pub fn reset(&mut self) {
        self.confusion.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_and_inverted_predictions() {
        let mut metric = MatthewsCorrcoef::new();
        metric.update(&[0, 1, 1, 0], &[0, 1, 1, 0]);
        assert!((metric.score() - 1.0).abs() < 1e-12);

        metric.reset();
        metric.update(&[1, 0, 0, 1], &[0, 1, 1, 0]);
        assert!((metric.score() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn constant_predictions_score_zero() {
        let mut metric = MatthewsCorrcoef::new();
        metric.update(&[1, 1, 1, 1], &[0, 1, 0, 1]);
        assert_eq!(metric.score(), 0.0);
    }

    #[test]
    fn binary_case_matches_closed_form() {
        // tp=2 tn=1 fp=1 fn=0
        let mut metric = MatthewsCorrcoef::new();
        metric.update(&[1, 1, 1, 0], &[1, 1, 0, 0]);
        let expected = (2.0 * 1.0 - 1.0 * 0.0) / ((3.0f64) * 2.0 * 2.0 * 1.0).sqrt();
        assert!((metric.score() - expected).abs() < 1e-12);
    }
}
