use std::collections::BTreeMap;

pub mod classification;
pub mod entity;

pub use classification::MatthewsCorrcoef;
pub use entity::{get_spans, Entity, EntityScore, Markup, SequenceLabelingScore};

/// Running weighted average of a scalar since the last reset.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: f64,
    last: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: usize) {
        self.last = value;
        self.sum += value * weight as f64;
        self.count += weight as f64;
    }

    /// Zero until the first update.
    pub fn average(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.sum / self.count
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Aggregate scores plus optional per-label breakdown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricReport {
    pub scores: BTreeMap<String, f64>,
    pub per_label: BTreeMap<String, BTreeMap<String, f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_meter_tracks_weighted_mean() {
        let mut meter = AverageMeter::new();
        assert_eq!(meter.average(), 0.0);
        meter.update(2.0, 1);
        meter.update(4.0, 1);
        assert_eq!(meter.average(), 3.0);
        assert_eq!(meter.last(), 4.0);

        meter.update(10.0, 2);
        assert_eq!(meter.average(), 6.5);

        meter.reset();
        assert_eq!(meter.count(), 0.0);
        assert_eq!(meter.average(), 0.0);
    }
}
