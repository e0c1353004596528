use std::collections::BTreeMap;

use burn::train::metric::Numeric;

/// Batch-size weighted mean of one metric.
#[derive(Default)]
struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    fn update(&mut self, name: &str, value: f64, batch_size: usize) {
        self.sum += value * batch_size as f64;
        self.count += batch_size;

        tracing::trace!(metric = name, last = value, mean = self.value(), "metric updated");
    }
}

impl Numeric for RunningMean {
    fn value(&self) -> f64 {
        match self.count {
            0 => f64::NAN,
            count => self.sum / count as f64,
        }
    }
}

/// Running averages of named scalar metrics over one epoch.
#[derive(Default)]
pub struct EpochMetrics {
    states: BTreeMap<String, RunningMean>,
}

impl EpochMetrics {
    pub fn update(&mut self, name: &str, value: f64, batch_size: usize) {
        self.states
            .entry(name.to_string())
            .or_default()
            .update(name, value, batch_size);
    }

    /// Batch-size weighted mean since the last `clear`.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.states.get(name).map(Numeric::value)
    }

    pub fn summary(&self) -> Vec<(String, f64)> {
        self.states
            .iter()
            .map(|(name, state)| (name.clone(), state.value()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_are_weighted_by_batch_size() {
        let mut metrics = EpochMetrics::default();

        metrics.update("val/rec_loss", 1.0, 1);
        metrics.update("val/rec_loss", 4.0, 3);

        let value = metrics.value("val/rec_loss").unwrap();
        assert!((value - 3.25).abs() < 1e-9);
        assert_eq!(metrics.value("val/disc_loss"), None);

        metrics.clear();
        assert!(metrics.is_empty());
    }

    #[test]
    fn empty_batches_do_not_count() {
        let mut metrics = EpochMetrics::default();

        metrics.update("val/embed_loss", 2.0, 0);
        assert!(metrics.value("val/embed_loss").unwrap().is_nan());

        metrics.update("val/embed_loss", 2.0, 2);
        assert_eq!(metrics.value("val/embed_loss"), Some(2.0));
    }
}
