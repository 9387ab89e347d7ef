//! Running accumulators for per-phase training summaries.
//!
//! Accumulator state is plain host memory owned by the training loop, so
//! resetting it never touches network weights.

use serde::Serialize;

/// Running mean over scalar observations.
#[derive(Debug, Clone, Default)]
pub struct MeanMetric {
    sum: f64,
    count: usize,
}

impl MeanMetric {
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Current mean, `0.0` before any update.
    pub fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Fraction of rounded predictions equal to their labels.
#[derive(Debug, Clone, Default)]
pub struct AccuracyMetric {
    correct: usize,
    total: usize,
}

impl AccuracyMetric {
    pub fn update(&mut self, predictions: &[f32], labels: &[f32]) {
        for (prediction, label) in predictions.iter().zip(labels) {
            if prediction.round() == *label {
                self.correct += 1;
            }
            self.total += 1;
        }
    }

    /// Current accuracy, `0.0` before any update.
    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Epoch-level values read at the end of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub ae_loss: f64,
}

/// Classification loss, accuracy and autoencoder loss for one phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseMetrics {
    loss: MeanMetric,
    accuracy: AccuracyMetric,
    ae_loss: MeanMetric,
}

impl PhaseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch into the running values.
    pub fn update(&mut self, loss: f64, ae_loss: f64, predictions: &[f32], labels: &[f32]) {
        self.loss.update(loss);
        self.ae_loss.update(ae_loss);
        self.accuracy.update(predictions, labels);
    }

    pub fn reset(&mut self) {
        self.loss.reset();
        self.accuracy.reset();
        self.ae_loss.reset();
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            loss: self.loss.value(),
            accuracy: self.accuracy.value(),
            ae_loss: self.ae_loss.value(),
        }
    }

    pub fn batches(&self) -> usize {
        self.loss.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_returns_identity_values() {
        let mut metrics = PhaseMetrics::new();
        metrics.update(0.5, 2.0, &[0.9, 0.2], &[1.0, 1.0]);
        metrics.reset();

        let summary = metrics.summary();
        assert_eq!(summary.loss, 0.0);
        assert_eq!(summary.accuracy, 0.0);
        assert_eq!(summary.ae_loss, 0.0);
        assert_eq!(metrics.batches(), 0);
    }

    #[test]
    fn loss_is_mean_of_batch_values() {
        let mut metrics = PhaseMetrics::new();
        metrics.update(1.0, 3.0, &[], &[]);
        metrics.update(2.0, 5.0, &[], &[]);

        let summary = metrics.summary();
        assert!((summary.loss - 1.5).abs() < 1e-12);
        assert!((summary.ae_loss - 4.0).abs() < 1e-12);
    }

    #[test]
    fn accuracy_rounds_predictions() {
        let mut accuracy = AccuracyMetric::default();
        accuracy.update(&[0.8, 0.3, 0.6, 0.1], &[1.0, 0.0, 0.0, 1.0]);
        assert!((accuracy.value() - 0.5).abs() < 1e-12);
    }
}
