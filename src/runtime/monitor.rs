//! Training-loss monitoring and the epsilon-improvement stop.

use std::collections::VecDeque;

/// A rolling window over per-epoch values.
#[derive(Clone, Debug)]
pub struct LossTracker {
    /// Metric name.
    pub name: String,

    /// Rolling window of samples, oldest first.
    pub samples: VecDeque<f64>,

    /// Maximum window size.
    pub max_samples: usize,
}

impl LossTracker {
    pub fn new(name: &str, max_samples: usize) -> Self {
        Self {
            name: name.to_string(),
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a new sample.
    pub fn record(&mut self, value: f64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Mean over the window.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Sample standard deviation over the window.
    pub fn std_dev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .samples
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / (self.samples.len() - 1) as f64;
        var.sqrt()
    }

    pub fn min(&self) -> f64 {
        self.samples.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Latest value more than three standard deviations from the mean.
    pub fn is_anomalous(&self) -> bool {
        if let Some(val) = self.latest() {
            let std = self.std_dev();
            if std > 1e-12 {
                return ((val - self.mean()) / std).abs() > 3.0;
            }
        }
        false
    }
}

/// Stops training once the loss has failed to improve by at least
/// `tolerance` for `patience` consecutive epochs.
#[derive(Clone, Debug)]
pub struct ConvergenceMonitor {
    tracker: LossTracker,
    tolerance: f64,
    patience: usize,
    best: f64,
    stale: usize,
}

impl ConvergenceMonitor {
    /// A non-positive `tolerance` or zero `patience` never converges.
    pub fn new(tolerance: f64, patience: usize) -> Self {
        Self {
            tracker: LossTracker::new("epoch_loss", patience.max(1) * 4),
            tolerance,
            patience,
            best: f64::INFINITY,
            stale: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tolerance > 0.0 && self.patience > 0
    }

    /// Feed one epoch's loss; `true` once training should stop.
    pub fn observe(&mut self, loss: f64) -> bool {
        self.tracker.record(loss);
        if self.tracker.is_anomalous() {
            tracing::warn!(
                "{} jumped to {:.6} (window mean {:.6})",
                self.tracker.name,
                loss,
                self.tracker.mean()
            );
        }

        if self.best - loss >= self.tolerance {
            self.best = loss;
            self.stale = 0;
        } else {
            self.best = self.best.min(loss);
            self.stale += 1;
        }
        self.is_enabled() && self.stale >= self.patience
    }

    /// Consecutive epochs without sufficient improvement.
    pub fn stale_epochs(&self) -> usize {
        self.stale
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn tracker(&self) -> &LossTracker {
        &self.tracker
    }
}
