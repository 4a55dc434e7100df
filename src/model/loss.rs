//! Surrogate losses driving the SGD update.
//!
//! A loss is a function of the signed margin `z = y · score`. The update
//! step only needs the loss value (for telemetry and metrics) and the
//! magnitude of its slope, `gain(z) = -dL/dz ≥ 0`; a zero gain means the
//! example does not move any hyperplane.

use serde::{Deserialize, Serialize};

use crate::config::MARGIN;

/// Pluggable surrogate loss.
pub trait Loss: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    /// `L(z)`.
    fn value(&self, z: f64) -> f64;

    /// `-dL/dz` (a subgradient where `L` is not differentiable).
    fn gain(&self, z: f64) -> f64;
}

/// Large-margin hinge `max(0, margin - z)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hinge {
    pub margin: f64,
}

impl Default for Hinge {
    fn default() -> Self {
        Self { margin: MARGIN }
    }
}

impl Loss for Hinge {
    fn name(&self) -> &'static str {
        "hinge"
    }

    fn value(&self, z: f64) -> f64 {
        (self.margin - z).max(0.0)
    }

    fn gain(&self, z: f64) -> f64 {
        if z < self.margin {
            1.0
        } else {
            0.0
        }
    }
}

/// Perceptron criterion `max(0, -z)`. A point on the boundary counts as a
/// mistake, so a zero-initialised model still receives updates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Perceptron;

impl Loss for Perceptron {
    fn name(&self) -> &'static str {
        "perceptron"
    }

    fn value(&self, z: f64) -> f64 {
        (-z).max(0.0)
    }

    fn gain(&self, z: f64) -> f64 {
        if z <= 0.0 {
            1.0
        } else {
            0.0
        }
    }
}

/// Quadratically smoothed hinge:
///
/// ```text
/// L(z) = 0                 z ≥ m
///        (m - z)² / 2m     0 < z < m
///        m/2 - z           z ≤ 0
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothedHinge {
    pub margin: f64,
}

impl Default for SmoothedHinge {
    fn default() -> Self {
        Self { margin: MARGIN }
    }
}

impl Loss for SmoothedHinge {
    fn name(&self) -> &'static str {
        "smoothed-hinge"
    }

    fn value(&self, z: f64) -> f64 {
        let m = self.margin;
        if z >= m {
            0.0
        } else if z > 0.0 {
            (m - z) * (m - z) / (2.0 * m)
        } else {
            m / 2.0 - z
        }
    }

    fn gain(&self, z: f64) -> f64 {
        let m = self.margin;
        if z >= m {
            0.0
        } else if z > 0.0 {
            (m - z) / m
        } else {
            1.0
        }
    }
}

/// Serializable selector over the built-in losses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    #[default]
    Hinge,
    Perceptron,
    SmoothedHinge,
}

impl Loss for LossKind {
    fn name(&self) -> &'static str {
        match self {
            LossKind::Hinge => Hinge::default().name(),
            LossKind::Perceptron => Perceptron.name(),
            LossKind::SmoothedHinge => SmoothedHinge::default().name(),
        }
    }

    fn value(&self, z: f64) -> f64 {
        match self {
            LossKind::Hinge => Hinge::default().value(z),
            LossKind::Perceptron => Perceptron.value(z),
            LossKind::SmoothedHinge => SmoothedHinge::default().value(z),
        }
    }

    fn gain(&self, z: f64) -> f64 {
        match self {
            LossKind::Hinge => Hinge::default().gain(z),
            LossKind::Perceptron => Perceptron.gain(z),
            LossKind::SmoothedHinge => SmoothedHinge::default().gain(z),
        }
    }
}
