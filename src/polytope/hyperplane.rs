//! Hyperplanes and the half-spaces they bound.
//!
//! Each hyperplane is `w · x + b = 0`; its half-space is `w · x + b ≥ 0`.
//! The boundary itself counts as inside, in training and in inference.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::linalg::features::FeatureVector;

/// A single half-space constraint `w · x + b ≥ 0`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyperplane {
    /// Normal vector `w ∈ R^D`.
    pub weights: Array1<f64>,

    /// Offset `b`.
    pub bias: f64,
}

impl Hyperplane {
    pub fn new(weights: Array1<f64>, bias: f64) -> Self {
        Self { weights, bias }
    }

    /// Hyperplane with zero normal and zero bias.
    pub fn zeros(dim: usize) -> Self {
        Self::new(Array1::zeros(dim), 0.0)
    }

    pub fn dim(&self) -> usize {
        self.weights.len()
    }

    /// Signed margin `w · x + b`.
    pub fn margin<F: FeatureVector>(&self, x: &F) -> f64 {
        x.dot(self.weights.view()) + self.bias
    }

    /// Whether `x` lies in the (closed) half-space.
    pub fn contains<F: FeatureVector>(&self, x: &F) -> bool {
        self.margin(x) >= 0.0
    }

    /// Euclidean distance to the boundary, negative outside.
    /// Zero for a degenerate (zero-normal) hyperplane.
    pub fn signed_distance<F: FeatureVector>(&self, x: &F) -> f64 {
        let norm = self.norm();
        if norm > 0.0 {
            self.margin(x) / norm
        } else {
            0.0
        }
    }

    /// How far `x` falls short of the half-space (0 if inside).
    pub fn violation<F: FeatureVector>(&self, x: &F) -> f64 {
        (-self.margin(x)).max(0.0)
    }

    /// ||w||_2
    pub fn norm(&self) -> f64 {
        self.weights.iter().map(|v| v * v).sum::<f64>().sqrt()
    }
}
