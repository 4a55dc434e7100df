//! Polytope structure of the hyperplane ensemble.
//!
//! The classifier is a disjunction of conjunctions:
//!
//!   accept(x)  ⇔  ∃ p : ∀ h ∈ members(p) : w_h · x + b_h ≥ 0
//!
//! Each polytope exclusively owns a contiguous block of `M` hyperplanes, so
//! polytope `p` owns rows `p·M .. (p+1)·M` of the weight matrix. A polytope's
//! score is the minimum member margin and the model score is the maximum
//! polytope score, so `accept(x) ⇔ score(x) ≥ 0`.

use std::ops::Range;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::hyperplane::Hyperplane;
use crate::error::{CpmError, Result};
use crate::linalg::features::FeatureVector;

/// Shape of the ensemble: `K` polytopes of `M` hyperplanes each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolytopeLayout {
    pub polytopes: usize,
    pub hyperplanes_per_polytope: usize,
}

impl PolytopeLayout {
    pub fn new(polytopes: usize, hyperplanes_per_polytope: usize) -> Result<Self> {
        if polytopes == 0 {
            return Err(CpmError::invalid_parameter("number of polytopes must be > 0"));
        }
        if hyperplanes_per_polytope == 0 {
            return Err(CpmError::invalid_parameter(
                "hyperplanes per polytope must be > 0",
            ));
        }
        Ok(Self {
            polytopes,
            hyperplanes_per_polytope,
        })
    }

    /// Total number of hyperplanes (`K · M`).
    pub fn total_hyperplanes(&self) -> usize {
        self.polytopes * self.hyperplanes_per_polytope
    }

    /// Hyperplane rows owned by polytope `p`.
    pub fn members(&self, p: usize) -> Result<Range<usize>> {
        if p >= self.polytopes {
            return Err(CpmError::out_of_range("polytope", p, self.polytopes));
        }
        let start = p * self.hyperplanes_per_polytope;
        Ok(start..start + self.hyperplanes_per_polytope)
    }

    /// Polytope owning hyperplane `h`.
    pub fn owner(&self, h: usize) -> Result<usize> {
        if h >= self.total_hyperplanes() {
            return Err(CpmError::out_of_range("hyperplane", h, self.total_hyperplanes()));
        }
        Ok(h / self.hyperplanes_per_polytope)
    }

    /// Reduce per-hyperplane margins to per-polytope scores.
    ///
    /// `margins` must have `total_hyperplanes()` entries.
    pub fn reduce(&self, margins: Array1<f64>) -> PolytopeScores {
        let m = self.hyperplanes_per_polytope;
        let mut scores = Vec::with_capacity(self.polytopes);
        let mut weakest = Vec::with_capacity(self.polytopes);

        for p in 0..self.polytopes {
            let start = p * m;
            let mut best = start;
            for h in start + 1..start + m {
                if margins[h] < margins[best] {
                    best = h;
                }
            }
            scores.push(margins[best]);
            weakest.push(best);
        }

        PolytopeScores {
            margins,
            scores,
            weakest,
        }
    }
}

/// Forward-pass result for one instance.
#[derive(Clone, Debug, PartialEq)]
pub struct PolytopeScores {
    /// Margin of every hyperplane.
    pub margins: Array1<f64>,

    /// Score of every polytope (its minimum member margin).
    pub scores: Vec<f64>,

    /// Per polytope, the member hyperplane attaining the minimum margin.
    /// Ties go to the lowest row.
    pub weakest: Vec<usize>,
}

impl PolytopeScores {
    /// Highest-scoring polytope (lowest index on ties) and its score.
    pub fn best(&self) -> (usize, f64) {
        let mut best = 0;
        for (p, &s) in self.scores.iter().enumerate().skip(1) {
            if s > self.scores[best] {
                best = p;
            }
        }
        (best, self.scores[best])
    }

    /// Model score: the best polytope score.
    pub fn score(&self) -> f64 {
        self.best().1
    }

    /// Whether polytope `p` accepts the instance.
    pub fn accepts(&self, p: usize) -> bool {
        self.scores[p] >= 0.0
    }

    /// ±1 prediction.
    pub fn label(&self) -> i8 {
        if self.score() >= 0.0 {
            1
        } else {
            -1
        }
    }

    /// Sum of positive scores of every polytope other than `exclude`.
    pub fn exclusion_loss(&self, exclude: usize) -> f64 {
        self.scores
            .iter()
            .enumerate()
            .filter(|&(p, _)| p != exclude)
            .map(|(_, &s)| s.max(0.0))
            .sum()
    }
}

/// A standalone convex polytope extracted from the model.
#[derive(Clone, Debug)]
pub struct Polytope {
    pub hyperplanes: Vec<Hyperplane>,
}

impl Polytope {
    pub fn new(hyperplanes: Vec<Hyperplane>) -> Self {
        Self { hyperplanes }
    }

    /// Whether `x` satisfies every half-space.
    pub fn contains<F: FeatureVector>(&self, x: &F) -> bool {
        self.hyperplanes.iter().all(|h| h.contains(x))
    }

    /// Minimum member margin.
    pub fn score<F: FeatureVector>(&self, x: &F) -> f64 {
        self.hyperplanes
            .iter()
            .map(|h| h.margin(x))
            .fold(f64::INFINITY, f64::min)
    }

    /// Violated members and how far `x` falls outside each.
    pub fn violations<F: FeatureVector>(&self, x: &F) -> Vec<(usize, f64)> {
        self.hyperplanes
            .iter()
            .enumerate()
            .filter_map(|(i, h)| {
                let v = h.violation(x);
                if v > 0.0 {
                    Some((i, v))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hyperplanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hyperplanes.is_empty()
    }
}
