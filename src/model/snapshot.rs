//! Immutable, versioned copies of model parameters.
//!
//! Evaluation never reads the live weight matrix. It works on a full copy
//! taken with [`ConvexPolytopeMachine::snapshot`](super::machine::ConvexPolytopeMachine::snapshot)
//! and shared across workers through an `Arc`, so training can continue
//! while a snapshot is being scored.

use std::sync::Arc;

use crate::error::Result;
use crate::linalg::dense_matrix::DenseMatrix;
use crate::linalg::features::FeatureVector;
use crate::model::loss::LossKind;
use crate::polytope::layout::{PolytopeLayout, PolytopeScores};

/// Forward pass shared by training and inference.
pub(crate) fn forward<F: FeatureVector>(
    weights: &DenseMatrix,
    layout: &PolytopeLayout,
    x: &F,
) -> Result<PolytopeScores> {
    Ok(layout.reduce(weights.margins(x)?))
}

/// Read-only model parameters at a given version.
#[derive(Clone, Debug)]
pub struct ModelSnapshot {
    version: u64,
    layout: PolytopeLayout,
    weights: DenseMatrix,
    outer_label: i32,
    loss: LossKind,
}

impl ModelSnapshot {
    pub(crate) fn new(
        version: u64,
        layout: PolytopeLayout,
        weights: DenseMatrix,
        outer_label: i32,
        loss: LossKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            version,
            layout,
            weights,
            outer_label,
            loss,
        })
    }

    /// Number of parameter updates applied when the snapshot was taken.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn layout(&self) -> &PolytopeLayout {
        &self.layout
    }

    pub fn weights(&self) -> &DenseMatrix {
        &self.weights
    }

    pub fn dimensions(&self) -> usize {
        self.weights.dim()
    }

    pub fn outer_label(&self) -> i32 {
        self.outer_label
    }

    pub fn loss(&self) -> LossKind {
        self.loss
    }

    /// Per-hyperplane margins reduced to polytope scores.
    pub fn scores<F: FeatureVector>(&self, x: &F) -> Result<PolytopeScores> {
        forward(&self.weights, &self.layout, x)
    }

    /// Model score and the polytope attaining it.
    pub fn decision<F: FeatureVector>(&self, x: &F) -> Result<(f64, usize)> {
        let (p, s) = self.scores(x)?.best();
        Ok((s, p))
    }

    /// ±1 prediction.
    pub fn predict<F: FeatureVector>(&self, x: &F) -> Result<i8> {
        Ok(self.scores(x)?.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse_vector::SparseVector;
    use crate::polytope::hyperplane::Hyperplane;
    use ndarray::Array1;

    #[test]
    fn test_snapshot_scores() {
        let layout = PolytopeLayout::new(2, 1).unwrap();
        let mut weights = DenseMatrix::zeros(2, 2);
        weights
            .set_row(0, &Hyperplane::new(Array1::from_vec(vec![1.0, 0.0]), 0.0))
            .unwrap();
        weights
            .set_row(1, &Hyperplane::new(Array1::from_vec(vec![0.0, 1.0]), -5.0))
            .unwrap();
        let snap = ModelSnapshot::new(7, layout, weights, 1, LossKind::Hinge);

        assert_eq!(snap.version(), 7);
        assert_eq!(snap.dimensions(), 2);
        let x = SparseVector::from_pairs(vec![(0, 2.0), (1, 1.0)]).unwrap();
        let (score, p) = snap.decision(&x).unwrap();
        assert_eq!(p, 0);
        assert!((score - 2.0).abs() < 1e-12);
        assert_eq!(snap.predict(&x).unwrap(), 1);

        let too_wide = SparseVector::from_pairs(vec![(2, 1.0)]).unwrap();
        assert!(snap.predict(&too_wide).is_err());
    }
}
