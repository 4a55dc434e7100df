//! Capability trait shared by sparse and dense feature vectors.
//!
//! Scoring and update code is generic over [`FeatureVector`], so the model
//! accepts either a [`SparseVector`](super::sparse_vector::SparseVector) or
//! any one-dimensional ndarray of `f64` without an inheritance hierarchy.

use ndarray::{s, ArrayBase, ArrayView1, ArrayViewMut1, Data, Ix1, Zip};

/// A feature vector that can be scored against, and added into, a dense row.
pub trait FeatureVector {
    /// Smallest dimensionality that holds every entry of this vector.
    fn required_dim(&self) -> usize;

    /// `self · row`. The caller guarantees `row.len() >= self.required_dim()`.
    fn dot(&self, row: ArrayView1<'_, f64>) -> f64;

    /// `row += alpha * self`, same length contract as [`dot`](Self::dot).
    fn scaled_add_to(&self, alpha: f64, row: ArrayViewMut1<'_, f64>);

    /// Squared L2 norm.
    fn squared_norm(&self) -> f64;

    /// Whether every stored value is finite.
    fn is_finite(&self) -> bool;
}

impl<S> FeatureVector for ArrayBase<S, Ix1>
where
    S: Data<Elem = f64>,
{
    fn required_dim(&self) -> usize {
        self.len()
    }

    fn dot(&self, row: ArrayView1<'_, f64>) -> f64 {
        self.iter().zip(row.iter()).map(|(x, w)| x * w).sum()
    }

    fn scaled_add_to(&self, alpha: f64, mut row: ArrayViewMut1<'_, f64>) {
        let n = self.len();
        Zip::from(row.slice_mut(s![..n]))
            .and(self)
            .for_each(|r, &x| *r += alpha * x);
    }

    fn squared_norm(&self) -> f64 {
        self.iter().map(|v| v * v).sum()
    }

    fn is_finite(&self) -> bool {
        self.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn test_dense_dot_against_wider_row() {
        let x = Array1::from_vec(vec![1.0, 2.0]);
        let row = Array1::from_vec(vec![3.0, 4.0, 100.0]);
        assert!((FeatureVector::dot(&x, row.view()) - 11.0).abs() < 1e-12);
    }

    #[test]
    fn test_dense_scaled_add() {
        let x = Array1::from_vec(vec![1.0, -1.0]);
        let mut row = Array1::from_vec(vec![0.5, 0.5, 0.5]);
        x.scaled_add_to(2.0, row.view_mut());
        assert_eq!(row.to_vec(), vec![2.5, -1.5, 0.5]);
    }

    #[test]
    fn test_dense_finite() {
        assert!(Array1::from_vec(vec![1.0, 2.0]).is_finite());
        assert!(!Array1::from_vec(vec![1.0, f64::NAN]).is_finite());
    }
}
