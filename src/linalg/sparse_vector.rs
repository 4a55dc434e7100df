//! Sparse feature vectors.
//!
//! Entries are kept as two parallel arrays with strictly ascending indices.
//! Vectors are immutable after construction; scaling produces a new vector.

use std::fmt::Write as _;

use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use serde::{Deserialize, Serialize};

use super::features::FeatureVector;
use crate::error::{CpmError, Result};

/// Sparse vector of `(index, value)` pairs, implicit zero elsewhere.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    indices: Vec<usize>,
    values: Vec<f64>,
    squared_norm: f64,
}

impl SparseVector {
    /// The all-zero vector.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(index, value)` pairs in any order.
    ///
    /// Fails with `InvalidIndex` on a negative or repeated index.
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (i64, f64)>,
    {
        let mut entries: Vec<(usize, f64)> = Vec::new();
        for (index, value) in pairs {
            if index < 0 {
                return Err(CpmError::invalid_index(index, "negative index"));
            }
            entries.push((index as usize, value));
        }

        entries.sort_by_key(|&(i, _)| i);
        if let Some(w) = entries.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(CpmError::invalid_index(w[0].0 as i64, "duplicate index"));
        }

        let (indices, values) = entries.into_iter().unzip();
        Ok(Self::from_parts(indices, values))
    }

    /// Build from parallel index/value arrays that are already sorted.
    pub fn from_sorted(indices: Vec<usize>, values: Vec<f64>) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(CpmError::invalid_parameter(format!(
                "{} indices but {} values",
                indices.len(),
                values.len()
            )));
        }
        if let Some(w) = indices.windows(2).find(|w| w[0] >= w[1]) {
            let reason = if w[0] == w[1] {
                "duplicate index"
            } else {
                "indices must be strictly ascending"
            };
            return Err(CpmError::invalid_index(w[1] as i64, reason));
        }
        Ok(Self::from_parts(indices, values))
    }

    /// Build from a dense slice, keeping nonzero entries only.
    pub fn from_dense(data: &[f64]) -> Self {
        let (indices, values) = data
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, &v)| (i, v))
            .unzip();
        Self::from_parts(indices, values)
    }

    fn from_parts(indices: Vec<usize>, values: Vec<f64>) -> Self {
        let squared_norm = values.iter().map(|v| v * v).sum();
        Self {
            indices,
            values,
            squared_norm,
        }
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Iterate `(index, value)` in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.indices.iter().copied().zip(self.values.iter().copied())
    }

    /// Largest stored index, if any.
    pub fn max_index(&self) -> Option<usize> {
        self.indices.last().copied()
    }

    /// ||x||_2
    pub fn norm(&self) -> f64 {
        self.squared_norm.sqrt()
    }

    /// `weight * self` as a new vector.
    pub fn scaled(&self, weight: f64) -> Self {
        Self::from_parts(
            self.indices.clone(),
            self.values.iter().map(|v| v * weight).collect(),
        )
    }

    /// Expand to a dense vector of length `dim`.
    pub fn to_dense(&self, dim: usize) -> Result<Array1<f64>> {
        if self.required_dim() > dim {
            return Err(CpmError::dimension_mismatch(dim, self.required_dim()));
        }
        let mut out = Array1::zeros(dim);
        for (i, v) in self.iter() {
            out[i] = v;
        }
        Ok(out)
    }

    /// Serialise as libsvm features (`idx:val idx:val`), without a label.
    pub fn to_libsvm(&self) -> String {
        let mut out = String::new();
        for (n, (i, v)) in self.iter().enumerate() {
            if n > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{}:{}", i, v);
        }
        out
    }
}

impl FeatureVector for SparseVector {
    fn required_dim(&self) -> usize {
        self.max_index().map_or(0, |i| i + 1)
    }

    fn dot(&self, row: ArrayView1<'_, f64>) -> f64 {
        self.iter().map(|(i, v)| v * row[i]).sum()
    }

    fn scaled_add_to(&self, alpha: f64, mut row: ArrayViewMut1<'_, f64>) {
        for (i, v) in self.iter() {
            row[i] += alpha * v;
        }
    }

    fn squared_norm(&self) -> f64 {
        self.squared_norm
    }

    fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pairs_sorts() {
        let v = SparseVector::from_pairs(vec![(5, 1.0), (1, 2.0), (3, -1.0)]).unwrap();
        assert_eq!(v.indices(), &[1, 3, 5]);
        assert_eq!(v.values(), &[2.0, -1.0, 1.0]);
        assert_eq!(v.required_dim(), 6);
    }

    #[test]
    fn test_negative_index_rejected() {
        let err = SparseVector::from_pairs(vec![(0, 1.0), (-2, 1.0)]).unwrap_err();
        assert!(matches!(err, CpmError::InvalidIndex { index: -2, .. }));
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let err = SparseVector::from_pairs(vec![(4, 1.0), (4, 2.0)]).unwrap_err();
        assert!(matches!(err, CpmError::InvalidIndex { index: 4, .. }));
    }

    #[test]
    fn test_from_sorted_rejects_unsorted() {
        assert!(SparseVector::from_sorted(vec![0, 2, 1], vec![1.0; 3]).is_err());
        assert!(SparseVector::from_sorted(vec![0, 1], vec![1.0]).is_err());
        assert!(SparseVector::from_sorted(vec![0, 1, 7], vec![1.0; 3]).is_ok());
    }

    #[test]
    fn test_dot_matches_dense_expansion() {
        let dim = 17;
        let dense_w: Array1<f64> = (0..dim).map(|i| (i as f64 * 0.37).sin()).collect();

        let cases: Vec<Vec<(i64, f64)>> = vec![
            vec![],
            vec![(0, 1.5)],
            vec![(16, -2.0), (3, 0.25), (9, 4.0)],
            (0..dim as i64).map(|i| (i, i as f64 - 8.0)).collect(),
        ];

        for pairs in cases {
            let sv = SparseVector::from_pairs(pairs).unwrap();
            let expanded = sv.to_dense(dim).unwrap();
            let naive: f64 = expanded.iter().zip(dense_w.iter()).map(|(a, b)| a * b).sum();
            let fast = FeatureVector::dot(&sv, dense_w.view());
            assert!((naive - fast).abs() < 1e-9, "naive={} sparse={}", naive, fast);
        }
    }

    #[test]
    fn test_norm_and_scaled() {
        let v = SparseVector::from_pairs(vec![(0, 3.0), (2, 4.0)]).unwrap();
        assert!((v.norm() - 5.0).abs() < 1e-12);

        let w = v.scaled(2.0);
        assert!((w.norm() - 10.0).abs() < 1e-12);
        // Original untouched
        assert_eq!(v.values(), &[3.0, 4.0]);
    }

    #[test]
    fn test_from_dense_skips_zeros() {
        let v = SparseVector::from_dense(&[0.0, 1.0, 0.0, -2.0]);
        assert_eq!(v.indices(), &[1, 3]);
        assert_eq!(v.nnz(), 2);
    }

    #[test]
    fn test_to_dense_too_narrow() {
        let v = SparseVector::from_pairs(vec![(9, 1.0)]).unwrap();
        assert!(matches!(
            v.to_dense(5),
            Err(CpmError::DimensionMismatch { expected: 5, actual: 10 })
        ));
    }

    #[test]
    fn test_to_libsvm() {
        let v = SparseVector::from_pairs(vec![(3, 0.5), (1, 2.0)]).unwrap();
        assert_eq!(v.to_libsvm(), "1:2 3:0.5");
        assert_eq!(SparseVector::empty().to_libsvm(), "");
    }
}
