//! Dense hyperplane weight storage.
//!
//! One row per hyperplane, one column per feature, plus a bias per row.
//! Each row carries a lazy multiplicative scale so that the L2 shrink applied
//! after every SGD step costs O(rows) instead of O(rows × dim):
//!
//!   effective_row(r) = scale[r] · stored_row(r)
//!
//! Biases are stored unscaled (already effective). The scale is folded back
//! into the stored weights whenever it drops below [`MIN_SCALE`].

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::features::FeatureVector;
use crate::config::{BIAS_TERM, MIN_SCALE};
use crate::error::{CpmError, Result};
use crate::polytope::hyperplane::Hyperplane;

/// Row-per-hyperplane weight matrix with biases.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseMatrix {
    /// Stored (unscaled) weights: [rows, dim].
    weights: Array2<f64>,

    /// Per-row lazy scale.
    scales: Array1<f64>,

    /// Effective biases.
    biases: Array1<f64>,

    /// Constant feature multiplying the bias on updates.
    bias_term: f64,
}

impl DenseMatrix {
    /// Zero-initialised `rows × dim` matrix.
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            weights: Array2::zeros((rows, dim)),
            scales: Array1::ones(rows),
            biases: Array1::zeros(rows),
            bias_term: BIAS_TERM,
        }
    }

    /// Build from an explicit weight matrix and bias vector.
    pub fn from_parts(weights: Array2<f64>, biases: Array1<f64>) -> Result<Self> {
        if weights.nrows() != biases.len() {
            return Err(CpmError::invalid_parameter(format!(
                "{} weight rows but {} biases",
                weights.nrows(),
                biases.len()
            )));
        }
        let rows = weights.nrows();
        Ok(Self {
            weights,
            scales: Array1::ones(rows),
            biases,
            bias_term: BIAS_TERM,
        })
    }

    /// Number of hyperplanes.
    pub fn rows(&self) -> usize {
        self.weights.nrows()
    }

    /// Feature dimensionality.
    pub fn dim(&self) -> usize {
        self.weights.ncols()
    }

    fn check_row(&self, row: usize) -> Result<()> {
        if row >= self.rows() {
            return Err(CpmError::out_of_range("hyperplane", row, self.rows()));
        }
        Ok(())
    }

    fn check_features<F: FeatureVector>(&self, x: &F) -> Result<()> {
        let needed = x.required_dim();
        if needed > self.dim() {
            return Err(CpmError::dimension_mismatch(self.dim(), needed));
        }
        Ok(())
    }

    /// Copy out one hyperplane with its scale applied.
    pub fn row(&self, row: usize) -> Result<Hyperplane> {
        self.check_row(row)?;
        let scale = self.scales[row];
        let weights = self.weights.row(row).mapv(|w| w * scale);
        Ok(Hyperplane::new(weights, self.biases[row]))
    }

    /// Overwrite one hyperplane.
    pub fn set_row(&mut self, row: usize, hyperplane: &Hyperplane) -> Result<()> {
        self.check_row(row)?;
        if hyperplane.dim() != self.dim() {
            return Err(CpmError::dimension_mismatch(self.dim(), hyperplane.dim()));
        }
        self.weights.row_mut(row).assign(&hyperplane.weights);
        self.scales[row] = 1.0;
        self.biases[row] = hyperplane.bias;
        Ok(())
    }

    /// Margin of a single hyperplane.
    pub fn margin<F: FeatureVector>(&self, row: usize, x: &F) -> Result<f64> {
        self.check_row(row)?;
        self.check_features(x)?;
        Ok(self.margin_unchecked(row, x))
    }

    fn margin_unchecked<F: FeatureVector>(&self, row: usize, x: &F) -> f64 {
        x.dot(self.weights.row(row)) * self.scales[row] + self.biases[row]
    }

    /// Margins of every hyperplane, `out[r] = w_r · x + b_r`.
    pub fn margins<F: FeatureVector>(&self, x: &F) -> Result<Array1<f64>> {
        self.check_features(x)?;
        Ok((0..self.rows())
            .map(|r| self.margin_unchecked(r, x))
            .collect())
    }

    /// `w_row += alpha · x`, `b_row += alpha · bias_term`.
    pub fn add_to_row<F: FeatureVector>(&mut self, row: usize, alpha: f64, x: &F) -> Result<()> {
        self.check_row(row)?;
        self.check_features(x)?;
        let scale = self.scales[row];
        x.scaled_add_to(alpha / scale, self.weights.row_mut(row));
        self.biases[row] += alpha * self.bias_term;
        Ok(())
    }

    /// `W *= factor` for every row and bias (the L2 shrink).
    ///
    /// A non-positive factor zeroes the matrix.
    pub fn shrink(&mut self, factor: f64) {
        if factor == 1.0 {
            return;
        }
        if factor <= 0.0 {
            self.clear();
            return;
        }
        self.scales.mapv_inplace(|s| s * factor);
        self.biases.mapv_inplace(|b| b * factor);
        if self.scales.iter().any(|&s| s < MIN_SCALE) {
            self.fold_scales();
        }
    }

    /// Apply every lazy scale to the stored weights and reset scales to 1.
    pub fn fold_scales(&mut self) {
        for (mut row, scale) in self.weights.axis_iter_mut(Axis(0)).zip(self.scales.iter_mut()) {
            let s = *scale;
            row.mapv_inplace(|w| w * s);
            *scale = 1.0;
        }
    }

    /// Zero every weight and bias.
    pub fn clear(&mut self) {
        self.weights.fill(0.0);
        self.scales.fill(1.0);
        self.biases.fill(0.0);
    }

    /// Frobenius norm of the effective weights (biases excluded).
    pub fn l2_norm(&self) -> f64 {
        self.weights
            .axis_iter(Axis(0))
            .zip(self.scales.iter())
            .map(|(row, &s)| row.iter().map(|w| (w * s) * (w * s)).sum::<f64>())
            .sum::<f64>()
            .sqrt()
    }

    /// Effective weight matrix (scales applied).
    pub fn effective_weights(&self) -> Array2<f64> {
        let mut out = self.weights.clone();
        for (mut row, &s) in out.axis_iter_mut(Axis(0)).zip(self.scales.iter()) {
            row.mapv_inplace(|w| w * s);
        }
        out
    }

    pub fn biases(&self) -> &Array1<f64> {
        &self.biases
    }

    /// Structural check for matrices built outside this module (model files):
    /// one positive finite scale and one finite bias per row, finite weights.
    pub fn validate(&self) -> Result<()> {
        let rows = self.rows();
        if self.scales.len() != rows || self.biases.len() != rows {
            return Err(CpmError::invalid_parameter(format!(
                "{} weight rows but {} scales and {} biases",
                rows,
                self.scales.len(),
                self.biases.len()
            )));
        }
        if self.scales.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(CpmError::invalid_parameter("row scales must be finite and positive"));
        }
        if !self.bias_term.is_finite() || !self.is_finite() {
            return Err(CpmError::invalid_parameter("weight matrix holds non-finite values"));
        }
        Ok(())
    }

    /// Whether every weight, scale and bias is finite.
    pub fn is_finite(&self) -> bool {
        self.weights.iter().all(|v| v.is_finite())
            && self.scales.iter().all(|v| v.is_finite())
            && self.biases.iter().all(|v| v.is_finite())
    }
}
