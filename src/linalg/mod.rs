//! Sparse and dense linear algebra for hyperplane scoring.

pub mod dense_matrix;
pub mod features;
pub mod sparse_vector;
