//! # polytope-machine
//!
//! Convex Polytope Machine: a binary classifier whose positive region is a
//! union of `K` convex polytopes, each the intersection of `M` half-spaces.
//!
//! ## Layout
//!
//! - [`linalg`]: sparse feature vectors and the lazily scaled weight matrix
//! - [`polytope`]: hyperplanes and the polytope structure over them
//! - [`data`]: datasets, libsvm ingestion, stochastic mini-batching
//! - [`model`]: the machine, its losses, learning-rate schedule,
//!   positive-instance assignment, snapshots and model files
//! - [`eval`]: metrics and sharded parallel evaluation
//! - [`runtime`]: the training driver and hyperparameter sweeps
//!
//! ## Example
//!
//! ```no_run
//! use polytope_machine::data::dataset::Dataset;
//! use polytope_machine::runtime::driver::{Cpm, FitOptions};
//!
//! # fn main() -> polytope_machine::error::Result<()> {
//! let train = Dataset::from_libsvm_file("train.svm".as_ref())?;
//! let mut cpm = Cpm::create(train.dimensions(), 8, 4, 0.1, 1e-4, 7)?;
//! let metrics = cpm.fit(&train, &FitOptions::default().with_epochs(10))?;
//! println!("{}", metrics);
//! cpm.save("model.cpm".as_ref())?;
//! # Ok(())
//! # }
//! ```

pub mod data;
pub mod error;
pub mod eval;
pub mod linalg;
pub mod model;
pub mod polytope;
pub mod runtime;

pub use error::{CpmError, Result};

/// Crate-wide defaults.
pub mod config {
    /// Constant feature multiplying every bias update.
    pub const BIAS_TERM: f64 = 1.0;

    /// Lazy row scales below this are folded into the weights.
    pub const MIN_SCALE: f64 = 1e-9;

    /// Margin of the hinge-family losses.
    pub const MARGIN: f64 = 1.0;

    /// Distinct positives per polytope before the entropy heuristic engages.
    pub const ENTROPY_WARMUP_FACTOR: usize = 5;

    /// Initial learning rate `lr0`.
    pub const DEFAULT_LEARNING_RATE: f64 = 0.1;

    /// Learning-rate decay per processed example.
    pub const DEFAULT_DECAY: f64 = 1e-4;

    /// L2 penalty.
    pub const DEFAULT_L2: f64 = 1e-4;

    /// Cost of negatives relative to positives.
    pub const DEFAULT_COST_RATIO: f64 = 1.0;

    pub const DEFAULT_POLYTOPES: usize = 1;

    pub const DEFAULT_HYPERPLANES: usize = 1;

    pub const DEFAULT_OUTER_LABEL: i32 = 1;

    pub const DEFAULT_SEED: u64 = 0x5eed;

    pub const DEFAULT_BATCH_SIZE: usize = 32;

    pub const DEFAULT_EPOCHS: usize = 10;

    /// Epochs without improvement tolerated by early stopping.
    pub const DEFAULT_PATIENCE: usize = 3;

    /// Model file magic.
    pub const MODEL_MAGIC: [u8; 4] = *b"CPMB";

    /// Model file format version.
    pub const FORMAT_VERSION: u32 = 1;
}
