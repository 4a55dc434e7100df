//! Training orchestration.
//!
//! - [`driver::Cpm`]: epochs, early stopping, cancellation, checkpoints
//! - [`monitor`]: rolling epoch-loss tracking
//! - [`sweep`]: several configurations trained side by side

pub mod driver;
pub mod monitor;
pub mod sweep;
