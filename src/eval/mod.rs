//! Metrics and parallel evaluation.

pub mod metrics;
pub mod parallel;

pub use metrics::{Metrics, MetricAccumulator};
pub use parallel::{evaluate, EvalOptions};
