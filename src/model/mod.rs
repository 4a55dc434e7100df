//! The polytope ensemble, its training step and its persistence.

pub mod assignment;
pub mod loss;
pub mod machine;
pub mod persistence;
pub mod schedule;
pub mod snapshot;

pub use loss::{Loss, LossKind};
pub use machine::{ConvexPolytopeMachine, CpmConfig, Initialization, ModelState, StepSummary};
pub use snapshot::ModelSnapshot;
