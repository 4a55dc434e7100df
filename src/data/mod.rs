//! Dataset storage, libsvm ingestion and mini-batch sampling.

pub mod adaptor;
pub mod dataset;
pub mod libsvm;
