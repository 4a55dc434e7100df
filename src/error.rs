//! Error types for the polytope machine.
//!
//! Every fallible library operation returns [`Result`]. Reaching the end of
//! an epoch is not an error: the data adaptor reports it as
//! [`BatchOutcome::EpochBoundary`](crate::data::adaptor::BatchOutcome).

use thiserror::Error;

use crate::model::machine::ModelState;

/// Errors raised by model construction, training, evaluation and persistence.
#[derive(Debug, Error)]
pub enum CpmError {
    /// Malformed sparse input (negative or repeated feature index).
    #[error("Invalid feature index {index}: {reason}")]
    InvalidIndex {
        /// Offending index as supplied by the caller.
        index: i64,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A hyperplane or polytope index past the end of the ensemble.
    #[error("{what} index {index} out of range (len {len})")]
    IndexOutOfRange {
        /// Kind of object being indexed.
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// An operation was called out of sequence.
    #[error("Operation '{operation}' is invalid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ModelState,
    },

    /// A dataset with no instances was supplied where data is required.
    #[error("Dataset is empty")]
    EmptyDataset,

    /// A feature vector is wider than the model dimensionality.
    #[error("Dimension mismatch: expected at most {expected}, actual {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// An evaluation worker hit an unrecoverable error.
    #[error("Evaluation failed on instance {instance}: {message}")]
    EvaluationFailed { instance: usize, message: String },

    /// A configuration value is out of its valid domain.
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Malformed libsvm text.
    #[error("Parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl CpmError {
    pub fn invalid_index(index: i64, reason: &'static str) -> Self {
        Self::InvalidIndex { index, reason }
    }

    pub fn out_of_range(what: &'static str, index: usize, len: usize) -> Self {
        Self::IndexOutOfRange { what, index, len }
    }

    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    pub fn evaluation_failed(instance: usize, message: impl Into<String>) -> Self {
        Self::EvaluationFailed {
            instance,
            message: message.into(),
        }
    }
}

/// Library result alias.
pub type Result<T> = std::result::Result<T, CpmError>;
