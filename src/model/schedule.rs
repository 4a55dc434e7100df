//! Learning-rate schedule.
//!
//! `lr(t) = lr0 / (1 + decay · t)`, where `t` counts processed examples.
//! The Pegasos rate `1 / (λ (t + 2))` is the special case
//! `lr0 = 1 / 2λ`, `decay = 1/2`.

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_DECAY, DEFAULT_LEARNING_RATE};
use crate::error::{CpmError, Result};

/// Inverse-time decaying step size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearningRate {
    /// `lr0`.
    pub initial: f64,

    /// Decay per processed example.
    pub decay: f64,
}

impl Default for LearningRate {
    fn default() -> Self {
        Self {
            initial: DEFAULT_LEARNING_RATE,
            decay: DEFAULT_DECAY,
        }
    }
}

impl LearningRate {
    pub fn new(initial: f64, decay: f64) -> Result<Self> {
        let rate = Self { initial, decay };
        rate.validate()?;
        Ok(rate)
    }

    /// Pegasos schedule for regularisation strength `lambda`.
    pub fn pegasos(lambda: f64) -> Result<Self> {
        if !(lambda.is_finite() && lambda > 0.0) {
            return Err(CpmError::invalid_parameter(format!(
                "pegasos lambda must be positive, got {}",
                lambda
            )));
        }
        Self::new(1.0 / (2.0 * lambda), 0.5)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.initial.is_finite() && self.initial >= 0.0) {
            return Err(CpmError::invalid_parameter(format!(
                "learning rate must be finite and >= 0, got {}",
                self.initial
            )));
        }
        if !(self.decay.is_finite() && self.decay >= 0.0) {
            return Err(CpmError::invalid_parameter(format!(
                "decay must be finite and >= 0, got {}",
                self.decay
            )));
        }
        Ok(())
    }

    /// Step size after `t` examples.
    pub fn at(&self, t: u64) -> f64 {
        self.initial / (1.0 + self.decay * t as f64)
    }
}
