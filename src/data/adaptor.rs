//! Stochastic mini-batch iteration over a dataset.
//!
//! The adaptor owns the iteration state (permutation, cursor, epoch count);
//! the dataset itself is never mutated. A pass yields
//! `ceil(len / batch_size)` batches, the last possibly short, and then
//! reports [`BatchOutcome::EpochBoundary`] until [`StochasticDataAdaptor::reset`]
//! starts the next pass.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::dataset::{Dataset, Instance};
use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_SEED};
use crate::error::{CpmError, Result};

/// Batching configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaptorConfig {
    /// Examples per batch.
    pub batch_size: usize,

    /// Permute the order at the start of every epoch.
    pub shuffle: bool,

    /// Seed of the shuffle generator.
    pub seed: u64,
}

impl Default for AdaptorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            shuffle: true,
            seed: DEFAULT_SEED,
        }
    }
}

impl AdaptorConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// A mini-batch: dataset positions plus a borrow of the dataset.
#[derive(Clone, Debug)]
pub struct Batch<'a> {
    dataset: &'a Dataset,
    positions: Vec<usize>,
}

impl<'a> Batch<'a> {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Dataset positions in batch order.
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// `(position, instance)` pairs in batch order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &'a Instance)> + '_ {
        let dataset = self.dataset;
        self.positions
            .iter()
            .map(move |&i| (i, &dataset.instances()[i]))
    }
}

/// Result of asking the adaptor for more data.
#[derive(Debug)]
pub enum BatchOutcome<'a> {
    /// The next batch of the current epoch.
    Batch(Batch<'a>),

    /// The current pass is exhausted; call `reset()` to start another.
    EpochBoundary {
        /// Number of completed passes.
        epoch: usize,
    },
}

/// Lazy, restartable mini-batch source.
pub struct StochasticDataAdaptor<'a> {
    dataset: &'a Dataset,
    config: AdaptorConfig,
    order: Vec<usize>,
    cursor: usize,
    completed_epochs: usize,
    rng: StdRng,
}

impl<'a> StochasticDataAdaptor<'a> {
    pub fn new(dataset: &'a Dataset, config: AdaptorConfig) -> Result<Self> {
        if dataset.is_empty() {
            return Err(CpmError::EmptyDataset);
        }
        if config.batch_size == 0 {
            return Err(CpmError::invalid_parameter("batch_size must be > 0"));
        }

        let mut adaptor = Self {
            dataset,
            order: (0..dataset.len()).collect(),
            cursor: 0,
            completed_epochs: 0,
            rng: StdRng::seed_from_u64(config.seed),
            config,
        };
        if adaptor.config.shuffle {
            adaptor.order.shuffle(&mut adaptor.rng);
        }
        Ok(adaptor)
    }

    /// Next batch, or `EpochBoundary` once the pass is exhausted.
    pub fn next_batch(&mut self) -> BatchOutcome<'a> {
        if self.cursor >= self.order.len() {
            return BatchOutcome::EpochBoundary {
                epoch: self.completed_epochs + 1,
            };
        }
        let end = (self.cursor + self.config.batch_size).min(self.order.len());
        let positions = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        BatchOutcome::Batch(Batch {
            dataset: self.dataset,
            positions,
        })
    }

    /// Rewind to the start of a fresh epoch, reshuffling if configured.
    ///
    /// Only a pass that reached the end counts as completed. Shuffles draw
    /// from one seeded stream, so epoch `n` has the same order on every run.
    pub fn reset(&mut self) {
        if self.cursor >= self.order.len() {
            self.completed_epochs += 1;
        }
        self.cursor = 0;
        if self.config.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// Completed passes so far.
    pub fn epoch(&self) -> usize {
        self.completed_epochs
    }

    /// Batches in one full pass.
    pub fn batches_per_epoch(&self) -> usize {
        self.order.len().div_ceil(self.config.batch_size)
    }

    pub fn config(&self) -> &AdaptorConfig {
        &self.config
    }

    pub fn dataset(&self) -> &'a Dataset {
        self.dataset
    }
}
