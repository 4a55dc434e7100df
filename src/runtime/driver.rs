//! Training driver: epochs, stopping criteria, telemetry and checkpoints.
//!
//! [`Cpm`] owns a [`ConvexPolytopeMachine`] and is the only writer of its
//! weights. Each epoch drains a [`StochasticDataAdaptor`], feeding every
//! batch to `step()`, then logs the epoch telemetry. Training ends after
//! the configured number of epochs, when the epoch loss stops improving, or
//! when the stop flag returned by [`Cpm::stop_handle`] is raised.
//!
//! With `eval_every > 0` the driver also scores a snapshot of the model
//! every few epochs, on a held-out set when one is given.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::monitor::ConvergenceMonitor;
use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_EPOCHS, DEFAULT_PATIENCE, DEFAULT_SEED};
use crate::data::adaptor::{AdaptorConfig, BatchOutcome, StochasticDataAdaptor};
use crate::data::dataset::Dataset;
use crate::error::{CpmError, Result};
use crate::eval::metrics::Metrics;
use crate::eval::parallel::{self, EvalOptions, ScoredInstance};
use crate::linalg::features::FeatureVector;
use crate::model::machine::{ConvexPolytopeMachine, CpmConfig, ModelState, StepSummary};

/// Options for [`Cpm::fit`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    /// Maximum number of passes over the training set.
    pub epochs: usize,

    pub batch_size: usize,

    /// Reshuffle the training set every epoch.
    pub shuffle: bool,

    /// Seed of the shuffle.
    pub seed: u64,

    /// Minimum epoch-loss improvement; `0` disables early stopping.
    pub tolerance: f64,

    /// Epochs without improvement before stopping.
    pub patience: usize,

    /// Workers for evaluation (`0` = all cores).
    pub num_workers: usize,

    /// Evaluate every this many epochs; `0` only evaluates at the end.
    pub eval_every: usize,

    /// Write the model here every `checkpoint_every` epochs.
    pub checkpoint_path: Option<PathBuf>,

    pub checkpoint_every: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            shuffle: true,
            seed: DEFAULT_SEED,
            tolerance: 0.0,
            patience: DEFAULT_PATIENCE,
            num_workers: 0,
            eval_every: 0,
            checkpoint_path: None,
            checkpoint_every: 0,
        }
    }
}

impl FitOptions {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

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

    pub fn with_early_stopping(mut self, tolerance: f64, patience: usize) -> Self {
        self.tolerance = tolerance;
        self.patience = patience;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_eval_every(mut self, epochs: usize) -> Self {
        self.eval_every = epochs;
        self
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>, every: usize) -> Self {
        self.checkpoint_path = Some(path.into());
        self.checkpoint_every = every;
        self
    }
}

/// Per-epoch training statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochTelemetry {
    pub epoch: usize,
    /// Owner changes per positive seen.
    pub reassignment_rate: f64,
    /// Mean exclusion loss over positives.
    pub redundancy: f64,
    /// Assignment entropy in bits at the end of the epoch.
    pub entropy: f64,
    pub negative_loss: f64,
    pub positive_loss: f64,
    /// Mean loss over every example of the epoch.
    pub loss: f64,
    pub examples: usize,
    pub elapsed_ms: f64,
    /// Set on epochs where periodic evaluation ran.
    pub metrics: Option<Metrics>,
}

impl EpochTelemetry {
    fn from_summary(epoch: usize, summary: &StepSummary, entropy: f64, elapsed_ms: f64) -> Self {
        let per = |v: f64, n: usize| if n == 0 { 0.0 } else { v / n as f64 };
        Self {
            epoch,
            reassignment_rate: per(summary.reassignments as f64, summary.positives),
            redundancy: per(summary.redundancy, summary.positives),
            entropy,
            negative_loss: per(summary.negative_loss, summary.negatives),
            positive_loss: per(summary.positive_loss, summary.positives),
            loss: per(summary.positive_loss + summary.negative_loss, summary.examples),
            examples: summary.examples,
            elapsed_ms,
            metrics: None,
        }
    }
}

/// Why [`Cpm::fit`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxEpochs,
    Converged,
    Cancelled,
}

/// Model plus training loop.
pub struct Cpm {
    model: ConvexPolytopeMachine,
    stop: Arc<AtomicBool>,
    history: Vec<EpochTelemetry>,
    stop_reason: Option<StopReason>,
    /// Fingerprint of the dataset the assignment history refers to.
    trained_on: Option<u64>,
}

impl Cpm {
    /// A zero-initialised, `Ready` model with default regularisation.
    pub fn create(
        dimensions: usize,
        polytopes: usize,
        hyperplanes_per_polytope: usize,
        learning_rate: f64,
        decay: f64,
        seed: u64,
    ) -> Result<Self> {
        let config = CpmConfig::new(dimensions, polytopes, hyperplanes_per_polytope)
            .with_learning_rate(learning_rate, decay)
            .with_seed(seed);
        Self::from_config(config)
    }

    /// Build and initialise a model from a full configuration.
    pub fn from_config(config: CpmConfig) -> Result<Self> {
        let mut model = ConvexPolytopeMachine::new(config)?;
        model.initialize()?;
        Ok(Self::from_model(model))
    }

    pub fn from_model(model: ConvexPolytopeMachine) -> Self {
        Self {
            model,
            stop: Arc::new(AtomicBool::new(false)),
            history: Vec::new(),
            stop_reason: None,
            trained_on: None,
        }
    }

    pub fn model(&self) -> &ConvexPolytopeMachine {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut ConvexPolytopeMachine {
        &mut self.model
    }

    pub fn into_model(self) -> ConvexPolytopeMachine {
        self.model
    }

    /// Flag checked between steps; raising it stops the running `fit`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Telemetry of every epoch run so far.
    pub fn history(&self) -> &[EpochTelemetry] {
        &self.history
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Train on `dataset` and return metrics on the same dataset.
    ///
    /// Refitting on the same dataset continues from the current assignment
    /// history; a different dataset starts a fresh one.
    pub fn fit(&mut self, dataset: &Dataset, options: &FitOptions) -> Result<Metrics> {
        self.fit_with_validation(dataset, None, options)
    }

    /// Like [`Cpm::fit`], but periodic evaluation (`eval_every`) scores
    /// `validation` instead of the training set.
    pub fn fit_with_validation(
        &mut self,
        dataset: &Dataset,
        validation: Option<&Dataset>,
        options: &FitOptions,
    ) -> Result<Metrics> {
        for ds in std::iter::once(dataset).chain(validation) {
            if ds.is_empty() {
                return Err(CpmError::EmptyDataset);
            }
            if ds.dimensions() > self.model.dimensions() {
                return Err(CpmError::dimension_mismatch(
                    self.model.dimensions(),
                    ds.dimensions(),
                ));
            }
        }
        if self.model.state() == ModelState::Stopped {
            self.model.resume()?;
        }
        self.stop.store(false, Ordering::SeqCst);

        let outer = self.model.config().outer_label;
        let fingerprint = dataset.fingerprint();
        let stale = match self.trained_on {
            Some(previous) => previous != fingerprint,
            None => self.model.tracker().distinct() > dataset.count(outer),
        };
        if stale && self.model.tracker().distinct() > 0 {
            tracing::info!("Training set changed, clearing the positive assignment history");
            self.model.reset_assignments();
        }
        self.trained_on = Some(fingerprint);

        tracing::info!(
            "Training on {} instances ({} positives, {} negatives), {} epochs, batch size {}",
            dataset.len(),
            dataset.count(outer),
            dataset.len() - dataset.count(outer),
            options.epochs,
            options.batch_size
        );

        let mut adaptor = StochasticDataAdaptor::new(
            dataset,
            AdaptorConfig::default()
                .with_batch_size(options.batch_size)
                .with_shuffle(options.shuffle)
                .with_seed(options.seed),
        )?;
        let mut monitor = ConvergenceMonitor::new(options.tolerance, options.patience);
        let mut reason = StopReason::MaxEpochs;
        let started = Instant::now();

        'epochs: for epoch in 1..=options.epochs {
            let epoch_start = Instant::now();
            let mut summary = StepSummary::default();
            loop {
                if self.stop.load(Ordering::SeqCst) {
                    reason = StopReason::Cancelled;
                    break 'epochs;
                }
                match adaptor.next_batch() {
                    BatchOutcome::Batch(batch) => {
                        let step = self.model.step(&batch)?;
                        summary.merge(&step);
                    }
                    BatchOutcome::EpochBoundary { .. } => break,
                }
            }
            adaptor.reset();

            let mut telemetry = EpochTelemetry::from_summary(
                epoch,
                &summary,
                self.model.tracker().entropy_bits(),
                epoch_start.elapsed().as_secs_f64() * 1000.0,
            );
            tracing::info!(
                "Epoch {}\treassignments {:.4}\tredundancy {:.4}\tentropy {:.4}\tneg loss {:.6}\tpos loss {:.6}",
                telemetry.epoch,
                telemetry.reassignment_rate,
                telemetry.redundancy,
                telemetry.entropy,
                telemetry.negative_loss,
                telemetry.positive_loss
            );
            if options.eval_every > 0 && epoch % options.eval_every == 0 {
                let target = validation.unwrap_or(dataset);
                let metrics = parallel::evaluate(
                    &self.model.snapshot()?,
                    target,
                    &EvalOptions::default().with_workers(options.num_workers),
                )?;
                tracing::info!(
                    "Epoch {} evaluation\taccuracy {:.4}\tauc {:.4}\tloss {:.6}",
                    epoch,
                    metrics.accuracy,
                    metrics.auc,
                    metrics.loss
                );
                telemetry.metrics = Some(metrics);
            }
            let loss = telemetry.loss;
            self.history.push(telemetry);

            if let Some(path) = &options.checkpoint_path {
                if options.checkpoint_every > 0 && epoch % options.checkpoint_every == 0 {
                    self.model.save(path)?;
                    tracing::info!("Checkpoint after epoch {} written to {}", epoch, path.display());
                }
            }

            if monitor.observe(loss) {
                reason = StopReason::Converged;
                break;
            }
        }

        self.model.stop();
        self.stop_reason = Some(reason);
        tracing::info!(
            "Training stopped ({:?}) after {} iterations in {:.2}s",
            reason,
            self.model.iterations(),
            started.elapsed().as_secs_f64()
        );

        self.evaluate(dataset, options.num_workers)
    }

    pub fn predict<F: FeatureVector>(&self, x: &F) -> Result<i8> {
        self.model.predict(x)
    }

    /// ±1 predictions for many inputs, scored in parallel.
    pub fn predict_batch<F>(&self, inputs: &[F]) -> Result<Vec<i8>>
    where
        F: FeatureVector + Sync,
    {
        parallel::predict_batch(&self.model.snapshot()?, inputs, 0)
    }

    pub fn evaluate(&self, dataset: &Dataset, num_workers: usize) -> Result<Metrics> {
        self.evaluate_with(dataset, &EvalOptions::default().with_workers(num_workers))
    }

    pub fn evaluate_with(&self, dataset: &Dataset, options: &EvalOptions) -> Result<Metrics> {
        parallel::evaluate(&self.model.snapshot()?, dataset, options)
    }

    /// Raw score and polytope of every instance.
    pub fn score(&self, dataset: &Dataset, num_workers: usize) -> Result<Vec<ScoredInstance>> {
        parallel::score_dataset(&self.model.snapshot()?, dataset, num_workers)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.model.save(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_model(ConvexPolytopeMachine::load(path)?))
    }
}
