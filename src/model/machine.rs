//! The Convex Polytope Machine.
//!
//! `K` polytopes of `M` hyperplanes each, trained by per-example SGD.
//! A positive example is attributed to one polytope and pulls that
//! polytope's weakest hyperplane towards it; a negative example pushes the
//! weakest hyperplane of every polytope that still (nearly) accepts it.
//! After every example the whole weight matrix is shrunk for L2
//! regularisation.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::assignment::AssignmentTracker;
use super::loss::{Loss, LossKind};
use super::schedule::LearningRate;
use super::snapshot::{forward, ModelSnapshot};
use crate::config::{
    DEFAULT_COST_RATIO, DEFAULT_HYPERPLANES, DEFAULT_L2, DEFAULT_OUTER_LABEL, DEFAULT_POLYTOPES,
    DEFAULT_SEED,
};
use crate::data::adaptor::Batch;
use crate::data::dataset::Instance;
use crate::error::{CpmError, Result};
use crate::linalg::dense_matrix::DenseMatrix;
use crate::linalg::features::FeatureVector;
use crate::polytope::hyperplane::Hyperplane;
use crate::polytope::layout::{Polytope, PolytopeLayout, PolytopeScores};

/// Lifecycle of a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelState {
    Uninitialized,
    Ready,
    Training,
    Stopped,
}

/// Initial weight distribution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Initialization {
    Zeros,
    /// i.i.d. `N(0, std_dev²)` weights, zero biases.
    Gaussian { std_dev: f64 },
}

/// Model hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CpmConfig {
    /// Feature dimensionality `D`.
    pub dimensions: usize,

    /// Number of polytopes `K`.
    pub polytopes: usize,

    /// Hyperplanes per polytope `M`.
    pub hyperplanes_per_polytope: usize,

    pub learning_rate: LearningRate,

    /// L2 penalty applied through the per-example shrink.
    pub l2: f64,

    /// Cost of negatives relative to positives.
    pub cost_ratio: f64,

    /// Entropy floor as an effective polytope count in `[1, K]`.
    /// `1` disables the heuristic assignment.
    pub min_effective_polytopes: f64,

    /// Raw label treated as the positive class.
    pub outer_label: i32,

    pub loss: LossKind,

    pub initialization: Initialization,

    /// Seed for random initialisation.
    pub seed: u64,
}

impl Default for CpmConfig {
    fn default() -> Self {
        Self {
            dimensions: 0,
            polytopes: DEFAULT_POLYTOPES,
            hyperplanes_per_polytope: DEFAULT_HYPERPLANES,
            learning_rate: LearningRate::default(),
            l2: DEFAULT_L2,
            cost_ratio: DEFAULT_COST_RATIO,
            min_effective_polytopes: 1.0,
            outer_label: DEFAULT_OUTER_LABEL,
            loss: LossKind::default(),
            initialization: Initialization::Zeros,
            seed: DEFAULT_SEED,
        }
    }
}

impl CpmConfig {
    pub fn new(dimensions: usize, polytopes: usize, hyperplanes_per_polytope: usize) -> Self {
        Self {
            dimensions,
            polytopes,
            hyperplanes_per_polytope,
            ..Self::default()
        }
    }

    pub fn with_learning_rate(mut self, initial: f64, decay: f64) -> Self {
        self.learning_rate = LearningRate { initial, decay };
        self
    }

    /// Pegasos schedule and matching L2 penalty for regularisation factor
    /// `c` spread over a run of `total_steps` examples:
    /// `λ = 1 / (c · total_steps)`, `lr(t) = 1 / (λ (t + 2))`, `l2 = λ`.
    pub fn with_regularization(mut self, c: f64, total_steps: u64) -> Result<Self> {
        if !(c.is_finite() && c > 0.0) {
            return Err(CpmError::invalid_parameter(format!(
                "regularisation factor must be positive, got {}",
                c
            )));
        }
        if total_steps == 0 {
            return Err(CpmError::invalid_parameter("total_steps must be > 0"));
        }
        let lambda = 1.0 / (c * total_steps as f64);
        self.learning_rate = LearningRate::pegasos(lambda)?;
        self.l2 = lambda;
        Ok(self)
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    pub fn with_cost_ratio(mut self, cost_ratio: f64) -> Self {
        self.cost_ratio = cost_ratio;
        self
    }

    pub fn with_min_effective_polytopes(mut self, k: f64) -> Self {
        self.min_effective_polytopes = k;
        self
    }

    pub fn with_outer_label(mut self, label: i32) -> Self {
        self.outer_label = label;
        self
    }

    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_initialization(mut self, initialization: Initialization) -> Self {
        self.initialization = initialization;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Cost applied to positive updates.
    pub fn positive_cost(&self) -> f64 {
        1.0 / (1.0 + self.cost_ratio)
    }

    /// Cost applied to negative updates.
    pub fn negative_cost(&self) -> f64 {
        self.cost_ratio / (1.0 + self.cost_ratio)
    }

    pub fn validate(&self) -> Result<PolytopeLayout> {
        if self.dimensions == 0 {
            return Err(CpmError::invalid_parameter("dimensions must be > 0"));
        }
        let layout = PolytopeLayout::new(self.polytopes, self.hyperplanes_per_polytope)?;
        let fits = layout
            .total_hyperplanes()
            .checked_mul(self.dimensions)
            .and_then(|n| n.checked_mul(std::mem::size_of::<f64>()))
            .is_some_and(|bytes| bytes <= isize::MAX as usize);
        if !fits {
            return Err(CpmError::invalid_parameter(format!(
                "{} hyperplanes of dimension {} do not fit in memory",
                layout.total_hyperplanes(),
                self.dimensions
            )));
        }
        self.learning_rate.validate()?;
        if !(self.l2.is_finite() && self.l2 >= 0.0) {
            return Err(CpmError::invalid_parameter(format!(
                "l2 must be finite and >= 0, got {}",
                self.l2
            )));
        }
        if !(self.cost_ratio.is_finite() && self.cost_ratio > 0.0) {
            return Err(CpmError::invalid_parameter(format!(
                "cost ratio must be positive, got {}",
                self.cost_ratio
            )));
        }
        let k = self.polytopes as f64;
        if !(self.min_effective_polytopes >= 1.0 && self.min_effective_polytopes <= k) {
            return Err(CpmError::invalid_parameter(format!(
                "minimum effective polytopes must lie in [1, {}], got {}",
                self.polytopes, self.min_effective_polytopes
            )));
        }
        if let Initialization::Gaussian { std_dev } = self.initialization {
            if !(std_dev.is_finite() && std_dev >= 0.0) {
                return Err(CpmError::invalid_parameter(format!(
                    "initial std dev must be finite and >= 0, got {}",
                    std_dev
                )));
            }
        }
        Ok(layout)
    }
}

/// Aggregate of one or more SGD steps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepSummary {
    pub examples: usize,
    pub positives: usize,
    pub negatives: usize,
    /// Summed loss of the attributed polytope over positives.
    pub positive_loss: f64,
    /// Summed loss of the best polytope over negatives.
    pub negative_loss: f64,
    /// Summed exclusion loss over positives.
    pub redundancy: f64,
    /// Positives whose owner changed.
    pub reassignments: usize,
    /// Hyperplane updates applied.
    pub updates: usize,
}

impl StepSummary {
    pub fn merge(&mut self, other: &StepSummary) {
        self.examples += other.examples;
        self.positives += other.positives;
        self.negatives += other.negatives;
        self.positive_loss += other.positive_loss;
        self.negative_loss += other.negative_loss;
        self.redundancy += other.redundancy;
        self.reassignments += other.reassignments;
        self.updates += other.updates;
    }
}

/// Trainable polytope ensemble.
#[derive(Clone, Debug)]
pub struct ConvexPolytopeMachine {
    config: CpmConfig,
    layout: PolytopeLayout,
    weights: DenseMatrix,
    tracker: AssignmentTracker,
    state: ModelState,
    iterations: u64,
    version: u64,
}

impl ConvexPolytopeMachine {
    /// Allocate an uninitialised model.
    pub fn new(config: CpmConfig) -> Result<Self> {
        let layout = config.validate()?;
        Ok(Self {
            weights: DenseMatrix::zeros(layout.total_hyperplanes(), config.dimensions),
            tracker: AssignmentTracker::new(layout.polytopes, config.min_effective_polytopes),
            config,
            layout,
            state: ModelState::Uninitialized,
            iterations: 0,
            version: 0,
        })
    }

    pub(crate) fn from_parts(
        config: CpmConfig,
        weights: DenseMatrix,
        tracker: AssignmentTracker,
        iterations: u64,
    ) -> Result<Self> {
        let layout = config.validate()?;
        if weights.rows() != layout.total_hyperplanes() {
            return Err(CpmError::invalid_parameter(format!(
                "{} weight rows for {} hyperplanes",
                weights.rows(),
                layout.total_hyperplanes()
            )));
        }
        if weights.dim() != config.dimensions {
            return Err(CpmError::dimension_mismatch(config.dimensions, weights.dim()));
        }
        weights.validate()?;
        tracker.validate(layout.polytopes)?;
        Ok(Self {
            config,
            layout,
            weights,
            tracker,
            state: ModelState::Ready,
            iterations,
            version: iterations,
        })
    }

    /// (Re)initialise parameters and move to `Ready`.
    pub fn initialize(&mut self) -> Result<()> {
        let rows = self.layout.total_hyperplanes();
        let dim = self.config.dimensions;
        self.weights = match self.config.initialization {
            Initialization::Zeros => DenseMatrix::zeros(rows, dim),
            Initialization::Gaussian { std_dev } => {
                let normal = Normal::new(0.0, std_dev)
                    .map_err(|e| CpmError::invalid_parameter(e.to_string()))?;
                let mut rng = StdRng::seed_from_u64(self.config.seed);
                let weights = Array2::from_shape_fn((rows, dim), |_| normal.sample(&mut rng));
                DenseMatrix::from_parts(weights, Array1::zeros(rows))?
            }
        };
        self.tracker.clear();
        self.iterations = 0;
        self.version += 1;
        self.state = ModelState::Ready;
        Ok(())
    }

    /// Forget which polytope owns each positive. Positive ids are only
    /// meaningful for the dataset they were drawn from.
    pub fn reset_assignments(&mut self) {
        self.tracker.clear();
    }

    /// Leave `Training` (or `Ready`) for good; further steps are rejected.
    pub fn stop(&mut self) {
        if self.state != ModelState::Uninitialized {
            self.state = ModelState::Stopped;
        }
    }

    /// Re-open a stopped model for another round of training.
    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            ModelState::Stopped => {
                self.state = ModelState::Ready;
                Ok(())
            }
            ModelState::Ready | ModelState::Training => Ok(()),
            state => Err(CpmError::InvalidState {
                operation: "resume",
                state,
            }),
        }
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn config(&self) -> &CpmConfig {
        &self.config
    }

    pub fn layout(&self) -> &PolytopeLayout {
        &self.layout
    }

    pub fn weights(&self) -> &DenseMatrix {
        &self.weights
    }

    pub fn tracker(&self) -> &AssignmentTracker {
        &self.tracker
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Examples processed since initialisation.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Monotone counter bumped by every parameter change.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn require_initialized(&self, operation: &'static str) -> Result<()> {
        if self.state == ModelState::Uninitialized {
            return Err(CpmError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    pub fn hyperplane(&self, h: usize) -> Result<Hyperplane> {
        self.weights.row(h)
    }

    pub fn set_hyperplane(&mut self, h: usize, hyperplane: &Hyperplane) -> Result<()> {
        self.weights.set_row(h, hyperplane)?;
        self.version += 1;
        Ok(())
    }

    /// Copy of polytope `p` with its member hyperplanes.
    pub fn polytope(&self, p: usize) -> Result<Polytope> {
        let hyperplanes = self
            .layout
            .members(p)?
            .map(|h| self.weights.row(h))
            .collect::<Result<Vec<_>>>()?;
        Ok(Polytope::new(hyperplanes))
    }

    pub fn scores<F: FeatureVector>(&self, x: &F) -> Result<PolytopeScores> {
        self.require_initialized("score")?;
        forward(&self.weights, &self.layout, x)
    }

    /// Model score and the polytope attaining it.
    pub fn decision<F: FeatureVector>(&self, x: &F) -> Result<(f64, usize)> {
        let (p, s) = self.scores(x)?.best();
        Ok((s, p))
    }

    /// ±1 prediction; +1 iff some polytope accepts `x`.
    pub fn predict<F: FeatureVector>(&self, x: &F) -> Result<i8> {
        Ok(self.scores(x)?.label())
    }

    /// Full-copy, immutable view for concurrent evaluation.
    pub fn snapshot(&self) -> Result<Arc<ModelSnapshot>> {
        self.require_initialized("snapshot")?;
        Ok(ModelSnapshot::new(
            self.version,
            self.layout,
            self.weights.clone(),
            self.config.outer_label,
            self.config.loss,
        ))
    }

    /// One SGD pass over a mini-batch.
    pub fn step(&mut self, batch: &Batch<'_>) -> Result<StepSummary> {
        self.step_instances(batch.iter().map(|(_, inst)| inst))
    }

    /// One SGD pass over arbitrary instances, in order.
    ///
    /// The whole batch is validated before any update is applied.
    pub fn step_instances<'i, I>(&mut self, instances: I) -> Result<StepSummary>
    where
        I: IntoIterator<Item = &'i Instance>,
    {
        match self.state {
            ModelState::Ready | ModelState::Training => {}
            state => {
                return Err(CpmError::InvalidState {
                    operation: "step",
                    state,
                })
            }
        }

        let batch: Vec<&Instance> = instances.into_iter().collect();
        for (i, inst) in batch.iter().enumerate() {
            let needed = inst.features.required_dim();
            if needed > self.config.dimensions {
                return Err(CpmError::dimension_mismatch(self.config.dimensions, needed));
            }
            if !inst.features.is_finite() {
                return Err(CpmError::invalid_parameter(format!(
                    "batch entry {} has non-finite feature values",
                    i
                )));
            }
        }

        self.state = ModelState::Training;
        let mut summary = StepSummary::default();
        for inst in batch {
            self.step_one(inst, &mut summary)?;
        }
        Ok(summary)
    }

    fn step_one(&mut self, inst: &Instance, summary: &mut StepSummary) -> Result<()> {
        let eta = self.config.learning_rate.at(self.iterations);
        let scores = forward(&self.weights, &self.layout, &inst.features)?;
        let loss = self.config.loss;
        let mut updates: Vec<(usize, f64)> = Vec::new();

        summary.examples += 1;
        match inst.positive_id(self.config.outer_label) {
            Some(id) => {
                let previous = self.tracker.assignment(id);
                let attribution = self.tracker.choose(id, &scores.scores);
                let p = attribution.update;
                let score = scores.scores[p];

                let coeff = eta * self.config.positive_cost() * loss.gain(score);
                if coeff != 0.0 {
                    updates.push((scores.weakest[p], coeff));
                }

                summary.positives += 1;
                summary.positive_loss += loss.value(score);
                summary.redundancy += scores.exclusion_loss(p);
                if previous.is_some_and(|old| old != attribution.assigned) {
                    summary.reassignments += 1;
                }
                self.tracker.record(id, attribution.assigned);
            }
            None => {
                let negative_cost = self.config.negative_cost();
                for (p, &score) in scores.scores.iter().enumerate() {
                    let coeff = eta * negative_cost * loss.gain(-score);
                    if coeff != 0.0 {
                        updates.push((scores.weakest[p], -coeff));
                    }
                }
                summary.negatives += 1;
                summary.negative_loss += loss.value(-scores.score());
            }
        }

        summary.updates += updates.len();
        for (row, alpha) in updates {
            self.weights.add_to_row(row, alpha, &inst.features)?;
        }
        self.weights.shrink((1.0 - eta * self.config.l2).max(0.0));

        self.iterations += 1;
        self.version += 1;
        Ok(())
    }

    /// Human-readable description of the model.
    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            state: self.state,
            dimensions: self.config.dimensions,
            polytopes: self.layout.polytopes,
            hyperplanes_per_polytope: self.layout.hyperplanes_per_polytope,
            outer_label: self.config.outer_label,
            iterations: self.iterations,
            learning_rate: self.config.learning_rate,
            l2: self.config.l2,
            cost_ratio: self.config.cost_ratio,
            min_effective_polytopes: self.config.min_effective_polytopes,
            loss: self.config.loss,
            seed: self.config.seed,
            positives_seen: self.tracker.distinct(),
            occupancy: self.tracker.occupancy().to_vec(),
            active_polytopes: self.tracker.active_polytopes(),
            weight_norm: self.weights.l2_norm(),
        }
    }
}

/// Snapshot of model metadata for display.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSummary {
    pub state: ModelState,
    pub dimensions: usize,
    pub polytopes: usize,
    pub hyperplanes_per_polytope: usize,
    pub outer_label: i32,
    pub iterations: u64,
    pub learning_rate: LearningRate,
    pub l2: f64,
    pub cost_ratio: f64,
    pub min_effective_polytopes: f64,
    pub loss: LossKind,
    pub seed: u64,
    pub positives_seen: usize,
    pub occupancy: Vec<usize>,
    pub active_polytopes: usize,
    pub weight_norm: f64,
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dataset")?;
        writeln!(f, "  outer label:        {}", self.outer_label)?;
        writeln!(f, "  positives seen:     {}", self.positives_seen)?;
        writeln!(f, "  dimensions:         {}", self.dimensions)?;
        writeln!(f, "Parameters")?;
        writeln!(f, "  polytopes:          {}", self.polytopes)?;
        writeln!(f, "  hyperplanes/poly:   {}", self.hyperplanes_per_polytope)?;
        writeln!(f, "  iterations:         {}", self.iterations)?;
        writeln!(
            f,
            "  learning rate:      {} (decay {})",
            self.learning_rate.initial, self.learning_rate.decay
        )?;
        writeln!(f, "  l2:                 {}", self.l2)?;
        writeln!(f, "  cost ratio:         {}", self.cost_ratio)?;
        writeln!(f, "  min entropy (exp):  {}", self.min_effective_polytopes)?;
        writeln!(f, "  loss:               {}", self.loss.name())?;
        writeln!(f, "  seed:               {}", self.seed)?;
        writeln!(f, "  state:              {:?}", self.state)?;
        writeln!(f, "Assignments")?;
        writeln!(f, "  active polytopes:   {}", self.active_polytopes)?;
        let counts: Vec<String> = self.occupancy.iter().map(|c| c.to_string()).collect();
        writeln!(f, "  counts:             {}", counts.join(" "))?;
        write!(f, "  weight norm:        {:.6}", self.weight_norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::adaptor::{AdaptorConfig, BatchOutcome, StochasticDataAdaptor};
    use crate::data::dataset::Dataset;
    use crate::linalg::sparse_vector::SparseVector;

    fn sv(pairs: &[(i64, f64)]) -> SparseVector {
        SparseVector::from_pairs(pairs.iter().copied()).unwrap()
    }

    fn ready(config: CpmConfig) -> ConvexPolytopeMachine {
        let mut model = ConvexPolytopeMachine::new(config).unwrap();
        model.initialize().unwrap();
        model
    }

    /// Positives inside the unit box around the origin, negatives on a ring.
    fn box_dataset() -> Dataset {
        let mut items = Vec::new();
        for i in 0..40 {
            let t = i as f64 / 40.0 * std::f64::consts::TAU;
            items.push((1, sv(&[(0, 0.3 * t.cos()), (1, 0.3 * t.sin())])));
            items.push((-1, sv(&[(0, 3.0 * t.cos()), (1, 3.0 * t.sin())])));
        }
        Dataset::from_labelled(items)
    }

    #[test]
    fn test_two_dim_single_hyperplane() {
        let mut model = ready(CpmConfig::new(2, 1, 1));
        model
            .set_hyperplane(0, &Hyperplane::new(Array1::from_vec(vec![1.0, 0.0]), 0.0))
            .unwrap();
        assert_eq!(model.predict(&sv(&[(0, 1.0), (1, 1.0)])).unwrap(), 1);
        assert_eq!(model.predict(&sv(&[(0, -1.0), (1, 1.0)])).unwrap(), -1);
        // Boundary is inside.
        assert_eq!(model.predict(&sv(&[(1, 1.0)])).unwrap(), 1);
    }

    #[test]
    fn test_predict_is_deterministic() {
        let config = CpmConfig::new(3, 2, 2)
            .with_initialization(Initialization::Gaussian { std_dev: 1.0 })
            .with_seed(3);
        let model = ready(config.clone());
        let again = ready(config);
        let x = sv(&[(0, 0.2), (2, -1.5)]);
        let first = model.decision(&x).unwrap();
        for _ in 0..10 {
            assert_eq!(model.decision(&x).unwrap(), first);
        }
        assert_eq!(again.decision(&x).unwrap(), first);
    }

    #[test]
    fn test_step_before_initialize() {
        let mut model = ConvexPolytopeMachine::new(CpmConfig::new(2, 1, 1)).unwrap();
        let ds = box_dataset();
        let err = model.step_instances(ds.iter()).unwrap_err();
        assert!(matches!(
            err,
            CpmError::InvalidState {
                operation: "step",
                state: ModelState::Uninitialized
            }
        ));
        assert!(model.predict(&sv(&[(0, 1.0)])).is_err());
        assert!(model.snapshot().is_err());
    }

    #[test]
    fn test_step_after_stop() {
        let mut model = ready(CpmConfig::new(2, 1, 1));
        let ds = box_dataset();
        model.step_instances(ds.iter().take(3)).unwrap();
        assert_eq!(model.state(), ModelState::Training);
        model.stop();
        assert!(matches!(
            model.step_instances(ds.iter()),
            Err(CpmError::InvalidState { state: ModelState::Stopped, .. })
        ));
        model.resume().unwrap();
        assert!(model.step_instances(ds.iter().take(1)).is_ok());
    }

    #[test]
    fn test_zero_learning_rate_leaves_weights() {
        let config = CpmConfig::new(2, 3, 2)
            .with_learning_rate(0.0, 0.0)
            .with_l2(0.5)
            .with_initialization(Initialization::Gaussian { std_dev: 0.5 });
        let mut model = ready(config);
        let before = model.weights().clone();
        let ds = box_dataset();
        let summary = model.step_instances(ds.iter()).unwrap();
        assert_eq!(summary.examples, ds.len());
        assert_eq!(summary.updates, 0);
        assert_eq!(model.weights(), &before);
    }

    #[test]
    fn test_batch_rejected_atomically() {
        let mut model = ready(CpmConfig::new(2, 1, 1).with_learning_rate(1.0, 0.0));
        let ds = Dataset::from_labelled(vec![
            (1, sv(&[(0, 1.0)])),
            (1, sv(&[(5, 1.0)])),
        ]);
        let before = model.weights().clone();
        assert!(matches!(
            model.step_instances(ds.iter()),
            Err(CpmError::DimensionMismatch { expected: 2, actual: 6 })
        ));
        assert_eq!(model.weights(), &before);
        assert_eq!(model.iterations(), 0);
        assert_eq!(model.state(), ModelState::Ready);
    }

    #[test]
    fn test_positive_moves_weakest_hyperplane() {
        let config = CpmConfig::new(2, 1, 2)
            .with_learning_rate(1.0, 0.0)
            .with_l2(0.0)
            .with_cost_ratio(1.0);
        let mut model = ready(config);
        model
            .set_hyperplane(0, &Hyperplane::new(Array1::from_vec(vec![0.0, 0.0]), 5.0))
            .unwrap();
        let ds = Dataset::from_labelled(vec![(1, sv(&[(0, 2.0)]))]);
        let summary = model.step_instances(ds.iter()).unwrap();
        assert_eq!(summary.updates, 1);

        // Row 1 had margin 0 < 5, so it moves by 0.5 * x and its bias by 0.5.
        let h = model.hyperplane(1).unwrap();
        assert!((h.weights[0] - 1.0).abs() < 1e-12);
        assert!((h.bias - 0.5).abs() < 1e-12);
        assert_eq!(model.hyperplane(0).unwrap().bias, 5.0);
    }

    #[test]
    fn test_negative_pushes_every_active_polytope() {
        let config = CpmConfig::new(1, 3, 1)
            .with_learning_rate(1.0, 0.0)
            .with_l2(0.0)
            .with_cost_ratio(1.0);
        let mut model = ready(config);
        // Polytope 2 already rejects x with margin beyond 1.
        model
            .set_hyperplane(2, &Hyperplane::new(Array1::from_vec(vec![0.0]), -3.0))
            .unwrap();
        let ds = Dataset::from_labelled(vec![(-1, sv(&[(0, 1.0)]))]);
        let summary = model.step_instances(ds.iter()).unwrap();
        assert_eq!(summary.updates, 2);
        assert!((model.hyperplane(0).unwrap().weights[0] + 0.5).abs() < 1e-12);
        assert!((model.hyperplane(1).unwrap().bias + 0.5).abs() < 1e-12);
        assert_eq!(model.hyperplane(2).unwrap().bias, -3.0);
    }

    #[test]
    fn test_entropy_floor_redirects_update() {
        let config = CpmConfig::new(1, 2, 1)
            .with_learning_rate(1.0, 0.0)
            .with_l2(0.0)
            .with_min_effective_polytopes(2.0);
        let mut model = ready(config);
        model
            .set_hyperplane(0, &Hyperplane::new(Array1::from_vec(vec![0.0]), 100.0))
            .unwrap();
        model
            .set_hyperplane(1, &Hyperplane::new(Array1::from_vec(vec![0.0]), -100.0))
            .unwrap();
        let ds = Dataset::from_labelled((0..11).map(|_| (1, sv(&[(0, 1.0)]))));

        // Warm-up: plain argmax, and polytope 0 is already past the margin.
        let warmup = model.step_instances(ds.iter().take(10)).unwrap();
        assert_eq!(warmup.updates, 0);
        assert_eq!(model.tracker().occupancy(), &[10, 0]);

        // Ten distinct positives all in polytope 0: the eleventh is charged
        // to the empty polytope but still owned by the argmax.
        let summary = model.step_instances(ds.iter().skip(10)).unwrap();
        assert_eq!(summary.updates, 1);
        assert!((summary.positive_loss - 101.0).abs() < 1e-12);
        let moved = model.hyperplane(1).unwrap();
        assert!((moved.weights[0] - 0.5).abs() < 1e-12);
        assert!((moved.bias + 99.5).abs() < 1e-12);
        let owner = model.hyperplane(0).unwrap();
        assert_eq!(owner.weights[0], 0.0);
        assert_eq!(owner.bias, 100.0);
        assert_eq!(model.tracker().assignment(10), Some(0));
        assert_eq!(model.tracker().occupancy(), &[11, 0]);
    }

    #[test]
    fn test_reassignments_count_owner_changes_only() {
        let config = CpmConfig::new(1, 2, 1).with_learning_rate(0.0, 0.0);
        let mut model = ready(config);
        model
            .set_hyperplane(0, &Hyperplane::new(Array1::from_vec(vec![0.0]), 1.0))
            .unwrap();
        let ds = Dataset::from_labelled(vec![
            (1, sv(&[(0, 1.0)])),
            (-1, sv(&[(0, 2.0)])),
            (1, sv(&[(0, 0.5)])),
        ]);

        let first = model.step_instances(ds.iter()).unwrap();
        assert_eq!(first.positives, 2);
        assert_eq!(first.reassignments, 0);
        assert_eq!(model.tracker().occupancy(), &[2, 0]);

        let same = model.step_instances(ds.iter()).unwrap();
        assert_eq!(same.reassignments, 0);

        model
            .set_hyperplane(1, &Hyperplane::new(Array1::from_vec(vec![0.0]), 5.0))
            .unwrap();
        let moved = model.step_instances(ds.iter()).unwrap();
        assert_eq!(moved.reassignments, 2);
        assert_eq!(model.tracker().occupancy(), &[0, 2]);
        assert_eq!(model.tracker().distinct(), 2);
    }

    #[test]
    fn test_regularization_spreads_lambda_over_run() {
        let config = CpmConfig::new(2, 1, 1).with_regularization(2.0, 100).unwrap();
        let lambda = 1.0 / 200.0;
        assert!((config.l2 - lambda).abs() < 1e-15);
        assert!((config.learning_rate.at(0) - 1.0 / (lambda * 2.0)).abs() < 1e-9);
        assert!((config.learning_rate.at(8) - 1.0 / (lambda * 10.0)).abs() < 1e-9);
        // Shrink after the first step is 1 - eta * lambda = 1/2.
        assert!((1.0 - config.learning_rate.at(0) * config.l2 - 0.5).abs() < 1e-12);

        assert!(CpmConfig::new(2, 1, 1).with_regularization(0.0, 10).is_err());
        assert!(CpmConfig::new(2, 1, 1).with_regularization(1.0, 0).is_err());
    }

    #[test]
    fn test_oversized_model_rejected() {
        assert!(matches!(
            CpmConfig::new(usize::MAX / 2, 4, 4).validate(),
            Err(CpmError::InvalidParameter { .. })
        ));
        let ds = Dataset::from_libsvm_str("1 9223372036854775806:1.0\n").unwrap();
        assert!(matches!(
            ConvexPolytopeMachine::new(CpmConfig::new(ds.dimensions(), 2, 2)),
            Err(CpmError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_learns_box() {
        let config = CpmConfig::new(2, 4, 4)
            .with_learning_rate(0.5, 0.01)
            .with_l2(1e-4)
            .with_initialization(Initialization::Gaussian { std_dev: 0.1 })
            .with_seed(5);
        let mut model = ready(config);
        let ds = box_dataset();
        let mut adaptor = StochasticDataAdaptor::new(
            &ds,
            AdaptorConfig::default().with_batch_size(8).with_seed(1),
        )
        .unwrap();
        for _ in 0..60 {
            while let BatchOutcome::Batch(batch) = adaptor.next_batch() {
                model.step(&batch).unwrap();
            }
            adaptor.reset();
        }
        let correct = ds
            .iter()
            .filter(|inst| {
                model.predict(&inst.features).unwrap() == inst.binary_label(1)
            })
            .count();
        assert!(correct as f64 / ds.len() as f64 >= 0.85, "correct {}", correct);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut model = ready(CpmConfig::new(1, 1, 1).with_learning_rate(1.0, 0.0));
        let snap = model.snapshot().unwrap();
        let ds = Dataset::from_labelled(vec![(1, sv(&[(0, 1.0)]))]);
        model.step_instances(ds.iter()).unwrap();
        assert!(model.version() > snap.version());
        assert_eq!(snap.weights().l2_norm(), 0.0);
        assert!(model.weights().l2_norm() > 0.0);
    }

    #[test]
    fn test_polytope_view() {
        let model = ready(CpmConfig::new(2, 2, 3));
        assert_eq!(model.polytope(1).unwrap().len(), 3);
        assert!(matches!(
            model.polytope(2),
            Err(CpmError::IndexOutOfRange { what: "polytope", .. })
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(ConvexPolytopeMachine::new(CpmConfig::new(0, 1, 1)).is_err());
        assert!(ConvexPolytopeMachine::new(CpmConfig::new(2, 0, 1)).is_err());
        assert!(ConvexPolytopeMachine::new(CpmConfig::new(2, 2, 1).with_cost_ratio(0.0)).is_err());
        assert!(ConvexPolytopeMachine::new(
            CpmConfig::new(2, 2, 1).with_min_effective_polytopes(3.0)
        )
        .is_err());
        let config = CpmConfig::new(2, 2, 1).with_cost_ratio(3.0);
        assert!((config.negative_cost() - 0.75).abs() < 1e-12);
        assert!((config.positive_cost() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_summary_display() {
        let mut model = ready(CpmConfig::new(2, 2, 1).with_learning_rate(0.1, 0.0));
        model.step_instances(box_dataset().iter()).unwrap();
        let summary = model.summary();
        assert_eq!(summary.positives_seen, 40);
        assert_eq!(summary.occupancy.iter().sum::<usize>(), 40);
        let text = summary.to_string();
        assert!(text.contains("active polytopes"));
        assert!(text.contains("hinge"));
    }
}
