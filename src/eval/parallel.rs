//! Data-parallel evaluation over a fixed worker pool.
//!
//! The dataset is cut into contiguous shards, one per worker, and each
//! shard is scored against the same immutable [`ModelSnapshot`]. Workers
//! share nothing mutable; partial results are merged after the join.

use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use super::metrics::{ExampleOutcome, MetricAccumulator, Metrics};
use crate::data::dataset::{Dataset, Instance};
use crate::error::{CpmError, Result};
use crate::linalg::features::FeatureVector;
use crate::model::snapshot::ModelSnapshot;

/// Evaluation knobs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalOptions {
    /// Worker threads; `0` means one per available core.
    pub num_workers: usize,

    /// Drop malformed instances (and count them) instead of failing.
    pub skip_invalid: bool,
}

impl EvalOptions {
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_skip_invalid(mut self, skip_invalid: bool) -> Self {
        self.skip_invalid = skip_invalid;
        self
    }
}

/// Resolve a requested worker count (`0` = hardware parallelism).
pub fn resolve_workers(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn build_pool(workers: usize) -> Result<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| CpmError::invalid_parameter(format!("cannot start worker pool: {}", e)))
}

fn evaluate_shard(
    snapshot: &ModelSnapshot,
    offset: usize,
    shard: &[Instance],
    skip_invalid: bool,
) -> Result<MetricAccumulator> {
    let outer = snapshot.outer_label();
    let mut acc = MetricAccumulator::new();
    for (i, inst) in shard.iter().enumerate() {
        let index = offset + i;
        match ExampleOutcome::measure(snapshot, index, &inst.features, inst.binary_label(outer)) {
            Ok(outcome) => acc.push(outcome),
            Err(e) if skip_invalid => {
                tracing::debug!("Skipping instance {}: {}", index, e);
                acc.skip();
            }
            Err(e) => return Err(CpmError::evaluation_failed(index, e.to_string())),
        }
    }
    Ok(acc)
}

/// Score `dataset` against `snapshot` on `options.num_workers` threads.
///
/// The result does not depend on the number of workers.
pub fn evaluate(
    snapshot: &Arc<ModelSnapshot>,
    dataset: &Dataset,
    options: &EvalOptions,
) -> Result<Metrics> {
    if dataset.is_empty() {
        return Err(CpmError::EmptyDataset);
    }
    let workers = resolve_workers(options.num_workers).min(dataset.len());
    let shard_len = dataset.len().div_ceil(workers);
    let pool = build_pool(workers)?;

    let partials: Vec<Result<MetricAccumulator>> = pool.install(|| {
        dataset
            .instances()
            .par_chunks(shard_len)
            .enumerate()
            .map(|(s, shard)| evaluate_shard(snapshot, s * shard_len, shard, options.skip_invalid))
            .collect()
    });

    let mut total = MetricAccumulator::new();
    for partial in partials {
        total = total.merge(partial?);
    }
    if total.skipped() > 0 {
        tracing::warn!(
            "Skipped {} of {} instances during evaluation",
            total.skipped(),
            dataset.len()
        );
    }
    tracing::debug!(
        "Evaluated {} instances on {} workers (snapshot v{})",
        total.len(),
        workers,
        snapshot.version()
    );
    Ok(total.finalize(snapshot.layout().polytopes, snapshot.weights().l2_norm()))
}

/// Raw model output for one instance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoredInstance {
    pub score: f64,
    /// Polytope attaining the score.
    pub polytope: usize,
    /// Whether the instance carries the outer label.
    pub is_outer: bool,
}

/// Per-instance scores and assignments, in dataset order.
pub fn score_dataset(
    snapshot: &Arc<ModelSnapshot>,
    dataset: &Dataset,
    num_workers: usize,
) -> Result<Vec<ScoredInstance>> {
    let pool = build_pool(resolve_workers(num_workers))?;
    let outer = snapshot.outer_label();
    pool.install(|| {
        dataset
            .instances()
            .par_iter()
            .enumerate()
            .map(|(i, inst)| -> Result<ScoredInstance> {
                let (score, polytope) = snapshot
                    .decision(&inst.features)
                    .map_err(|e| CpmError::evaluation_failed(i, e.to_string()))?;
                Ok(ScoredInstance {
                    score,
                    polytope,
                    is_outer: inst.label == outer,
                })
            })
            .collect()
    })
}

/// ±1 predictions for a batch of feature vectors, in input order.
pub fn predict_batch<F>(
    snapshot: &Arc<ModelSnapshot>,
    inputs: &[F],
    num_workers: usize,
) -> Result<Vec<i8>>
where
    F: FeatureVector + Sync,
{
    let pool = build_pool(resolve_workers(num_workers))?;
    pool.install(|| inputs.par_iter().map(|x| snapshot.predict(x)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse_vector::SparseVector;
    use crate::model::machine::{ConvexPolytopeMachine, CpmConfig, Initialization};

    fn dataset() -> Dataset {
        let items = (0..57).map(|i| {
            let a = (i as f64 * 0.37).sin();
            let b = (i as f64 * 0.91).cos();
            let label = if a * a + b * b < 0.6 { 1 } else { -1 };
            (label, SparseVector::from_pairs(vec![(0, a), (1, b), (2, a * b)]).unwrap())
        });
        Dataset::from_labelled(items)
    }

    fn snapshot(ds: &Dataset) -> Arc<ModelSnapshot> {
        let config = CpmConfig::new(3, 3, 2)
            .with_learning_rate(0.2, 0.05)
            .with_initialization(Initialization::Gaussian { std_dev: 0.3 })
            .with_seed(17);
        let mut model = ConvexPolytopeMachine::new(config).unwrap();
        model.initialize().unwrap();
        for _ in 0..5 {
            model.step_instances(ds.iter()).unwrap();
        }
        model.snapshot().unwrap()
    }

    #[test]
    fn test_worker_count_does_not_change_metrics() {
        let ds = dataset();
        let snap = snapshot(&ds);
        let one = evaluate(&snap, &ds, &EvalOptions::default().with_workers(1)).unwrap();
        let four = evaluate(&snap, &ds, &EvalOptions::default().with_workers(4)).unwrap();
        let many = evaluate(&snap, &ds, &EvalOptions::default().with_workers(64)).unwrap();
        assert_eq!(one, four);
        assert_eq!(one, many);
        assert_eq!(one.examples, ds.len());
    }

    #[test]
    fn test_empty_dataset() {
        let ds = dataset();
        let snap = snapshot(&ds);
        assert!(matches!(
            evaluate(&snap, &Dataset::default(), &EvalOptions::default()),
            Err(CpmError::EmptyDataset)
        ));
    }

    #[test]
    fn test_malformed_instance_fails_or_is_skipped() {
        let ds = dataset();
        let snap = snapshot(&ds);
        let mut items: Vec<(i32, SparseVector)> = ds
            .iter()
            .map(|inst| (inst.label, inst.features.clone()))
            .collect();
        items[10] = (1, SparseVector::from_pairs(vec![(7, 1.0)]).unwrap());
        let bad = Dataset::from_labelled(items);

        let err = evaluate(&snap, &bad, &EvalOptions::default().with_workers(3)).unwrap_err();
        assert!(matches!(err, CpmError::EvaluationFailed { instance: 10, .. }));

        let m = evaluate(
            &snap,
            &bad,
            &EvalOptions::default().with_workers(3).with_skip_invalid(true),
        )
        .unwrap();
        assert_eq!(m.skipped, 1);
        assert_eq!(m.examples, ds.len() - 1);
    }

    #[test]
    fn test_score_dataset_matches_snapshot() {
        let ds = dataset();
        let snap = snapshot(&ds);
        let scored = score_dataset(&snap, &ds, 2).unwrap();
        assert_eq!(scored.len(), ds.len());
        for (s, inst) in scored.iter().zip(ds.iter()) {
            let (score, p) = snap.decision(&inst.features).unwrap();
            assert_eq!(s.score, score);
            assert_eq!(s.polytope, p);
            assert_eq!(s.is_outer, inst.label == 1);
        }
    }

    #[test]
    fn test_predict_batch_in_order() {
        let ds = dataset();
        let snap = snapshot(&ds);
        let inputs: Vec<SparseVector> = ds.iter().map(|i| i.features.clone()).collect();
        let preds = predict_batch(&snap, &inputs, 3).unwrap();
        let expected: Vec<i8> = inputs.iter().map(|x| snap.predict(x).unwrap()).collect();
        assert_eq!(preds, expected);
    }

    #[test]
    fn test_resolve_workers() {
        assert_eq!(resolve_workers(3), 3);
        assert!(resolve_workers(0) >= 1);
    }
}
