//! Concurrent training of several configurations on one training set.

use rayon::prelude::*;

use super::driver::{Cpm, FitOptions};
use crate::data::dataset::Dataset;
use crate::error::{CpmError, Result};
use crate::eval::metrics::Metrics;
use crate::eval::parallel::{self, resolve_workers, EvalOptions, ScoredInstance};
use crate::model::machine::CpmConfig;

/// Outcome of one configuration.
#[derive(Clone, Debug)]
pub struct SweepResult {
    pub config: CpmConfig,
    /// Metrics on the training set after fitting.
    pub train: Metrics,
    /// Metrics on the test set.
    pub test: Metrics,
    /// Score and polytope of every test instance.
    pub scores: Vec<ScoredInstance>,
}

/// Fit every configuration on `train` and score `test` with each.
///
/// Configurations run concurrently on up to `num_workers` threads; each
/// model is evaluated single-threaded inside its own task. Results come
/// back in input order.
pub fn parallel_fit_predict(
    configs: &[CpmConfig],
    options: &FitOptions,
    train: &Dataset,
    test: &Dataset,
    num_workers: usize,
) -> Result<Vec<SweepResult>> {
    let workers = resolve_workers(num_workers).min(configs.len().max(1));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| CpmError::invalid_parameter(format!("cannot start worker pool: {}", e)))?;

    let mut task_options = options.clone().with_workers(1);
    task_options.checkpoint_path = None;

    tracing::info!(
        "Sweeping {} configurations on {} workers",
        configs.len(),
        workers
    );
    pool.install(|| {
        configs
            .par_iter()
            .map(|config| -> Result<SweepResult> {
                let mut cpm = Cpm::from_config(config.clone())?;
                let train_metrics = cpm.fit(train, &task_options)?;
                let snapshot = cpm.model().snapshot()?;
                let test_metrics =
                    parallel::evaluate(&snapshot, test, &EvalOptions::default().with_workers(1))?;
                let scores = parallel::score_dataset(&snapshot, test, 1)?;
                tracing::info!(
                    "K={} M={} lr={} l2={}: test accuracy {:.4}, auc {:.4}",
                    config.polytopes,
                    config.hyperplanes_per_polytope,
                    config.learning_rate.initial,
                    config.l2,
                    test_metrics.accuracy,
                    test_metrics.auc
                );
                Ok(SweepResult {
                    config: config.clone(),
                    train: train_metrics,
                    test: test_metrics,
                    scores,
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse_vector::SparseVector;

    fn blobs(n: usize, offset: f64) -> Dataset {
        Dataset::from_labelled((0..n).map(|i| {
            let t = offset + i as f64 * 0.13;
            let (label, cx) = if i % 2 == 0 { (1, 1.5) } else { (-1, -1.5) };
            (
                label,
                SparseVector::from_pairs(vec![(0, cx + 0.3 * t.sin()), (1, 0.3 * t.cos())]).unwrap(),
            )
        }))
    }

    #[test]
    fn test_sweep_matches_sequential() {
        let train = blobs(40, 0.0);
        let test = blobs(20, 0.5);
        let configs = vec![
            CpmConfig::new(2, 1, 1).with_learning_rate(0.2, 0.0),
            CpmConfig::new(2, 2, 2).with_learning_rate(0.1, 0.01),
            CpmConfig::new(2, 3, 1).with_learning_rate(0.3, 0.1).with_l2(0.01),
        ];
        let options = FitOptions::default().with_epochs(5).with_batch_size(4);

        let results = parallel_fit_predict(&configs, &options, &train, &test, 3).unwrap();
        assert_eq!(results.len(), 3);

        for (result, config) in results.iter().zip(&configs) {
            assert_eq!(&result.config, config);
            assert_eq!(result.scores.len(), test.len());

            let mut cpm = Cpm::from_config(config.clone()).unwrap();
            cpm.fit(&train, &options.clone().with_workers(1)).unwrap();
            let expected = cpm.evaluate(&test, 1).unwrap();
            assert_eq!(result.test, expected);
        }
    }

    #[test]
    fn test_empty_sweep() {
        let train = blobs(4, 0.0);
        let results =
            parallel_fit_predict(&[], &FitOptions::default(), &train, &train, 0).unwrap();
        assert!(results.is_empty());
    }
}
