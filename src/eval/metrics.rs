//! Scoring metrics.
//!
//! Evaluation is split in two phases. Workers turn instances into
//! [`ExampleOutcome`]s and collect them in a [`MetricAccumulator`];
//! accumulators merge by concatenation. [`MetricAccumulator::finalize`]
//! orders outcomes by dataset index before folding them, so every
//! floating-point sum runs in the same order whatever the sharding.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CpmError, Result};
use crate::linalg::features::FeatureVector;
use crate::model::loss::Loss;
use crate::model::snapshot::ModelSnapshot;

/// Per-instance evaluation result.
#[derive(Clone, Debug, PartialEq)]
pub struct ExampleOutcome {
    /// Position in the evaluated dataset.
    pub index: usize,
    /// ±1 ground truth.
    pub label: i8,
    /// Model score.
    pub score: f64,
    /// Polytope attaining the score.
    pub assigned: usize,
    /// Loss at `label · score`.
    pub loss: f64,
    /// Positives: loss of the best polytope. Negatives: summed loss of
    /// every polytope.
    pub cost: f64,
    /// Positives: positive scores of polytopes other than `assigned`.
    pub redundancy: f64,
}

impl ExampleOutcome {
    pub fn measure<F: FeatureVector>(
        snapshot: &ModelSnapshot,
        index: usize,
        features: &F,
        label: i8,
    ) -> Result<Self> {
        if !features.is_finite() {
            return Err(CpmError::invalid_parameter("non-finite feature values"));
        }
        let scores = snapshot.scores(features)?;
        let (assigned, score) = scores.best();
        if !score.is_finite() {
            return Err(CpmError::invalid_parameter(format!("non-finite score {}", score)));
        }

        let loss = snapshot.loss();
        let (cost, redundancy) = if label > 0 {
            (loss.value(score), scores.exclusion_loss(assigned))
        } else {
            (scores.scores.iter().map(|&s| loss.value(-s)).sum(), 0.0)
        };

        Ok(Self {
            index,
            label,
            score,
            assigned,
            loss: loss.value(label as f64 * score),
            cost,
            redundancy,
        })
    }

    pub fn predicted(&self) -> i8 {
        if self.score >= 0.0 {
            1
        } else {
            -1
        }
    }
}

/// Min / max / mean / standard deviation of a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarginStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl MarginStats {
    /// Two-pass statistics; all zero for an empty sample.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        Self {
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean,
            std_dev: var.sqrt(),
        }
    }
}

/// Equal-width histogram.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub fn bin_width(&self) -> f64 {
        if self.counts.is_empty() {
            0.0
        } else {
            (self.max - self.min) / self.counts.len() as f64
        }
    }
}

/// Bucket `values` into `bins` equal-width bins spanning their range.
/// A degenerate range puts everything in the first bin.
pub fn margin_histogram(values: &[f64], bins: usize) -> Histogram {
    let stats = MarginStats::from_values(values);
    let mut counts = vec![0; bins];
    if bins == 0 || values.is_empty() {
        return Histogram {
            min: stats.min,
            max: stats.max,
            counts,
        };
    }
    let width = (stats.max - stats.min) / bins as f64;
    for &v in values {
        let bin = if width > 0.0 {
            (((v - stats.min) / width) as usize).min(bins - 1)
        } else {
            0
        };
        counts[bin] += 1;
    }
    Histogram {
        min: stats.min,
        max: stats.max,
        counts,
    }
}

/// Entropy in bits of an occupancy distribution.
pub fn entropy_bits(occupancy: &[usize]) -> f64 {
    let total: usize = occupancy.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    occupancy
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct RocAreas {
    auc: f64,
    auc_01: f64,
    auc_001: f64,
    absolute_top: f64,
}

/// Trapezoid area under the ROC curve restricted to `fpr <= limit`, for the
/// segment `(last_f, last_t) -> (f, t)`.
fn clipped_area(limit: f64, last_f: f64, last_t: f64, f: f64, t: f64) -> f64 {
    if last_f >= limit {
        0.0
    } else if f <= limit {
        (f - last_f) * (last_t + t) / 2.0
    } else if f > last_f {
        let t_limit = last_t + (limit - last_f) / (f - last_f) * (t - last_t);
        (limit - last_f) * (last_t + t_limit) / 2.0
    } else {
        0.0
    }
}

/// ROC areas over `(score, is_positive)` pairs sorted by decreasing score.
/// Tied scores move the curve in one step.
fn roc_areas(ranked: &[(f64, bool)], positives: usize, negatives: usize) -> RocAreas {
    if positives == 0 || negatives == 0 {
        return RocAreas::default();
    }
    let (n_pos, n_neg) = (positives as f64, negatives as f64);
    let mut areas = RocAreas::default();
    let (mut tp, mut fp, mut top) = (0usize, 0usize, 0usize);
    let (mut tpr, mut fpr) = (0.0, 0.0);

    let mut i = 0;
    while i < ranked.len() {
        let (last_t, last_f) = (tpr, fpr);
        let group = ranked[i].0;
        while i < ranked.len() && ranked[i].0 == group {
            if ranked[i].1 {
                tp += 1;
                if fp == 0 {
                    top += 1;
                }
            } else {
                fp += 1;
            }
            i += 1;
        }
        tpr = tp as f64 / n_pos;
        fpr = fp as f64 / n_neg;

        areas.auc += (fpr - last_f) * (last_t + tpr) / 2.0;
        areas.auc_01 += clipped_area(0.1, last_f, last_t, fpr, tpr);
        areas.auc_001 += clipped_area(0.01, last_f, last_t, fpr, tpr);
    }

    areas.auc_01 *= 10.0;
    areas.auc_001 *= 100.0;
    areas.absolute_top = top as f64 / n_pos;
    areas
}

fn ratio(num: f64, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num / den as f64
    }
}

/// Aggregated evaluation results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub examples: usize,
    pub positives: usize,
    pub negatives: usize,
    /// Instances dropped by skip-invalid evaluation.
    pub skipped: usize,

    pub accuracy: f64,
    /// Mean of `label · score`.
    pub avg_margin: f64,
    /// Mean loss at `label · score`.
    pub loss: f64,

    /// Mean cost over all instances.
    pub cost: f64,
    pub cost_positives: f64,
    pub cost_negatives: f64,
    /// Mean exclusion loss over positives.
    pub redundancy: f64,
    /// Entropy (bits) of the positives' polytope assignment.
    pub entropy: f64,
    /// Frobenius norm of the weights.
    pub l2_norm: f64,

    pub true_positive_rate: f64,
    pub false_positive_rate: f64,
    pub precision: f64,

    pub auc: f64,
    /// Area for FPR ≤ 0.1, scaled by 10.
    pub auc_01: f64,
    /// Area for FPR ≤ 0.01, scaled by 100.
    pub auc_001: f64,
    /// Fraction of positives ranked above every negative.
    pub absolute_top: f64,

    /// Statistics of `label · score`.
    pub margins: MarginStats,
    /// Positives per polytope.
    pub occupancy: Vec<usize>,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: [(&str, f64); 17] = [
            ("accuracy", self.accuracy),
            ("avg_margin", self.avg_margin),
            ("loss", self.loss),
            ("cost", self.cost),
            ("cost_positives", self.cost_positives),
            ("cost_negatives", self.cost_negatives),
            ("redundancy", self.redundancy),
            ("entropy", self.entropy),
            ("l2", self.l2_norm),
            ("tpr", self.true_positive_rate),
            ("fpr", self.false_positive_rate),
            ("precision", self.precision),
            ("auc", self.auc),
            ("auc_0.1", self.auc_01),
            ("auc_0.01", self.auc_001),
            ("absolute_top", self.absolute_top),
            ("margin_std", self.margins.std_dev),
        ];
        writeln!(
            f,
            "examples\t{} ({} positives, {} negatives, {} skipped)",
            self.examples, self.positives, self.negatives, self.skipped
        )?;
        for (name, value) in rows {
            writeln!(f, "{}\t{:.6}", name, value)?;
        }
        write!(f, "margin_range\t[{:.6}, {:.6}]", self.margins.min, self.margins.max)
    }
}

/// Mergeable collection of per-instance outcomes.
#[derive(Clone, Debug, Default)]
pub struct MetricAccumulator {
    outcomes: Vec<ExampleOutcome>,
    skipped: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outcome: ExampleOutcome) {
        self.outcomes.push(outcome);
    }

    /// Count an instance that was dropped.
    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn merge(mut self, other: MetricAccumulator) -> Self {
        self.outcomes.extend(other.outcomes);
        self.skipped += other.skipped;
        self
    }

    /// Outcomes in dataset order.
    pub fn into_outcomes(mut self) -> Vec<ExampleOutcome> {
        self.outcomes.sort_by_key(|o| o.index);
        self.outcomes
    }

    /// Fold into [`Metrics`] for a model with `polytopes` polytopes whose
    /// weights have norm `l2_norm`.
    pub fn finalize(self, polytopes: usize, l2_norm: f64) -> Metrics {
        let skipped = self.skipped;
        let outcomes = self.into_outcomes();

        let mut m = Metrics {
            examples: outcomes.len(),
            skipped,
            l2_norm,
            occupancy: vec![0; polytopes],
            ..Metrics::default()
        };

        let (mut correct, mut tp, mut fp) = (0usize, 0usize, 0usize);
        let (mut cost_pos, mut cost_neg, mut redundancy, mut loss) = (0.0, 0.0, 0.0, 0.0);
        let mut margins = Vec::with_capacity(outcomes.len());

        for o in &outcomes {
            let margin = o.label as f64 * o.score;
            margins.push(margin);
            loss += o.loss;
            if o.predicted() == o.label {
                correct += 1;
            }
            if o.label > 0 {
                m.positives += 1;
                cost_pos += o.cost;
                redundancy += o.redundancy;
                if let Some(c) = m.occupancy.get_mut(o.assigned) {
                    *c += 1;
                }
                if o.predicted() > 0 {
                    tp += 1;
                }
            } else {
                m.negatives += 1;
                cost_neg += o.cost;
                if o.predicted() > 0 {
                    fp += 1;
                }
            }
        }

        m.accuracy = ratio(correct as f64, m.examples);
        m.avg_margin = ratio(margins.iter().sum(), m.examples);
        m.loss = ratio(loss, m.examples);
        m.cost = ratio(cost_pos + cost_neg, m.examples);
        m.cost_positives = ratio(cost_pos, m.positives);
        m.cost_negatives = ratio(cost_neg, m.negatives);
        m.redundancy = ratio(redundancy, m.positives);
        m.entropy = entropy_bits(&m.occupancy);
        m.true_positive_rate = ratio(tp as f64, m.positives);
        m.false_positive_rate = ratio(fp as f64, m.negatives);
        m.precision = ratio(tp as f64, tp + fp);
        m.margins = MarginStats::from_values(&margins);

        let mut ranked: Vec<(f64, bool)> =
            outcomes.iter().map(|o| (o.score, o.label > 0)).collect();
        // Stable: ties keep dataset order.
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        let areas = roc_areas(&ranked, m.positives, m.negatives);
        m.auc = areas.auc;
        m.auc_01 = areas.auc_01;
        m.auc_001 = areas.auc_001;
        m.absolute_top = areas.absolute_top;
        m
    }
}
