//! Attribution of positive instances to polytopes.
//!
//! Every positive instance is "owned" by the polytope that last scored it
//! highest. Plain argmax tends to collapse onto a few polytopes, so once
//! enough positives have been seen the tracker may redirect an update to a
//! less crowded polytope whenever following the argmax would push the
//! entropy of the occupancy distribution below the configured floor.

use serde::{Deserialize, Serialize};

use crate::config::ENTROPY_WARMUP_FACTOR;
use crate::error::{CpmError, Result};

/// Outcome of [`AssignmentTracker::choose`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attribution {
    /// Polytope receiving the gradient step.
    pub update: usize,

    /// True argmax, recorded as the instance's new owner.
    pub assigned: usize,
}

impl Attribution {
    fn plain(p: usize) -> Self {
        Self {
            update: p,
            assigned: p,
        }
    }
}

/// Per-positive ownership history and per-polytope occupancy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignmentTracker {
    assignments: Vec<Option<usize>>,
    occupancy: Vec<usize>,
    distinct: usize,
    /// Entropy floor in nats; `<= 0` disables the heuristic.
    min_entropy: f64,
}

fn plogp(count: f64, total: f64) -> f64 {
    if count <= 0.0 || total <= 0.0 {
        return 0.0;
    }
    let p = count / total;
    -p * p.ln()
}

fn argmax(scores: &[f64]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

impl AssignmentTracker {
    /// `effective_polytopes` is the floor expressed as `exp(entropy)`;
    /// values `<= 1` disable it.
    pub fn new(polytopes: usize, effective_polytopes: f64) -> Self {
        let min_entropy = if effective_polytopes > 1.0 {
            effective_polytopes.ln()
        } else {
            0.0
        };
        Self {
            assignments: Vec::new(),
            occupancy: vec![0; polytopes],
            distinct: 0,
            min_entropy,
        }
    }

    pub fn polytopes(&self) -> usize {
        self.occupancy.len()
    }

    /// Current owner of positive `id`.
    pub fn assignment(&self, id: usize) -> Option<usize> {
        self.assignments.get(id).copied().flatten()
    }

    /// Positives attributed to each polytope.
    pub fn occupancy(&self) -> &[usize] {
        &self.occupancy
    }

    /// Number of distinct positives seen so far.
    pub fn distinct(&self) -> usize {
        self.distinct
    }

    /// Polytopes owning at least one positive.
    pub fn active_polytopes(&self) -> usize {
        self.occupancy.iter().filter(|&&c| c > 0).count()
    }

    /// Entropy of the occupancy distribution in nats.
    pub fn entropy(&self) -> f64 {
        let total = self.distinct as f64;
        self.occupancy
            .iter()
            .map(|&c| plogp(c as f64, total))
            .sum()
    }

    pub fn entropy_bits(&self) -> f64 {
        self.entropy() / std::f64::consts::LN_2
    }

    /// Pick the polytope to update for positive `id` given polytope scores.
    pub fn choose(&self, id: usize, scores: &[f64]) -> Attribution {
        let k = self.occupancy.len();
        let true_max = argmax(scores);
        let n = self.distinct as f64;

        if self.min_entropy <= 0.0 || self.distinct < ENTROPY_WARMUP_FACTOR * k {
            return Attribution::plain(true_max);
        }

        let old = self.assignment(id);
        let h_old = self.entropy();
        let h_new = match old {
            Some(o) if o == true_max => h_old,
            Some(o) => {
                let occ = |p: usize| self.occupancy[p] as f64;
                h_old - plogp(occ(o), n) - plogp(occ(true_max), n)
                    + plogp(occ(o) - 1.0, n)
                    + plogp(occ(true_max) + 1.0, n)
            }
            None => self
                .occupancy
                .iter()
                .enumerate()
                .map(|(p, &c)| {
                    let c = c as f64 + if p == true_max { 1.0 } else { 0.0 };
                    plogp(c, n + 1.0)
                })
                .sum(),
        };

        if h_new >= self.min_entropy || h_old < h_new {
            return Attribution::plain(true_max);
        }

        let threshold = match old {
            Some(o) => self.occupancy[o] as f64,
            None => n / k as f64,
        };
        let candidate = (0..k)
            .filter(|&p| (self.occupancy[p] as f64) < threshold)
            .fold(None, |best: Option<usize>, p| match best {
                Some(b) if scores[b] >= scores[p] => Some(b),
                _ => Some(p),
            });

        match candidate {
            Some(p) => Attribution {
                update: p,
                assigned: true_max,
            },
            None => Attribution::plain(true_max),
        }
    }

    /// Record `polytope` as the owner of positive `id`.
    pub fn record(&mut self, id: usize, polytope: usize) {
        if id >= self.assignments.len() {
            self.assignments.resize(id + 1, None);
        }
        match self.assignments[id] {
            Some(old) if old == polytope => {}
            Some(old) => {
                self.occupancy[old] -= 1;
                self.occupancy[polytope] += 1;
            }
            None => {
                self.occupancy[polytope] += 1;
                self.distinct += 1;
            }
        }
        self.assignments[id] = Some(polytope);
    }

    /// Check a tracker read from a model file against a `polytopes`-wide
    /// model: owners in range, occupancy and distinct count consistent
    /// with the history.
    pub fn validate(&self, polytopes: usize) -> Result<()> {
        if self.occupancy.len() != polytopes {
            return Err(CpmError::invalid_parameter(format!(
                "assignment history covers {} polytopes, model has {}",
                self.occupancy.len(),
                polytopes
            )));
        }
        if !self.min_entropy.is_finite() {
            return Err(CpmError::invalid_parameter("entropy floor must be finite"));
        }
        let mut counts = vec![0usize; polytopes];
        for (id, owner) in self.assignments.iter().enumerate() {
            if let Some(p) = *owner {
                if p >= polytopes {
                    return Err(CpmError::invalid_parameter(format!(
                        "positive {} assigned to polytope {} of {}",
                        id, p, polytopes
                    )));
                }
                counts[p] += 1;
            }
        }
        if counts != self.occupancy || counts.iter().sum::<usize>() != self.distinct {
            return Err(CpmError::invalid_parameter(
                "assignment occupancy disagrees with the recorded history",
            ));
        }
        Ok(())
    }

    /// Forget every assignment.
    pub fn clear(&mut self) {
        self.assignments.clear();
        self.occupancy.iter_mut().for_each(|c| *c = 0);
        self.distinct = 0;
    }
}
