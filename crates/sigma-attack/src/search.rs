//! Outer binary search over the per-example trade-off constant.

use ndarray::{Array2, Array4};
use sigma_core::{Result, SigmaError};
use sigma_ensemble::Ensemble;
use tracing::{debug, info};

use crate::config::AttackConfig;
use crate::optimizer::{PerturbationOptimizer, RoundSummary};
use crate::record::BestAttack;

/// Initial upper bound for every constant.
pub const INITIAL_UPPER: f64 = 1e10;

/// While `upper` is at or above this, a failure multiplies the constant by
/// ten instead of bisecting.
pub const BRACKET_LIMIT: f64 = 1e9;

/// Per-example `[lower, upper]` brackets and the constants to try next.
#[derive(Debug, Clone, PartialEq)]
pub struct BinarySearch {
    consts: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl BinarySearch {
    pub fn new(batch_len: usize, initial_const: f64) -> Self {
        Self {
            consts: vec![initial_const; batch_len],
            lower: vec![0.0; batch_len],
            upper: vec![INITIAL_UPPER; batch_len],
        }
    }

    pub fn consts(&self) -> &[f64] {
        &self.consts
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    /// Spend the next round at the current upper bounds.
    pub fn force_upper(&mut self) {
        self.consts.clone_from(&self.upper);
    }

    /// Tighten each bracket from the outcome of a round.
    pub fn update(&mut self, successes: &[bool]) -> Result<()> {
        if successes.len() != self.consts.len() {
            return Err(SigmaError::shape_mismatch(
                &[self.consts.len()],
                &[successes.len()],
            ));
        }
        for (i, &success) in successes.iter().enumerate() {
            if success {
                self.upper[i] = self.upper[i].min(self.consts[i]);
                if self.upper[i] < BRACKET_LIMIT {
                    self.consts[i] = (self.lower[i] + self.upper[i]) / 2.0;
                }
            } else {
                self.lower[i] = self.lower[i].max(self.consts[i]);
                if self.upper[i] < BRACKET_LIMIT {
                    self.consts[i] = (self.lower[i] + self.upper[i]) / 2.0;
                } else {
                    self.consts[i] *= 10.0;
                }
            }
        }
        Ok(())
    }
}

/// Result of attacking one batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Best attack per example.
    pub records: Vec<BestAttack>,
    /// Constants used by each round, outer index is the round.
    pub trajectory: Vec<Vec<f64>>,
    pub rounds: Vec<RoundSummary>,
}

/// Run the full binary search on one validated batch.
pub fn search_batch(
    ensemble: &Ensemble,
    config: &AttackConfig,
    images: &Array4<f32>,
    labels: &Array2<f32>,
) -> Result<BatchOutcome> {
    let n = images.dim().0;
    let mut optimizer = PerturbationOptimizer::new(ensemble, config, images, labels)?;
    let mut search = BinarySearch::new(n, config.initial_const);
    let mut records = vec![BestAttack::unset(ensemble.input_shape()); n];
    let mut trajectory = Vec::with_capacity(config.binary_search_steps);
    let mut rounds = Vec::with_capacity(config.binary_search_steps);

    for round in 0..config.binary_search_steps {
        if config.repeats_last_round() && round + 1 == config.binary_search_steps {
            search.force_upper();
        }
        trajectory.push(search.consts().to_vec());

        let summary = optimizer.run_round(search.consts(), &mut records)?;
        let successes = summary.successes();
        let found = successes.iter().filter(|&&s| s).count();
        info!(
            "Round {}/{}: {}/{} succeeded in {} iterations{}",
            round + 1,
            config.binary_search_steps,
            found,
            n,
            summary.iterations,
            if summary.aborted_early { " (aborted early)" } else { "" }
        );
        debug!("Round {} constants: {:?}", round + 1, search.consts());

        search.update(&successes)?;
        rounds.push(summary);
    }

    Ok(BatchOutcome {
        records,
        trajectory,
        rounds,
    })
}
