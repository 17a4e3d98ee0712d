//! The emission strategy interface shared by every emission family.
//!
//! The trainer and the inference routines only see [`EmissionModel`]: they ask
//! it for per-timestep log-likelihoods, hand it state posteriors to fold into
//! its own sufficient statistics, and let it re-estimate its parameters. The
//! concrete families live in the `emission_*` modules.

use std::fmt;
use std::ops::Range;

use crate::clustering::Clusterer;
use crate::errors::HmmResult;
use crate::hmm_config::ParamGroups;
use crate::rng::ModelRng;
use crate::sequences::{ObservationSet, SequenceIndex};

/// Associative, commutative combination of partial statistics.
///
/// Partial statistics from different sequences may be merged in any order
/// and grouping; the result must not depend on either.
pub trait MergeStatistics {
    /// Add `other` into `self`.
    fn merge(&mut self, other: Self);
}

impl MergeStatistics for Vec<f64> {
    fn merge(&mut self, other: Self) {
        add_assign(self, &other);
    }
}

impl MergeStatistics for Vec<Vec<f64>> {
    fn merge(&mut self, other: Self) {
        add_assign_rows(self, &other);
    }
}

/// Element-wise `a += b`.
pub fn add_assign(a: &mut [f64], b: &[f64]) {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += y;
    }
}

/// Row-wise `a += b`.
pub fn add_assign_rows(a: &mut [Vec<f64>], b: &[Vec<f64>]) {
    for (ra, rb) in a.iter_mut().zip(b.iter()) {
        add_assign(ra, rb);
    }
}

/// Per-state emission distribution family.
///
/// Every method that consumes a sequence receives the concatenated buffer and
/// the half-open span of the sequence inside it; posteriors are indexed
/// relative to the start of that span.
pub trait EmissionModel: Send + Sync {
    /// Observation buffer type read by this family.
    type Observations: ObservationSet;

    /// Sufficient statistics accumulated during one E-step.
    type Stats: MergeStatistics + Clone + Send + Sync + fmt::Debug;

    /// Short family name used in log messages.
    fn family(&self) -> &'static str;

    /// Number of hidden states the emission parameters are laid out for.
    fn n_states(&self) -> usize;

    /// Whether every emission parameter has a value.
    fn is_initialized(&self) -> bool;

    /// Seed parameters from training data.
    ///
    /// Groups selected in `init_params` are (re)seeded; groups without a value
    /// yet are seeded regardless.
    fn initialize(
        &mut self,
        obs: &Self::Observations,
        index: &SequenceIndex,
        init_params: &ParamGroups,
        clusterer: &dyn Clusterer,
        rng: &mut ModelRng,
    ) -> HmmResult<()>;

    /// Check that the parameters are well formed.
    fn validate(&self) -> HmmResult<()>;

    /// Check that `obs` is compatible with the fixed dimensionality.
    fn check_observations(&self, obs: &Self::Observations) -> HmmResult<()>;

    /// Per-timestep, per-state log-likelihood for one sequence, shape `(T, K)`.
    fn log_likelihood(&self, obs: &Self::Observations, span: Range<usize>)
        -> HmmResult<Vec<Vec<f64>>>;

    /// Zeroed statistics for a new E-step.
    fn initialize_sufficient_statistics(&self) -> Self::Stats;

    /// Fold one sequence's posteriors into `stats`.
    fn accumulate(
        &self,
        stats: &mut Self::Stats,
        obs: &Self::Observations,
        span: Range<usize>,
        posteriors: &[Vec<f64>],
        params: &ParamGroups,
    ) -> HmmResult<()>;

    /// Re-estimate the groups selected in `params` from accumulated statistics.
    fn m_step(&mut self, stats: &Self::Stats, params: &ParamGroups) -> HmmResult<()>;

    /// Draw one observation from the emission distribution of `state`.
    fn sample(
        &self,
        state: usize,
        rng: &mut ModelRng,
    ) -> HmmResult<<Self::Observations as ObservationSet>::Frame>;

    /// Empty buffer that sampled frames are pushed into.
    fn empty_observations(&self) -> Self::Observations;

    /// Number of free emission parameters, used for model selection.
    fn n_free_parameters(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_order_independent() {
        let parts = vec![vec![1.0, 2.0], vec![0.5, 0.5], vec![3.0, 0.0]];

        let mut forward = vec![0.0, 0.0];
        for p in parts.iter().cloned() {
            forward.merge(p);
        }
        let mut backward = vec![0.0, 0.0];
        for p in parts.iter().rev().cloned() {
            backward.merge(p);
        }
        assert_eq!(forward, backward);
        assert_eq!(forward, vec![4.5, 2.5]);
    }

    #[test]
    fn test_row_merge() {
        let mut a = vec![vec![1.0], vec![2.0]];
        a.merge(vec![vec![1.0], vec![-2.0]]);
        assert_eq!(a, vec![vec![2.0], vec![0.0]]);
    }
}
