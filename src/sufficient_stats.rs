//! Per-iteration sufficient statistics of a whole training batch.
//!
//! The core statistics (start occupancy, expected transitions) live next to
//! the emission family's own statistics. One accumulator is built per
//! sequence during the E-step and the partials are merged before the M-step.

use crate::emission_models::{add_assign, add_assign_rows, MergeStatistics};

/// Accumulated statistics for one EM iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct SufficientStatistics<S> {
    /// Number of sequences folded in
    pub n_sequences: usize,
    /// Σ over sequences of γ[0, k]
    pub start: Vec<f64>,
    /// Σ over sequences of the expected transition counts
    pub trans: Vec<Vec<f64>>,
    /// Emission-family statistics
    pub emission: S,
    /// Σ over sequences of the log-likelihood
    pub log_likelihood: f64,
}

impl<S> SufficientStatistics<S> {
    /// Zeroed statistics for `n_states` states.
    pub fn new(n_states: usize, emission: S) -> Self {
        Self {
            n_sequences: 0,
            start: vec![0.0; n_states],
            trans: vec![vec![0.0; n_states]; n_states],
            emission,
            log_likelihood: 0.0,
        }
    }

    /// Fold the start and transition contributions of one sequence.
    pub fn add_sequence(&mut self, logprob: f64, first: &[f64], transitions: Option<&[Vec<f64>]>) {
        self.n_sequences += 1;
        self.log_likelihood += logprob;
        add_assign(&mut self.start, first);
        if let Some(xi) = transitions {
            add_assign_rows(&mut self.trans, xi);
        }
    }
}

impl<S: MergeStatistics> MergeStatistics for SufficientStatistics<S> {
    fn merge(&mut self, other: Self) {
        self.n_sequences += other.n_sequences;
        self.log_likelihood += other.log_likelihood;
        add_assign(&mut self.start, &other.start);
        add_assign_rows(&mut self.trans, &other.trans);
        self.emission.merge(other.emission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_merge_matches_sequential_fold() {
        let seqs = [
            (-1.0, vec![0.2, 0.8], vec![vec![1.0, 0.5], vec![0.0, 2.0]]),
            (-2.5, vec![0.6, 0.4], vec![vec![0.1, 0.1], vec![0.3, 0.5]]),
            (-0.5, vec![1.0, 0.0], vec![vec![0.0, 0.0], vec![0.0, 0.0]]),
        ];

        let mut sequential = SufficientStatistics::new(2, vec![0.0; 2]);
        for (lp, first, xi) in &seqs {
            sequential.add_sequence(*lp, first, Some(xi.as_slice()));
            sequential.emission.merge(first.clone());
        }

        let mut merged = SufficientStatistics::new(2, vec![0.0; 2]);
        for (lp, first, xi) in seqs.iter().rev() {
            let mut part = SufficientStatistics::new(2, vec![0.0; 2]);
            part.add_sequence(*lp, first, Some(xi.as_slice()));
            part.emission.merge(first.clone());
            merged.merge(part);
        }

        assert_eq!(merged.n_sequences, 3);
        assert_approx_eq!(merged.log_likelihood, sequential.log_likelihood);
        for i in 0..2 {
            assert_approx_eq!(merged.start[i], sequential.start[i]);
            assert_approx_eq!(merged.emission[i], sequential.emission[i]);
            for j in 0..2 {
                assert_approx_eq!(merged.trans[i][j], sequential.trans[i][j]);
            }
        }
    }
}
