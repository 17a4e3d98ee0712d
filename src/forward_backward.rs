//! Log-domain forward-backward recursions for a single sequence.
//!
//! The start vector and the transition matrix are converted to the log
//! domain once per iteration ([`LogParameters`]) and then shared by every
//! sequence. Lattices are owned by one call and dropped once the posteriors
//! have been derived.

use crate::errors::{HmmError, HmmResult};
use crate::math_utils::constants::MIN_LOGLIKELIHOOD;
use crate::math_utils::{log_matrix, log_vector, logaddexp, logsumexp};

/// Start vector and transition matrix in the log domain.
#[derive(Debug, Clone, PartialEq)]
pub struct LogParameters {
    /// ln startprob
    pub startprob: Vec<f64>,
    /// ln transmat, row `i` holds transitions out of state `i`
    pub transmat: Vec<Vec<f64>>,
}

impl LogParameters {
    pub fn new(startprob: &[f64], transmat: &[Vec<f64>]) -> Self {
        Self {
            startprob: log_vector(startprob),
            transmat: log_matrix(transmat),
        }
    }

    pub fn n_states(&self) -> usize {
        self.startprob.len()
    }
}

/// Reject impossible timesteps and clamp the remaining entries at the floor.
///
/// A row whose entries are all `-inf`, or that contains a NaN, makes the
/// observation impossible under every state and is reported with its index in
/// the concatenated buffer (`offset + t`). Entries below
/// [`MIN_LOGLIKELIHOOD`] are raised to it.
pub fn sanitize_log_likelihood(framelogprob: &mut [Vec<f64>], offset: usize) -> HmmResult<()> {
    for (t, row) in framelogprob.iter_mut().enumerate() {
        if row.iter().any(|v| v.is_nan()) {
            return Err(HmmError::observation(
                Some(offset + t),
                "emission log-likelihood is NaN",
            ));
        }
        if row.iter().all(|&v| v == f64::NEG_INFINITY) {
            return Err(HmmError::observation(
                Some(offset + t),
                "observation has zero likelihood under every state",
            ));
        }
        for v in row.iter_mut() {
            if *v < MIN_LOGLIKELIHOOD {
                *v = MIN_LOGLIKELIHOOD;
            }
        }
    }
    Ok(())
}

/// Forward lattice and the sequence log-likelihood `logsumexp_k α[T-1, k]`.
pub fn forward(params: &LogParameters, framelogprob: &[Vec<f64>]) -> (f64, Vec<Vec<f64>>) {
    let n = params.n_states();
    let mut alpha: Vec<Vec<f64>> = Vec::with_capacity(framelogprob.len());
    let mut work = vec![0.0; n];

    for (t, frame) in framelogprob.iter().enumerate() {
        let row: Vec<f64> = if t == 0 {
            (0..n).map(|k| params.startprob[k] + frame[k]).collect()
        } else {
            let prev = &alpha[t - 1];
            (0..n)
                .map(|k| {
                    for (j, w) in work.iter_mut().enumerate() {
                        *w = prev[j] + params.transmat[j][k];
                    }
                    logsumexp(&work) + frame[k]
                })
                .collect()
        };
        alpha.push(row);
    }

    let logprob = alpha.last().map(|row| logsumexp(row)).unwrap_or(0.0);
    (logprob, alpha)
}

/// Backward lattice with `β[T-1, k] = 0`.
pub fn backward(params: &LogParameters, framelogprob: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = params.n_states();
    let n_samples = framelogprob.len();
    let mut beta = vec![vec![0.0; n]; n_samples];
    let mut work = vec![0.0; n];

    for t in (0..n_samples.saturating_sub(1)).rev() {
        for k in 0..n {
            for (j, w) in work.iter_mut().enumerate() {
                *w = params.transmat[k][j] + framelogprob[t + 1][j] + beta[t + 1][j];
            }
            beta[t][k] = logsumexp(&work);
        }
    }
    beta
}

/// State posteriors `γ[t, k]` from the two lattices.
pub fn posteriors(alpha: &[Vec<f64>], beta: &[Vec<f64>]) -> Vec<Vec<f64>> {
    alpha
        .iter()
        .zip(beta.iter())
        .map(|(a, b)| {
            let joint: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| x + y).collect();
            let norm = logsumexp(&joint);
            joint.iter().map(|v| (v - norm).exp()).collect()
        })
        .collect()
}

/// `ln Σ_t ξ[t, i, j]`, the log of the expected transition counts of one sequence.
pub fn log_xi_sum(
    params: &LogParameters,
    framelogprob: &[Vec<f64>],
    alpha: &[Vec<f64>],
    beta: &[Vec<f64>],
    logprob: f64,
) -> Vec<Vec<f64>> {
    let n = params.n_states();
    let mut acc = vec![vec![f64::NEG_INFINITY; n]; n];
    for t in 0..framelogprob.len().saturating_sub(1) {
        for i in 0..n {
            for j in 0..n {
                let xi = alpha[t][i]
                    + params.transmat[i][j]
                    + framelogprob[t + 1][j]
                    + beta[t + 1][j]
                    - logprob;
                acc[i][j] = logaddexp(acc[i][j], xi);
            }
        }
    }
    acc
}

/// Everything the E-step needs from one sequence.
#[derive(Debug, Clone)]
pub struct SequencePosteriors {
    /// Log-likelihood of the sequence
    pub logprob: f64,
    /// State posteriors, shape `(T, K)`
    pub posteriors: Vec<Vec<f64>>,
    /// Expected transition counts, present when requested
    pub transitions: Option<Vec<Vec<f64>>>,
}

/// Run both passes over one sanitized log-likelihood matrix.
pub fn run(
    params: &LogParameters,
    framelogprob: &[Vec<f64>],
    with_transitions: bool,
) -> SequencePosteriors {
    let (logprob, alpha) = forward(params, framelogprob);
    let beta = backward(params, framelogprob);
    let transitions = with_transitions.then(|| {
        log_xi_sum(params, framelogprob, &alpha, &beta, logprob)
            .into_iter()
            .map(|row| row.into_iter().map(f64::exp).collect())
            .collect()
    });
    SequencePosteriors {
        logprob,
        posteriors: posteriors(&alpha, &beta),
        transitions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn toy() -> (LogParameters, Vec<Vec<f64>>) {
        let params = LogParameters::new(&[0.6, 0.4], &[vec![0.7, 0.3], vec![0.4, 0.6]]);
        let probs = [[0.5, 0.1], [0.4, 0.3], [0.1, 0.6]];
        let framelogprob = probs.iter().map(|r| r.iter().map(|p: &f64| p.ln()).collect()).collect();
        (params, framelogprob)
    }

    /// Brute-force likelihood by enumerating all 2^3 paths.
    fn enumerate_paths() -> f64 {
        let start = [0.6, 0.4];
        let trans = [[0.7, 0.3], [0.4, 0.6]];
        let emit = [[0.5, 0.1], [0.4, 0.3], [0.1, 0.6]];
        let mut total = 0.0;
        for a in 0..2 {
            for b in 0..2 {
                for c in 0..2 {
                    total += start[a] * emit[0][a] * trans[a][b] * emit[1][b] * trans[b][c] * emit[2][c];
                }
            }
        }
        total
    }

    #[test]
    fn test_forward_matches_path_enumeration() {
        let (params, framelogprob) = toy();
        let (logprob, _) = forward(&params, &framelogprob);
        assert_approx_eq!(logprob, enumerate_paths().ln(), 1e-12);
    }

    #[test]
    fn test_backward_agrees_with_forward() {
        let (params, framelogprob) = toy();
        let (logprob, _) = forward(&params, &framelogprob);
        let beta = backward(&params, &framelogprob);
        let first: Vec<f64> = (0..2)
            .map(|k| params.startprob[k] + framelogprob[0][k] + beta[0][k])
            .collect();
        assert_approx_eq!(logsumexp(&first), logprob, 1e-12);
    }

    #[test]
    fn test_posteriors_and_transitions_are_consistent() {
        let (params, framelogprob) = toy();
        let result = run(&params, &framelogprob, true);
        for row in &result.posteriors {
            assert_approx_eq!(row.iter().sum::<f64>(), 1.0, 1e-12);
        }
        // Expected transitions sum to T - 1.
        let xi = result.transitions.unwrap();
        let total: f64 = xi.iter().flatten().sum();
        assert_approx_eq!(total, 2.0, 1e-12);
        // Outgoing transitions of state i equal its occupancy over t < T - 1.
        for i in 0..2 {
            let out: f64 = xi[i].iter().sum();
            let occupancy = result.posteriors[0][i] + result.posteriors[1][i];
            assert_approx_eq!(out, occupancy, 1e-12);
        }
    }

    #[test]
    fn test_sanitize_clamps_and_rejects() {
        let mut ok = vec![vec![f64::NEG_INFINITY, -1.0], vec![-900.0, -2.0]];
        sanitize_log_likelihood(&mut ok, 0).unwrap();
        assert_eq!(ok[0][0], MIN_LOGLIKELIHOOD);
        assert_eq!(ok[1][0], MIN_LOGLIKELIHOOD);
        assert_eq!(ok[1][1], -2.0);

        let mut impossible = vec![vec![-1.0, -1.0], vec![f64::NEG_INFINITY; 2]];
        match sanitize_log_likelihood(&mut impossible, 10) {
            Err(HmmError::InvalidObservation { index, .. }) => assert_eq!(index, Some(11)),
            other => panic!("Expected InvalidObservation, got {:?}", other),
        }
    }

    #[test]
    fn test_single_timestep_sequence() {
        let params = LogParameters::new(&[0.5, 0.5], &[vec![0.5, 0.5], vec![0.5, 0.5]]);
        let framelogprob = vec![vec![0.0, 0.0]];
        let result = run(&params, &framelogprob, true);
        assert_approx_eq!(result.logprob, 0.0, 1e-12);
        assert_eq!(result.transitions.unwrap(), vec![vec![0.0; 2]; 2]);
    }
}
