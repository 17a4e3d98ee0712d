//! Viterbi and MAP decoding of a single sequence.
//!
//! Both decoders expect a log-likelihood matrix that has already been
//! sanitized by [`crate::forward_backward::sanitize_log_likelihood`].

use std::fmt;
use std::str::FromStr;

use crate::errors::HmmError;
use crate::forward_backward::{self, LogParameters};
use crate::math_utils::argmax;

/// Decoding strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecoderAlgorithm {
    /// Single most probable state path (max-product).
    #[default]
    Viterbi,
    /// Per-timestep argmax of the state posteriors.
    ///
    /// Adjacent decoded states may be joined by a zero-probability
    /// transition; the path is not guaranteed to be feasible.
    Map,
}

impl fmt::Display for DecoderAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderAlgorithm::Viterbi => f.write_str("viterbi"),
            DecoderAlgorithm::Map => f.write_str("map"),
        }
    }
}

impl FromStr for DecoderAlgorithm {
    type Err = HmmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "viterbi" => Ok(DecoderAlgorithm::Viterbi),
            "map" => Ok(DecoderAlgorithm::Map),
            other => Err(HmmError::InvalidParameter {
                parameter: format!("algorithm '{}'", other),
                value: f64::NAN,
                constraint: "viterbi or map".to_string(),
            }),
        }
    }
}

/// Most probable path and its log-probability.
///
/// Ties, both in the recursion and at the final step, go to the lowest state
/// index.
pub fn viterbi(params: &LogParameters, framelogprob: &[Vec<f64>]) -> (f64, Vec<usize>) {
    let n = params.n_states();
    let n_samples = framelogprob.len();
    if n_samples == 0 {
        return (0.0, Vec::new());
    }

    let mut delta: Vec<f64> = (0..n)
        .map(|k| params.startprob[k] + framelogprob[0][k])
        .collect();
    let mut backpointers = vec![vec![0usize; n]; n_samples];
    let mut work = vec![0.0; n];

    for t in 1..n_samples {
        let next: Vec<f64> = (0..n)
            .map(|k| {
                for (j, w) in work.iter_mut().enumerate() {
                    *w = delta[j] + params.transmat[j][k];
                }
                let (best, value) = argmax(&work);
                backpointers[t][k] = best;
                value + framelogprob[t][k]
            })
            .collect();
        delta = next;
    }

    let (last, logprob) = argmax(&delta);
    let mut path = vec![0; n_samples];
    path[n_samples - 1] = last;
    for t in (1..n_samples).rev() {
        path[t - 1] = backpointers[t][path[t]];
    }
    (logprob, path)
}

/// Per-timestep posterior argmax.
///
/// The returned score is `Σ_t ln max_k γ[t, k]`.
pub fn map(params: &LogParameters, framelogprob: &[Vec<f64>]) -> (f64, Vec<usize>) {
    let result = forward_backward::run(params, framelogprob, false);
    let mut logprob = 0.0;
    let path = result
        .posteriors
        .iter()
        .map(|gamma| {
            let (state, p) = argmax(gamma);
            logprob += p.ln();
            state
        })
        .collect();
    (logprob, path)
}

/// Dispatch on the configured algorithm.
pub fn decode(
    algorithm: DecoderAlgorithm,
    params: &LogParameters,
    framelogprob: &[Vec<f64>],
) -> (f64, Vec<usize>) {
    match algorithm {
        DecoderAlgorithm::Viterbi => viterbi(params, framelogprob),
        DecoderAlgorithm::Map => map(params, framelogprob),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn sticky() -> LogParameters {
        LogParameters::new(&[0.5, 0.5], &[vec![0.9, 0.1], vec![0.1, 0.9]])
    }

    #[test]
    fn test_viterbi_follows_strong_evidence() {
        let framelogprob = vec![
            vec![-0.1, -5.0],
            vec![-0.1, -5.0],
            vec![-5.0, -0.1],
            vec![-5.0, -0.1],
        ];
        let (logprob, path) = viterbi(&sticky(), &framelogprob);
        assert_eq!(path, vec![0, 0, 1, 1]);
        // ln 0.5 + 4 * (-0.1) + 2 ln 0.9 + ln 0.1
        let exact = 0.5f64.ln() - 0.4 + 2.0 * 0.9f64.ln() + 0.1f64.ln();
        assert_approx_eq!(logprob, exact, 1e-12);
    }

    #[test]
    fn test_viterbi_ties_go_to_lowest_state() {
        let params = LogParameters::new(&[0.5, 0.5], &[vec![0.5, 0.5], vec![0.5, 0.5]]);
        let framelogprob = vec![vec![-1.0, -1.0]; 3];
        let (_, path) = viterbi(&params, &framelogprob);
        assert_eq!(path, vec![0, 0, 0]);
    }

    #[test]
    fn test_viterbi_bounded_by_forward_likelihood() {
        let framelogprob = vec![vec![-1.0, -2.0], vec![-0.5, -0.7], vec![-3.0, -0.2]];
        let (best, path) = viterbi(&sticky(), &framelogprob);
        let (total, _) = forward_backward::forward(&sticky(), &framelogprob);
        assert_eq!(path.len(), 3);
        assert!(best <= total);
    }

    #[test]
    fn test_map_uses_posteriors_not_local_evidence() {
        // State 1 is unreachable, so local evidence for it at t = 1 is overruled.
        let params = LogParameters::new(&[1.0, 0.0], &[vec![1.0, 0.0], vec![0.0, 1.0]]);
        let framelogprob = vec![vec![0.0, -1.0], vec![-1.0, 0.0]];
        let (_, viterbi_path) = viterbi(&params, &framelogprob);
        let (logprob, map_path) = map(&params, &framelogprob);
        assert_eq!(viterbi_path, vec![0, 0]);
        assert_eq!(map_path, vec![0, 0]);
        assert_approx_eq!(logprob, 0.0, 1e-12);
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("viterbi".parse::<DecoderAlgorithm>().unwrap(), DecoderAlgorithm::Viterbi);
        assert_eq!("MAP".parse::<DecoderAlgorithm>().unwrap(), DecoderAlgorithm::Map);
        assert!("beam".parse::<DecoderAlgorithm>().is_err());
    }
}
