//! Result structures returned by training, decoding and model selection.

use crate::convergence::TrainingStatus;
use crate::decoder::DecoderAlgorithm;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Summary of a training run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitReport {
    /// How training stopped
    pub status: TrainingStatus,
    /// Number of completed EM iterations
    pub iterations: usize,
    /// Log-likelihood of the last E-step, NaN if no iteration ran
    pub log_likelihood: f64,
    /// Log-likelihood of every iteration
    pub history: Vec<f64>,
    /// Iterations (zero-based) at which the log-likelihood decreased
    pub decreases: Vec<usize>,
}

impl FitReport {
    pub fn converged(&self) -> bool {
        self.status == TrainingStatus::Converged
    }

    /// Whether the log-likelihood never went down.
    pub fn is_monotone(&self) -> bool {
        self.decreases.is_empty()
    }
}

/// Decoded state path over a batch of sequences.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DecodeResult {
    /// Sum over sequences of the decoder's log-probability
    pub log_prob: f64,
    /// Concatenated state paths
    pub states: Vec<usize>,
    /// Decoder that produced the path
    pub algorithm: DecoderAlgorithm,
}

/// Model selection criteria for a fitted HMM
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelCriteria {
    /// Total log-likelihood of the evaluated data
    pub log_likelihood: f64,
    /// Akaike Information Criterion
    pub aic: f64,
    /// Bayesian Information Criterion
    pub bic: f64,
    /// Number of free parameters
    pub num_parameters: usize,
    /// Number of timesteps the criteria were computed on
    pub num_samples: usize,
}

impl ModelCriteria {
    pub fn new(log_likelihood: f64, num_parameters: usize, num_samples: usize) -> Self {
        let k = num_parameters as f64;
        Self {
            log_likelihood,
            aic: -2.0 * log_likelihood + 2.0 * k,
            bic: -2.0 * log_likelihood + k * (num_samples as f64).ln(),
            num_parameters,
            num_samples,
        }
    }
}
