//! Convergence monitoring for EM training.

use std::fmt;

/// Outcome of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrainingStatus {
    /// Gain dropped below the tolerance.
    Converged,
    /// Iteration budget exhausted first.
    MaxIterReached,
}

impl fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingStatus::Converged => f.write_str("converged"),
            TrainingStatus::MaxIterReached => f.write_str("maximum iterations reached"),
        }
    }
}

/// Records the log-likelihood of every iteration and applies the stopping rule.
///
/// Training stops once the gain between the last two iterations falls below
/// `tol`, or after `n_iter` iterations. A decrease is recorded and logged but
/// never aborts training.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConvergenceMonitor {
    /// Gain threshold
    pub tol: f64,
    /// Iteration budget
    pub n_iter: usize,
    /// Report every iteration at info level
    pub verbose: bool,
    history: Vec<f64>,
    decreases: Vec<usize>,
}

impl ConvergenceMonitor {
    pub fn new(tol: f64, n_iter: usize, verbose: bool) -> Self {
        Self {
            tol,
            n_iter,
            verbose,
            history: Vec::new(),
            decreases: Vec::new(),
        }
    }

    /// Forget everything recorded so far.
    pub fn reset(&mut self) {
        self.history.clear();
        self.decreases.clear();
    }

    /// Append the log-likelihood of a finished iteration.
    pub fn report(&mut self, log_likelihood: f64) {
        let iter = self.history.len();
        let delta = self
            .history
            .last()
            .map(|prev| log_likelihood - prev)
            .unwrap_or(f64::NAN);

        if self.verbose {
            log::info!(
                "EM iteration {:>4}: log-likelihood {:.6}, gain {:+.6}",
                iter + 1,
                log_likelihood,
                delta
            );
        } else {
            log::debug!(
                "EM iteration {}: log-likelihood {:.6}, gain {:+.6}",
                iter + 1,
                log_likelihood,
                delta
            );
        }

        if delta < 0.0 {
            log::warn!(
                "Log-likelihood decreased by {:.6e} at iteration {}; \
                 the model may be numerically unstable or the data too scarce",
                -delta,
                iter + 1
            );
            self.decreases.push(iter);
        }
        self.history.push(log_likelihood);
    }

    /// Recorded log-likelihoods, one per iteration.
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// Iterations (zero-based) whose log-likelihood fell below the previous one.
    pub fn decreases(&self) -> &[usize] {
        &self.decreases
    }

    pub fn iterations(&self) -> usize {
        self.history.len()
    }

    /// Whether the gain of the last iteration is below `tol`.
    pub fn converged_by_tolerance(&self) -> bool {
        match self.history.as_slice() {
            [.., prev, last] => last - prev < self.tol,
            _ => false,
        }
    }

    /// Whether training should stop.
    pub fn converged(&self) -> bool {
        self.history.len() >= self.n_iter || self.converged_by_tolerance()
    }

    /// Final status once training has stopped.
    pub fn status(&self) -> TrainingStatus {
        if self.converged_by_tolerance() {
            TrainingStatus::Converged
        } else {
            TrainingStatus::MaxIterReached
        }
    }
}
