//! Baum-Welch (EM) training loop.
//!
//! [`EmTrainer`] drives a [`HiddenMarkovModel`] through
//! `Uninitialized → Initializing → Iterating → {Converged, MaxIterReached}`.
//! Every iteration runs the E-step over all sequences (in parallel with the
//! `parallel` feature), merges the per-sequence statistics, then re-estimates
//! the start vector, the transition matrix and the emission parameters.

use std::fmt;
use std::ops::Range;

use crate::convergence::{ConvergenceMonitor, TrainingStatus};
use crate::emission_models::{EmissionModel, MergeStatistics};
use crate::errors::HmmResult;
use crate::forward_backward::{self, sanitize_log_likelihood, LogParameters};
use crate::hmm_config::{HmmConfig, ParamGroups};
use crate::hmm_core::{ChainParameters, HiddenMarkovModel};
use crate::hmm_results::FitReport;
use crate::math_utils::normalize;
use crate::sequences::SequenceIndex;
use crate::sufficient_stats::SufficientStatistics;

/// Lifecycle of one training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrainerState {
    Uninitialized,
    Initializing,
    Iterating,
    Converged,
    MaxIterReached,
}

impl fmt::Display for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainerState::Uninitialized => "uninitialized",
            TrainerState::Initializing => "initializing",
            TrainerState::Iterating => "iterating",
            TrainerState::Converged => "converged",
            TrainerState::MaxIterReached => "max-iter-reached",
        };
        f.write_str(name)
    }
}

/// Statistics of one sequence: forward-backward, then emission accumulation.
fn process_sequence<E: EmissionModel>(
    log_params: &LogParameters,
    emission: &E,
    obs: &E::Observations,
    span: Range<usize>,
    params: &ParamGroups,
) -> HmmResult<SufficientStatistics<E::Stats>> {
    let mut framelogprob = emission.log_likelihood(obs, span.clone())?;
    sanitize_log_likelihood(&mut framelogprob, span.start)?;
    let result = forward_backward::run(log_params, &framelogprob, params.transitions);

    let mut stats = SufficientStatistics::new(
        log_params.n_states(),
        emission.initialize_sufficient_statistics(),
    );
    if let Some(first) = result.posteriors.first() {
        stats.add_sequence(result.logprob, first, result.transitions.as_deref());
    }
    if params.any_emission() {
        emission.accumulate(&mut stats.emission, obs, span, &result.posteriors, params)?;
    }
    Ok(stats)
}

/// E-step over a whole batch.
///
/// Per-sequence statistics are independent; they are merged after every
/// sequence has been processed.
pub fn e_step<E: EmissionModel>(
    chain: &ChainParameters,
    emission: &E,
    obs: &E::Observations,
    index: &SequenceIndex,
    params: &ParamGroups,
) -> HmmResult<SufficientStatistics<E::Stats>> {
    let log_params = LogParameters::new(&chain.startprob, &chain.transmat);

    #[cfg(feature = "parallel")]
    let partials = {
        use rayon::prelude::*;
        index
            .spans()
            .par_iter()
            .map(|span| process_sequence(&log_params, emission, obs, span.clone(), params))
            .collect::<HmmResult<Vec<_>>>()?
    };
    #[cfg(not(feature = "parallel"))]
    let partials = index
        .iter()
        .map(|span| process_sequence(&log_params, emission, obs, span, params))
        .collect::<HmmResult<Vec<_>>>()?;

    let mut total = SufficientStatistics::new(
        chain.n_states(),
        emission.initialize_sufficient_statistics(),
    );
    for part in partials {
        total.merge(part);
    }
    Ok(total)
}

/// MAP update of one Dirichlet-distributed vector.
///
/// Entries that are currently zero stay zero; the rest become
/// `max(prior - 1 + counts, 0)` before normalization. Returns `None` when no
/// mass is left, in which case the caller keeps the current values.
fn dirichlet_update(current: &[f64], counts: &[f64], prior: &[f64]) -> Option<Vec<f64>> {
    let mut updated: Vec<f64> = current
        .iter()
        .zip(counts.iter().zip(prior.iter()))
        .map(|(&old, (&c, &a))| if old == 0.0 { 0.0 } else { (a - 1.0 + c).max(0.0) })
        .collect();
    if updated.iter().sum::<f64>() <= 0.0 {
        return None;
    }
    normalize(&mut updated);
    Some(updated)
}

/// M-step for the start vector and the transition matrix.
pub fn chain_m_step<S>(
    chain: &mut ChainParameters,
    stats: &SufficientStatistics<S>,
    config: &HmmConfig,
) -> HmmResult<()> {
    let n = chain.n_states();
    if config.params.start {
        let prior = config.startprob_prior.as_vector(n)?;
        match dirichlet_update(&chain.startprob, &stats.start, &prior) {
            Some(updated) => chain.startprob = updated,
            None => log::warn!("Start distribution received no mass; keeping previous values"),
        }
    }
    if config.params.transitions {
        let prior = config.transmat_prior.as_matrix(n)?;
        for (i, row) in chain.transmat.iter_mut().enumerate() {
            match dirichlet_update(row, &stats.trans[i], &prior[i]) {
                Some(updated) => *row = updated,
                None => log::debug!("Transition row {} received no mass; keeping previous values", i),
            }
        }
    }
    Ok(())
}

/// Drives EM training of a model.
#[derive(Debug, Clone)]
pub struct EmTrainer {
    state: TrainerState,
    monitor: ConvergenceMonitor,
}

impl EmTrainer {
    pub fn new(config: &HmmConfig) -> Self {
        Self {
            state: TrainerState::Uninitialized,
            monitor: ConvergenceMonitor::new(config.tol, config.n_iter, config.verbose),
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn monitor(&self) -> &ConvergenceMonitor {
        &self.monitor
    }

    /// Initialize `model` from the batch and iterate until convergence or budget exhaustion.
    pub fn run<E: EmissionModel>(
        &mut self,
        model: &mut HiddenMarkovModel<E>,
        obs: &E::Observations,
        index: &SequenceIndex,
    ) -> HmmResult<FitReport> {
        self.state = TrainerState::Initializing;
        self.monitor.reset();
        model.initialize(obs, index)?;
        model.validate()?;

        self.state = TrainerState::Iterating;
        let config = model.config.clone();
        log::debug!(
            "Training {}-state {} HMM on {} sequences ({} timesteps)",
            config.n_states,
            model.emission.family(),
            index.n_sequences(),
            index.n_timesteps()
        );

        for _ in 0..config.n_iter {
            let stats = e_step(&model.chain, &model.emission, obs, index, &config.params)?;
            chain_m_step(&mut model.chain, &stats, &config)?;
            model.emission.m_step(&stats.emission, &config.params)?;

            self.monitor.report(stats.log_likelihood);
            if self.monitor.converged() {
                break;
            }
        }

        let status = self.monitor.status();
        self.state = match status {
            TrainingStatus::Converged => TrainerState::Converged,
            TrainingStatus::MaxIterReached => TrainerState::MaxIterReached,
        };
        if status == TrainingStatus::MaxIterReached && config.n_iter > 0 {
            log::info!(
                "EM stopped after {} iterations without reaching tol = {}",
                self.monitor.iterations(),
                config.tol
            );
        }

        Ok(FitReport {
            status,
            iterations: self.monitor.iterations(),
            log_likelihood: self.monitor.history().last().copied().unwrap_or(f64::NAN),
            history: self.monitor.history().to_vec(),
            decreases: self.monitor.decreases().to_vec(),
        })
    }
}
