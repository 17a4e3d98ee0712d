//! Independent Poisson emissions: one rate per state and feature.

use std::ops::Range;

use statrs::function::gamma::ln_gamma;

use crate::clustering::Clusterer;
use crate::emission_models::{add_assign, add_assign_rows, EmissionModel, MergeStatistics};
use crate::errors::{HmmError, HmmResult};
use crate::hmm_config::ParamGroups;
use crate::math_utils::constants::MIN_RATE;
use crate::rng::ModelRng;
use crate::sequences::{FeatureMatrix, SequenceIndex};

/// Log-probability mass of `count` events under a Poisson with mean `rate`.
pub fn poisson_log_pmf(count: f64, rate: f64) -> f64 {
    if rate == 0.0 {
        return if count == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    count * rate.ln() - rate - ln_gamma(count + 1.0)
}

/// Poisson emission parameters with a Gamma-style rate prior.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoissonEmission {
    n_states: usize,
    /// Prior mean rate
    pub lambdas_prior: f64,
    /// Weight of the rate prior in pseudo-observations
    pub lambdas_weight: f64,
    n_features: Option<usize>,
    lambdas: Vec<Vec<f64>>,
}

/// Sufficient statistics of the Poisson family.
#[derive(Debug, Clone, PartialEq)]
pub struct PoissonStats {
    /// Σ_t γ[t, k]
    pub post: Vec<f64>,
    /// Σ_t γ[t, k] x_t
    pub obs: Vec<Vec<f64>>,
}

impl MergeStatistics for PoissonStats {
    fn merge(&mut self, other: Self) {
        add_assign(&mut self.post, &other.post);
        add_assign_rows(&mut self.obs, &other.obs);
    }
}

impl PoissonEmission {
    pub fn new(n_states: usize) -> Self {
        Self {
            n_states,
            lambdas_prior: 0.0,
            lambdas_weight: 0.0,
            n_features: None,
            lambdas: Vec::new(),
        }
    }

    pub fn with_lambdas_prior(mut self, prior: f64, weight: f64) -> Self {
        self.lambdas_prior = prior;
        self.lambdas_weight = weight;
        self
    }

    /// Rates, one row per state.
    pub fn lambdas(&self) -> &[Vec<f64>] {
        &self.lambdas
    }

    pub fn set_lambdas(&mut self, lambdas: Vec<Vec<f64>>) -> HmmResult<()> {
        if lambdas.len() != self.n_states {
            return Err(HmmError::shape("lambdas", self.n_states, lambdas.len()));
        }
        let dim = self
            .n_features
            .unwrap_or_else(|| lambdas.first().map(|r| r.len()).unwrap_or(0));
        check_rates(&lambdas, dim)?;
        self.n_features = Some(dim);
        self.lambdas = lambdas;
        Ok(())
    }
}

fn check_rates(lambdas: &[Vec<f64>], dim: usize) -> HmmResult<()> {
    for (k, row) in lambdas.iter().enumerate() {
        if row.len() != dim {
            return Err(HmmError::ShapeMismatch {
                what: format!("lambdas of state {}", k),
                expected: dim.to_string(),
                actual: row.len().to_string(),
            });
        }
        if let Some(&r) = row.iter().find(|r| !(r.is_finite() && **r >= 0.0)) {
            return Err(HmmError::distribution(
                "lambdas",
                Some(k),
                format!("rate must be finite and non-negative, got {}", r),
            ));
        }
    }
    Ok(())
}

impl EmissionModel for PoissonEmission {
    type Observations = FeatureMatrix;
    type Stats = PoissonStats;

    fn family(&self) -> &'static str {
        "poisson"
    }

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn is_initialized(&self) -> bool {
        self.n_features.is_some() && self.lambdas.len() == self.n_states
    }

    fn initialize(
        &mut self,
        obs: &FeatureMatrix,
        _index: &SequenceIndex,
        init_params: &ParamGroups,
        clusterer: &dyn Clusterer,
        rng: &mut ModelRng,
    ) -> HmmResult<()> {
        self.check_observations(obs)?;
        if init_params.location || self.lambdas.len() != self.n_states {
            let centers = clusterer.fit_partition(&obs.all_rows(), self.n_states, rng)?;
            self.lambdas = centers
                .into_iter()
                .map(|row| row.into_iter().map(|c| c.max(MIN_RATE)).collect())
                .collect();
            log::debug!("Seeded {} Poisson rate vectors with k-means", self.n_states);
        }
        self.n_features = Some(obs.n_features());
        Ok(())
    }

    fn validate(&self) -> HmmResult<()> {
        let dim = self.n_features.ok_or_else(|| HmmError::NotInitialized {
            operation: "validate".to_string(),
        })?;
        if self.lambdas.len() != self.n_states {
            return Err(HmmError::shape("lambdas", self.n_states, self.lambdas.len()));
        }
        check_rates(&self.lambdas, dim)
    }

    fn check_observations(&self, obs: &FeatureMatrix) -> HmmResult<()> {
        if let Some(d) = self.n_features {
            if d != obs.n_features() {
                return Err(HmmError::shape("observation features", d, obs.n_features()));
            }
        }
        if let Some(i) = obs
            .as_slice()
            .iter()
            .position(|&x| x < 0.0 || x.fract() != 0.0)
        {
            return Err(HmmError::observation(
                Some(i / obs.n_features().max(1)),
                format!("Poisson counts must be non-negative integers, got {}", obs.as_slice()[i]),
            ));
        }
        Ok(())
    }

    fn log_likelihood(&self, obs: &FeatureMatrix, span: Range<usize>) -> HmmResult<Vec<Vec<f64>>> {
        if self.lambdas.len() != self.n_states {
            return Err(HmmError::NotInitialized {
                operation: "log_likelihood".to_string(),
            });
        }
        Ok(obs
            .rows(span)
            .map(|x| {
                self.lambdas
                    .iter()
                    .map(|rates| {
                        x.iter()
                            .zip(rates.iter())
                            .map(|(&c, &r)| poisson_log_pmf(c, r))
                            .sum()
                    })
                    .collect()
            })
            .collect())
    }

    fn initialize_sufficient_statistics(&self) -> PoissonStats {
        PoissonStats {
            post: vec![0.0; self.n_states],
            obs: vec![vec![0.0; self.n_features.unwrap_or(0)]; self.n_states],
        }
    }

    fn accumulate(
        &self,
        stats: &mut PoissonStats,
        obs: &FeatureMatrix,
        span: Range<usize>,
        posteriors: &[Vec<f64>],
        _params: &ParamGroups,
    ) -> HmmResult<()> {
        for (x, gamma) in obs.rows(span).zip(posteriors.iter()) {
            for (k, &g) in gamma.iter().enumerate() {
                stats.post[k] += g;
                for (acc, &c) in stats.obs[k].iter_mut().zip(x.iter()) {
                    *acc += g * c;
                }
            }
        }
        Ok(())
    }

    fn m_step(&mut self, stats: &PoissonStats, params: &ParamGroups) -> HmmResult<()> {
        if !params.location {
            return Ok(());
        }
        let prior_mass = self.lambdas_weight * self.lambdas_prior;
        for (k, rates) in self.lambdas.iter_mut().enumerate() {
            let denom = self.lambdas_weight + stats.post[k];
            if denom <= 0.0 {
                continue;
            }
            for (r, &o) in rates.iter_mut().zip(stats.obs[k].iter()) {
                *r = ((prior_mass + o) / denom).max(MIN_RATE);
            }
        }
        Ok(())
    }

    fn sample(&self, state: usize, rng: &mut ModelRng) -> HmmResult<Vec<f64>> {
        let rates = self.lambdas.get(state).ok_or_else(|| HmmError::NotInitialized {
            operation: "sample".to_string(),
        })?;
        rates
            .iter()
            .map(|&r| rng.poisson(r).map(|c| c as f64))
            .collect()
    }

    fn empty_observations(&self) -> FeatureMatrix {
        FeatureMatrix::empty(self.n_features.unwrap_or(0))
    }

    fn n_free_parameters(&self) -> usize {
        self.n_states * self.n_features.unwrap_or(0)
    }
}
