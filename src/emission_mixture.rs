//! Gaussian-mixture emissions: each state emits from its own weighted mixture
//! of `n_mix` Gaussians.
//!
//! The E-step splits every state posterior γ[t, k] across the components of
//! state `k` in proportion to their weighted densities. The M-step applies a
//! Dirichlet prior to the weights, a Normal prior to the means and a
//! Wishart-type prior to the covariances. The default covariance priors make
//! the update reduce to the maximum-likelihood estimate.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};

use crate::clustering::{assign_to_nearest, Clusterer};
use crate::covariance::{regularized_covariance, CovarianceType, Covariances, PreparedGaussian};
use crate::emission_models::{add_assign, add_assign_rows, EmissionModel, MergeStatistics};
use crate::errors::{validate_probability_vector, HmmError, HmmResult};
use crate::hmm_config::ParamGroups;
use crate::math_utils::{logsumexp, sample_from_cdf, safe_ln};
use crate::rng::ModelRng;
use crate::sequences::{FeatureMatrix, SequenceIndex};

/// Gaussian-mixture emission parameters and hyper-parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianMixtureEmission {
    n_states: usize,
    n_mix: usize,
    covariance_type: CovarianceType,
    /// Added to the diagonal of the initial empirical covariance
    pub min_covar: f64,
    /// Dirichlet concentration of the mixture weights
    pub weights_prior: f64,
    /// Prior mean of every component mean
    pub means_prior: f64,
    /// Weight of the mean prior
    pub means_weight: f64,
    /// Covariance prior scale; `None` picks the default of the structuring
    pub covars_prior: Option<f64>,
    /// Covariance prior weight; `None` picks the default of the structuring
    pub covars_weight: Option<f64>,
    n_features: Option<usize>,
    weights: Vec<Vec<f64>>,
    means: Vec<Vec<Vec<f64>>>,
    covars: Vec<Covariances>,
}

/// Sufficient statistics of the mixture family, indexed `[state][mix]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureStats {
    /// Σ_t γ[t, k]
    pub post_sum: Vec<f64>,
    /// Σ_t γ[t, k] ρ[t, k, m]
    pub post_mix_sum: Vec<Vec<f64>>,
    /// Σ_t γρ x_t
    pub obs: Vec<Vec<Vec<f64>>>,
    /// Σ_t γρ (x_t - μ)², element-wise, around the current means (spherical, diagonal)
    pub scatter_diag: Vec<Vec<Vec<f64>>>,
    /// Σ_t γρ (x_t - μ)(x_t - μ)ᵀ around the current means (full, tied)
    pub scatter: Vec<Vec<DMatrix<f64>>>,
}

impl MergeStatistics for MixtureStats {
    fn merge(&mut self, other: Self) {
        add_assign(&mut self.post_sum, &other.post_sum);
        add_assign_rows(&mut self.post_mix_sum, &other.post_mix_sum);
        for (a, b) in self.obs.iter_mut().zip(other.obs.iter()) {
            add_assign_rows(a, b);
        }
        for (a, b) in self.scatter_diag.iter_mut().zip(other.scatter_diag.iter()) {
            add_assign_rows(a, b);
        }
        for (a, b) in self.scatter.iter_mut().zip(other.scatter) {
            for (ma, mb) in a.iter_mut().zip(b) {
                *ma += mb;
            }
        }
    }
}

impl GaussianMixtureEmission {
    pub fn new(n_states: usize, n_mix: usize, covariance_type: CovarianceType) -> Self {
        Self {
            n_states,
            n_mix,
            covariance_type,
            min_covar: 1e-3,
            weights_prior: 1.0,
            means_prior: 0.0,
            means_weight: 0.0,
            covars_prior: None,
            covars_weight: None,
            n_features: None,
            weights: Vec::new(),
            means: Vec::new(),
            covars: Vec::new(),
        }
    }

    pub fn with_min_covar(mut self, min_covar: f64) -> Self {
        self.min_covar = min_covar;
        self
    }

    pub fn with_weights_prior(mut self, alpha: f64) -> Self {
        self.weights_prior = alpha;
        self
    }

    pub fn with_means_prior(mut self, prior: f64, weight: f64) -> Self {
        self.means_prior = prior;
        self.means_weight = weight;
        self
    }

    pub fn with_covars_prior(mut self, prior: f64, weight: f64) -> Self {
        self.covars_prior = Some(prior);
        self.covars_weight = Some(weight);
        self
    }

    pub fn n_mix(&self) -> usize {
        self.n_mix
    }

    pub fn covariance_type(&self) -> CovarianceType {
        self.covariance_type
    }

    pub fn weights(&self) -> &[Vec<f64>] {
        &self.weights
    }

    pub fn means(&self) -> &[Vec<Vec<f64>>] {
        &self.means
    }

    /// Per-state covariances over that state's mixture components.
    pub fn covars(&self) -> &[Covariances] {
        &self.covars
    }

    pub fn set_weights(&mut self, weights: Vec<Vec<f64>>) -> HmmResult<()> {
        if weights.len() != self.n_states {
            return Err(HmmError::shape("mixture weights", self.n_states, weights.len()));
        }
        for (k, row) in weights.iter().enumerate() {
            validate_probability_vector(row, self.n_mix, "mixture weights", Some(k))?;
        }
        self.weights = weights;
        Ok(())
    }

    pub fn set_means(&mut self, means: Vec<Vec<Vec<f64>>>) -> HmmResult<()> {
        let dim = self.n_features.unwrap_or_else(|| {
            means
                .first()
                .and_then(|s| s.first())
                .map(|m| m.len())
                .unwrap_or(0)
        });
        self.check_means_shape(&means, dim)?;
        self.n_features = Some(dim);
        self.means = means;
        Ok(())
    }

    pub fn set_covars(&mut self, covars: Vec<Covariances>) -> HmmResult<()> {
        if covars.len() != self.n_states {
            return Err(HmmError::shape("mixture covars", self.n_states, covars.len()));
        }
        for c in &covars {
            if c.covariance_type() != self.covariance_type {
                return Err(HmmError::shape(
                    "covariance type",
                    self.covariance_type,
                    c.covariance_type(),
                ));
            }
            if let Some(d) = self.n_features {
                c.validate(self.n_mix, d)?;
            }
        }
        self.covars = covars;
        Ok(())
    }

    /// Covariance prior `(scale, weight)` in effect for `n_features` features.
    pub fn covars_priors(&self, n_features: usize) -> (f64, f64) {
        let d = n_features as f64;
        let m = self.n_mix as f64;
        let (prior, weight) = match self.covariance_type {
            CovarianceType::Full => (0.0, -(1.0 + d + 1.0)),
            CovarianceType::Tied => (0.0, -(m + d + 1.0)),
            CovarianceType::Diag => (-1.5, 0.0),
            CovarianceType::Spherical => (-(m + 2.0) / 2.0, 0.0),
        };
        (
            self.covars_prior.unwrap_or(prior),
            self.covars_weight.unwrap_or(weight),
        )
    }

    fn check_means_shape(&self, means: &[Vec<Vec<f64>>], dim: usize) -> HmmResult<()> {
        if means.len() != self.n_states {
            return Err(HmmError::shape("mixture means", self.n_states, means.len()));
        }
        for (k, state) in means.iter().enumerate() {
            if state.len() != self.n_mix {
                return Err(HmmError::ShapeMismatch {
                    what: format!("mixture means of state {}", k),
                    expected: self.n_mix.to_string(),
                    actual: state.len().to_string(),
                });
            }
            if let Some(m) = state.iter().position(|mean| mean.len() != dim) {
                return Err(HmmError::ShapeMismatch {
                    what: format!("mean of component {} of state {}", m, k),
                    expected: dim.to_string(),
                    actual: state[m].len().to_string(),
                });
            }
        }
        Ok(())
    }

    fn prepared(&self) -> HmmResult<Vec<Vec<PreparedGaussian>>> {
        if self.covars.len() != self.n_states || self.means.len() != self.n_states {
            return Err(HmmError::NotInitialized {
                operation: "mixture density evaluation".to_string(),
            });
        }
        self.means
            .iter()
            .zip(self.covars.iter())
            .map(|(state_means, covars)| {
                state_means
                    .iter()
                    .enumerate()
                    .map(|(m, mean)| PreparedGaussian::from_covariances(mean, covars, m))
                    .collect::<HmmResult<Vec<_>>>()
            })
            .collect()
    }

    fn log_weighted_densities(
        &self,
        prepared: &[PreparedGaussian],
        state: usize,
        x: &[f64],
    ) -> Vec<f64> {
        prepared
            .iter()
            .zip(self.weights[state].iter())
            .map(|(g, &w)| g.log_pdf(x) + safe_ln(w))
            .collect()
    }

    fn update_weights(&mut self, stats: &MixtureStats) {
        let alpha_minus_one = self.weights_prior - 1.0;
        for k in 0..self.n_states {
            let mut row: Vec<f64> = stats.post_mix_sum[k]
                .iter()
                .map(|&p| (p + alpha_minus_one).max(0.0))
                .collect();
            let total: f64 = row.iter().sum();
            if total > 0.0 {
                row.iter_mut().for_each(|w| *w /= total);
                self.weights[k] = row;
            }
        }
    }

    fn update_means(&self, stats: &MixtureStats) -> Vec<Vec<Vec<f64>>> {
        let lambda = self.means_weight;
        let mut updated = self.means.clone();
        for k in 0..self.n_states {
            for m in 0..self.n_mix {
                let denom = stats.post_mix_sum[k][m] + lambda;
                if denom <= 0.0 {
                    continue;
                }
                for (j, value) in updated[k][m].iter_mut().enumerate() {
                    *value = (stats.obs[k][m][j] + lambda * self.means_prior) / denom;
                }
            }
        }
        updated
    }

    fn update_covars(&self, stats: &MixtureStats, n_features: usize) -> Vec<Covariances> {
        let d = n_features as f64;
        let n_mix = self.n_mix as f64;
        let lambda = self.means_weight;
        let (prior, weight) = self.covars_priors(n_features);
        let psi = DMatrix::<f64>::identity(n_features, n_features) * prior;

        let centered_means: Vec<Vec<DVector<f64>>> = self
            .means
            .iter()
            .map(|state| {
                state
                    .iter()
                    .map(|mean| DVector::from_column_slice(mean).add_scalar(-self.means_prior))
                    .collect()
            })
            .collect();

        (0..self.n_states)
            .map(|k| match &self.covars[k] {
                Covariances::Full(previous) => Covariances::Full(
                    (0..self.n_mix)
                        .map(|m| {
                            let cm = &centered_means[k][m];
                            let numer = &stats.scatter[k][m] + &psi + cm * cm.transpose() * lambda;
                            let denom = stats.post_mix_sum[k][m] + 1.0 + weight + d + 1.0;
                            if denom > 0.0 {
                                numer / denom
                            } else {
                                previous[m].clone()
                            }
                        })
                        .collect(),
                ),
                Covariances::Tied(previous) => {
                    let mut numer = psi.clone();
                    for m in 0..self.n_mix {
                        let cm = &centered_means[k][m];
                        numer += &stats.scatter[k][m] + cm * cm.transpose() * lambda;
                    }
                    let denom = stats.post_sum[k] + n_mix + weight + d + 1.0;
                    if denom > 0.0 {
                        Covariances::Tied(numer / denom)
                    } else {
                        Covariances::Tied(previous.clone())
                    }
                }
                Covariances::Diag(previous) => Covariances::Diag(
                    (0..self.n_mix)
                        .map(|m| {
                            let denom = stats.post_mix_sum[k][m] + 1.0 + 2.0 * (prior + 1.0);
                            if denom <= 0.0 {
                                return previous[m].clone();
                            }
                            (0..n_features)
                                .map(|j| {
                                    let cm = centered_means[k][m][j];
                                    (stats.scatter_diag[k][m][j] + lambda * cm * cm + 2.0 * weight)
                                        / denom
                                })
                                .collect()
                        })
                        .collect(),
                ),
                Covariances::Spherical(previous) => Covariances::Spherical(
                    (0..self.n_mix)
                        .map(|m| {
                            let denom =
                                d * stats.post_mix_sum[k][m] + d + 2.0 * (prior + 1.0);
                            if denom <= 0.0 {
                                return previous[m];
                            }
                            let scatter: f64 = stats.scatter_diag[k][m].iter().sum();
                            (scatter + lambda * centered_means[k][m].norm_squared() + 2.0 * weight)
                                / denom
                        })
                        .collect(),
                ),
            })
            .collect()
    }
}

impl EmissionModel for GaussianMixtureEmission {
    type Observations = FeatureMatrix;
    type Stats = MixtureStats;

    fn family(&self) -> &'static str {
        "gaussian-mixture"
    }

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn is_initialized(&self) -> bool {
        self.n_features.is_some()
            && self.weights.len() == self.n_states
            && self.means.len() == self.n_states
            && self.covars.len() == self.n_states
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
        let n_features = obs.n_features();
        let rows = obs.all_rows();

        if init_params.location || self.means.len() != self.n_states {
            let centers = clusterer.fit_partition(&rows, self.n_states, rng)?;
            let labels = assign_to_nearest(&rows, &centers);
            let mut means = Vec::with_capacity(self.n_states);
            for k in 0..self.n_states {
                let group: Vec<&[f64]> = rows
                    .iter()
                    .zip(labels.iter())
                    .filter(|(_, &l)| l == k)
                    .map(|(r, _)| *r)
                    .collect();
                // Too few points in the group to seed every component from it.
                let source = if group.len() >= self.n_mix { &group } else { &rows };
                means.push(clusterer.fit_partition(source, self.n_mix, rng)?);
            }
            self.means = means;
            log::debug!(
                "Seeded {} x {} mixture means with nested k-means",
                self.n_states,
                self.n_mix
            );
        }
        if init_params.weights || self.weights.len() != self.n_states {
            self.weights = vec![vec![1.0 / self.n_mix as f64; self.n_mix]; self.n_states];
        }
        if init_params.scale || self.covars.len() != self.n_states {
            let cov = regularized_covariance(&rows, n_features, self.min_covar);
            self.covars = (0..self.n_states)
                .map(|_| Covariances::distribute(&cov, self.covariance_type, self.n_mix))
                .collect();
        }
        self.n_features = Some(n_features);
        Ok(())
    }

    fn validate(&self) -> HmmResult<()> {
        let n_features = self.n_features.ok_or_else(|| HmmError::NotInitialized {
            operation: "validate".to_string(),
        })?;
        if self.weights.len() != self.n_states {
            return Err(HmmError::shape("mixture weights", self.n_states, self.weights.len()));
        }
        for (k, row) in self.weights.iter().enumerate() {
            validate_probability_vector(row, self.n_mix, "mixture weights", Some(k))?;
        }
        self.check_means_shape(&self.means, n_features)?;
        if self.covars.len() != self.n_states {
            return Err(HmmError::shape("mixture covars", self.n_states, self.covars.len()));
        }
        for c in &self.covars {
            c.validate(self.n_mix, n_features)?;
        }
        Ok(())
    }

    fn check_observations(&self, obs: &FeatureMatrix) -> HmmResult<()> {
        match self.n_features {
            Some(d) if d != obs.n_features() => {
                Err(HmmError::shape("observation features", d, obs.n_features()))
            }
            _ => Ok(()),
        }
    }

    fn log_likelihood(&self, obs: &FeatureMatrix, span: Range<usize>) -> HmmResult<Vec<Vec<f64>>> {
        let prepared = self.prepared()?;
        Ok(obs
            .rows(span)
            .map(|x| {
                prepared
                    .iter()
                    .enumerate()
                    .map(|(k, comps)| logsumexp(&self.log_weighted_densities(comps, k, x)))
                    .collect()
            })
            .collect())
    }

    fn initialize_sufficient_statistics(&self) -> MixtureStats {
        let k = self.n_states;
        let m = self.n_mix;
        let d = self.n_features.unwrap_or(0);
        let matrix = self.covariance_type.is_matrix();
        MixtureStats {
            post_sum: vec![0.0; k],
            post_mix_sum: vec![vec![0.0; m]; k],
            obs: vec![vec![vec![0.0; d]; m]; k],
            scatter_diag: if matrix {
                Vec::new()
            } else {
                vec![vec![vec![0.0; d]; m]; k]
            },
            scatter: if matrix {
                vec![vec![DMatrix::zeros(d, d); m]; k]
            } else {
                Vec::new()
            },
        }
    }

    fn accumulate(
        &self,
        stats: &mut MixtureStats,
        obs: &FeatureMatrix,
        span: Range<usize>,
        posteriors: &[Vec<f64>],
        _params: &ParamGroups,
    ) -> HmmResult<()> {
        let prepared = self.prepared()?;
        let matrix = self.covariance_type.is_matrix();

        for (x, gamma) in obs.rows(span).zip(posteriors.iter()) {
            for (k, comps) in prepared.iter().enumerate() {
                let g = gamma[k];
                stats.post_sum[k] += g;

                let log_dens = self.log_weighted_densities(comps, k, x);
                let shift = log_dens.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mut resp: Vec<f64> = log_dens
                    .iter()
                    .map(|&l| {
                        let p = if shift.is_finite() { (l - shift).exp() } else { 0.0 };
                        p + f64::EPSILON
                    })
                    .collect();
                let total: f64 = resp.iter().sum();
                resp.iter_mut().for_each(|r| *r /= total);

                for (m, &rho) in resp.iter().enumerate() {
                    let w = g * rho;
                    stats.post_mix_sum[k][m] += w;
                    let centered: Vec<f64> = x
                        .iter()
                        .zip(self.means[k][m].iter())
                        .map(|(&xi, &mi)| xi - mi)
                        .collect();
                    for (acc, &xi) in stats.obs[k][m].iter_mut().zip(x.iter()) {
                        *acc += w * xi;
                    }
                    if matrix {
                        let c = DVector::from_vec(centered);
                        stats.scatter[k][m].ger(w, &c, &c, 1.0);
                    } else {
                        for (acc, &ci) in stats.scatter_diag[k][m].iter_mut().zip(centered.iter()) {
                            *acc += w * ci * ci;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn m_step(&mut self, stats: &MixtureStats, params: &ParamGroups) -> HmmResult<()> {
        let n_features = self.n_features.ok_or_else(|| HmmError::NotInitialized {
            operation: "m_step".to_string(),
        })?;

        // Covariances are centered on the means the statistics were gathered with.
        let new_covars = if params.scale {
            Some(self.update_covars(stats, n_features))
        } else {
            None
        };
        if params.weights {
            self.update_weights(stats);
        }
        if params.location {
            self.means = self.update_means(stats);
        }
        if let Some(covars) = new_covars {
            for (k, c) in covars.into_iter().enumerate() {
                match c.validate(self.n_mix, n_features) {
                    Ok(()) => self.covars[k] = c,
                    Err(e) => log::warn!(
                        "Keeping previous mixture covariances of state {}: {}",
                        k,
                        e
                    ),
                }
            }
        }
        Ok(())
    }

    fn sample(&self, state: usize, rng: &mut ModelRng) -> HmmResult<Vec<f64>> {
        if !self.is_initialized() {
            return Err(HmmError::NotInitialized {
                operation: "sample".to_string(),
            });
        }
        let m = sample_from_cdf(&self.weights[state], rng.f64());
        let gaussian =
            PreparedGaussian::from_covariances(&self.means[state][m], &self.covars[state], m)?;
        Ok(gaussian.sample(rng))
    }

    fn empty_observations(&self) -> FeatureMatrix {
        FeatureMatrix::empty(self.n_features.unwrap_or(0))
    }

    fn n_free_parameters(&self) -> usize {
        let k = self.n_states;
        let m = self.n_mix;
        let d = self.n_features.unwrap_or(0);
        let cov = match self.covariance_type {
            CovarianceType::Spherical => k * m,
            CovarianceType::Diag => k * m * d,
            CovarianceType::Full => k * m * d * (d + 1) / 2,
            CovarianceType::Tied => k * d * (d + 1) / 2,
        };
        k * m.saturating_sub(1) + k * m * d + cov
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::KMeansClusterer;
    use assert_approx_eq::assert_approx_eq;

    fn bimodal() -> FeatureMatrix {
        let mut rng = ModelRng::with_seed(21);
        let values: Vec<f64> = (0..80)
            .map(|i| {
                let center = if i % 2 == 0 { -4.0 } else { 4.0 };
                center + 0.5 * rng.standard_normal()
            })
            .collect();
        FeatureMatrix::from_column(&values).unwrap()
    }

    fn initialized(cov_type: CovarianceType) -> (GaussianMixtureEmission, FeatureMatrix) {
        let obs = bimodal();
        let mut model = GaussianMixtureEmission::new(1, 2, cov_type);
        model
            .initialize(
                &obs,
                &SequenceIndex::single(obs.n_rows()),
                &ParamGroups::all(),
                &KMeansClusterer::default(),
                &mut ModelRng::with_seed(1),
            )
            .unwrap();
        (model, obs)
    }

    #[test]
    fn test_default_covariance_priors() {
        let full = GaussianMixtureEmission::new(2, 3, CovarianceType::Full);
        assert_eq!(full.covars_priors(4), (0.0, -6.0));
        let tied = GaussianMixtureEmission::new(2, 3, CovarianceType::Tied);
        assert_eq!(tied.covars_priors(4), (0.0, -8.0));
        let diag = GaussianMixtureEmission::new(2, 3, CovarianceType::Diag);
        assert_eq!(diag.covars_priors(4), (-1.5, 0.0));
        let spherical = GaussianMixtureEmission::new(2, 3, CovarianceType::Spherical);
        assert_eq!(spherical.covars_priors(4), (-2.5, 0.0));
    }

    #[test]
    fn test_m_step_separates_components_for_every_structuring() {
        for cov_type in [
            CovarianceType::Spherical,
            CovarianceType::Diag,
            CovarianceType::Full,
            CovarianceType::Tied,
        ] {
            let (mut model, obs) = initialized(cov_type);
            let posteriors = vec![vec![1.0]; obs.n_rows()];
            for _ in 0..5 {
                let mut stats = model.initialize_sufficient_statistics();
                model
                    .accumulate(&mut stats, &obs, 0..obs.n_rows(), &posteriors, &ParamGroups::all())
                    .unwrap();
                model.m_step(&stats, &ParamGroups::all()).unwrap();
            }
            assert!(model.validate().is_ok(), "{} failed validation", cov_type);
            let mut centers: Vec<f64> = model.means()[0].iter().map(|m| m[0]).collect();
            centers.sort_by(|a, b| a.total_cmp(b));
            assert_approx_eq!(centers[0], -4.0, 0.5);
            assert_approx_eq!(centers[1], 4.0, 0.5);
            assert_approx_eq!(model.weights()[0].iter().sum::<f64>(), 1.0, 1e-9);
        }
    }

    #[test]
    fn test_statistics_merge_matches_single_pass() {
        let (model, obs) = initialized(CovarianceType::Diag);
        let n = obs.n_rows();
        let posteriors = vec![vec![1.0]; n];

        let mut whole = model.initialize_sufficient_statistics();
        model
            .accumulate(&mut whole, &obs, 0..n, &posteriors, &ParamGroups::all())
            .unwrap();

        let mut first = model.initialize_sufficient_statistics();
        let mut second = model.initialize_sufficient_statistics();
        model
            .accumulate(&mut first, &obs, 0..n / 2, &posteriors[..n / 2], &ParamGroups::all())
            .unwrap();
        model
            .accumulate(&mut second, &obs, n / 2..n, &posteriors[n / 2..], &ParamGroups::all())
            .unwrap();
        first.merge(second);

        assert_approx_eq!(first.post_sum[0], whole.post_sum[0], 1e-9);
        assert_approx_eq!(first.obs[0][1][0], whole.obs[0][1][0], 1e-9);
    }

    #[test]
    fn test_free_parameter_count() {
        let (model, _) = initialized(CovarianceType::Full);
        // weights 1, means 2, covariances 2
        assert_eq!(model.n_free_parameters(), 5);
    }
}
