//! Multivariate Gaussian emissions with four covariance structurings.
//!
//! Means carry a Normal prior (`means_prior`, `means_weight`) and covariances
//! an inverse-gamma / inverse-Wishart style prior (`covars_prior`,
//! `covars_weight`). With the default hyper-parameters the M-step is close to
//! maximum likelihood, with `covars_prior` keeping variances away from zero.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};

use crate::clustering::Clusterer;
use crate::covariance::{
    log_multivariate_normal_density, regularized_covariance, CovarianceType, Covariances,
    PreparedGaussian,
};
use crate::emission_models::{add_assign, add_assign_rows, EmissionModel, MergeStatistics};
use crate::errors::{HmmError, HmmResult};
use crate::hmm_config::ParamGroups;
use crate::math_utils::constants::MIN_COVARIANCE_DENOMINATOR;
use crate::rng::ModelRng;
use crate::sequences::{FeatureMatrix, SequenceIndex};

/// Gaussian emission parameters and hyper-parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianEmission {
    n_states: usize,
    covariance_type: CovarianceType,
    /// Added to the diagonal of the initial empirical covariance
    pub min_covar: f64,
    /// Prior mean of every mean
    pub means_prior: f64,
    /// Weight of the mean prior in pseudo-observations
    pub means_weight: f64,
    /// Prior scale of the covariances
    pub covars_prior: f64,
    /// Weight of the covariance prior
    pub covars_weight: f64,
    n_features: Option<usize>,
    means: Vec<Vec<f64>>,
    covars: Option<Covariances>,
}

/// Sufficient statistics of the Gaussian family.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianStats {
    /// Σ_t γ[t, k]
    pub post: Vec<f64>,
    /// Σ_t γ[t, k] x_t
    pub obs: Vec<Vec<f64>>,
    /// Σ_t γ[t, k] x_t², element-wise (spherical and diagonal)
    pub obs_sq: Vec<Vec<f64>>,
    /// Σ_t γ[t, k] x_t x_tᵀ (full and tied)
    pub obs_outer: Vec<DMatrix<f64>>,
}

impl MergeStatistics for GaussianStats {
    fn merge(&mut self, other: Self) {
        add_assign(&mut self.post, &other.post);
        add_assign_rows(&mut self.obs, &other.obs);
        add_assign_rows(&mut self.obs_sq, &other.obs_sq);
        for (a, b) in self.obs_outer.iter_mut().zip(other.obs_outer) {
            *a += b;
        }
    }
}

impl GaussianEmission {
    /// Uninitialized emission for `n_states` states.
    pub fn new(n_states: usize, covariance_type: CovarianceType) -> Self {
        Self {
            n_states,
            covariance_type,
            min_covar: 1e-3,
            means_prior: 0.0,
            means_weight: 0.0,
            covars_prior: 1e-2,
            covars_weight: 1.0,
            n_features: None,
            means: Vec::new(),
            covars: None,
        }
    }

    pub fn with_min_covar(mut self, min_covar: f64) -> Self {
        self.min_covar = min_covar;
        self
    }

    pub fn with_means_prior(mut self, prior: f64, weight: f64) -> Self {
        self.means_prior = prior;
        self.means_weight = weight;
        self
    }

    pub fn with_covars_prior(mut self, prior: f64, weight: f64) -> Self {
        self.covars_prior = prior;
        self.covars_weight = weight;
        self
    }

    pub fn covariance_type(&self) -> CovarianceType {
        self.covariance_type
    }

    pub fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    pub fn means(&self) -> &[Vec<f64>] {
        &self.means
    }

    /// Covariances in their compact stored form.
    pub fn covars(&self) -> Option<&Covariances> {
        self.covars.as_ref()
    }

    /// One full covariance matrix per state, whatever the structuring.
    pub fn covars_full(&self) -> HmmResult<Vec<DMatrix<f64>>> {
        let covars = self.covars.as_ref().ok_or_else(|| HmmError::NotInitialized {
            operation: "covars_full".to_string(),
        })?;
        let n_features = self.n_features.ok_or_else(|| HmmError::NotInitialized {
            operation: "covars_full".to_string(),
        })?;
        Ok(covars.to_full(self.n_states, n_features))
    }

    /// Assign means, one row per state. Fixes the feature dimension if unset.
    pub fn set_means(&mut self, means: Vec<Vec<f64>>) -> HmmResult<()> {
        if means.len() != self.n_states {
            return Err(HmmError::shape("means", self.n_states, means.len()));
        }
        let dim = self
            .n_features
            .unwrap_or_else(|| means.first().map(|m| m.len()).unwrap_or(0));
        for (k, row) in means.iter().enumerate() {
            if row.len() != dim {
                return Err(HmmError::ShapeMismatch {
                    what: format!("mean of state {}", k),
                    expected: dim.to_string(),
                    actual: row.len().to_string(),
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(HmmError::distribution("means", Some(k), "mean must be finite"));
            }
        }
        self.n_features = Some(dim);
        self.means = means;
        Ok(())
    }

    /// Assign covariances in the compact form matching the structuring.
    pub fn set_covars(&mut self, covars: Covariances) -> HmmResult<()> {
        if covars.covariance_type() != self.covariance_type {
            return Err(HmmError::shape(
                "covariance type",
                self.covariance_type,
                covars.covariance_type(),
            ));
        }
        if let Some(d) = self.n_features {
            covars.validate(self.n_states, d)?;
        }
        self.covars = Some(covars);
        Ok(())
    }

    fn require_covars(&self, operation: &str) -> HmmResult<&Covariances> {
        self.covars.as_ref().ok_or_else(|| HmmError::NotInitialized {
            operation: operation.to_string(),
        })
    }

    fn diagonal_update(&self, stats: &GaussianStats, n_features: usize) -> Vec<Vec<f64>> {
        let base = (self.covars_weight - 1.0).max(0.0);
        (0..self.n_states)
            .map(|k| {
                let denom = (base + stats.post[k]).max(MIN_COVARIANCE_DENOMINATOR);
                (0..n_features)
                    .map(|j| {
                        let m = self.means[k][j];
                        let meandiff = m - self.means_prior;
                        let numer = self.means_weight * meandiff * meandiff + stats.obs_sq[k][j]
                            - 2.0 * m * stats.obs[k][j]
                            + m * m * stats.post[k];
                        (self.covars_prior + numer) / denom
                    })
                    .collect()
            })
            .collect()
    }

    fn matrix_numerators(&self, stats: &GaussianStats) -> Vec<DMatrix<f64>> {
        (0..self.n_states)
            .map(|k| {
                let mean = DVector::from_column_slice(&self.means[k]);
                let obs = DVector::from_column_slice(&stats.obs[k]);
                let meandiff = mean.add_scalar(-self.means_prior);
                let obsmean = &obs * mean.transpose();
                let numer = &meandiff * meandiff.transpose() * self.means_weight
                    + &stats.obs_outer[k]
                    - &obsmean
                    - obsmean.transpose()
                    + &mean * mean.transpose() * stats.post[k];
                (&numer + numer.transpose()) * 0.5
            })
            .collect()
    }
}

impl EmissionModel for GaussianEmission {
    type Observations = FeatureMatrix;
    type Stats = GaussianStats;

    fn family(&self) -> &'static str {
        "gaussian"
    }

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn is_initialized(&self) -> bool {
        self.n_features.is_some() && self.means.len() == self.n_states && self.covars.is_some()
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
            self.means = clusterer.fit_partition(&rows, self.n_states, rng)?;
            log::debug!("Seeded {} Gaussian means with k-means", self.n_states);
        }
        if init_params.scale || self.covars.is_none() {
            let cov = regularized_covariance(&rows, n_features, self.min_covar);
            self.covars = Some(Covariances::distribute(
                &cov,
                self.covariance_type,
                self.n_states,
            ));
        }
        self.n_features = Some(n_features);
        Ok(())
    }

    fn validate(&self) -> HmmResult<()> {
        let n_features = self.n_features.ok_or_else(|| HmmError::NotInitialized {
            operation: "validate".to_string(),
        })?;
        if self.means.len() != self.n_states {
            return Err(HmmError::shape("means", self.n_states, self.means.len()));
        }
        if let Some(k) = self.means.iter().position(|m| m.len() != n_features) {
            return Err(HmmError::ShapeMismatch {
                what: format!("mean of state {}", k),
                expected: n_features.to_string(),
                actual: self.means[k].len().to_string(),
            });
        }
        self.require_covars("validate")?
            .validate(self.n_states, n_features)
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
        let covars = self.require_covars("log_likelihood")?;
        log_multivariate_normal_density(obs.rows(span), &self.means, covars)
    }

    fn initialize_sufficient_statistics(&self) -> GaussianStats {
        let k = self.n_states;
        let d = self.n_features.unwrap_or(0);
        let matrix = self.covariance_type.is_matrix();
        GaussianStats {
            post: vec![0.0; k],
            obs: vec![vec![0.0; d]; k],
            obs_sq: if matrix { Vec::new() } else { vec![vec![0.0; d]; k] },
            obs_outer: if matrix {
                vec![DMatrix::zeros(d, d); k]
            } else {
                Vec::new()
            },
        }
    }

    fn accumulate(
        &self,
        stats: &mut GaussianStats,
        obs: &FeatureMatrix,
        span: Range<usize>,
        posteriors: &[Vec<f64>],
        _params: &ParamGroups,
    ) -> HmmResult<()> {
        let matrix = self.covariance_type.is_matrix();
        for (x, gamma) in obs.rows(span).zip(posteriors.iter()) {
            let xv = if matrix {
                Some(DVector::from_column_slice(x))
            } else {
                None
            };
            for (k, &g) in gamma.iter().enumerate() {
                stats.post[k] += g;
                for (acc, &xi) in stats.obs[k].iter_mut().zip(x.iter()) {
                    *acc += g * xi;
                }
                match &xv {
                    Some(v) => stats.obs_outer[k].ger(g, v, v, 1.0),
                    None => {
                        for (acc, &xi) in stats.obs_sq[k].iter_mut().zip(x.iter()) {
                            *acc += g * xi * xi;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn m_step(&mut self, stats: &GaussianStats, params: &ParamGroups) -> HmmResult<()> {
        let n_features = self.n_features.ok_or_else(|| HmmError::NotInitialized {
            operation: "m_step".to_string(),
        })?;

        if params.location {
            let prior_mass = self.means_weight * self.means_prior;
            for k in 0..self.n_states {
                let denom = self.means_weight + stats.post[k];
                if denom > 0.0 {
                    for j in 0..n_features {
                        self.means[k][j] = (prior_mass + stats.obs[k][j]) / denom;
                    }
                }
            }
        }

        if params.scale {
            let updated = match self.covariance_type {
                CovarianceType::Diag => Covariances::Diag(self.diagonal_update(stats, n_features)),
                CovarianceType::Spherical => Covariances::Spherical(
                    self.diagonal_update(stats, n_features)
                        .iter()
                        .map(|row| row.iter().sum::<f64>() / n_features as f64)
                        .collect(),
                ),
                CovarianceType::Full | CovarianceType::Tied => {
                    let cv_weight = (self.covars_weight - n_features as f64).max(0.0);
                    let prior = DMatrix::<f64>::identity(n_features, n_features) * self.covars_prior;
                    let numers = self.matrix_numerators(stats);
                    if self.covariance_type == CovarianceType::Tied {
                        let total: f64 = stats.post.iter().sum();
                        let pooled = numers
                            .iter()
                            .fold(DMatrix::<f64>::zeros(n_features, n_features), |acc, m| acc + m);
                        Covariances::Tied(
                            (prior + pooled) / (cv_weight + total).max(MIN_COVARIANCE_DENOMINATOR),
                        )
                    } else {
                        Covariances::Full(
                            numers
                                .iter()
                                .zip(stats.post.iter())
                                .map(|(n, &p)| {
                                    (&prior + n) / (cv_weight + p).max(MIN_COVARIANCE_DENOMINATOR)
                                })
                                .collect(),
                        )
                    }
                }
            };

            match updated.validate(self.n_states, n_features) {
                Ok(()) => self.covars = Some(updated),
                Err(e) => log::warn!("Keeping previous Gaussian covariances: {}", e),
            }
        }
        Ok(())
    }

    fn sample(&self, state: usize, rng: &mut ModelRng) -> HmmResult<Vec<f64>> {
        let covars = self.require_covars("sample")?;
        let gaussian = PreparedGaussian::from_covariances(&self.means[state], covars, state)?;
        Ok(gaussian.sample(rng))
    }

    fn empty_observations(&self) -> FeatureMatrix {
        FeatureMatrix::empty(self.n_features.unwrap_or(0))
    }

    fn n_free_parameters(&self) -> usize {
        let k = self.n_states;
        let d = self.n_features.unwrap_or(0);
        let cov = match self.covariance_type {
            CovarianceType::Spherical => k,
            CovarianceType::Diag => k * d,
            CovarianceType::Full => k * d * (d + 1) / 2,
            CovarianceType::Tied => d * (d + 1) / 2,
        };
        k * d + cov
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::KMeansClusterer;
    use assert_approx_eq::assert_approx_eq;

    fn one_state_stats(model: &GaussianEmission, xs: &[f64]) -> GaussianStats {
        let obs = FeatureMatrix::from_column(xs).unwrap();
        let posteriors = vec![vec![1.0]; xs.len()];
        let mut stats = model.initialize_sufficient_statistics();
        model
            .accumulate(&mut stats, &obs, 0..xs.len(), &posteriors, &ParamGroups::all())
            .unwrap();
        stats
    }

    #[test]
    fn test_diag_m_step_matches_hand_computation() {
        let mut model = GaussianEmission::new(1, CovarianceType::Diag);
        model.set_means(vec![vec![0.0]]).unwrap();
        model.set_covars(Covariances::Diag(vec![vec![1.0]])).unwrap();

        let stats = one_state_stats(&model, &[1.0, 3.0]);
        model.m_step(&stats, &ParamGroups::all()).unwrap();

        assert_approx_eq!(model.means()[0][0], 2.0);
        // (covars_prior + Σ(x - 2)²) / post
        match model.covars().unwrap() {
            Covariances::Diag(v) => assert_approx_eq!(v[0][0], (0.01 + 2.0) / 2.0),
            other => panic!("unexpected covariances {:?}", other),
        }
    }

    #[test]
    fn test_full_and_diag_agree_in_one_dimension() {
        let mut full = GaussianEmission::new(1, CovarianceType::Full);
        full.set_means(vec![vec![0.0]]).unwrap();
        full.set_covars(Covariances::Full(vec![DMatrix::identity(1, 1)])).unwrap();

        let stats = one_state_stats(&full, &[1.0, 3.0]);
        full.m_step(&stats, &ParamGroups::all()).unwrap();
        let cov = full.covars_full().unwrap();
        assert_approx_eq!(cov[0][(0, 0)], 1.005);
    }

    #[test]
    fn test_location_only_keeps_covariances() {
        let mut model = GaussianEmission::new(1, CovarianceType::Spherical);
        model.set_means(vec![vec![0.0, 0.0]]).unwrap();
        model.set_covars(Covariances::Spherical(vec![4.0])).unwrap();

        let obs = FeatureMatrix::from_rows(&[vec![1.0, 1.0], vec![3.0, 3.0]]).unwrap();
        let mut stats = model.initialize_sufficient_statistics();
        model
            .accumulate(&mut stats, &obs, 0..2, &[vec![1.0], vec![1.0]], &ParamGroups::all())
            .unwrap();
        let params = ParamGroups::from_codes("m").unwrap();
        model.m_step(&stats, &params).unwrap();

        assert_eq!(model.means()[0], vec![2.0, 2.0]);
        assert_eq!(model.covars(), Some(&Covariances::Spherical(vec![4.0])));
    }

    #[test]
    fn test_initialize_fixes_dimension() {
        let mut model = GaussianEmission::new(2, CovarianceType::Tied);
        let obs = FeatureMatrix::from_rows(&[
            vec![0.0, 0.1],
            vec![0.2, 0.0],
            vec![5.0, 5.1],
            vec![5.2, 4.9],
        ])
        .unwrap();
        model
            .initialize(
                &obs,
                &SequenceIndex::single(4),
                &ParamGroups::all(),
                &KMeansClusterer::default(),
                &mut ModelRng::with_seed(5),
            )
            .unwrap();
        assert!(model.is_initialized());
        assert!(model.validate().is_ok());
        assert_eq!(model.n_free_parameters(), 2 * 2 + 3);

        let wrong = FeatureMatrix::from_column(&[1.0, 2.0]).unwrap();
        assert!(matches!(
            model.check_observations(&wrong),
            Err(HmmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_set_covars_rejects_other_structuring() {
        let mut model = GaussianEmission::new(2, CovarianceType::Diag);
        assert!(model.set_covars(Covariances::Spherical(vec![1.0, 1.0])).is_err());
    }
}
