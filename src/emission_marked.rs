//! Marked Poisson ("clusterless") emissions.
//!
//! Each timestep carries a variable number of marks (for example spike
//! waveform features) whose cluster of origin is not observed. Clusters are
//! fixed Gaussian densities `f_n`, bootstrapped once from the pooled marks by
//! the clustering collaborator. Each state `z` owns a rate vector `r_z` over
//! clusters and the marks of a timestep form a marked Poisson process with
//! intensity `λ_z(m) = Σ_n r_{z,n} f_n(m)`:
//!
//! ```text
//! log p(marks | z) = -Σ_n r_{z,n} + Σ_k logsumexp_n(log r_{z,n} + log f_n(m_k))
//! ```
//!
//! Only the rates are re-estimated by EM. In [`RateMode::Relative`] each
//! state's rates are renormalized to sum to one after every M-step.
//!
//! [`MultiProbeMarkedPoissonEmission`] handles several probes sharing the
//! hidden state: the global rate vector is split into contiguous per-probe
//! blocks ([`MultiProbeMarkedPoissonEmission::cluster_ids`]) and every probe
//! is treated as above.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use nalgebra::DMatrix;

use crate::clustering::Clusterer;
use crate::covariance::{CovarianceType, Covariances, PreparedGaussian};
use crate::emission_models::{add_assign, add_assign_rows, EmissionModel, MergeStatistics};
use crate::errors::{HmmError, HmmResult};
use crate::hmm_config::ParamGroups;
use crate::math_utils::constants::{MIN_LOGLIKELIHOOD, MIN_RATE};
use crate::math_utils::{logsumexp, normalize, safe_ln};
use crate::rng::ModelRng;
use crate::sequences::{MarkArena, MultiProbeMarks, ObservationSet, SequenceIndex};

/// How per-timestep expected cluster rates are formed from mark responsibilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RateMode {
    /// Sum of responsibilities: expected number of marks per cluster.
    #[default]
    Absolute,
    /// Sum of responsibilities divided by the mark count; rates sum to one.
    Relative,
}

impl fmt::Display for RateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateMode::Absolute => f.write_str("absolute"),
            RateMode::Relative => f.write_str("relative"),
        }
    }
}

impl FromStr for RateMode {
    type Err = HmmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absolute" => Ok(RateMode::Absolute),
            "relative" => Ok(RateMode::Relative),
            other => Err(HmmError::InvalidParameter {
                parameter: format!("rate_mode '{}'", other),
                value: f64::NAN,
                constraint: "absolute or relative".to_string(),
            }),
        }
    }
}

/// Fixed Gaussian densities of the mark clusters of one probe.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MarkClusters {
    means: Vec<Vec<f64>>,
    covars: Covariances,
}

impl MarkClusters {
    /// Cluster densities from means and compact covariances.
    pub fn new(means: Vec<Vec<f64>>, covars: Covariances) -> HmmResult<Self> {
        let dim = means.first().map(|m| m.len()).unwrap_or(0);
        if let Some(n) = means.iter().position(|m| m.len() != dim) {
            return Err(HmmError::ShapeMismatch {
                what: format!("mean of cluster {}", n),
                expected: dim.to_string(),
                actual: means[n].len().to_string(),
            });
        }
        covars.validate(means.len(), dim)?;
        Ok(Self { means, covars })
    }

    pub fn n_clusters(&self) -> usize {
        self.means.len()
    }

    /// Mark dimensionality.
    pub fn dim(&self) -> usize {
        self.means.first().map(|m| m.len()).unwrap_or(0)
    }

    pub fn means(&self) -> &[Vec<f64>] {
        &self.means
    }

    pub fn covars(&self) -> &Covariances {
        &self.covars
    }

    /// One full covariance matrix per cluster.
    pub fn covars_full(&self) -> Vec<DMatrix<f64>> {
        self.covars.to_full(self.n_clusters(), self.dim())
    }

    fn prepared(&self) -> HmmResult<Vec<PreparedGaussian>> {
        self.means
            .iter()
            .enumerate()
            .map(|(n, mean)| PreparedGaussian::from_covariances(mean, &self.covars, n))
            .collect()
    }

    fn fit(
        marks: &[&[f64]],
        n_clusters: usize,
        cov_type: CovarianceType,
        clusterer: &dyn Clusterer,
        rng: &mut ModelRng,
    ) -> HmmResult<Self> {
        if marks.is_empty() {
            return Err(HmmError::InsufficientData {
                required: n_clusters,
                actual: 0,
            });
        }
        let fit = clusterer.fit_gaussian_mixture(marks, n_clusters, cov_type, rng)?;
        Self::new(fit.means, fit.covariances)
    }
}

/// Log-density of every mark under every cluster, floored at the minimum
/// log-likelihood. Shape `[marks][clusters]`.
fn mark_log_densities<'a>(
    clusters: &[PreparedGaussian],
    marks: impl Iterator<Item = &'a [f64]>,
) -> Vec<Vec<f64>> {
    marks
        .map(|m| {
            clusters
                .iter()
                .map(|g| g.log_pdf(m).max(MIN_LOGLIKELIHOOD))
                .collect()
        })
        .collect()
}

/// Posterior cluster membership of each mark given a state's rates.
///
/// `log_f` has shape `[marks][clusters]`; so does the result. A mark that no
/// cluster with a positive rate can explain gets zero responsibility.
pub fn mark_responsibilities(log_f: &[Vec<f64>], rates: &[f64]) -> Vec<Vec<f64>> {
    let log_rates: Vec<f64> = rates.iter().map(|&r| safe_ln(r)).collect();
    log_f
        .iter()
        .map(|densities| {
            let joint: Vec<f64> = densities
                .iter()
                .zip(log_rates.iter())
                .map(|(lf, lr)| lf + lr)
                .collect();
            let den = logsumexp(&joint);
            if den == f64::NEG_INFINITY {
                return vec![0.0; joint.len()];
            }
            joint.iter().map(|j| (j - den).exp()).collect()
        })
        .collect()
}

/// Expected per-cluster rates of one timestep.
///
/// Absolute mode sums responsibilities over marks, relative mode divides that
/// sum by the mark count. A timestep without marks yields `min_rate` for
/// every cluster.
pub fn expected_cluster_rates(
    log_f: &[Vec<f64>],
    rates: &[f64],
    mode: RateMode,
    min_rate: f64,
) -> Vec<f64> {
    if log_f.is_empty() {
        return vec![min_rate; rates.len()];
    }
    let mut expected = vec![0.0; rates.len()];
    for resp in mark_responsibilities(log_f, rates) {
        add_assign(&mut expected, &resp);
    }
    if mode == RateMode::Relative {
        let k = log_f.len() as f64;
        expected.iter_mut().for_each(|e| *e /= k);
    }
    expected
}

/// Marked Poisson log-likelihood of one timestep under one state's rates.
pub fn marked_poisson_log_likelihood(log_f: &[Vec<f64>], rates: &[f64]) -> f64 {
    let log_rates: Vec<f64> = rates.iter().map(|&r| safe_ln(r)).collect();
    let total_rate: f64 = rates.iter().sum();
    let marks: f64 = log_f
        .iter()
        .map(|densities| {
            let joint: Vec<f64> = densities
                .iter()
                .zip(log_rates.iter())
                .map(|(lf, lr)| lf + lr)
                .collect();
            logsumexp(&joint)
        })
        .sum();
    marks - total_rate
}

/// Sufficient statistics of the marked Poisson families.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkedStats {
    /// Σ_t γ[t, z]
    pub post: Vec<f64>,
    /// Σ_t γ[t, z] · expected_rates[t], one row per state
    pub numerator: Vec<Vec<f64>>,
}

impl MergeStatistics for MarkedStats {
    fn merge(&mut self, other: Self) {
        add_assign(&mut self.post, &other.post);
        add_assign_rows(&mut self.numerator, &other.numerator);
    }
}

/// Rate hyper-parameters shared by the single- and multi-probe families.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateSettings {
    /// Absolute or relative rates
    pub rate_mode: RateMode,
    /// Expected rate assigned to timesteps without marks
    pub min_rate: f64,
    /// Prior mean rate
    pub rate_prior: f64,
    /// Weight of the rate prior
    pub rate_weight: f64,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            rate_mode: RateMode::Absolute,
            min_rate: 0.0,
            rate_prior: 0.0,
            rate_weight: 0.0,
        }
    }
}

fn add_probe_log_likelihood(
    out: &mut [Vec<f64>],
    clusters: &[PreparedGaussian],
    arena: &MarkArena,
    span: Range<usize>,
    rates: &[Vec<f64>],
    block: Range<usize>,
) {
    for (row, t) in out.iter_mut().zip(span) {
        let log_f = mark_log_densities(clusters, arena.marks_at(t));
        for (value, state_rates) in row.iter_mut().zip(rates.iter()) {
            *value += marked_poisson_log_likelihood(&log_f, &state_rates[block.clone()]);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accumulate_probe(
    numerator: &mut [Vec<f64>],
    clusters: &[PreparedGaussian],
    arena: &MarkArena,
    span: Range<usize>,
    posteriors: &[Vec<f64>],
    rates: &[Vec<f64>],
    block: Range<usize>,
    settings: &RateSettings,
) {
    for (gamma, t) in posteriors.iter().zip(span) {
        let log_f = mark_log_densities(clusters, arena.marks_at(t));
        for (z, state_rates) in rates.iter().enumerate() {
            let expected = expected_cluster_rates(
                &log_f,
                &state_rates[block.clone()],
                settings.rate_mode,
                settings.min_rate,
            );
            for (acc, e) in numerator[z][block.clone()].iter_mut().zip(expected) {
                *acc += gamma[z] * e;
            }
        }
    }
}

fn update_rates(
    rates: &mut [Vec<f64>],
    stats: &MarkedStats,
    settings: &RateSettings,
    blocks: &[Range<usize>],
) {
    let prior_mass = settings.rate_weight * settings.rate_prior;
    for (z, state_rates) in rates.iter_mut().enumerate() {
        let denom = settings.rate_weight + stats.post[z];
        if denom <= 0.0 {
            continue;
        }
        for (r, &num) in state_rates.iter_mut().zip(stats.numerator[z].iter()) {
            *r = ((prior_mass + num) / denom).max(MIN_RATE);
        }
        if settings.rate_mode == RateMode::Relative {
            for block in blocks {
                normalize(&mut state_rates[block.clone()]);
            }
        }
    }
}

fn random_rates(
    n_states: usize,
    blocks: &[Range<usize>],
    rng: &mut ModelRng,
) -> HmmResult<Vec<Vec<f64>>> {
    let width = blocks.last().map(|b| b.end).unwrap_or(0);
    (0..n_states)
        .map(|_| {
            let mut row = (0..width)
                .map(|_| rng.gamma(1.0, 1.0))
                .collect::<HmmResult<Vec<f64>>>()?;
            for block in blocks {
                normalize(&mut row[block.clone()]);
            }
            Ok(row)
        })
        .collect()
}

fn check_rate_rows(rates: &[Vec<f64>], n_states: usize, width: usize) -> HmmResult<()> {
    if rates.len() != n_states {
        return Err(HmmError::shape("rates", n_states, rates.len()));
    }
    for (z, row) in rates.iter().enumerate() {
        if row.len() != width {
            return Err(HmmError::ShapeMismatch {
                what: format!("rates of state {}", z),
                expected: width.to_string(),
                actual: row.len().to_string(),
            });
        }
        if let Some(&r) = row.iter().find(|r| !(r.is_finite() && **r >= 0.0)) {
            return Err(HmmError::distribution(
                "rates",
                Some(z),
                format!("rate must be finite and non-negative, got {}", r),
            ));
        }
    }
    Ok(())
}

fn sample_probe_marks(
    clusters: &[PreparedGaussian],
    rates: &[f64],
    rng: &mut ModelRng,
) -> HmmResult<Vec<Vec<f64>>> {
    let mut marks = Vec::new();
    for (gaussian, &rate) in clusters.iter().zip(rates.iter()) {
        let count = rng.poisson(rate)?;
        for _ in 0..count {
            marks.push(gaussian.sample(rng));
        }
    }
    Ok(marks)
}

/// Single-probe marked Poisson emission.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MarkedPoissonEmission {
    n_states: usize,
    n_clusters: usize,
    covariance_type: CovarianceType,
    /// Rate hyper-parameters
    pub settings: RateSettings,
    clusters: Option<MarkClusters>,
    clusters_supplied: bool,
    rates: Vec<Vec<f64>>,
    already_initialized: bool,
}

impl MarkedPoissonEmission {
    pub fn new(n_states: usize, n_clusters: usize, covariance_type: CovarianceType) -> Self {
        Self {
            n_states,
            n_clusters,
            covariance_type,
            settings: RateSettings::default(),
            clusters: None,
            clusters_supplied: false,
            rates: Vec::new(),
            already_initialized: false,
        }
    }

    pub fn with_rate_mode(mut self, mode: RateMode) -> Self {
        self.settings.rate_mode = mode;
        self
    }

    pub fn with_min_rate(mut self, min_rate: f64) -> Self {
        self.settings.min_rate = min_rate;
        self
    }

    pub fn with_rate_prior(mut self, prior: f64, weight: f64) -> Self {
        self.settings.rate_prior = prior;
        self.settings.rate_weight = weight;
        self
    }

    /// Use fixed cluster densities instead of fitting them from the marks.
    pub fn with_clusters(mut self, clusters: MarkClusters) -> HmmResult<Self> {
        if clusters.n_clusters() != self.n_clusters {
            return Err(HmmError::shape("clusters", self.n_clusters, clusters.n_clusters()));
        }
        self.clusters = Some(clusters);
        self.clusters_supplied = true;
        Ok(self)
    }

    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    pub fn clusters(&self) -> Option<&MarkClusters> {
        self.clusters.as_ref()
    }

    /// Rates, one row per state.
    pub fn rates(&self) -> &[Vec<f64>] {
        &self.rates
    }

    pub fn set_rates(&mut self, rates: Vec<Vec<f64>>) -> HmmResult<()> {
        check_rate_rows(&rates, self.n_states, self.n_clusters)?;
        self.rates = rates;
        Ok(())
    }

    /// Whether the one-off initialization has already run.
    pub fn already_initialized(&self) -> bool {
        self.already_initialized
    }

    fn prepared(&self, operation: &str) -> HmmResult<Vec<PreparedGaussian>> {
        match &self.clusters {
            Some(c) if self.rates.len() == self.n_states => c.prepared(),
            _ => Err(HmmError::NotInitialized {
                operation: operation.to_string(),
            }),
        }
    }

    fn blocks(&self) -> [Range<usize>; 1] {
        [0..self.n_clusters]
    }
}

impl EmissionModel for MarkedPoissonEmission {
    type Observations = MarkArena;
    type Stats = MarkedStats;

    fn family(&self) -> &'static str {
        "marked-poisson"
    }

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn is_initialized(&self) -> bool {
        self.clusters.is_some() && self.rates.len() == self.n_states
    }

    fn initialize(
        &mut self,
        obs: &MarkArena,
        _index: &SequenceIndex,
        init_params: &ParamGroups,
        clusterer: &dyn Clusterer,
        rng: &mut ModelRng,
    ) -> HmmResult<()> {
        if self.already_initialized {
            return Ok(());
        }
        if self.clusters.is_none() || (init_params.location && !self.clusters_supplied) {
            log::debug!(
                "Fitting {} mark clusters with a Gaussian mixture",
                self.n_clusters
            );
            self.clusters = Some(MarkClusters::fit(
                &obs.all_marks(),
                self.n_clusters,
                self.covariance_type,
                clusterer,
                rng,
            )?);
        }
        if init_params.scale || self.rates.len() != self.n_states {
            self.rates = random_rates(self.n_states, &self.blocks(), rng)?;
        }
        self.already_initialized = true;
        Ok(())
    }

    fn validate(&self) -> HmmResult<()> {
        if self.clusters.is_none() {
            return Err(HmmError::NotInitialized {
                operation: "validate".to_string(),
            });
        }
        check_rate_rows(&self.rates, self.n_states, self.n_clusters)
    }

    fn check_observations(&self, obs: &MarkArena) -> HmmResult<()> {
        match &self.clusters {
            Some(c) if c.dim() != obs.dim() => {
                Err(HmmError::shape("mark dimension", c.dim(), obs.dim()))
            }
            _ => Ok(()),
        }
    }

    fn log_likelihood(&self, obs: &MarkArena, span: Range<usize>) -> HmmResult<Vec<Vec<f64>>> {
        let prepared = self.prepared("log_likelihood")?;
        let mut out = vec![vec![0.0; self.n_states]; span.len()];
        add_probe_log_likelihood(&mut out, &prepared, obs, span, &self.rates, 0..self.n_clusters);
        Ok(out)
    }

    fn initialize_sufficient_statistics(&self) -> MarkedStats {
        MarkedStats {
            post: vec![0.0; self.n_states],
            numerator: vec![vec![0.0; self.n_clusters]; self.n_states],
        }
    }

    fn accumulate(
        &self,
        stats: &mut MarkedStats,
        obs: &MarkArena,
        span: Range<usize>,
        posteriors: &[Vec<f64>],
        params: &ParamGroups,
    ) -> HmmResult<()> {
        if !params.scale {
            return Ok(());
        }
        let prepared = self.prepared("accumulate")?;
        for gamma in posteriors {
            add_assign(&mut stats.post, gamma);
        }
        accumulate_probe(
            &mut stats.numerator,
            &prepared,
            obs,
            span,
            posteriors,
            &self.rates,
            0..self.n_clusters,
            &self.settings,
        );
        Ok(())
    }

    fn m_step(&mut self, stats: &MarkedStats, params: &ParamGroups) -> HmmResult<()> {
        if params.scale {
            let blocks = self.blocks();
            update_rates(&mut self.rates, stats, &self.settings, &blocks);
        }
        Ok(())
    }

    fn sample(&self, state: usize, rng: &mut ModelRng) -> HmmResult<Vec<Vec<f64>>> {
        let prepared = self.prepared("sample")?;
        sample_probe_marks(&prepared, &self.rates[state], rng)
    }

    fn empty_observations(&self) -> MarkArena {
        MarkArena::new(self.clusters.as_ref().map(|c| c.dim()).unwrap_or(0))
    }

    fn n_free_parameters(&self) -> usize {
        match self.settings.rate_mode {
            RateMode::Absolute => self.n_states * self.n_clusters,
            RateMode::Relative => self.n_states * self.n_clusters.saturating_sub(1),
        }
    }
}

/// Marked Poisson emission over several probes sharing the hidden state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MultiProbeMarkedPoissonEmission {
    n_states: usize,
    n_clusters: Vec<usize>,
    covariance_type: CovarianceType,
    /// Rate hyper-parameters
    pub settings: RateSettings,
    clusters: Vec<MarkClusters>,
    clusters_supplied: bool,
    rates: Vec<Vec<f64>>,
    already_initialized: bool,
}

impl MultiProbeMarkedPoissonEmission {
    /// Emission with `n_clusters[p]` clusters on probe `p`.
    pub fn new(n_states: usize, n_clusters: Vec<usize>, covariance_type: CovarianceType) -> Self {
        Self {
            n_states,
            n_clusters,
            covariance_type,
            settings: RateSettings::default(),
            clusters: Vec::new(),
            clusters_supplied: false,
            rates: Vec::new(),
            already_initialized: false,
        }
    }

    pub fn with_rate_mode(mut self, mode: RateMode) -> Self {
        self.settings.rate_mode = mode;
        self
    }

    pub fn with_min_rate(mut self, min_rate: f64) -> Self {
        self.settings.min_rate = min_rate;
        self
    }

    pub fn with_rate_prior(mut self, prior: f64, weight: f64) -> Self {
        self.settings.rate_prior = prior;
        self.settings.rate_weight = weight;
        self
    }

    /// Use fixed per-probe cluster densities instead of fitting them.
    pub fn with_clusters(mut self, clusters: Vec<MarkClusters>) -> HmmResult<Self> {
        if clusters.len() != self.n_clusters.len() {
            return Err(HmmError::shape("probes", self.n_clusters.len(), clusters.len()));
        }
        for (p, (c, &n)) in clusters.iter().zip(self.n_clusters.iter()).enumerate() {
            if c.n_clusters() != n {
                return Err(HmmError::ShapeMismatch {
                    what: format!("clusters of probe {}", p),
                    expected: n.to_string(),
                    actual: c.n_clusters().to_string(),
                });
            }
        }
        self.clusters = clusters;
        self.clusters_supplied = true;
        Ok(self)
    }

    pub fn n_probes(&self) -> usize {
        self.n_clusters.len()
    }

    /// Total number of clusters across probes.
    pub fn total_clusters(&self) -> usize {
        self.n_clusters.iter().sum()
    }

    /// Contiguous block of the global rate vector owned by each probe.
    pub fn cluster_ids(&self) -> Vec<Range<usize>> {
        let mut start = 0;
        self.n_clusters
            .iter()
            .map(|&n| {
                let block = start..start + n;
                start += n;
                block
            })
            .collect()
    }

    pub fn clusters(&self) -> &[MarkClusters] {
        &self.clusters
    }

    /// Global rates, one row per state.
    pub fn rates(&self) -> &[Vec<f64>] {
        &self.rates
    }

    pub fn set_rates(&mut self, rates: Vec<Vec<f64>>) -> HmmResult<()> {
        check_rate_rows(&rates, self.n_states, self.total_clusters())?;
        self.rates = rates;
        Ok(())
    }

    pub fn already_initialized(&self) -> bool {
        self.already_initialized
    }

    fn prepared(&self, operation: &str) -> HmmResult<Vec<Vec<PreparedGaussian>>> {
        if !self.is_initialized() {
            return Err(HmmError::NotInitialized {
                operation: operation.to_string(),
            });
        }
        self.clusters.iter().map(|c| c.prepared()).collect()
    }
}

impl EmissionModel for MultiProbeMarkedPoissonEmission {
    type Observations = MultiProbeMarks;
    type Stats = MarkedStats;

    fn family(&self) -> &'static str {
        "multi-probe-marked-poisson"
    }

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn is_initialized(&self) -> bool {
        self.clusters.len() == self.n_clusters.len() && self.rates.len() == self.n_states
    }

    fn initialize(
        &mut self,
        obs: &MultiProbeMarks,
        _index: &SequenceIndex,
        init_params: &ParamGroups,
        clusterer: &dyn Clusterer,
        rng: &mut ModelRng,
    ) -> HmmResult<()> {
        if self.already_initialized {
            return Ok(());
        }
        if obs.n_probes() != self.n_probes() {
            return Err(HmmError::shape("probes", self.n_probes(), obs.n_probes()));
        }
        let refit = init_params.location && !self.clusters_supplied;
        if self.clusters.len() != self.n_probes() || refit {
            self.clusters = obs
                .probes()
                .iter()
                .zip(self.n_clusters.iter())
                .enumerate()
                .map(|(p, (arena, &n))| {
                    log::debug!("Fitting {} mark clusters of probe {}", n, p);
                    MarkClusters::fit(&arena.all_marks(), n, self.covariance_type, clusterer, rng)
                })
                .collect::<HmmResult<Vec<_>>>()?;
        }
        if init_params.scale || self.rates.len() != self.n_states {
            self.rates = random_rates(self.n_states, &self.cluster_ids(), rng)?;
        }
        self.already_initialized = true;
        Ok(())
    }

    fn validate(&self) -> HmmResult<()> {
        if self.clusters.len() != self.n_probes() {
            return Err(HmmError::NotInitialized {
                operation: "validate".to_string(),
            });
        }
        check_rate_rows(&self.rates, self.n_states, self.total_clusters())
    }

    fn check_observations(&self, obs: &MultiProbeMarks) -> HmmResult<()> {
        if obs.n_probes() != self.n_probes() {
            return Err(HmmError::shape("probes", self.n_probes(), obs.n_probes()));
        }
        for (p, (c, arena)) in self.clusters.iter().zip(obs.probes()).enumerate() {
            if c.dim() != arena.dim() {
                return Err(HmmError::ShapeMismatch {
                    what: format!("mark dimension of probe {}", p),
                    expected: c.dim().to_string(),
                    actual: arena.dim().to_string(),
                });
            }
        }
        Ok(())
    }

    fn log_likelihood(
        &self,
        obs: &MultiProbeMarks,
        span: Range<usize>,
    ) -> HmmResult<Vec<Vec<f64>>> {
        let prepared = self.prepared("log_likelihood")?;
        let mut out = vec![vec![0.0; self.n_states]; span.len()];
        for ((clusters, arena), block) in prepared
            .iter()
            .zip(obs.probes())
            .zip(self.cluster_ids())
        {
            add_probe_log_likelihood(&mut out, clusters, arena, span.clone(), &self.rates, block);
        }
        Ok(out)
    }

    fn initialize_sufficient_statistics(&self) -> MarkedStats {
        MarkedStats {
            post: vec![0.0; self.n_states],
            numerator: vec![vec![0.0; self.total_clusters()]; self.n_states],
        }
    }

    fn accumulate(
        &self,
        stats: &mut MarkedStats,
        obs: &MultiProbeMarks,
        span: Range<usize>,
        posteriors: &[Vec<f64>],
        params: &ParamGroups,
    ) -> HmmResult<()> {
        if !params.scale {
            return Ok(());
        }
        let prepared = self.prepared("accumulate")?;
        for gamma in posteriors {
            add_assign(&mut stats.post, gamma);
        }
        for ((clusters, arena), block) in prepared
            .iter()
            .zip(obs.probes())
            .zip(self.cluster_ids())
        {
            accumulate_probe(
                &mut stats.numerator,
                clusters,
                arena,
                span.clone(),
                posteriors,
                &self.rates,
                block,
                &self.settings,
            );
        }
        Ok(())
    }

    fn m_step(&mut self, stats: &MarkedStats, params: &ParamGroups) -> HmmResult<()> {
        if params.scale {
            let blocks = self.cluster_ids();
            update_rates(&mut self.rates, stats, &self.settings, &blocks);
        }
        Ok(())
    }

    fn sample(&self, state: usize, rng: &mut ModelRng) -> HmmResult<Vec<Vec<Vec<f64>>>> {
        let prepared = self.prepared("sample")?;
        prepared
            .iter()
            .zip(self.cluster_ids())
            .map(|(clusters, block)| sample_probe_marks(clusters, &self.rates[state][block], rng))
            .collect()
    }

    fn empty_observations(&self) -> MultiProbeMarks {
        let dims: Vec<usize> = self.clusters.iter().map(|c| c.dim()).collect();
        MultiProbeMarks::empty(&dims)
    }

    fn n_free_parameters(&self) -> usize {
        match self.settings.rate_mode {
            RateMode::Absolute => self.n_states * self.total_clusters(),
            RateMode::Relative => {
                self.n_states * (self.total_clusters().saturating_sub(self.n_probes()))
            }
        }
    }
}
