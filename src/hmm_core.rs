//! Core hidden Markov model: chain parameters, emission model and the public operations.
//!
//! [`HiddenMarkovModel`] owns the start distribution, the transition matrix
//! and one [`EmissionModel`]. Training is delegated to
//! [`crate::em_trainer::EmTrainer`]; scoring and decoding reuse the same
//! per-sequence log-likelihood computation.

use std::fmt;
use std::sync::Arc;

use crate::clustering::{Clusterer, KMeansClusterer};
use crate::decoder::{self, DecoderAlgorithm};
use crate::em_trainer::EmTrainer;
use crate::emission_models::EmissionModel;
use crate::errors::{
    validate_probability_vector, validate_stochastic_matrix, HmmError, HmmResult,
};
use crate::forward_backward::{self, sanitize_log_likelihood, LogParameters};
use crate::hmm_config::HmmConfig;
use crate::hmm_results::{DecodeResult, FitReport, ModelCriteria};
use crate::math_utils::sample_from_cdf;
use crate::rng::ModelRng;
use crate::sequences::{ObservationSet, SequenceIndex};

/// Start distribution and transition matrix of the hidden chain.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChainParameters {
    /// Initial state probabilities
    pub startprob: Vec<f64>,
    /// Transition probability matrix (state i to state j)
    pub transmat: Vec<Vec<f64>>,
}

impl ChainParameters {
    /// Uniform start vector and transition rows.
    pub fn uniform(n_states: usize) -> Self {
        let p = 1.0 / n_states as f64;
        Self {
            startprob: vec![p; n_states],
            transmat: vec![vec![p; n_states]; n_states],
        }
    }

    pub fn n_states(&self) -> usize {
        self.startprob.len()
    }

    /// Check both parameters against `n_states` states.
    pub fn validate(&self, n_states: usize) -> HmmResult<()> {
        validate_probability_vector(&self.startprob, n_states, "startprob", None)?;
        validate_stochastic_matrix(&self.transmat, n_states, "transmat")
    }
}

/// Hidden Markov model with emission family `E`.
#[derive(Clone)]
pub struct HiddenMarkovModel<E: EmissionModel> {
    pub(crate) config: HmmConfig,
    pub(crate) emission: E,
    pub(crate) chain: ChainParameters,
    clusterer: Arc<dyn Clusterer>,
    rng: ModelRng,
    last_fit: Option<FitReport>,
}

impl<E: EmissionModel + fmt::Debug> fmt::Debug for HiddenMarkovModel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiddenMarkovModel")
            .field("config", &self.config)
            .field("emission", &self.emission)
            .field("chain", &self.chain)
            .field("last_fit", &self.last_fit)
            .finish()
    }
}

impl<E: EmissionModel> HiddenMarkovModel<E> {
    /// Create a model from a configuration and an emission model laid out for
    /// the same number of states.
    ///
    /// # Example
    /// ```rust
    /// use hmmkit::covariance::CovarianceType;
    /// use hmmkit::emission_gaussian::GaussianEmission;
    /// use hmmkit::hmm_config::HmmConfig;
    /// use hmmkit::hmm_core::HiddenMarkovModel;
    ///
    /// let model = HiddenMarkovModel::new(
    ///     HmmConfig::new(2).with_seed(42),
    ///     GaussianEmission::new(2, CovarianceType::Diag),
    /// )
    /// .unwrap();
    /// assert_eq!(model.n_states(), 2);
    /// assert!(!model.is_initialized());
    /// ```
    pub fn new(config: HmmConfig, emission: E) -> HmmResult<Self> {
        config.validate()?;
        if emission.n_states() != config.n_states {
            return Err(HmmError::shape(
                "emission states",
                config.n_states,
                emission.n_states(),
            ));
        }
        let rng = ModelRng::from_optional_seed(config.seed);
        Ok(Self {
            config,
            emission,
            chain: ChainParameters {
                startprob: Vec::new(),
                transmat: Vec::new(),
            },
            clusterer: Arc::new(KMeansClusterer::default()),
            rng,
            last_fit: None,
        })
    }

    /// Replace the clustering collaborator used to seed emission parameters.
    pub fn with_clusterer(mut self, clusterer: impl Clusterer + 'static) -> Self {
        self.clusterer = Arc::new(clusterer);
        self
    }

    pub fn config(&self) -> &HmmConfig {
        &self.config
    }

    pub fn n_states(&self) -> usize {
        self.config.n_states
    }

    pub fn emission(&self) -> &E {
        &self.emission
    }

    pub fn emission_mut(&mut self) -> &mut E {
        &mut self.emission
    }

    pub fn startprob(&self) -> &[f64] {
        &self.chain.startprob
    }

    pub fn transmat(&self) -> &[Vec<f64>] {
        &self.chain.transmat
    }

    /// Report of the most recent call to [`fit`](Self::fit).
    pub fn last_fit(&self) -> Option<&FitReport> {
        self.last_fit.as_ref()
    }

    pub fn set_startprob(&mut self, startprob: Vec<f64>) -> HmmResult<()> {
        validate_probability_vector(&startprob, self.n_states(), "startprob", None)?;
        self.chain.startprob = startprob;
        Ok(())
    }

    pub fn set_transmat(&mut self, transmat: Vec<Vec<f64>>) -> HmmResult<()> {
        validate_stochastic_matrix(&transmat, self.n_states(), "transmat")?;
        self.chain.transmat = transmat;
        Ok(())
    }

    /// Whether every parameter has a value.
    pub fn is_initialized(&self) -> bool {
        self.chain.startprob.len() == self.n_states()
            && self.chain.transmat.len() == self.n_states()
            && self.emission.is_initialized()
    }

    /// Check the chain and the emission parameters.
    pub fn validate(&self) -> HmmResult<()> {
        self.chain.validate(self.n_states())?;
        self.emission.validate()
    }

    /// Seed the groups selected in `init_params` and any group still missing.
    pub(crate) fn initialize(
        &mut self,
        obs: &E::Observations,
        index: &SequenceIndex,
    ) -> HmmResult<()> {
        if obs.n_timesteps() == 0 {
            return Err(HmmError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }
        self.emission.check_observations(obs)?;

        let n = self.n_states();
        let init = self.config.init_params;
        if init.start || self.chain.startprob.len() != n {
            self.chain.startprob = ChainParameters::uniform(n).startprob;
        }
        if init.transitions || self.chain.transmat.len() != n {
            self.chain.transmat = ChainParameters::uniform(n).transmat;
        }
        self.emission.initialize(
            obs,
            index,
            &init,
            self.clusterer.as_ref(),
            &mut self.rng,
        )?;
        log::debug!(
            "Initialized {}-state {} emission parameters",
            n,
            self.emission.family()
        );
        Ok(())
    }

    /// Estimate model parameters with EM.
    ///
    /// `lengths` splits `obs` into independent sequences; `None` means one
    /// sequence. Failing to converge within `n_iter` iterations is reported in
    /// the returned [`FitReport`], not as an error.
    pub fn fit(&mut self, obs: &E::Observations, lengths: Option<&[usize]>) -> HmmResult<FitReport> {
        let index = SequenceIndex::from_lengths(lengths, obs.n_timesteps())?;
        let mut trainer = EmTrainer::new(&self.config);
        let report = trainer.run(self, obs, &index)?;
        self.last_fit = Some(report.clone());
        Ok(report)
    }

    fn check_inference(&self, obs: &E::Observations, operation: &str) -> HmmResult<()> {
        if !self.is_initialized() {
            return Err(HmmError::NotInitialized {
                operation: operation.to_string(),
            });
        }
        self.validate()?;
        self.emission.check_observations(obs)
    }

    /// Run `f` on the sanitized log-likelihood matrix of every sequence.
    fn for_each_sequence<T>(
        &self,
        obs: &E::Observations,
        lengths: Option<&[usize]>,
        operation: &str,
        mut f: impl FnMut(&LogParameters, &[Vec<f64>]) -> T,
    ) -> HmmResult<Vec<T>> {
        self.check_inference(obs, operation)?;
        let index = SequenceIndex::from_lengths(lengths, obs.n_timesteps())?;
        let log_params = LogParameters::new(&self.chain.startprob, &self.chain.transmat);
        index
            .iter()
            .map(|span| {
                let mut framelogprob = self.emission.log_likelihood(obs, span.clone())?;
                sanitize_log_likelihood(&mut framelogprob, span.start)?;
                Ok(f(&log_params, &framelogprob))
            })
            .collect()
    }

    /// Total log-likelihood of `obs` under the model.
    pub fn score(&self, obs: &E::Observations, lengths: Option<&[usize]>) -> HmmResult<f64> {
        let per_sequence = self.for_each_sequence(obs, lengths, "score", |params, flp| {
            forward_backward::forward(params, flp).0
        })?;
        Ok(per_sequence.into_iter().sum())
    }

    /// Total log-likelihood and state posteriors, concatenated over sequences.
    pub fn score_samples(
        &self,
        obs: &E::Observations,
        lengths: Option<&[usize]>,
    ) -> HmmResult<(f64, Vec<Vec<f64>>)> {
        let per_sequence = self.for_each_sequence(obs, lengths, "score_samples", |params, flp| {
            forward_backward::run(params, flp, false)
        })?;
        let mut logprob = 0.0;
        let mut posteriors = Vec::with_capacity(obs.n_timesteps());
        for result in per_sequence {
            logprob += result.logprob;
            posteriors.extend(result.posteriors);
        }
        Ok((logprob, posteriors))
    }

    /// Most likely state path, using `algorithm` or the configured default.
    pub fn decode(
        &self,
        obs: &E::Observations,
        lengths: Option<&[usize]>,
        algorithm: Option<DecoderAlgorithm>,
    ) -> HmmResult<DecodeResult> {
        let algorithm = algorithm.unwrap_or(self.config.algorithm);
        let per_sequence = self.for_each_sequence(obs, lengths, "decode", |params, flp| {
            decoder::decode(algorithm, params, flp)
        })?;
        let mut log_prob = 0.0;
        let mut states = Vec::with_capacity(obs.n_timesteps());
        for (lp, path) in per_sequence {
            log_prob += lp;
            states.extend(path);
        }
        Ok(DecodeResult {
            log_prob,
            states,
            algorithm,
        })
    }

    /// Decoded states with the configured algorithm.
    pub fn predict(&self, obs: &E::Observations, lengths: Option<&[usize]>) -> HmmResult<Vec<usize>> {
        Ok(self.decode(obs, lengths, None)?.states)
    }

    /// State posteriors, one row per timestep.
    pub fn predict_proba(
        &self,
        obs: &E::Observations,
        lengths: Option<&[usize]>,
    ) -> HmmResult<Vec<Vec<f64>>> {
        Ok(self.score_samples(obs, lengths)?.1)
    }

    /// Draw `n_steps` observations by ancestral sampling.
    ///
    /// Returns the observations and the hidden states that produced them. The
    /// same generator state reproduces the same draw.
    pub fn sample(
        &self,
        n_steps: usize,
        rng: &mut ModelRng,
    ) -> HmmResult<(E::Observations, Vec<usize>)> {
        if !self.is_initialized() {
            return Err(HmmError::NotInitialized {
                operation: "sample".to_string(),
            });
        }
        self.validate()?;

        let mut obs = self.emission.empty_observations();
        let mut states = Vec::with_capacity(n_steps);
        let mut state = sample_from_cdf(&self.chain.startprob, rng.f64());
        for t in 0..n_steps {
            if t > 0 {
                state = sample_from_cdf(&self.chain.transmat[state], rng.f64());
            }
            obs.push_frame(self.emission.sample(state, rng)?)?;
            states.push(state);
        }
        Ok((obs, states))
    }

    /// Number of free parameters of the chain and the emission model.
    pub fn n_free_parameters(&self) -> usize {
        let n = self.n_states();
        let chain = n.saturating_sub(1) + n * n.saturating_sub(1);
        chain + self.emission.n_free_parameters()
    }

    /// AIC and BIC of the model on `obs`.
    pub fn criteria(
        &self,
        obs: &E::Observations,
        lengths: Option<&[usize]>,
    ) -> HmmResult<ModelCriteria> {
        let log_likelihood = self.score(obs, lengths)?;
        Ok(ModelCriteria::new(
            log_likelihood,
            self.n_free_parameters(),
            obs.n_timesteps(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emission_categorical::CategoricalEmission;
    use assert_approx_eq::assert_approx_eq;

    fn fixed_model() -> HiddenMarkovModel<CategoricalEmission> {
        let mut emission = CategoricalEmission::new(2);
        emission
            .set_emissionprob(vec![vec![0.9, 0.1], vec![0.2, 0.8]])
            .unwrap();
        let mut model = HiddenMarkovModel::new(HmmConfig::new(2), emission).unwrap();
        model.set_startprob(vec![0.6, 0.4]).unwrap();
        model
            .set_transmat(vec![vec![0.7, 0.3], vec![0.4, 0.6]])
            .unwrap();
        model
    }

    #[test]
    fn test_state_count_must_agree() {
        let result = HiddenMarkovModel::new(HmmConfig::new(3), CategoricalEmission::new(2));
        assert!(matches!(result, Err(HmmError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_inference_before_initialization() {
        let model = HiddenMarkovModel::new(HmmConfig::new(2), CategoricalEmission::new(2)).unwrap();
        match model.score(&vec![0, 1], None) {
            Err(HmmError::NotInitialized { operation }) => assert_eq!(operation, "score"),
            other => panic!("Expected NotInitialized, got {:?}", other),
        }
    }

    #[test]
    fn test_score_is_additive_over_sequences() {
        let model = fixed_model();
        let obs = vec![0, 1, 1, 0, 0];
        let a = model.score(&vec![0, 1], None).unwrap();
        let b = model.score(&vec![1, 0, 0], None).unwrap();
        let both = model.score(&obs, Some(&[2, 3])).unwrap();
        assert_approx_eq!(both, a + b, 1e-12);
    }

    #[test]
    fn test_decode_concatenates_paths() {
        let model = fixed_model();
        let obs = vec![0, 0, 1, 1, 1, 0];
        let result = model.decode(&obs, Some(&[3, 3]), None).unwrap();
        assert_eq!(result.states.len(), 6);
        assert_eq!(result.algorithm, DecoderAlgorithm::Viterbi);
        assert!(result.log_prob <= model.score(&obs, Some(&[3, 3])).unwrap());

        let map = model.decode(&obs, Some(&[3, 3]), Some(DecoderAlgorithm::Map)).unwrap();
        assert_eq!(map.algorithm, DecoderAlgorithm::Map);
        assert_eq!(map.states.len(), 6);
    }

    #[test]
    fn test_sample_shapes() {
        let model = fixed_model();
        let (obs, states) = model.sample(25, &mut ModelRng::with_seed(3)).unwrap();
        assert_eq!(obs.len(), 25);
        assert_eq!(states.len(), 25);
        assert!(obs.iter().all(|&s| s < 2));
    }

    #[test]
    fn test_free_parameter_count() {
        // chain: 1 + 2, emission: 2 * 1
        assert_eq!(fixed_model().n_free_parameters(), 5);
    }
}
