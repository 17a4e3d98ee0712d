//! Integration tests for full training and inference workflows
//!
//! These tests fit Gaussian hidden Markov models end to end and check the
//! properties every fitted model must satisfy: stochastic chain parameters,
//! non-decreasing log-likelihood, consistent decoding and reproducible sampling.

use assert_approx_eq::assert_approx_eq;
use hmmkit::{
    CovarianceType, DecoderAlgorithm, FeatureMatrix, GaussianEmission, HiddenMarkovModel,
    HmmConfig, ModelRng, ParamGroups,
};

/// Rows scattered around `center` with standard deviation `spread`.
fn blob(center: &[f64], n: usize, spread: f64, rng: &mut ModelRng) -> Vec<Vec<f64>> {
    (0..n)
        .map(|_| {
            center
                .iter()
                .map(|c| c + spread * rng.standard_normal())
                .collect()
        })
        .collect()
}

fn assert_stochastic<E: hmmkit::EmissionModel>(model: &HiddenMarkovModel<E>) {
    assert_approx_eq!(model.startprob().iter().sum::<f64>(), 1.0, 1e-8);
    for row in model.transmat() {
        assert_approx_eq!(row.iter().sum::<f64>(), 1.0, 1e-8);
        assert!(row.iter().all(|&p| p >= 0.0));
    }
}

/// Test scenario: two well separated 3-D clusters of 50 points each
///
/// After fitting, decoding assigns one state to every point of the first
/// cluster and the other state to every point of the second.
#[test]
fn test_two_cluster_gaussian_end_to_end() {
    let mut rng = ModelRng::with_seed(2024);
    let mut rows = blob(&[0.0, 0.0, 0.0], 50, 0.5, &mut rng);
    rows.extend(blob(&[10.0, 10.0, 10.0], 50, 0.5, &mut rng));
    let obs = FeatureMatrix::from_rows(&rows).unwrap();

    for cov_type in [
        CovarianceType::Diag,
        CovarianceType::Full,
        CovarianceType::Spherical,
        CovarianceType::Tied,
    ] {
        let config = HmmConfig::new(2).with_n_iter(25).with_seed(11);
        let mut model =
            HiddenMarkovModel::new(config, GaussianEmission::new(2, cov_type)).unwrap();
        model.fit(&obs, None).unwrap();
        assert_stochastic(&model);

        let states = model.predict(&obs, None).unwrap();
        let first = states[0];
        assert!(
            states[..50].iter().all(|&s| s == first),
            "{}: first cluster split across states",
            cov_type
        );
        assert!(
            states[50..].iter().all(|&s| s != first),
            "{}: second cluster not separated",
            cov_type
        );
    }
}

/// Test scenario: EM on data sampled from a known 2-state, 1-D Gaussian HMM
///
/// With flat priors the log-likelihood must never decrease between iterations.
#[test]
fn test_log_likelihood_is_non_decreasing() {
    let mut truth = HiddenMarkovModel::new(
        HmmConfig::new(2),
        GaussianEmission::new(2, CovarianceType::Diag),
    )
    .unwrap();
    truth.set_startprob(vec![0.5, 0.5]).unwrap();
    truth
        .set_transmat(vec![vec![0.9, 0.1], vec![0.2, 0.8]])
        .unwrap();
    truth
        .emission_mut()
        .set_means(vec![vec![0.0], vec![4.0]])
        .unwrap();
    truth
        .emission_mut()
        .set_covars(hmmkit::Covariances::Diag(vec![vec![1.0], vec![1.5]]))
        .unwrap();

    let (obs, _) = truth.sample(300, &mut ModelRng::with_seed(5)).unwrap();

    let config = HmmConfig::new(2).with_n_iter(40).with_tol(0.0).with_seed(1);
    let emission = GaussianEmission::new(2, CovarianceType::Diag).with_covars_prior(0.0, 0.0);
    let mut model = HiddenMarkovModel::new(config, emission).unwrap();
    let report = model.fit(&obs, None).unwrap();

    assert!(report.iterations >= 2);
    for pair in report.history.windows(2) {
        let tolerance = 1e-8 * pair[0].abs().max(1.0);
        assert!(
            pair[1] >= pair[0] - tolerance,
            "log-likelihood decreased from {} to {}",
            pair[0],
            pair[1]
        );
    }

    // The score after training is at least the last E-step value.
    let score = model.score(&obs, None).unwrap();
    assert!(score >= report.log_likelihood - 1e-6 * score.abs());
}

/// Test scenario: decoding on several sequences
///
/// Viterbi paths cover every timestep and their log-probability never
/// exceeds the forward log-likelihood of the same data.
#[test]
fn test_viterbi_path_bounds() {
    let mut rng = ModelRng::with_seed(9);
    let mut rows = blob(&[0.0], 30, 1.0, &mut rng);
    rows.extend(blob(&[6.0], 30, 1.0, &mut rng));
    rows.extend(blob(&[0.0], 20, 1.0, &mut rng));
    let obs = FeatureMatrix::from_rows(&rows).unwrap();
    let lengths = [45usize, 35];

    let mut model = HiddenMarkovModel::new(
        HmmConfig::new(2).with_n_iter(15).with_seed(3),
        GaussianEmission::new(2, CovarianceType::Spherical),
    )
    .unwrap();
    model.fit(&obs, Some(&lengths)).unwrap();

    let viterbi = model.decode(&obs, Some(&lengths), None).unwrap();
    let total = model.score(&obs, Some(&lengths)).unwrap();
    assert_eq!(viterbi.states.len(), 80);
    assert!(viterbi.log_prob <= total + 1e-9);

    let map = model
        .decode(&obs, Some(&lengths), Some(DecoderAlgorithm::Map))
        .unwrap();
    assert_eq!(map.states.len(), 80);
    assert!(map.log_prob <= 0.0);

    let (logprob, posteriors) = model.score_samples(&obs, Some(&lengths)).unwrap();
    assert_approx_eq!(logprob, total, 1e-9);
    assert_eq!(posteriors.len(), 80);
    for row in &posteriors {
        assert_approx_eq!(row.iter().sum::<f64>(), 1.0, 1e-8);
    }
}

/// Test scenario: only some parameter groups are trained
///
/// Groups left out of `params` keep their assigned values.
#[test]
fn test_frozen_parameter_groups() {
    let mut rng = ModelRng::with_seed(17);
    let mut rows = blob(&[-3.0, 1.0], 40, 0.7, &mut rng);
    rows.extend(blob(&[3.0, -1.0], 40, 0.7, &mut rng));
    let obs = FeatureMatrix::from_rows(&rows).unwrap();

    let config = HmmConfig::new(2)
        .with_n_iter(10)
        .with_seed(4)
        .with_params(ParamGroups::from_codes("mc").unwrap())
        .with_init_params(ParamGroups::from_codes("mc").unwrap());
    let mut model =
        HiddenMarkovModel::new(config, GaussianEmission::new(2, CovarianceType::Full)).unwrap();
    model.set_startprob(vec![0.3, 0.7]).unwrap();
    model
        .set_transmat(vec![vec![0.8, 0.2], vec![0.25, 0.75]])
        .unwrap();

    model.fit(&obs, None).unwrap();
    assert_eq!(model.startprob(), &[0.3, 0.7]);
    assert_eq!(model.transmat()[0], vec![0.8, 0.2]);
    assert_eq!(model.transmat()[1], vec![0.25, 0.75]);
}

/// Test scenario: ancestral sampling with a fixed generator seed
///
/// The same seed reproduces both the observations and the hidden states.
#[test]
fn test_sampling_is_reproducible() {
    let mut model = HiddenMarkovModel::new(
        HmmConfig::new(2),
        GaussianEmission::new(2, CovarianceType::Full),
    )
    .unwrap();
    model.set_startprob(vec![0.6, 0.4]).unwrap();
    model
        .set_transmat(vec![vec![0.7, 0.3], vec![0.3, 0.7]])
        .unwrap();
    model
        .emission_mut()
        .set_means(vec![vec![0.0, 0.0], vec![5.0, 5.0]])
        .unwrap();
    let cov = nalgebra::DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.3, 1.0]);
    model
        .emission_mut()
        .set_covars(hmmkit::Covariances::Full(vec![cov.clone(), cov]))
        .unwrap();

    let (obs_a, states_a) = model.sample(60, &mut ModelRng::with_seed(99)).unwrap();
    let (obs_b, states_b) = model.sample(60, &mut ModelRng::with_seed(99)).unwrap();
    assert_eq!(states_a, states_b);
    assert_eq!(obs_a, obs_b);
    assert_eq!(obs_a.n_rows(), 60);

    let (_, states_c) = model.sample(60, &mut ModelRng::with_seed(100)).unwrap();
    assert_ne!(states_a, states_c);
}

/// Test scenario: model selection criteria after fitting
#[test]
fn test_information_criteria() {
    let mut rng = ModelRng::with_seed(31);
    let mut rows = blob(&[0.0], 40, 1.0, &mut rng);
    rows.extend(blob(&[5.0], 40, 1.0, &mut rng));
    let obs = FeatureMatrix::from_rows(&rows).unwrap();

    let mut model = HiddenMarkovModel::new(
        HmmConfig::new(2).with_n_iter(10).with_seed(8),
        GaussianEmission::new(2, CovarianceType::Diag),
    )
    .unwrap();
    model.fit(&obs, None).unwrap();

    let criteria = model.criteria(&obs, None).unwrap();
    // startprob 1 + transmat 2 + means 2 + variances 2
    assert_eq!(criteria.num_parameters, 7);
    assert_eq!(criteria.num_samples, 80);
    assert_approx_eq!(criteria.aic, -2.0 * criteria.log_likelihood + 14.0, 1e-9);
    assert!(criteria.bic > criteria.aic);
}
