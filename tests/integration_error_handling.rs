//! Integration tests for error handling and invalid data scenarios
//!
//! These tests validate that models reject malformed configuration,
//! parameters and observations with the matching error variant and enough
//! context to locate the problem.

use hmmkit::{
    CategoricalEmission, CovarianceType, Covariances, FeatureMatrix, GaussianEmission,
    HiddenMarkovModel, HmmConfig, HmmError, ModelRng, PoissonEmission,
};

fn fitted_gaussian() -> (HiddenMarkovModel<GaussianEmission>, FeatureMatrix) {
    let mut rng = ModelRng::with_seed(1);
    let rows: Vec<Vec<f64>> = (0..40)
        .map(|i| {
            let c = if i < 20 { 0.0 } else { 5.0 };
            vec![c + rng.standard_normal(), c + rng.standard_normal()]
        })
        .collect();
    let obs = FeatureMatrix::from_rows(&rows).unwrap();
    let mut model = HiddenMarkovModel::new(
        HmmConfig::new(2).with_n_iter(5).with_seed(2),
        GaussianEmission::new(2, CovarianceType::Diag),
    )
    .unwrap();
    model.fit(&obs, None).unwrap();
    (model, obs)
}

/// Test scenario: invalid configuration values
#[test]
fn test_invalid_configuration() {
    let zero_states = HiddenMarkovModel::new(
        HmmConfig::new(0),
        GaussianEmission::new(0, CovarianceType::Diag),
    );
    assert!(matches!(zero_states, Err(HmmError::InvalidParameter { .. })));

    let negative_tol = HiddenMarkovModel::new(
        HmmConfig::new(2).with_tol(-1.0),
        GaussianEmission::new(2, CovarianceType::Diag),
    );
    assert!(matches!(negative_tol, Err(HmmError::InvalidParameter { .. })));
}

/// Test scenario: inference before any parameter exists
#[test]
fn test_not_initialized() {
    let model = HiddenMarkovModel::new(
        HmmConfig::new(2),
        GaussianEmission::new(2, CovarianceType::Full),
    )
    .unwrap();
    let obs = FeatureMatrix::from_column(&[0.0, 1.0]).unwrap();

    for result in [
        model.score(&obs, None).map(|_| ()),
        model.decode(&obs, None, None).map(|_| ()),
        model.sample(3, &mut ModelRng::with_seed(0)).map(|_| ()),
    ] {
        assert!(matches!(result, Err(HmmError::NotInitialized { .. })));
    }
}

/// Test scenario: feature dimension changes after fitting
#[test]
fn test_dimension_mismatch_after_fit() {
    let (model, _) = fitted_gaussian();
    let wrong = FeatureMatrix::from_rows(&[vec![0.0, 1.0, 2.0]]).unwrap();
    match model.score(&wrong, None) {
        Err(HmmError::ShapeMismatch { expected, actual, .. }) => {
            assert_eq!(expected, "2");
            assert_eq!(actual, "3");
        }
        other => panic!("Expected ShapeMismatch, got {:?}", other),
    }
}

/// Test scenario: sequence lengths that do not cover the buffer
#[test]
fn test_bad_lengths() {
    let (model, obs) = fitted_gaussian();
    assert!(model.score(&obs, Some(&[10, 10])).is_err());
    assert!(model.score(&obs, Some(&[30, 20])).is_err());
    assert!(model.score(&obs, Some(&[20, 20])).is_ok());
}

/// Test scenario: non-stochastic chain parameters
#[test]
fn test_invalid_chain_parameters() {
    let (mut model, _) = fitted_gaussian();
    match model.set_startprob(vec![0.7, 0.7]) {
        Err(HmmError::InvalidDistributionParameter { parameter, .. }) => {
            assert_eq!(parameter, "startprob")
        }
        other => panic!("Expected InvalidDistributionParameter, got {:?}", other),
    }
    assert!(model.set_transmat(vec![vec![1.0, 0.0]]).is_err());
    assert!(model
        .set_transmat(vec![vec![1.2, -0.2], vec![0.5, 0.5]])
        .is_err());
}

/// Test scenario: covariance that is not positive definite
#[test]
fn test_non_positive_definite_covariance() {
    let mut emission = GaussianEmission::new(1, CovarianceType::Full);
    emission.set_means(vec![vec![0.0, 0.0]]).unwrap();
    let singular = nalgebra::DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
    assert!(matches!(
        emission.set_covars(Covariances::Full(vec![singular])),
        Err(HmmError::InvalidDistributionParameter { .. })
    ));

    let mut diag = GaussianEmission::new(1, CovarianceType::Diag);
    diag.set_means(vec![vec![0.0]]).unwrap();
    assert!(diag.set_covars(Covariances::Diag(vec![vec![-1.0]])).is_err());
}

/// Test scenario: observations impossible under every state
#[test]
fn test_zero_likelihood_row() {
    let mut emission = CategoricalEmission::new(2);
    emission
        .set_emissionprob(vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]])
        .unwrap();
    let mut model = HiddenMarkovModel::new(HmmConfig::new(2), emission).unwrap();
    model.set_startprob(vec![0.5, 0.5]).unwrap();
    model
        .set_transmat(vec![vec![0.5, 0.5], vec![0.5, 0.5]])
        .unwrap();

    // Symbol 2 has probability zero in both states.
    match model.decode(&vec![0, 1, 2, 0], None, None) {
        Err(HmmError::InvalidObservation { index, .. }) => assert_eq!(index, Some(2)),
        other => panic!("Expected InvalidObservation, got {:?}", other),
    }
    assert!(matches!(
        model.score(&vec![0, 2], None),
        Err(HmmError::InvalidObservation { .. })
    ));
    assert!(model.score(&vec![0, 1, 1], None).unwrap().is_finite());
}

/// Test scenario: symbols outside the fitted alphabet
#[test]
fn test_unknown_symbol() {
    let mut model = HiddenMarkovModel::new(
        HmmConfig::new(2).with_n_iter(3).with_seed(4),
        CategoricalEmission::new(2),
    )
    .unwrap();
    model.fit(&vec![0, 1, 2, 1, 0, 2], None).unwrap();
    match model.score(&vec![0, 3], None) {
        Err(HmmError::InvalidObservation { index, .. }) => assert_eq!(index, Some(1)),
        other => panic!("Expected InvalidObservation, got {:?}", other),
    }
}

/// Test scenario: Poisson counts must be non-negative integers
#[test]
fn test_negative_counts() {
    let mut model = HiddenMarkovModel::new(
        HmmConfig::new(1).with_n_iter(3).with_seed(4),
        PoissonEmission::new(1),
    )
    .unwrap();
    let bad = FeatureMatrix::from_column(&[1.0, -2.0, 3.0]).unwrap();
    assert!(matches!(
        model.fit(&bad, None),
        Err(HmmError::InvalidObservation { index: Some(1), .. })
    ));
}

/// Test scenario: training on an empty batch
#[test]
fn test_empty_batch() {
    let mut model = HiddenMarkovModel::new(
        HmmConfig::new(2),
        GaussianEmission::new(2, CovarianceType::Diag),
    )
    .unwrap();
    let empty = FeatureMatrix::empty(1);
    assert!(matches!(
        model.fit(&empty, None),
        Err(HmmError::InsufficientData { .. })
    ));
}
