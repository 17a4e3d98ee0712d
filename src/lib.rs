//! # hmmkit
//!
//! Hidden Markov models with pluggable emission families.
//!
//! A [`HiddenMarkovModel`] pairs a discrete hidden chain (start distribution
//! and transition matrix) with one [`EmissionModel`]. Parameters are estimated
//! with Baum-Welch (EM) in the log domain, and state paths are recovered with
//! Viterbi or per-timestep MAP decoding.
//!
//! ## Emission families
//!
//! - [`GaussianEmission`]: spherical, diagonal, full or tied covariances with
//!   Normal / inverse-Wishart style priors
//! - [`CategoricalEmission`]: symbols `0..V`
//! - [`PoissonEmission`]: independent per-feature counts
//! - [`GaussianMixtureEmission`]: a Gaussian mixture per state
//! - [`MarkedPoissonEmission`] and [`MultiProbeMarkedPoissonEmission`]:
//!   clusterless marked point processes
//!
//! ## Quick Start
//!
//! ```rust
//! use hmmkit::{CovarianceType, FeatureMatrix, GaussianEmission, HiddenMarkovModel, HmmConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Two well separated regimes of 1-D data.
//!     let mut values = Vec::new();
//!     for i in 0..40 {
//!         let jitter = 0.1 * ((i * 7 % 11) as f64 - 5.0) / 5.0;
//!         values.push(if (i / 10) % 2 == 0 { jitter } else { 8.0 + jitter });
//!     }
//!     let obs = FeatureMatrix::from_column(&values)?;
//!
//!     let config = HmmConfig::new(2).with_n_iter(20).with_seed(7);
//!     let mut model = HiddenMarkovModel::new(config, GaussianEmission::new(2, CovarianceType::Diag))?;
//!     let report = model.fit(&obs, None)?;
//!     println!("{} after {} iterations", report.status, report.iterations);
//!
//!     let states = model.predict(&obs, None)?;
//!     assert_eq!(states.len(), values.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`forward_backward`] and [`decoder`] hold the log-domain recursions.
//! - [`em_trainer`] runs the E-step (in parallel with the `parallel` feature)
//!   and the M-step; [`convergence`] decides when to stop.
//! - [`emission_models`] defines the strategy trait every family implements.
//! - [`clustering`] is the seeding collaborator; swap it with
//!   [`HiddenMarkovModel::with_clusterer`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(clippy::all)]

// Core modules
pub mod errors;
pub mod math_utils;
pub mod rng;
pub mod sequences;
pub mod covariance;
pub mod clustering;

// Emission families
pub mod emission_models;
pub mod emission_categorical;
pub mod emission_gaussian;
pub mod emission_marked;
pub mod emission_mixture;
pub mod emission_poisson;

// Inference and training
pub mod convergence;
pub mod decoder;
pub mod em_trainer;
pub mod forward_backward;
pub mod hmm_config;
pub mod hmm_core;
pub mod hmm_results;
pub mod sufficient_stats;

// Re-exports for convenience - main public API
pub use errors::{HmmError, HmmResult};
pub use hmm_config::{DirichletPrior, HmmConfig, ParamGroups};
pub use hmm_core::{ChainParameters, HiddenMarkovModel};
pub use hmm_results::{DecodeResult, FitReport, ModelCriteria};

pub use convergence::{ConvergenceMonitor, TrainingStatus};
pub use decoder::DecoderAlgorithm;
pub use em_trainer::{EmTrainer, TrainerState};

pub use clustering::{Clusterer, KMeansClusterer, MixtureFit};
pub use covariance::{CovarianceType, Covariances};
pub use emission_categorical::CategoricalEmission;
pub use emission_gaussian::GaussianEmission;
pub use emission_marked::{
    MarkClusters, MarkedPoissonEmission, MultiProbeMarkedPoissonEmission, RateMode, RateSettings,
};
pub use emission_mixture::GaussianMixtureEmission;
pub use emission_models::{EmissionModel, MergeStatistics};
pub use emission_poisson::PoissonEmission;
pub use rng::ModelRng;
pub use sequences::{FeatureMatrix, MarkArena, MultiProbeMarks, ObservationSet, SequenceIndex};
