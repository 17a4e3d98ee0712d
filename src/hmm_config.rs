//! Configuration structures for hidden Markov model training and inference.
//!
//! Family-specific options (covariance structuring, priors, mixture sizes)
//! live on the emission structs themselves; this module holds what every
//! model shares.

use crate::decoder::DecoderAlgorithm;
use crate::errors::{validate_parameter, HmmError, HmmResult};

/// Parameter groups that are updated during training or seeded at initialization.
///
/// Each group is independently selectable. Families interpret the emission
/// groups as follows:
///
/// | group       | Gaussian | categorical    | Poisson | mixture | marked Poisson  |
/// |-------------|----------|----------------|---------|---------|-----------------|
/// | `location`  | means    | emission probs | rates   | means   | cluster fitting |
/// | `scale`     | covars   | (unused)       | (unused)| covars  | rates           |
/// | `weights`   | (unused) | (unused)       | (unused)| weights | (unused)        |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParamGroups {
    /// Initial state distribution
    pub start: bool,
    /// Transition matrix
    pub transitions: bool,
    /// Emission location parameters
    pub location: bool,
    /// Emission scale or rate parameters
    pub scale: bool,
    /// Mixture weights
    pub weights: bool,
}

impl Default for ParamGroups {
    fn default() -> Self {
        Self::all()
    }
}

impl ParamGroups {
    /// Every group selected.
    pub fn all() -> Self {
        Self {
            start: true,
            transitions: true,
            location: true,
            scale: true,
            weights: true,
        }
    }

    /// No group selected.
    pub fn none() -> Self {
        Self {
            start: false,
            transitions: false,
            location: false,
            scale: false,
            weights: false,
        }
    }

    /// Parse letter codes: `s` start, `t` transitions, `m`/`e` location,
    /// `c`/`r`/`l` scale or rate, `w` weights.
    ///
    /// # Example
    /// ```rust
    /// use hmmkit::hmm_config::ParamGroups;
    ///
    /// let groups = ParamGroups::from_codes("st").unwrap();
    /// assert!(groups.start && groups.transitions && !groups.location);
    /// assert!(ParamGroups::from_codes("sx").is_err());
    /// ```
    pub fn from_codes(codes: &str) -> HmmResult<Self> {
        let mut groups = Self::none();
        for code in codes.chars() {
            match code {
                's' => groups.start = true,
                't' => groups.transitions = true,
                'm' | 'e' => groups.location = true,
                'c' | 'r' | 'l' => groups.scale = true,
                'w' => groups.weights = true,
                other => {
                    return Err(HmmError::InvalidParameter {
                        parameter: format!("parameter code '{}'", other),
                        value: f64::NAN,
                        constraint: "one of s, t, m, e, c, r, l, w".to_string(),
                    })
                }
            }
        }
        Ok(groups)
    }

    /// Canonical letter codes of the selected groups.
    pub fn to_codes(&self) -> String {
        let mut codes = String::new();
        for (selected, code) in [
            (self.start, 's'),
            (self.transitions, 't'),
            (self.location, 'm'),
            (self.scale, 'c'),
            (self.weights, 'w'),
        ] {
            if selected {
                codes.push(code);
            }
        }
        codes
    }

    /// Whether any emission group is selected.
    pub fn any_emission(&self) -> bool {
        self.location || self.scale || self.weights
    }
}

/// Dirichlet pseudo-counts for the start vector or the transition rows.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DirichletPrior {
    /// Same concentration for every entry.
    Symmetric(f64),
    /// Explicit concentrations for the start vector.
    Vector(Vec<f64>),
    /// Explicit concentrations for the transition matrix, one row per state.
    Matrix(Vec<Vec<f64>>),
}

impl Default for DirichletPrior {
    fn default() -> Self {
        DirichletPrior::Symmetric(1.0)
    }
}

impl DirichletPrior {
    /// Concentrations as a vector of length `n`.
    pub fn as_vector(&self, n: usize) -> HmmResult<Vec<f64>> {
        match self {
            DirichletPrior::Symmetric(a) => Ok(vec![*a; n]),
            DirichletPrior::Vector(v) if v.len() == n => Ok(v.clone()),
            DirichletPrior::Vector(v) => Err(HmmError::shape("startprob_prior", n, v.len())),
            DirichletPrior::Matrix(_) => Err(HmmError::shape(
                "startprob_prior",
                format!("vector of length {}", n),
                "matrix",
            )),
        }
    }

    /// Concentrations as an `n×n` matrix.
    pub fn as_matrix(&self, n: usize) -> HmmResult<Vec<Vec<f64>>> {
        match self {
            DirichletPrior::Symmetric(a) => Ok(vec![vec![*a; n]; n]),
            DirichletPrior::Matrix(m) => {
                if m.len() != n || m.iter().any(|row| row.len() != n) {
                    return Err(HmmError::shape(
                        "transmat_prior",
                        format!("{}x{}", n, n),
                        format!("{}x{}", m.len(), m.first().map(|r| r.len()).unwrap_or(0)),
                    ));
                }
                Ok(m.clone())
            }
            DirichletPrior::Vector(v) => Err(HmmError::shape(
                "transmat_prior",
                format!("{}x{} matrix", n, n),
                format!("vector of length {}", v.len()),
            )),
        }
    }
}

/// Configuration shared by every hidden Markov model.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HmmConfig {
    /// Number of hidden states
    pub n_states: usize,
    /// Maximum number of EM iterations
    pub n_iter: usize,
    /// Convergence threshold on the log-likelihood gain
    pub tol: f64,
    /// Groups updated during training
    pub params: ParamGroups,
    /// Groups seeded during initialization
    pub init_params: ParamGroups,
    /// Default decoding strategy
    pub algorithm: DecoderAlgorithm,
    /// Report every iteration at info level
    pub verbose: bool,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
    /// Dirichlet prior on the start vector
    pub startprob_prior: DirichletPrior,
    /// Dirichlet prior on the transition rows
    pub transmat_prior: DirichletPrior,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            n_states: 1,
            n_iter: 10,
            tol: 1e-2,
            params: ParamGroups::all(),
            init_params: ParamGroups::all(),
            algorithm: DecoderAlgorithm::Viterbi,
            verbose: false,
            seed: None,
            startprob_prior: DirichletPrior::default(),
            transmat_prior: DirichletPrior::default(),
        }
    }
}

impl HmmConfig {
    /// Default configuration with `n_states` hidden states.
    pub fn new(n_states: usize) -> Self {
        Self {
            n_states,
            ..Self::default()
        }
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_params(mut self, params: ParamGroups) -> Self {
        self.params = params;
        self
    }

    pub fn with_init_params(mut self, init_params: ParamGroups) -> Self {
        self.init_params = init_params;
        self
    }

    pub fn with_algorithm(mut self, algorithm: DecoderAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_startprob_prior(mut self, prior: DirichletPrior) -> Self {
        self.startprob_prior = prior;
        self
    }

    pub fn with_transmat_prior(mut self, prior: DirichletPrior) -> Self {
        self.transmat_prior = prior;
        self
    }

    /// Check the configuration before it is used to build a model.
    pub fn validate(&self) -> HmmResult<()> {
        if self.n_states == 0 {
            return Err(HmmError::InvalidParameter {
                parameter: "n_states".to_string(),
                value: 0.0,
                constraint: "at least 1".to_string(),
            });
        }
        validate_parameter(self.tol, 0.0, f64::INFINITY, "tol")?;

        let start = self.startprob_prior.as_vector(self.n_states)?;
        let trans = self.transmat_prior.as_matrix(self.n_states)?;
        if let Some(&a) = start.iter().chain(trans.iter().flatten()).find(|a| !a.is_finite()) {
            return Err(HmmError::InvalidParameter {
                parameter: "dirichlet prior".to_string(),
                value: a,
                constraint: "finite concentrations".to_string(),
            });
        }
        Ok(())
    }
}
