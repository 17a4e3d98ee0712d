//! Covariance structurings and multivariate Gaussian densities.
//!
//! Covariances are stored in a compact form that depends on the structuring:
//!
//! | type        | stored as                              |
//! |-------------|----------------------------------------|
//! | `Spherical` | one variance per component             |
//! | `Diag`      | one variance vector per component      |
//! | `Full`      | one D×D matrix per component           |
//! | `Tied`      | a single D×D matrix shared by all      |
//!
//! [`Covariances::to_full`] expands to one full matrix per component and
//! [`Covariances::from_full`] compacts back; the round trip is idempotent.

use std::fmt;
use std::str::FromStr;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use crate::errors::{HmmError, HmmResult};
use crate::math_utils::constants::LOG_2PI;
use crate::math_utils::sample_covariance;
use crate::rng::ModelRng;

/// Jitter added to the diagonal when a Cholesky factorization fails once.
const CHOLESKY_JITTER: f64 = 1e-7;

/// Relative tolerance for the symmetry check.
const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// Covariance structuring of a Gaussian emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CovarianceType {
    /// Single variance shared by all features of a component.
    Spherical,
    /// Independent variance per feature.
    #[default]
    Diag,
    /// Unrestricted symmetric positive-definite matrix per component.
    Full,
    /// One full matrix shared by all components.
    Tied,
}

impl CovarianceType {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CovarianceType::Spherical => "spherical",
            CovarianceType::Diag => "diag",
            CovarianceType::Full => "full",
            CovarianceType::Tied => "tied",
        }
    }

    /// Whether the stored form is a full matrix.
    pub fn is_matrix(&self) -> bool {
        matches!(self, CovarianceType::Full | CovarianceType::Tied)
    }
}

impl fmt::Display for CovarianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CovarianceType {
    type Err = HmmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spherical" => Ok(CovarianceType::Spherical),
            "diag" => Ok(CovarianceType::Diag),
            "full" => Ok(CovarianceType::Full),
            "tied" => Ok(CovarianceType::Tied),
            other => Err(HmmError::InvalidParameter {
                parameter: format!("covariance_type '{}'", other),
                value: f64::NAN,
                constraint: "one of spherical, diag, full, tied".to_string(),
            }),
        }
    }
}

/// Compactly stored covariance parameters for a set of components.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Covariances {
    /// Variance per component.
    Spherical(Vec<f64>),
    /// Variance vector per component.
    Diag(Vec<Vec<f64>>),
    /// Full matrix per component.
    Full(Vec<DMatrix<f64>>),
    /// One matrix shared by all components.
    Tied(DMatrix<f64>),
}

impl Covariances {
    /// Structuring of the stored parameters.
    pub fn covariance_type(&self) -> CovarianceType {
        match self {
            Covariances::Spherical(_) => CovarianceType::Spherical,
            Covariances::Diag(_) => CovarianceType::Diag,
            Covariances::Full(_) => CovarianceType::Full,
            Covariances::Tied(_) => CovarianceType::Tied,
        }
    }

    /// Replicate one empirical covariance matrix into the requested structuring.
    pub fn distribute(cov: &DMatrix<f64>, cov_type: CovarianceType, n_components: usize) -> Self {
        let n = cov.nrows();
        match cov_type {
            CovarianceType::Spherical => {
                let mean_var = cov.diagonal().sum() / n.max(1) as f64;
                Covariances::Spherical(vec![mean_var; n_components])
            }
            CovarianceType::Diag => {
                let diag: Vec<f64> = cov.diagonal().iter().copied().collect();
                Covariances::Diag(vec![diag; n_components])
            }
            CovarianceType::Full => Covariances::Full(vec![cov.clone(); n_components]),
            CovarianceType::Tied => Covariances::Tied(cov.clone()),
        }
    }

    /// Full covariance matrix of component `k`.
    pub fn full(&self, k: usize, n_features: usize) -> DMatrix<f64> {
        match self {
            Covariances::Spherical(v) => DMatrix::identity(n_features, n_features) * v[k],
            Covariances::Diag(v) => DMatrix::from_diagonal(&DVector::from_column_slice(&v[k])),
            Covariances::Full(m) => m[k].clone(),
            Covariances::Tied(m) => m.clone(),
        }
    }

    /// Expand to one full matrix per component.
    pub fn to_full(&self, n_components: usize, n_features: usize) -> Vec<DMatrix<f64>> {
        (0..n_components).map(|k| self.full(k, n_features)).collect()
    }

    /// Compact a list of full matrices into the requested structuring.
    ///
    /// Spherical keeps the mean of each diagonal, diag keeps the diagonal and
    /// tied requires every matrix to be identical.
    pub fn from_full(cov_type: CovarianceType, fulls: &[DMatrix<f64>]) -> HmmResult<Self> {
        match cov_type {
            CovarianceType::Spherical => Ok(Covariances::Spherical(
                fulls
                    .iter()
                    .map(|m| m.diagonal().sum() / m.nrows().max(1) as f64)
                    .collect(),
            )),
            CovarianceType::Diag => Ok(Covariances::Diag(
                fulls
                    .iter()
                    .map(|m| m.diagonal().iter().copied().collect())
                    .collect(),
            )),
            CovarianceType::Full => Ok(Covariances::Full(fulls.to_vec())),
            CovarianceType::Tied => {
                let first = fulls
                    .first()
                    .ok_or_else(|| HmmError::shape("tied covariances", "at least 1", 0))?;
                for (k, m) in fulls.iter().enumerate().skip(1) {
                    if m != first {
                        return Err(HmmError::distribution(
                            "covars",
                            Some(k),
                            "tied covariance matrices must be identical across components",
                        ));
                    }
                }
                Ok(Covariances::Tied(first.clone()))
            }
        }
    }

    /// Check shapes and the positivity constraints of the structuring.
    ///
    /// Spherical and diagonal variances must be positive; full and tied
    /// matrices must be symmetric positive-definite.
    pub fn validate(&self, n_components: usize, n_features: usize) -> HmmResult<()> {
        match self {
            Covariances::Spherical(v) => {
                if v.len() != n_components {
                    return Err(HmmError::shape("spherical covars", n_components, v.len()));
                }
                if let Some((k, &var)) = v.iter().enumerate().find(|(_, &x)| !(x > 0.0)) {
                    return Err(HmmError::distribution(
                        "covars",
                        Some(k),
                        format!("spherical variance must be positive, got {}", var),
                    ));
                }
            }
            Covariances::Diag(v) => {
                if v.len() != n_components {
                    return Err(HmmError::shape("diag covars", n_components, v.len()));
                }
                for (k, row) in v.iter().enumerate() {
                    if row.len() != n_features {
                        return Err(HmmError::ShapeMismatch {
                            what: format!("diag covars of component {}", k),
                            expected: n_features.to_string(),
                            actual: row.len().to_string(),
                        });
                    }
                    if let Some((j, &var)) = row.iter().enumerate().find(|(_, &x)| !(x > 0.0)) {
                        return Err(HmmError::distribution(
                            "covars",
                            Some(k),
                            format!("variance of feature {} must be positive, got {}", j, var),
                        ));
                    }
                }
            }
            Covariances::Full(m) => {
                if m.len() != n_components {
                    return Err(HmmError::shape("full covars", n_components, m.len()));
                }
                for (k, cov) in m.iter().enumerate() {
                    check_spd(cov, n_features, Some(k))?;
                }
            }
            Covariances::Tied(cov) => check_spd(cov, n_features, None)?,
        }
        Ok(())
    }
}

/// Check that `cov` is an `n×n` symmetric positive-definite matrix.
pub fn check_spd(cov: &DMatrix<f64>, n: usize, index: Option<usize>) -> HmmResult<()> {
    if cov.nrows() != n || cov.ncols() != n {
        return Err(HmmError::ShapeMismatch {
            what: match index {
                Some(k) => format!("covariance matrix of component {}", k),
                None => "tied covariance matrix".to_string(),
            },
            expected: format!("{}x{}", n, n),
            actual: format!("{}x{}", cov.nrows(), cov.ncols()),
        });
    }
    let scale = cov.amax().max(1.0);
    let asymmetry = (cov - cov.transpose()).amax();
    if asymmetry > SYMMETRY_TOLERANCE * scale {
        return Err(HmmError::distribution(
            "covars",
            index,
            format!("matrix is not symmetric (max asymmetry {:.3e})", asymmetry),
        ));
    }
    if Cholesky::new(cov.clone()).is_none() {
        return Err(HmmError::distribution(
            "covars",
            index,
            "matrix is not positive-definite",
        ));
    }
    Ok(())
}

/// Cholesky factor of `cov`, retrying once with a small diagonal jitter.
fn cholesky_with_jitter(cov: &DMatrix<f64>, index: Option<usize>) -> HmmResult<Cholesky<f64, Dyn>> {
    if let Some(chol) = Cholesky::new(cov.clone()) {
        return Ok(chol);
    }
    let n = cov.nrows();
    let jittered = cov + DMatrix::identity(n, n) * CHOLESKY_JITTER;
    Cholesky::new(jittered).ok_or_else(|| {
        HmmError::distribution(
            "covars",
            index,
            "covariance must be symmetric, positive-definite",
        )
    })
}

#[derive(Debug, Clone)]
enum Precision {
    Diagonal { variances: Vec<f64>, log_det: f64 },
    Cholesky { lower: DMatrix<f64>, log_det: f64 },
}

/// Gaussian component with its factorization cached for repeated evaluation.
#[derive(Debug, Clone)]
pub struct PreparedGaussian {
    mean: DVector<f64>,
    precision: Precision,
}

impl PreparedGaussian {
    /// Prepare a component from a mean and a variance vector.
    pub fn diagonal(mean: &[f64], variances: &[f64], index: Option<usize>) -> HmmResult<Self> {
        if mean.len() != variances.len() {
            return Err(HmmError::shape("variance vector", mean.len(), variances.len()));
        }
        if let Some(&v) = variances.iter().find(|&&v| !(v > 0.0)) {
            return Err(HmmError::distribution(
                "covars",
                index,
                format!("variance must be positive, got {}", v),
            ));
        }
        let log_det = variances.iter().map(|v| v.ln()).sum();
        Ok(Self {
            mean: DVector::from_column_slice(mean),
            precision: Precision::Diagonal {
                variances: variances.to_vec(),
                log_det,
            },
        })
    }

    /// Prepare a component from a mean and a full covariance matrix.
    pub fn full(mean: &[f64], cov: &DMatrix<f64>, index: Option<usize>) -> HmmResult<Self> {
        if cov.nrows() != mean.len() || cov.ncols() != mean.len() {
            return Err(HmmError::shape(
                "covariance matrix",
                format!("{}x{}", mean.len(), mean.len()),
                format!("{}x{}", cov.nrows(), cov.ncols()),
            ));
        }
        let chol = cholesky_with_jitter(cov, index)?;
        let lower = chol.l();
        let log_det = 2.0 * lower.diagonal().iter().map(|x| x.ln()).sum::<f64>();
        Ok(Self {
            mean: DVector::from_column_slice(mean),
            precision: Precision::Cholesky { lower, log_det },
        })
    }

    /// Prepare component `k` of a compact covariance set.
    pub fn from_covariances(mean: &[f64], covars: &Covariances, k: usize) -> HmmResult<Self> {
        let d = mean.len();
        match covars {
            Covariances::Spherical(v) => Self::diagonal(mean, &vec![v[k]; d], Some(k)),
            Covariances::Diag(v) => Self::diagonal(mean, &v[k], Some(k)),
            Covariances::Full(m) => Self::full(mean, &m[k], Some(k)),
            Covariances::Tied(m) => Self::full(mean, m, Some(k)),
        }
    }

    /// Dimensionality of the component.
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Log-density at `x`.
    pub fn log_pdf(&self, x: &[f64]) -> f64 {
        let d = self.mean.len() as f64;
        match &self.precision {
            Precision::Diagonal { variances, log_det } => {
                let maha: f64 = x
                    .iter()
                    .zip(self.mean.iter())
                    .zip(variances.iter())
                    .map(|((&xi, &mi), &vi)| (xi - mi) * (xi - mi) / vi)
                    .sum();
                -0.5 * (d * LOG_2PI + log_det + maha)
            }
            Precision::Cholesky { lower, log_det } => {
                let diff = DVector::from_iterator(
                    self.mean.len(),
                    x.iter().zip(self.mean.iter()).map(|(&xi, &mi)| xi - mi),
                );
                let maha = match lower.solve_lower_triangular(&diff) {
                    Some(y) => y.norm_squared(),
                    None => f64::INFINITY,
                };
                -0.5 * (d * LOG_2PI + log_det + maha)
            }
        }
    }

    /// Draw one sample from the component.
    pub fn sample(&self, rng: &mut ModelRng) -> Vec<f64> {
        let n = self.mean.len();
        let z = DVector::from_iterator(n, (0..n).map(|_| rng.standard_normal()));
        let x = match &self.precision {
            Precision::Diagonal { variances, .. } => DVector::from_iterator(
                n,
                z.iter()
                    .zip(variances.iter())
                    .map(|(&zi, &vi)| zi * vi.sqrt()),
            ),
            Precision::Cholesky { lower, .. } => lower * z,
        };
        (x + &self.mean).iter().copied().collect()
    }
}

/// Sample covariance of `rows` plus `min_covar` on the diagonal.
///
/// A single row has zero scatter, so the result is `min_covar · I`.
pub fn regularized_covariance(rows: &[&[f64]], n_features: usize, min_covar: f64) -> DMatrix<f64> {
    let cov = sample_covariance(rows, n_features);
    DMatrix::from_fn(n_features, n_features, |i, j| {
        cov[i][j] + if i == j { min_covar } else { 0.0 }
    })
}

/// Log-density of every row under every component: a `(T, K)` matrix.
pub fn log_multivariate_normal_density<'a>(
    rows: impl Iterator<Item = &'a [f64]>,
    means: &[Vec<f64>],
    covars: &Covariances,
) -> HmmResult<Vec<Vec<f64>>> {
    let prepared = means
        .iter()
        .enumerate()
        .map(|(k, mean)| PreparedGaussian::from_covariances(mean, covars, k))
        .collect::<HmmResult<Vec<_>>>()?;
    Ok(rows
        .map(|x| prepared.iter().map(|g| g.log_pdf(x)).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn spd_3x3() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 3, &[2.0, 0.3, 0.1, 0.3, 1.5, 0.2, 0.1, 0.2, 1.0])
    }

    #[test]
    fn test_round_trip_is_idempotent_for_all_types() {
        let n_components = 2;
        let n_features = 3;
        let cases = vec![
            Covariances::Spherical(vec![0.5, 2.0]),
            Covariances::Diag(vec![vec![0.5, 1.0, 1.5], vec![2.0, 0.1, 0.7]]),
            Covariances::Full(vec![spd_3x3(), DMatrix::identity(3, 3) * 0.4]),
            Covariances::Tied(spd_3x3()),
        ];
        for covars in cases {
            let fulls = covars.to_full(n_components, n_features);
            let compact = Covariances::from_full(covars.covariance_type(), &fulls).unwrap();
            assert_eq!(compact, covars);
            let again = compact.to_full(n_components, n_features);
            assert_eq!(again, fulls);
        }
    }

    #[test]
    fn test_distribute_matches_structuring() {
        let cov = spd_3x3();
        match Covariances::distribute(&cov, CovarianceType::Spherical, 4) {
            Covariances::Spherical(v) => {
                assert_eq!(v.len(), 4);
                assert_approx_eq!(v[0], 1.5);
            }
            other => panic!("unexpected {:?}", other),
        }
        match Covariances::distribute(&cov, CovarianceType::Diag, 2) {
            Covariances::Diag(v) => assert_eq!(v[1], vec![2.0, 1.5, 1.0]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_non_spd() {
        let bad = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        match Covariances::Full(vec![DMatrix::identity(2, 2), bad]).validate(2, 2) {
            Err(HmmError::InvalidDistributionParameter { index, .. }) => {
                assert_eq!(index, Some(1))
            }
            other => panic!("Expected InvalidDistributionParameter, got {:?}", other),
        }

        let asym = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(Covariances::Tied(asym).validate(3, 2).is_err());
        assert!(Covariances::Diag(vec![vec![1.0, 0.0]]).validate(1, 2).is_err());
        assert!(Covariances::Spherical(vec![1.0]).validate(2, 2).is_err());
    }

    #[test]
    fn test_diagonal_and_full_densities_agree() {
        let mean = [0.5, -1.0];
        let vars = [2.0, 0.5];
        let diag = PreparedGaussian::diagonal(&mean, &vars, None).unwrap();
        let full = PreparedGaussian::full(
            &mean,
            &DMatrix::from_diagonal(&DVector::from_column_slice(&vars)),
            None,
        )
        .unwrap();
        let x = [1.3, 0.2];
        assert_approx_eq!(diag.log_pdf(&x), full.log_pdf(&x), 1e-10);
    }

    #[test]
    fn test_standard_normal_density_at_origin() {
        let g = PreparedGaussian::diagonal(&[0.0], &[1.0], None).unwrap();
        assert_approx_eq!(g.log_pdf(&[0.0]), -0.5 * LOG_2PI, 1e-12);
    }

    #[test]
    fn test_density_matrix_shape() {
        let rows = [vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]];
        let means = vec![vec![0.0, 0.0], vec![2.0, 2.0]];
        let covars = Covariances::Spherical(vec![1.0, 1.0]);
        let ll = log_multivariate_normal_density(rows.iter().map(|r| r.as_slice()), &means, &covars)
            .unwrap();
        assert_eq!(ll.len(), 3);
        assert_eq!(ll[0].len(), 2);
        assert!(ll[0][0] > ll[0][1]);
        assert!(ll[2][1] > ll[2][0]);
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let g = PreparedGaussian::full(&[1.0, 2.0, 3.0], &spd_3x3(), None).unwrap();
        let a = g.sample(&mut ModelRng::with_seed(5));
        let b = g.sample(&mut ModelRng::with_seed(5));
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_parse_covariance_type() {
        assert_eq!("tied".parse::<CovarianceType>().unwrap(), CovarianceType::Tied);
        assert!("banded".parse::<CovarianceType>().is_err());
    }
}
