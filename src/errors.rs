//! Error types and validation functions for hidden Markov model operations.
//!
//! This module provides the error taxonomy shared by every component of the
//! crate, together with the validation helpers used to check probability
//! vectors, stochastic matrices and shapes before they reach the numerical core.

use thiserror::Error;

/// Tolerance used when checking that probability vectors sum to one.
pub const PROBABILITY_SUM_TOLERANCE: f64 = 1e-8;

/// Error types for model construction, training and inference.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum HmmError {
    /// Feature dimensionality or state count disagrees with previously fixed values.
    #[error("Shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Quantity whose shape was checked
        what: String,
        /// Expected shape description
        expected: String,
        /// Actual shape description
        actual: String,
    },

    /// Distribution parameter outside its valid domain.
    #[error("Invalid distribution parameter {parameter}{}: {reason}", index_suffix(.index))]
    InvalidDistributionParameter {
        /// Parameter group name (e.g. `covars`, `startprob`)
        parameter: String,
        /// Offending state, component or row index if known
        index: Option<usize>,
        /// Why the parameter was rejected
        reason: String,
    },

    /// Observation that cannot be handled by the active emission model.
    #[error("Invalid observation{}: {reason}", index_suffix(.index))]
    InvalidObservation {
        /// Description of the problem
        reason: String,
        /// Offending timestep (relative to the concatenated buffer) if known
        index: Option<usize>,
    },

    /// Inference requested before parameters exist.
    #[error("Model is not initialized: {operation} requires fitted or assigned parameters")]
    NotInitialized {
        /// Operation that was attempted
        operation: String,
    },

    /// Invalid configuration value.
    #[error("Invalid parameter: {parameter} = {value}, expected {constraint}")]
    InvalidParameter {
        /// Parameter name
        parameter: String,
        /// Invalid value provided
        value: f64,
        /// Valid range or constraint description
        constraint: String,
    },

    /// Insufficient data for the requested operation.
    #[error("Insufficient data: need at least {required} points, got {actual}")]
    InsufficientData {
        /// Minimum required data points
        required: usize,
        /// Actual number of data points provided
        actual: usize,
    },

    /// Numerical computation error such as a failed factorization.
    #[error("Numerical computation failed: {reason}")]
    NumericalError {
        /// Detailed reason for numerical failure
        reason: String,
        /// Operation that failed
        operation: Option<String>,
    },
}

fn index_suffix(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" at index {}", i),
        None => String::new(),
    }
}

/// Result type for hidden Markov model operations.
pub type HmmResult<T> = Result<T, HmmError>;

impl HmmError {
    /// Convenience constructor for [`HmmError::ShapeMismatch`].
    pub fn shape(what: &str, expected: impl ToString, actual: impl ToString) -> Self {
        HmmError::ShapeMismatch {
            what: what.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Convenience constructor for [`HmmError::InvalidDistributionParameter`].
    pub fn distribution(parameter: &str, index: Option<usize>, reason: impl Into<String>) -> Self {
        HmmError::InvalidDistributionParameter {
            parameter: parameter.to_string(),
            index,
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`HmmError::InvalidObservation`].
    pub fn observation(index: Option<usize>, reason: impl Into<String>) -> Self {
        HmmError::InvalidObservation {
            reason: reason.into(),
            index,
        }
    }
}

/// Validates that a parameter is within expected bounds.
///
/// # Example
/// ```rust
/// use hmmkit::errors::validate_parameter;
///
/// assert!(validate_parameter(0.5, 0.0, 1.0, "tol").is_ok());
/// assert!(validate_parameter(1.5, 0.0, 1.0, "tol").is_err());
/// ```
pub fn validate_parameter(value: f64, min: f64, max: f64, name: &str) -> HmmResult<()> {
    if value.is_nan() {
        return Err(HmmError::InvalidParameter {
            parameter: name.to_string(),
            value,
            constraint: "must not be NaN".to_string(),
        });
    }

    if value < min || value > max {
        Err(HmmError::InvalidParameter {
            parameter: name.to_string(),
            value,
            constraint: format!("[{}, {}]", min, max),
        })
    } else {
        Ok(())
    }
}

/// Validates that all values in a slice are finite.
///
/// Returns on the first non-finite value, reporting its position.
pub fn validate_all_finite(data: &[f64], name: &str) -> HmmResult<()> {
    if let Some((i, &value)) = data.iter().enumerate().find(|(_, &v)| !v.is_finite()) {
        return Err(HmmError::InvalidObservation {
            reason: format!("{} contains non-finite value {}", name, value),
            index: Some(i),
        });
    }
    Ok(())
}

/// Validates a probability vector: expected length, non-negative entries, unit sum.
pub fn validate_probability_vector(
    probs: &[f64],
    expected_len: usize,
    parameter: &str,
    row: Option<usize>,
) -> HmmResult<()> {
    if probs.len() != expected_len {
        return Err(HmmError::shape(parameter, expected_len, probs.len()));
    }

    if let Some((i, &p)) = probs
        .iter()
        .enumerate()
        .find(|(_, &p)| !p.is_finite() || p < 0.0)
    {
        return Err(HmmError::distribution(
            parameter,
            row.or(Some(i)),
            format!("entry {} is {}, expected a finite non-negative value", i, p),
        ));
    }

    let sum: f64 = probs.iter().sum();
    if (sum - 1.0).abs() > PROBABILITY_SUM_TOLERANCE.max(1e-6 * expected_len as f64) {
        return Err(HmmError::distribution(
            parameter,
            row,
            format!("must sum to 1, got {:.12}", sum),
        ));
    }

    Ok(())
}

/// Validates a square row-stochastic matrix of the given order.
pub fn validate_stochastic_matrix(
    matrix: &[Vec<f64>],
    order: usize,
    parameter: &str,
) -> HmmResult<()> {
    if matrix.len() != order {
        return Err(HmmError::shape(
            parameter,
            format!("{} rows", order),
            format!("{} rows", matrix.len()),
        ));
    }
    for (i, row) in matrix.iter().enumerate() {
        validate_probability_vector(row, order, parameter, Some(i))?;
    }
    Ok(())
}
