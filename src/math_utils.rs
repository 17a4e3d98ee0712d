//! Mathematical utility functions and constants for log-domain inference.
//!
//! Everything in the forward-backward recursions, the decoders and the
//! emission models funnels through the helpers in this module, so they are
//! written to stay finite in the presence of `-inf` inputs.

/// Numerical constants shared by the inference engine and the emission models.
pub mod constants {
    /// Floor applied to per-timestep emission log-likelihoods.
    pub const MIN_LOGLIKELIHOOD: f64 = -700.0;

    /// Smallest likelihood considered distinguishable from zero.
    pub const MIN_LIKELIHOOD: f64 = 1e-300;

    /// ln(2π)
    pub const LOG_2PI: f64 = 1.837_877_066_409_345_5;

    /// Denominator floor for diagonal and spherical covariance updates.
    pub const MIN_COVARIANCE_DENOMINATOR: f64 = 1e-5;

    /// Floor for Poisson means and marked Poisson rates after the M-step.
    pub const MIN_RATE: f64 = 1e-3;
}

/// Numerically stable `ln(Σ exp(xᵢ))`.
///
/// The maximum is subtracted before exponentiating. An empty slice or a slice
/// of `-inf` values yields `-inf`.
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// `ln(exp(a) + exp(b))` without allocating.
#[inline]
pub fn logaddexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Natural logarithm that maps zero to `-inf` instead of producing NaN for `-0.0`.
#[inline]
pub fn safe_ln(x: f64) -> f64 {
    if x <= 0.0 {
        f64::NEG_INFINITY
    } else {
        x.ln()
    }
}

/// Element-wise [`safe_ln`] over a vector.
pub fn log_vector(values: &[f64]) -> Vec<f64> {
    values.iter().map(|&v| safe_ln(v)).collect()
}

/// Element-wise [`safe_ln`] over a row-major matrix.
pub fn log_matrix(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
    rows.iter().map(|row| log_vector(row)).collect()
}

/// Normalizes a vector in place so that it sums to one.
///
/// A zero sum is treated as one, leaving an all-zero vector untouched.
pub fn normalize(values: &mut [f64]) {
    let sum: f64 = values.iter().sum();
    let denom = if sum == 0.0 { 1.0 } else { sum };
    for v in values.iter_mut() {
        *v /= denom;
    }
}

/// Index and value of the maximum, ties broken by lowest index.
///
/// NaN entries never win. Returns `(0, -inf)` for an empty or all-NaN slice.
pub fn argmax(values: &[f64]) -> (usize, f64) {
    let mut best_idx = 0;
    let mut best_val = f64::NEG_INFINITY;
    let mut found = false;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if !found || v > best_val {
            best_idx = i;
            best_val = v;
            found = true;
        }
    }
    (best_idx, best_val)
}

/// Draws an index from a discrete distribution given a uniform variate in [0, 1).
///
/// Uses the cumulative sum, returning the first index whose CDF exceeds `u`.
/// Falls back to the last positive-mass index when rounding leaves the CDF short of `u`.
pub fn sample_from_cdf(probs: &[f64], u: f64) -> usize {
    let mut cumulative = 0.0;
    let mut last_positive = 0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if p > 0.0 {
            last_positive = i;
        }
        if cumulative > u {
            return i;
        }
    }
    last_positive
}

/// Sample mean of each column of a set of rows.
pub fn column_means(rows: &[&[f64]], n_cols: usize) -> Vec<f64> {
    let mut means = vec![0.0; n_cols];
    if rows.is_empty() {
        return means;
    }
    for row in rows {
        for (m, &x) in means.iter_mut().zip(row.iter()) {
            *m += x;
        }
    }
    let n = rows.len() as f64;
    means.iter_mut().for_each(|m| *m /= n);
    means
}

/// Unbiased sample covariance of a set of rows (`np.cov(X.T)` convention).
///
/// With fewer than two rows the covariance is all zeros.
pub fn sample_covariance(rows: &[&[f64]], n_cols: usize) -> Vec<Vec<f64>> {
    let mut cov = vec![vec![0.0; n_cols]; n_cols];
    if rows.len() < 2 {
        return cov;
    }
    let means = column_means(rows, n_cols);
    for row in rows {
        for p in 0..n_cols {
            let dp = row[p] - means[p];
            for q in p..n_cols {
                cov[p][q] += dp * (row[q] - means[q]);
            }
        }
    }
    let denom = (rows.len() - 1) as f64;
    for p in 0..n_cols {
        for q in p..n_cols {
            cov[p][q] /= denom;
            cov[q][p] = cov[p][q];
        }
    }
    cov
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_logsumexp_matches_direct_sum() {
        let values = [0.1f64.ln(), 0.2f64.ln(), 0.7f64.ln()];
        assert_approx_eq!(logsumexp(&values), 0.0, 1e-12);
    }

    #[test]
    fn test_logsumexp_handles_large_negative_values() {
        // Direct exponentiation underflows to zero here.
        let values = [-1000.0, -1000.0];
        assert_approx_eq!(logsumexp(&values), -1000.0 + 2f64.ln(), 1e-9);
    }

    #[test]
    fn test_logsumexp_all_neg_infinity() {
        assert_eq!(logsumexp(&[f64::NEG_INFINITY; 3]), f64::NEG_INFINITY);
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_logaddexp_agrees_with_logsumexp() {
        assert_approx_eq!(logaddexp(-3.0, -4.5), logsumexp(&[-3.0, -4.5]), 1e-12);
        assert_eq!(logaddexp(f64::NEG_INFINITY, -2.0), -2.0);
    }

    #[test]
    fn test_normalize_keeps_zero_rows() {
        let mut zeros = vec![0.0, 0.0];
        normalize(&mut zeros);
        assert_eq!(zeros, vec![0.0, 0.0]);

        let mut row = vec![1.0, 3.0];
        normalize(&mut row);
        assert_approx_eq!(row[0], 0.25);
        assert_approx_eq!(row[1], 0.75);
    }

    #[test]
    fn test_argmax_breaks_ties_low() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]).0, 1);
        assert_eq!(argmax(&[f64::NEG_INFINITY, f64::NEG_INFINITY]).0, 0);
        assert_eq!(argmax(&[f64::NAN, 2.0]).0, 1);
    }

    #[test]
    fn test_sample_from_cdf() {
        let probs = [0.2, 0.0, 0.8];
        assert_eq!(sample_from_cdf(&probs, 0.1), 0);
        assert_eq!(sample_from_cdf(&probs, 0.5), 2);
        assert_eq!(sample_from_cdf(&probs, 0.999_999_999_999), 2);
    }

    #[test]
    fn test_sample_covariance_matches_hand_computation() {
        let a = [1.0, 2.0];
        let b = [3.0, 6.0];
        let rows: Vec<&[f64]> = vec![&a, &b];
        let cov = sample_covariance(&rows, 2);
        assert_approx_eq!(cov[0][0], 2.0);
        assert_approx_eq!(cov[0][1], 4.0);
        assert_approx_eq!(cov[1][1], 8.0);
    }
}
