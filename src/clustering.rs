//! Clustering collaborators used only to seed emission parameters.
//!
//! The EM core never depends on a concrete clustering routine: it calls the
//! [`Clusterer`] trait, so alternative seeding strategies can be injected
//! without touching the trainer. [`KMeansClusterer`] is the default
//! implementation (k-means++ seeding with Lloyd iterations, and a
//! k-means-initialized EM fit for Gaussian mixtures).

use nalgebra::DMatrix;

use crate::covariance::{CovarianceType, Covariances, PreparedGaussian};
use crate::errors::{HmmError, HmmResult};
use crate::math_utils::logsumexp;
use crate::rng::ModelRng;

/// Result of fitting a Gaussian mixture to a point cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureFit {
    /// Mixing weights, summing to one
    pub weights: Vec<f64>,
    /// Component means
    pub means: Vec<Vec<f64>>,
    /// Component covariances in the requested structuring
    pub covariances: Covariances,
}

/// Partitioning and mixture-fitting collaborator used during initialization.
pub trait Clusterer: Send + Sync {
    /// Partition `points` into `k` groups and return the group centers.
    fn fit_partition(
        &self,
        points: &[&[f64]],
        k: usize,
        rng: &mut ModelRng,
    ) -> HmmResult<Vec<Vec<f64>>>;

    /// Fit a `k`-component Gaussian mixture with the given covariance structuring.
    fn fit_gaussian_mixture(
        &self,
        points: &[&[f64]],
        k: usize,
        cov_type: CovarianceType,
        rng: &mut ModelRng,
    ) -> HmmResult<MixtureFit>;
}

/// Index of the nearest center (squared Euclidean distance) for every point.
pub fn assign_to_nearest(points: &[&[f64]], centers: &[Vec<f64>]) -> Vec<usize> {
    points
        .iter()
        .map(|p| {
            let mut best = 0;
            let mut min_dist = f64::INFINITY;
            for (j, c) in centers.iter().enumerate() {
                let dist = squared_distance(p, c);
                if dist < min_dist {
                    min_dist = dist;
                    best = j;
                }
            }
            best
        })
        .collect()
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// K-means partitioner and k-means-seeded Gaussian mixture fitter.
#[derive(Debug, Clone)]
pub struct KMeansClusterer {
    /// Maximum Lloyd iterations
    pub max_iterations: usize,
    /// Stop when no center moves further than this
    pub tolerance: f64,
    /// Maximum EM iterations for the mixture fit
    pub mixture_iterations: usize,
    /// Stop the mixture fit when the mean log-likelihood gains less than this
    pub mixture_tolerance: f64,
    /// Added to covariance diagonals in the mixture fit
    pub reg_covar: f64,
}

impl Default for KMeansClusterer {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            tolerance: 1e-6,
            mixture_iterations: 100,
            mixture_tolerance: 1e-3,
            reg_covar: 1e-6,
        }
    }
}

impl KMeansClusterer {
    /// Choose initial centers with the k-means++ rule.
    fn initialize_centroids_plus_plus(
        points: &[&[f64]],
        k: usize,
        rng: &mut ModelRng,
    ) -> Vec<Vec<f64>> {
        let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
        centroids.push(points[rng.usize(0..points.len())].to_vec());

        for _ in 1..k {
            let distances: Vec<f64> = points
                .iter()
                .map(|p| {
                    centroids
                        .iter()
                        .map(|c| squared_distance(p, c))
                        .fold(f64::INFINITY, f64::min)
                })
                .collect();
            let total: f64 = distances.iter().sum();

            // All points already coincide with a center.
            if total <= 0.0 {
                centroids.push(points[rng.usize(0..points.len())].to_vec());
                continue;
            }

            let target = rng.f64() * total;
            let mut cumulative = 0.0;
            let mut chosen = points.len() - 1;
            for (i, &d) in distances.iter().enumerate() {
                cumulative += d;
                if cumulative >= target && d > 0.0 {
                    chosen = i;
                    break;
                }
            }
            centroids.push(points[chosen].to_vec());
        }

        centroids
    }

    fn validate_points(points: &[&[f64]], k: usize) -> HmmResult<usize> {
        if k == 0 {
            return Err(HmmError::InvalidParameter {
                parameter: "n_clusters".to_string(),
                value: 0.0,
                constraint: "at least 1".to_string(),
            });
        }
        if points.len() < k {
            return Err(HmmError::InsufficientData {
                required: k,
                actual: points.len(),
            });
        }
        let dim = points[0].len();
        if let Some(i) = points.iter().position(|p| p.len() != dim) {
            return Err(HmmError::ShapeMismatch {
                what: format!("point {}", i),
                expected: dim.to_string(),
                actual: points[i].len().to_string(),
            });
        }
        Ok(dim)
    }

    /// Mixture M-step from soft responsibilities `resp[n][k]`.
    fn mixture_m_step(
        &self,
        points: &[&[f64]],
        resp: &[Vec<f64>],
        k: usize,
        dim: usize,
        cov_type: CovarianceType,
    ) -> MixtureFit {
        let n = points.len() as f64;
        let mut nk = vec![10.0 * f64::EPSILON; k];
        let mut means = vec![vec![0.0; dim]; k];
        for (p, r) in points.iter().zip(resp.iter()) {
            for c in 0..k {
                nk[c] += r[c];
                for d in 0..dim {
                    means[c][d] += r[c] * p[d];
                }
            }
        }
        for c in 0..k {
            means[c].iter_mut().for_each(|m| *m /= nk[c]);
        }

        let mut scatter = vec![DMatrix::<f64>::zeros(dim, dim); k];
        for (p, r) in points.iter().zip(resp.iter()) {
            for c in 0..k {
                for a in 0..dim {
                    let da = p[a] - means[c][a];
                    for b in a..dim {
                        scatter[c][(a, b)] += r[c] * da * (p[b] - means[c][b]);
                    }
                }
            }
        }
        for s in scatter.iter_mut() {
            for a in 0..dim {
                for b in a + 1..dim {
                    s[(b, a)] = s[(a, b)];
                }
            }
        }

        let reg = DMatrix::<f64>::identity(dim, dim) * self.reg_covar;
        let covariances = match cov_type {
            CovarianceType::Full => Covariances::Full(
                scatter
                    .iter()
                    .zip(nk.iter())
                    .map(|(s, &w)| s / w + &reg)
                    .collect(),
            ),
            CovarianceType::Tied => {
                let pooled = scatter
                    .iter()
                    .fold(DMatrix::<f64>::zeros(dim, dim), |acc, s| acc + s);
                Covariances::Tied(pooled / n + &reg)
            }
            CovarianceType::Diag => Covariances::Diag(
                scatter
                    .iter()
                    .zip(nk.iter())
                    .map(|(s, &w)| (0..dim).map(|d| s[(d, d)] / w + self.reg_covar).collect())
                    .collect(),
            ),
            CovarianceType::Spherical => Covariances::Spherical(
                scatter
                    .iter()
                    .zip(nk.iter())
                    .map(|(s, &w)| s.diagonal().sum() / (w * dim as f64) + self.reg_covar)
                    .collect(),
            ),
        };

        MixtureFit {
            weights: nk.iter().map(|w| w / n).collect(),
            means,
            covariances,
        }
    }

    /// Mixture E-step: responsibilities and the mean log-likelihood.
    fn mixture_e_step(points: &[&[f64]], fit: &MixtureFit) -> HmmResult<(Vec<Vec<f64>>, f64)> {
        let prepared = fit
            .means
            .iter()
            .enumerate()
            .map(|(c, m)| PreparedGaussian::from_covariances(m, &fit.covariances, c))
            .collect::<HmmResult<Vec<_>>>()?;
        let log_weights: Vec<f64> = fit.weights.iter().map(|w| w.ln()).collect();

        let mut total = 0.0;
        let mut resp = Vec::with_capacity(points.len());
        for p in points {
            let weighted: Vec<f64> = prepared
                .iter()
                .zip(log_weights.iter())
                .map(|(g, lw)| g.log_pdf(p) + lw)
                .collect();
            let norm = logsumexp(&weighted);
            total += norm;
            resp.push(weighted.iter().map(|w| (w - norm).exp()).collect());
        }
        Ok((resp, total / points.len() as f64))
    }
}

impl Clusterer for KMeansClusterer {
    fn fit_partition(
        &self,
        points: &[&[f64]],
        k: usize,
        rng: &mut ModelRng,
    ) -> HmmResult<Vec<Vec<f64>>> {
        let dim = Self::validate_points(points, k)?;
        let mut centroids = Self::initialize_centroids_plus_plus(points, k, rng);

        for _iteration in 0..self.max_iterations {
            let assignments = assign_to_nearest(points, &centroids);

            let mut new_centroids = vec![vec![0.0; dim]; k];
            let mut counts = vec![0usize; k];
            for (p, &c) in points.iter().zip(assignments.iter()) {
                for d in 0..dim {
                    new_centroids[c][d] += p[d];
                }
                counts[c] += 1;
            }

            let mut max_change = 0.0f64;
            for c in 0..k {
                if counts[c] > 0 {
                    new_centroids[c].iter_mut().for_each(|x| *x /= counts[c] as f64);
                    max_change = max_change.max(squared_distance(&new_centroids[c], &centroids[c]).sqrt());
                } else {
                    // Empty clusters keep their previous center.
                    new_centroids[c] = centroids[c].clone();
                }
            }

            centroids = new_centroids;
            if max_change < self.tolerance {
                break;
            }
        }

        Ok(centroids)
    }

    fn fit_gaussian_mixture(
        &self,
        points: &[&[f64]],
        k: usize,
        cov_type: CovarianceType,
        rng: &mut ModelRng,
    ) -> HmmResult<MixtureFit> {
        let dim = Self::validate_points(points, k)?;
        let centers = self.fit_partition(points, k, rng)?;
        let labels = assign_to_nearest(points, &centers);

        let hard: Vec<Vec<f64>> = labels
            .iter()
            .map(|&l| {
                let mut r = vec![0.0; k];
                r[l] = 1.0;
                r
            })
            .collect();
        let mut fit = self.mixture_m_step(points, &hard, k, dim, cov_type);

        let mut previous = f64::NEG_INFINITY;
        for iteration in 0..self.mixture_iterations {
            let (resp, mean_ll) = Self::mixture_e_step(points, &fit)?;
            fit = self.mixture_m_step(points, &resp, k, dim, cov_type);
            if (mean_ll - previous).abs() < self.mixture_tolerance {
                log::debug!(
                    "Gaussian mixture fit converged after {} iterations (mean log-likelihood {:.6})",
                    iteration + 1,
                    mean_ll
                );
                break;
            }
            previous = mean_ll;
        }

        Ok(fit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn two_blobs() -> Vec<Vec<f64>> {
        let mut rng = ModelRng::with_seed(17);
        let mut pts = Vec::new();
        for i in 0..60 {
            let center = if i % 2 == 0 { 0.0 } else { 8.0 };
            pts.push(vec![
                center + 0.3 * rng.standard_normal(),
                center + 0.3 * rng.standard_normal(),
            ]);
        }
        pts
    }

    #[test]
    fn test_kmeans_finds_separated_centers() {
        let pts = two_blobs();
        let refs: Vec<&[f64]> = pts.iter().map(|p| p.as_slice()).collect();
        let mut centers = KMeansClusterer::default()
            .fit_partition(&refs, 2, &mut ModelRng::with_seed(3))
            .unwrap();
        centers.sort_by(|a, b| a[0].total_cmp(&b[0]));
        assert_approx_eq!(centers[0][0], 0.0, 0.3);
        assert_approx_eq!(centers[1][1], 8.0, 0.3);
    }

    #[test]
    fn test_kmeans_requires_enough_points() {
        let pts = [vec![1.0]];
        let refs: Vec<&[f64]> = pts.iter().map(|p| p.as_slice()).collect();
        match KMeansClusterer::default().fit_partition(&refs, 2, &mut ModelRng::with_seed(1)) {
            Err(HmmError::InsufficientData { required, actual }) => {
                assert_eq!(required, 2);
                assert_eq!(actual, 1);
            }
            other => panic!("Expected InsufficientData, got {:?}", other),
        }
    }

    #[test]
    fn test_identical_points_do_not_break_seeding() {
        let pts = vec![vec![1.0, 1.0]; 5];
        let refs: Vec<&[f64]> = pts.iter().map(|p| p.as_slice()).collect();
        let centers = KMeansClusterer::default()
            .fit_partition(&refs, 3, &mut ModelRng::with_seed(9))
            .unwrap();
        assert_eq!(centers.len(), 3);
        assert!(centers.iter().all(|c| c == &vec![1.0, 1.0]));
    }

    #[test]
    fn test_mixture_fit_for_each_structuring() {
        let pts = two_blobs();
        let refs: Vec<&[f64]> = pts.iter().map(|p| p.as_slice()).collect();
        for cov_type in [
            CovarianceType::Spherical,
            CovarianceType::Diag,
            CovarianceType::Full,
            CovarianceType::Tied,
        ] {
            let fit = KMeansClusterer::default()
                .fit_gaussian_mixture(&refs, 2, cov_type, &mut ModelRng::with_seed(4))
                .unwrap();
            assert_eq!(fit.covariances.covariance_type(), cov_type);
            assert_approx_eq!(fit.weights.iter().sum::<f64>(), 1.0, 1e-9);
            assert!(fit.covariances.validate(2, 2).is_ok());
        }
    }
}
