//! Centroid training for the coarse quantizer.
//!
//! [`CentroidTrainer`] is the seam for plugging in any clustering routine;
//! [`KMeansTrainer`] is the default: k-means++ seeding followed by Lloyd's
//! iterations under squared L2. Centroid storage is pre-allocated and reused
//! across iterations to avoid per-iteration heap churn.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::error::{IvfSqError, Result};
use crate::index::distance::l2_squared;
use crate::resources::Resources;

/// Produces `nlist` centroids from a flat training sample.
pub trait CentroidTrainer: Send + Sync + std::fmt::Debug {
    /// Returns `nlist * dim` floats, centroid `i` at `[i * dim..(i + 1) * dim]`.
    fn train_centroids(
        &self,
        vectors: &[f32],
        dim: usize,
        nlist: usize,
        res: &Resources,
    ) -> Result<Vec<f32>>;
}

/// k-means++ / Lloyd trainer with a fixed seed for reproducible centroids.
#[derive(Debug, Clone)]
pub struct KMeansTrainer {
    pub max_iters: usize,
    pub epsilon: f64,
    pub seed: u64,
}

impl KMeansTrainer {
    pub fn new(max_iters: usize, epsilon: f64, seed: u64) -> Self {
        Self {
            max_iters,
            epsilon,
            seed,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.kmeans_max_iterations,
            config.kmeans_convergence_epsilon,
            config.seed,
        )
    }
}

impl Default for KMeansTrainer {
    fn default() -> Self {
        Self::from_config(&TrainingConfig::default())
    }
}

impl CentroidTrainer for KMeansTrainer {
    fn train_centroids(
        &self,
        vectors: &[f32],
        dim: usize,
        nlist: usize,
        res: &Resources,
    ) -> Result<Vec<f32>> {
        train_kmeans(vectors, dim, nlist, self.max_iters, self.epsilon, self.seed, res)
    }
}

/// Train `k` centroids from a flat sample of `n * dim` floats.
///
/// Requires `n >= k`. Empty clusters keep their previous centroid.
pub fn train_kmeans(
    vectors: &[f32],
    dim: usize,
    k: usize,
    max_iters: usize,
    epsilon: f64,
    seed: u64,
    res: &Resources,
) -> Result<Vec<f32>> {
    if dim == 0 || vectors.len() % dim != 0 {
        return Err(IvfSqError::DimensionMismatch {
            expected: dim,
            actual: vectors.len(),
        });
    }
    if k == 0 {
        return Err(IvfSqError::InvalidArgument("k must be > 0".into()));
    }
    let n = vectors.len() / dim;
    if n < k {
        return Err(IvfSqError::InsufficientTrainingData {
            required: k,
            actual: n,
        });
    }

    info!(n, k, dim, "starting k-means++ initialization");

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = kmeans_pp_init(vectors, dim, k, &mut rng);

    let mut assignments = vec![0usize; n];
    let mut counts = vec![0usize; k];
    // Scratch buffer for accumulating new centroids.
    let mut new_centroids = vec![0.0f32; k * dim];

    for iter in 0..max_iters {
        // Assignment step: nearest centroid per vector, ties to the lowest index.
        res.install(|| {
            assignments
                .par_iter_mut()
                .zip(vectors.par_chunks_exact(dim))
                .for_each(|(slot, vec)| *slot = nearest(&centroids, dim, vec));
        });

        counts.fill(0);
        new_centroids.fill(0.0);
        for (vec, &c) in vectors.chunks_exact(dim).zip(assignments.iter()) {
            counts[c] += 1;
            for (acc, &v) in new_centroids[c * dim..(c + 1) * dim].iter_mut().zip(vec) {
                *acc += v;
            }
        }

        let mut max_shift: f64 = 0.0;
        for c in 0..k {
            let new_centroid = &mut new_centroids[c * dim..(c + 1) * dim];
            let old_centroid = &centroids[c * dim..(c + 1) * dim];
            if counts[c] == 0 {
                // Empty cluster: keep old centroid (degenerate but safe).
                new_centroid.copy_from_slice(old_centroid);
                continue;
            }
            let inv = 1.0 / counts[c] as f32;
            for val in new_centroid.iter_mut() {
                *val *= inv;
            }
            let shift = l2_squared(old_centroid, new_centroid) as f64;
            if shift > max_shift {
                max_shift = shift;
            }
        }

        std::mem::swap(&mut centroids, &mut new_centroids);

        debug!(iter = iter + 1, max_shift, epsilon, "k-means iteration complete");

        if max_shift < epsilon {
            info!(iterations = iter + 1, max_shift, "k-means converged");
            return Ok(centroids);
        }
    }

    // Unconverged centroids are still usable for partitioning.
    warn!(max_iters, "k-means did not converge within iteration limit, using current centroids");
    Ok(centroids)
}

fn nearest(centroids: &[f32], dim: usize, vec: &[f32]) -> usize {
    let mut best_dist = f32::INFINITY;
    let mut best_idx = 0usize;
    for (c, centroid) in centroids.chunks_exact(dim).enumerate() {
        let d = l2_squared(vec, centroid);
        if d < best_dist {
            best_dist = d;
            best_idx = c;
        }
    }
    best_idx
}

/// k-means++ seeding: pick initial centroids with probability proportional
/// to squared distance from the nearest already-chosen centroid.
fn kmeans_pp_init(vectors: &[f32], dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = vectors.len() / dim;
    let mut centroids: Vec<f32> = Vec::with_capacity(k * dim);

    let first_idx = rng.gen_range(0..n);
    centroids.extend_from_slice(&vectors[first_idx * dim..(first_idx + 1) * dim]);

    // Distance from each point to the nearest centroid chosen so far.
    let mut min_dists = vec![f32::MAX; n];

    for c in 1..k {
        let last = &centroids[(c - 1) * dim..c * dim];
        let mut total_dist: f64 = 0.0;
        for (i, vec) in vectors.chunks_exact(dim).enumerate() {
            let d = l2_squared(vec, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total_dist += min_dists[i] as f64;
        }

        let chosen = if total_dist <= 0.0 {
            // Every point coincides with a chosen centroid; fall back to a
            // uniform pick so that exactly k centroids are produced.
            warn!(chosen = c, k, "all remaining distances are zero, picking uniformly");
            rng.gen_range(0..n)
        } else {
            let threshold = rng.gen::<f64>() * total_dist;
            let mut cumulative: f64 = 0.0;
            let mut chosen = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        centroids.extend_from_slice(&vectors[chosen * dim..(chosen + 1) * dim]);
        debug!(centroid = c, chosen_idx = chosen, "k-means++ selected centroid");
    }

    debug_assert_eq!(centroids.len(), k * dim);
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_single_point() {
        let res = Resources::unbounded();
        let centroids = train_kmeans(&[1.0, 2.0, 3.0], 3, 1, 10, 1e-4, 7, &res).unwrap();
        assert_eq!(centroids, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_train_k_gt_n() {
        let res = Resources::unbounded();
        let result = train_kmeans(&[1.0, 0.0, 0.0, 1.0], 2, 5, 10, 1e-4, 7, &res);
        assert!(matches!(
            result,
            Err(IvfSqError::InsufficientTrainingData {
                required: 5,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_train_empty() {
        let res = Resources::unbounded();
        assert!(train_kmeans(&[], 3, 2, 10, 1e-4, 7, &res).is_err());
    }

    #[test]
    fn test_train_converges() {
        let res = Resources::unbounded();
        let mut data = Vec::new();
        for i in 0..50 {
            data.extend_from_slice(&[i as f32 * 0.01, 0.0]);
        }
        for i in 0..50 {
            data.extend_from_slice(&[10.0 + i as f32 * 0.01, 0.0]);
        }
        let centroids = train_kmeans(&data, 2, 2, 100, 1e-6, 7, &res).unwrap();

        let c0 = centroids[0].min(centroids[2]);
        let c1 = centroids[0].max(centroids[2]);
        assert!(c0 < 1.0, "lower centroid should be near 0, got {c0}");
        assert!(c1 > 9.0, "upper centroid should be near 10, got {c1}");
    }

    #[test]
    fn test_seed_is_deterministic() {
        let res = Resources::unbounded();
        let data: Vec<f32> = (0..200).map(|i| ((i * 37) % 101) as f32 / 10.0).collect();
        let a = train_kmeans(&data, 4, 5, 20, 1e-6, 99, &res).unwrap();
        let b = train_kmeans(&data, 4, 5, 20, 1e-6, 99, &res).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_points_still_yield_k_centroids() {
        let res = Resources::unbounded();
        let data = vec![1.0f32; 3 * 10];
        let centroids = train_kmeans(&data, 3, 4, 5, 1e-6, 1, &res).unwrap();
        assert_eq!(centroids.len(), 12);
    }
}
