//! Exact nearest-centroid assignment for adds (top-1) and probes (top-nprobe).

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::index::distance::compute_distance;
use crate::resources::Resources;
use crate::types::DistanceMetric;

/// Borrowed view over a trained centroid table.
#[derive(Debug, Clone, Copy)]
pub struct ListAssigner<'a> {
    centroids: &'a [f32],
    dim: usize,
    metric: DistanceMetric,
}

impl<'a> ListAssigner<'a> {
    /// `centroids` is `nlist * dim` floats, row-major.
    pub fn new(centroids: &'a [f32], dim: usize, metric: DistanceMetric) -> Self {
        debug_assert!(dim > 0 && centroids.len() % dim == 0);
        Self {
            centroids,
            dim,
            metric,
        }
    }

    pub fn nlist(&self) -> usize {
        self.centroids.len() / self.dim
    }

    pub fn centroid(&self, list_id: usize) -> &'a [f32] {
        &self.centroids[list_id * self.dim..(list_id + 1) * self.dim]
    }

    /// Nearest list for `vector`; ties go to the lowest list id.
    pub fn assign(&self, vector: &[f32]) -> usize {
        let mut best = 0usize;
        let mut best_score = f32::NAN;
        for (list_id, centroid) in self.centroids.chunks_exact(self.dim).enumerate() {
            let score = compute_distance(vector, centroid, self.metric);
            if list_id == 0 || self.metric.is_better(score, best_score) {
                best = list_id;
                best_score = score;
            }
        }
        best
    }

    /// The `nprobe` nearest lists, nearest first, ties to the lowest list id.
    /// Returns every list when `nprobe >= nlist`.
    pub fn assign_probe(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let metric = self.metric;
        let mut scored: Vec<(usize, f32)> = self
            .centroids
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(list_id, centroid)| (list_id, compute_distance(query, centroid, metric)))
            .collect();

        let by_rank = |a: &(usize, f32), b: &(usize, f32)| -> Ordering {
            metric.rank(a.1, b.1).then(a.0.cmp(&b.0))
        };

        let take = nprobe.min(scored.len());
        if take == 0 {
            return Vec::new();
        }
        if take < scored.len() {
            scored.select_nth_unstable_by(take - 1, by_rank);
            scored.truncate(take);
        }
        scored.sort_unstable_by(by_rank);
        scored.into_iter().map(|(list_id, _)| list_id).collect()
    }

    /// Top-1 assignment for a flat batch of vectors, in input order.
    pub fn assign_batch(&self, vectors: &[f32], res: &Resources) -> Vec<usize> {
        res.install(|| {
            vectors
                .par_chunks_exact(self.dim)
                .map(|v| self.assign(v))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Vec<f32> {
        // Four centroids on the x axis at 0, 1, 2, 3.
        vec![0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0]
    }

    #[test]
    fn test_assign_nearest_l2() {
        let centroids = grid();
        let assigner = ListAssigner::new(&centroids, 2, DistanceMetric::L2);
        assert_eq!(assigner.nlist(), 4);
        assert_eq!(assigner.assign(&[2.2, 0.1]), 2);
        assert_eq!(assigner.assign(&[-5.0, 0.0]), 0);
    }

    #[test]
    fn test_assign_tie_goes_to_lowest() {
        let centroids = grid();
        let assigner = ListAssigner::new(&centroids, 2, DistanceMetric::L2);
        // Equidistant from centroids 1 and 2.
        assert_eq!(assigner.assign(&[1.5, 0.0]), 1);
        assert_eq!(assigner.assign_probe(&[1.5, 0.0], 2), vec![1, 2]);
    }

    #[test]
    fn test_assign_inner_product() {
        let centroids = grid();
        let assigner = ListAssigner::new(&centroids, 2, DistanceMetric::InnerProduct);
        // Largest inner product wins: the farthest centroid along +x.
        assert_eq!(assigner.assign(&[1.0, 0.0]), 3);
        assert_eq!(assigner.assign_probe(&[1.0, 0.0], 3), vec![3, 2, 1]);
    }

    #[test]
    fn test_probe_order_and_clamp() {
        let centroids = grid();
        let assigner = ListAssigner::new(&centroids, 2, DistanceMetric::L2);
        assert_eq!(assigner.assign_probe(&[2.9, 0.0], 3), vec![3, 2, 1]);
        assert_eq!(assigner.assign_probe(&[2.9, 0.0], 10), vec![3, 2, 1, 0]);
        assert!(assigner.assign_probe(&[2.9, 0.0], 0).is_empty());
    }

    #[test]
    fn test_assign_batch_matches_single() {
        let centroids = grid();
        let assigner = ListAssigner::new(&centroids, 2, DistanceMetric::L2);
        let res = Resources::unbounded();
        let vectors = [0.1, 0.0, 2.6, 0.0, 1.4, 0.0];
        assert_eq!(assigner.assign_batch(&vectors, &res), vec![0, 3, 1]);
    }
}
