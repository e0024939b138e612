//! Search phase for the IVF-SQ index.
//!
//! 1. Validate the request (trained, `k >= 1`, `1 <= nprobe <= nlist`, dims).
//! 2. Rank centroids and keep the `nprobe` nearest lists.
//! 3. Scan every probed list with a query-specialised asymmetric scorer,
//!    keeping a bounded best-k selection per list.
//! 4. Merge the per-list selections (the reduction is order independent).
//! 5. Emit `k` slots per query, best first, padded with sentinels.
//!
//! Queries of a batch are answered in parallel on the context's pool.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{IvfSqError, Result};
use crate::index::distance::{inner_product, subtract_into};
use crate::index::quantization::ScalarQuantizer;
use crate::types::{DistanceMetric, SearchResult, SearchResults, VectorId, SENTINEL_ID};

use super::assign::ListAssigner;
use super::IvfSqIndex;

/// Heap entry ordered so that the *worst* candidate is the maximum.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    id: VectorId,
    distance: f32,
    metric: DistanceMetric,
}

impl Ranked {
    /// `Less` when `self` ranks ahead of `other`; equal distances go to the
    /// lower id.
    fn rank(&self, other: &Self) -> Ordering {
        self.metric
            .rank(self.distance, other.distance)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

/// Fixed-capacity best-of-k selection.
///
/// A candidate enters a full selection only if it is strictly better than
/// the current worst entry under (metric order, lower id). Because that is a
/// total order, pushing the same candidates in any order, or merging
/// partial selections in any grouping, yields the same final set.
#[derive(Debug, Clone)]
pub struct TopK {
    k: usize,
    metric: DistanceMetric,
    heap: BinaryHeap<Ranked>,
}

impl TopK {
    /// The heap grows with the candidates pushed, not with `k`.
    pub fn new(k: usize, metric: DistanceMetric) -> Self {
        Self {
            k,
            metric,
            heap: BinaryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[inline]
    pub fn push(&mut self, id: VectorId, distance: f32) {
        if self.k == 0 {
            return;
        }
        let candidate = Ranked {
            id,
            distance,
            metric: self.metric,
        };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(mut worst) = self.heap.peek_mut() {
            if candidate < *worst {
                *worst = candidate;
            }
        }
    }

    /// Fold another selection into this one.
    pub fn merge(&mut self, other: TopK) {
        for c in other.heap {
            self.push(c.id, c.distance);
        }
    }

    /// Kept candidates, best first.
    pub fn into_sorted(self) -> Vec<SearchResult> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| SearchResult {
                id: c.id,
                distance: c.distance,
            })
            .collect()
    }
}

/// Answer a flat batch of queries against `index`.
pub fn search_ivf_sq(
    index: &IvfSqIndex,
    queries: &[f32],
    k: usize,
    nprobe: usize,
) -> Result<SearchResults> {
    let (centroids, quantizer) = match (index.is_trained(), index.quantizer.as_ref()) {
        (true, Some(q)) => (index.centroids.as_slice(), q),
        _ => return Err(IvfSqError::NotTrained),
    };
    if k == 0 {
        return Err(IvfSqError::InvalidArgument("k must be >= 1".into()));
    }
    if nprobe == 0 || nprobe > index.nlist {
        return Err(IvfSqError::InvalidArgument(format!(
            "nprobe must be in 1..={}, got {nprobe}",
            index.nlist
        )));
    }
    if queries.len() % index.dims != 0 {
        return Err(IvfSqError::DimensionMismatch {
            expected: index.dims,
            actual: queries.len(),
        });
    }
    if queries.iter().any(|v| !v.is_finite()) {
        return Err(IvfSqError::InvalidArgument(
            "queries must not contain NaN or infinite values".into(),
        ));
    }

    let nq = queries.len() / index.dims;
    let slots = nq.checked_mul(k).ok_or_else(|| {
        IvfSqError::InvalidArgument(format!("{nq} queries x k {k} overflows the result size"))
    })?;
    let mut ids: Vec<VectorId> = Vec::new();
    let mut distances: Vec<f32> = Vec::new();
    if ids.try_reserve_exact(slots).is_err() || distances.try_reserve_exact(slots).is_err() {
        return Err(IvfSqError::OutOfMemory {
            requested: slots.saturating_mul(
                std::mem::size_of::<VectorId>() + std::mem::size_of::<f32>(),
            ),
            available: index.resources.budget().available(),
        });
    }

    let start = Instant::now();
    let metric = index.metric;
    let assigner = ListAssigner::new(centroids, index.dims, metric);
    let scan = ListScan {
        index,
        quantizer,
        assigner,
    };

    let per_query: Vec<Vec<SearchResult>> = index.resources.install(|| {
        queries
            .par_chunks_exact(index.dims)
            .map(|q| scan.search_one(q, k, nprobe))
            .collect()
    });

    for hits in per_query {
        let found = hits.len();
        for hit in hits {
            ids.push(hit.id);
            distances.push(hit.distance);
        }
        for _ in found..k {
            ids.push(SENTINEL_ID);
            distances.push(metric.sentinel_distance());
        }
    }

    let elapsed = start.elapsed();
    crate::metrics::SEARCH_DURATION.observe(elapsed.as_secs_f64());
    crate::metrics::QUERIES_TOTAL
        .with_label_values(&[&metric.to_string()])
        .inc_by(nq as u64);
    debug!(nq, k, nprobe, elapsed_us = elapsed.as_micros() as u64, "search complete");

    Ok(SearchResults { k, ids, distances })
}

struct ListScan<'a> {
    index: &'a IvfSqIndex,
    quantizer: &'a ScalarQuantizer,
    assigner: ListAssigner<'a>,
}

impl ListScan<'_> {
    fn search_one(&self, query: &[f32], k: usize, nprobe: usize) -> Vec<SearchResult> {
        let probes = self.assigner.assign_probe(query, nprobe);
        let metric = self.index.metric;
        let by_residual = self.index.codec.by_residual;

        // Without residuals one scorer serves every list; inner product with
        // residuals also shares it and adds <q, centroid> per list.
        let shared = (!by_residual || metric == DistanceMetric::InnerProduct)
            .then(|| self.quantizer.scorer(query, metric));
        let mut residual = vec![0.0f32; query.len()];

        // No list can yield more than the index holds.
        let kept = k.min(self.index.total_count());
        let mut best = TopK::new(kept, metric);
        for list_id in probes {
            let lists = &self.index.lists;
            if lists.list_length(list_id) == 0 {
                continue;
            }
            let mut partial = TopK::new(kept, metric);
            match &shared {
                Some(scorer) => {
                    let offset = if by_residual {
                        inner_product(query, self.assigner.centroid(list_id))
                    } else {
                        0.0
                    };
                    for (id, code) in lists.iter_list(list_id) {
                        partial.push(id, offset + scorer.distance(code));
                    }
                }
                None => {
                    subtract_into(query, self.assigner.centroid(list_id), &mut residual);
                    let scorer = self.quantizer.scorer(&residual, metric);
                    for (id, code) in lists.iter_list(list_id) {
                        partial.push(id, scorer.distance(code));
                    }
                }
            }
            best.merge(partial);
        }
        best.into_sorted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(results: &[SearchResult]) -> Vec<VectorId> {
        results.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_topk_keeps_best_l2() {
        let mut top = TopK::new(3, DistanceMetric::L2);
        for (id, d) in [(1, 5.0), (2, 1.0), (3, 4.0), (4, 0.5), (5, 9.0)] {
            top.push(id, d);
        }
        assert_eq!(ids(&top.into_sorted()), vec![4, 2, 3]);
    }

    #[test]
    fn test_topk_keeps_best_inner_product() {
        let mut top = TopK::new(2, DistanceMetric::InnerProduct);
        for (id, d) in [(1, 5.0), (2, 1.0), (3, 7.0)] {
            top.push(id, d);
        }
        assert_eq!(ids(&top.into_sorted()), vec![3, 1]);
    }

    #[test]
    fn test_topk_ties_prefer_lower_id() {
        let mut top = TopK::new(2, DistanceMetric::L2);
        for id in [9, 4, 7, 1] {
            top.push(id, 1.0);
        }
        assert_eq!(ids(&top.into_sorted()), vec![1, 4]);
    }

    #[test]
    fn test_topk_merge_is_order_independent() {
        let items: Vec<(VectorId, f32)> =
            (0..40).map(|i| (i, ((i * 17) % 11) as f32)).collect();

        let mut whole = TopK::new(5, DistanceMetric::L2);
        for &(id, d) in &items {
            whole.push(id, d);
        }

        let mut left = TopK::new(5, DistanceMetric::L2);
        let mut right = TopK::new(5, DistanceMetric::L2);
        for &(id, d) in items.iter().rev() {
            if id % 2 == 0 {
                left.push(id, d);
            } else {
                right.push(id, d);
            }
        }
        right.merge(left);

        assert_eq!(whole.into_sorted(), right.into_sorted());
    }

    #[test]
    fn test_topk_huge_k_does_not_preallocate() {
        let mut top = TopK::new(usize::MAX / 2, DistanceMetric::L2);
        top.push(3, 2.0);
        top.push(1, 1.0);
        assert_eq!(ids(&top.into_sorted()), vec![1, 3]);
    }

    #[test]
    fn test_topk_fewer_than_k() {
        let mut top = TopK::new(4, DistanceMetric::L2);
        top.push(1, 1.0);
        assert_eq!(top.len(), 1);
        assert_eq!(top.into_sorted().len(), 1);
    }
}
