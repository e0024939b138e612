use std::collections::HashSet;

use ivfsq::error::{ErrorKind, IvfSqError};
use ivfsq::index::distance::compute_distance;
use ivfsq::types::{DistanceMetric, SearchResults, VectorId};

/// Exact top-k ids for every query by brute-force scan (ids are row indices).
pub fn exact_top_k(
    base: &[f32],
    queries: &[f32],
    dims: usize,
    k: usize,
    metric: DistanceMetric,
) -> Vec<Vec<VectorId>> {
    queries
        .chunks_exact(dims)
        .map(|q| {
            let mut scored: Vec<(VectorId, f32)> = base
                .chunks_exact(dims)
                .enumerate()
                .map(|(i, v)| (i as VectorId, compute_distance(q, v, metric)))
                .collect();
            scored.sort_by(|a, b| metric.rank(a.1, b.1).then(a.0.cmp(&b.0)));
            scored.into_iter().take(k).map(|(id, _)| id).collect()
        })
        .collect()
}

/// Compute recall@k: fraction of ground truth ids found in the result ids.
pub fn recall_at_k(result_ids: &[VectorId], ground_truth: &[VectorId], k: usize) -> f64 {
    let truth: HashSet<VectorId> = ground_truth.iter().take(k).copied().collect();
    if truth.is_empty() {
        return 1.0;
    }
    let found = result_ids
        .iter()
        .take(k)
        .filter(|id| truth.contains(id))
        .count();
    found as f64 / truth.len() as f64
}

/// Assert that recall@k meets a minimum threshold.
pub fn assert_recall_at_k(
    result_ids: &[VectorId],
    ground_truth: &[VectorId],
    k: usize,
    min_recall: f64,
) {
    let recall = recall_at_k(result_ids, ground_truth, k);
    assert!(
        recall >= min_recall,
        "recall@{k} = {recall:.3}, expected >= {min_recall:.3}. \
         Results: {:?}, Truth: {:?}",
        &result_ids[..k.min(result_ids.len())],
        &ground_truth[..k.min(ground_truth.len())]
    );
}

/// Assert two result sets match id-for-id with distances within `tol`.
pub fn assert_results_match(a: &SearchResults, b: &SearchResults, tol: f32) {
    assert_eq!(a.k, b.k, "k differs");
    assert_eq!(a.ids, b.ids, "ids differ");
    for (i, (x, y)) in a.distances.iter().zip(b.distances.iter()).enumerate() {
        assert!(
            (x - y).abs() <= tol,
            "distance {i} differs: {x} vs {y} (tol {tol})"
        );
    }
}

/// Assert that an operation failed with the given error kind.
pub fn assert_error_kind<T: std::fmt::Debug>(result: Result<T, IvfSqError>, kind: ErrorKind) {
    match result {
        Err(e) if e.kind() == kind => {}
        other => panic!("expected {kind:?} error, got: {other:?}"),
    }
}
