use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Caller-assigned identifier of a stored vector.
pub type VectorId = i64;

/// Id emitted in result slots that have no candidate.
pub const SENTINEL_ID: VectorId = -1;

/// Distance metric for vector comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean distance, smaller is closer.
    #[default]
    L2,
    /// Inner product, larger is closer.
    InnerProduct,
}

impl DistanceMetric {
    /// Compare two scores so that `Ordering::Less` means `a` ranks ahead of `b`.
    #[inline]
    pub fn rank(self, a: f32, b: f32) -> Ordering {
        match self {
            DistanceMetric::L2 => a.total_cmp(&b),
            DistanceMetric::InnerProduct => b.total_cmp(&a),
        }
    }

    /// True when `a` is strictly better than `b` under this metric.
    #[inline]
    pub fn is_better(self, a: f32, b: f32) -> bool {
        self.rank(a, b) == Ordering::Less
    }

    /// Distance reported for padded result slots.
    pub fn sentinel_distance(self) -> f32 {
        match self {
            DistanceMetric::L2 => f32::MAX,
            DistanceMetric::InnerProduct => -f32::MAX,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            DistanceMetric::L2 => 0,
            DistanceMetric::InnerProduct => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DistanceMetric::L2),
            1 => Some(DistanceMetric::InnerProduct),
            _ => None,
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceMetric::L2 => write!(f, "l2"),
            DistanceMetric::InnerProduct => write!(f, "inner_product"),
        }
    }
}

/// A single (id, distance) hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: VectorId,
    pub distance: f32,
}

/// Row-major `nq × k` output of a batched search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub k: usize,
    pub ids: Vec<VectorId>,
    pub distances: Vec<f32>,
}

impl SearchResults {
    /// Number of queries answered.
    pub fn num_queries(&self) -> usize {
        if self.k == 0 {
            0
        } else {
            self.ids.len() / self.k
        }
    }

    /// Ids for query `q`, best first.
    pub fn ids_for(&self, q: usize) -> &[VectorId] {
        &self.ids[q * self.k..(q + 1) * self.k]
    }

    /// Distances for query `q`, best first.
    pub fn distances_for(&self, q: usize) -> &[f32] {
        &self.distances[q * self.k..(q + 1) * self.k]
    }

    /// Non-sentinel hits for query `q`.
    pub fn hits(&self, q: usize) -> Vec<SearchResult> {
        self.ids_for(q)
            .iter()
            .zip(self.distances_for(q))
            .filter(|(&id, _)| id != SENTINEL_ID)
            .map(|(&id, &distance)| SearchResult { id, distance })
            .collect()
    }
}

/// Point-in-time description of an index, used for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSummary {
    pub dims: usize,
    pub nlist: usize,
    pub nprobe: usize,
    pub metric: DistanceMetric,
    pub trained: bool,
    pub total_count: usize,
    pub code_size: usize,
    pub list_lengths: Vec<usize>,
    pub reserved_bytes: usize,
    pub used_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_direction() {
        assert!(DistanceMetric::L2.is_better(1.0, 2.0));
        assert!(!DistanceMetric::L2.is_better(2.0, 2.0));
        assert!(DistanceMetric::InnerProduct.is_better(2.0, 1.0));
        assert!(!DistanceMetric::InnerProduct.is_better(1.0, 1.0));
    }

    #[test]
    fn test_metric_serde() {
        let json = serde_json::to_string(&DistanceMetric::InnerProduct).unwrap();
        assert_eq!(json, "\"inner_product\"");
        let m: DistanceMetric = serde_json::from_str("\"l2\"").unwrap();
        assert_eq!(m, DistanceMetric::L2);
    }

    #[test]
    fn test_hits_skip_sentinels() {
        let results = SearchResults {
            k: 3,
            ids: vec![4, SENTINEL_ID, SENTINEL_ID],
            distances: vec![0.5, f32::MAX, f32::MAX],
        };
        assert_eq!(results.num_queries(), 1);
        assert_eq!(results.hits(0), vec![SearchResult { id: 4, distance: 0.5 }]);
    }
}
