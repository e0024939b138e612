//! Full-precision distance functions.
//!
//! Used for coarse assignment (query/vector to centroid), k-means training
//! and as the exact reference when validating quantized scores.

use crate::types::DistanceMetric;

/// Dispatch to the appropriate distance function based on the metric.
///
/// Returns squared L2 for [`DistanceMetric::L2`] (lower is closer) and the raw
/// inner product for [`DistanceMetric::InnerProduct`] (higher is closer). Use
/// [`DistanceMetric::rank`] to order scores.
#[inline]
pub fn compute_distance(a: &[f32], b: &[f32], metric: DistanceMetric) -> f32 {
    match metric {
        DistanceMetric::L2 => l2_squared(a, b),
        DistanceMetric::InnerProduct => inner_product(a, b),
    }
}

/// Squared Euclidean distance: `sum((a_i - b_i)^2)`.
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum()
}

/// Inner product: `sum(a_i * b_i)`.
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");
    a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum()
}

/// `out = a - b`, element-wise.
#[inline]
pub fn subtract_into(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x - y;
    }
}
