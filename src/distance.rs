//! Distance metrics for dense vectors.
//!
//! IVF-PQ supports two metrics. Both the coarse quantizer and the scan path are
//! metric-aware; only [`MetricType::L2`] admits the additive decomposition that the
//! precomputed table relies on.
//!
//! ## Important nuance
//!
//! [`MetricType::L2`] is the **squared** Euclidean distance (smaller is better).
//! [`MetricType::InnerProduct`] returns the raw inner product, which is a
//! similarity (larger is better). Search results are ordered accordingly.

use crate::simd;
use serde::{Deserialize, Serialize};

/// Metric used by an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    /// Squared Euclidean distance.
    #[default]
    L2,
    /// Inner product (maximum inner product search).
    InnerProduct,
}

impl MetricType {
    /// Score two vectors under this metric.
    ///
    /// If dimensions mismatch, this returns the worst possible score for the metric.
    #[inline]
    #[must_use]
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return self.worst();
        }
        match self {
            MetricType::L2 => simd::l2_distance_squared(a, b),
            MetricType::InnerProduct => simd::dot(a, b),
        }
    }

    /// Whether larger scores are better.
    #[inline]
    #[must_use]
    pub fn is_similarity(self) -> bool {
        matches!(self, MetricType::InnerProduct)
    }

    /// Whether `||x - y_C - y_R||^2` can be split into a per-query term plus a
    /// per-code table lookup.
    #[inline]
    #[must_use]
    pub fn has_residual_decomposition(self) -> bool {
        matches!(self, MetricType::L2)
    }

    /// Map a score to a cost where smaller is always better.
    #[inline]
    #[must_use]
    pub(crate) fn to_cost(self, score: f32) -> f32 {
        if self.is_similarity() {
            -score
        } else {
            score
        }
    }

    #[inline]
    pub(crate) fn worst(self) -> f32 {
        if self.is_similarity() {
            f32::NEG_INFINITY
        } else {
            f32::INFINITY
        }
    }
}
