//! Dense vector kernels.
//!
//! When the `innr` feature is enabled (default), the reductions (`dot`, `norm`,
//! `l2_distance_squared`) come from the `innr` crate's SIMD implementations.
//! Otherwise they fall back to portable code. The precomputed table builder and the
//! LUT construction in the scan path are the hot callers.
//!
//! ```rust
//! use ivfpq_share::simd::{dot, l2_distance_squared, norm};
//!
//! let a = [1.0_f32, 0.0, 0.0];
//! let b = [0.707, 0.707, 0.0];
//!
//! let d = dot(&a, &b);
//! let l2 = l2_distance_squared(&a, &b);
//! let n = norm(&a);
//! ```

#[cfg(feature = "innr")]
pub use innr::{dot, l2_distance_squared, norm};

#[cfg(not(feature = "innr"))]
mod fallback {
    //! Portable fallback implementations when innr is not available.

    /// Dot product of two vectors (portable implementation).
    #[inline]
    #[must_use]
    pub fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    /// L2 norm of a vector.
    #[inline]
    #[must_use]
    pub fn norm(v: &[f32]) -> f32 {
        dot(v, v).sqrt()
    }

    /// Squared L2 distance between two vectors.
    #[inline]
    #[must_use]
    pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum()
    }
}

#[cfg(not(feature = "innr"))]
pub use fallback::*;

// ─────────────────────────────────────────────────────────────────────────────
// Element-wise operations (always local, innr only provides reductions)
// ─────────────────────────────────────────────────────────────────────────────

/// Squared L2 norm of a vector.
#[inline]
#[must_use]
pub fn norm_squared(v: &[f32]) -> f32 {
    dot(v, v)
}

/// `out[i] = a[i] + bf * b[i]`.
///
/// All three slices must have the same length.
#[inline]
pub fn madd(a: &[f32], bf: f32, b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x + bf * y;
    }
}

/// `out[i] = a[i] - b[i]`.
#[inline]
pub fn sub(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x - y;
    }
}
