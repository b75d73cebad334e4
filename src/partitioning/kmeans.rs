//! k-means clustering implementation.
//!
//! Used to train the IVF coarse quantizer and every PQ sub-codebook.

use crate::simd;
use crate::RetrieveError;

/// Default number of Lloyd iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 25;

/// k-means clustering under squared L2.
///
/// Uses k-means++ initialization followed by Lloyd refinement. Centroids are stored
/// flat (`k x dimension`).
#[derive(Debug, Clone)]
pub struct KMeans {
    centroids: Vec<f32>,
    dimension: usize,
    k: usize,
    max_iterations: usize,
    seed: Option<u64>,
}

impl KMeans {
    /// Create new k-means with k clusters.
    pub fn new(dimension: usize, k: usize) -> Result<Self, RetrieveError> {
        if dimension == 0 || k == 0 {
            return Err(RetrieveError::InvalidParameter(
                "Dimension and k must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            seed: None,
        })
    }

    /// Configure a deterministic seed for k-means++ initialization.
    ///
    /// When set, repeated `fit(...)` calls on the same inputs produce identical results.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Cap the number of Lloyd iterations.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Train k-means on vectors.
    pub fn fit(&mut self, vectors: &[f32], num_vectors: usize) -> Result<(), RetrieveError> {
        if vectors.len() < num_vectors * self.dimension {
            return Err(RetrieveError::InvalidParameter(
                "Insufficient vectors".to_string(),
            ));
        }
        if num_vectors < self.k {
            return Err(RetrieveError::InvalidParameter(format!(
                "need at least {} training vectors, got {num_vectors}",
                self.k
            )));
        }

        self.centroids = self.kmeans_plus_plus(vectors, num_vectors);

        for _iteration in 0..self.max_iterations {
            let assignments = self.assign_clusters(vectors, num_vectors);
            let new_centroids = self.update_centroids(vectors, num_vectors, &assignments);

            let converged = self
                .centroids
                .chunks_exact(self.dimension)
                .zip(new_centroids.chunks_exact(self.dimension))
                .all(|(old, new)| simd::l2_distance_squared(old, new) <= 1e-12);

            self.centroids = new_centroids;
            if converged {
                break;
            }
        }

        Ok(())
    }

    /// k-means++ initialization.
    fn kmeans_plus_plus(&self, vectors: &[f32], num_vectors: usize) -> Vec<f32> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        // Use an explicit seed when configured; otherwise derive one from entropy.
        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut centroids = Vec::with_capacity(self.k * self.dimension);

        let first_idx = rng.random_range(0..num_vectors);
        centroids.extend_from_slice(self.get_vector(vectors, first_idx));

        // Distance from every point to its nearest chosen centroid, updated incrementally.
        let mut min_dists: Vec<f32> = (0..num_vectors)
            .map(|i| simd::l2_distance_squared(self.get_vector(vectors, i), &centroids))
            .collect();

        for _ in 1..self.k {
            let total: f64 = min_dists.iter().map(|&d| d as f64).sum();
            let threshold = rng.random::<f64>() * total;

            let mut chosen = num_vectors - 1;
            let mut cumulative = 0.0;
            for (i, &dist) in min_dists.iter().enumerate() {
                cumulative += dist as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }

            let start = centroids.len();
            centroids.extend_from_slice(self.get_vector(vectors, chosen));
            let newest = &centroids[start..];
            for (i, d) in min_dists.iter_mut().enumerate() {
                let nd = simd::l2_distance_squared(self.get_vector(vectors, i), newest);
                if nd < *d {
                    *d = nd;
                }
            }
        }

        centroids
    }

    /// Assign vectors to nearest clusters.
    pub fn assign_clusters(&self, vectors: &[f32], num_vectors: usize) -> Vec<usize> {
        (0..num_vectors)
            .map(|i| self.nearest(self.get_vector(vectors, i)))
            .collect()
    }

    fn nearest(&self, vec: &[f32]) -> usize {
        let mut best_cluster = 0;
        let mut best_dist = f32::INFINITY;
        for (cluster_idx, centroid) in self.centroids.chunks_exact(self.dimension).enumerate() {
            let dist = simd::l2_distance_squared(vec, centroid);
            if dist < best_dist {
                best_dist = dist;
                best_cluster = cluster_idx;
            }
        }
        best_cluster
    }

    /// Update centroids based on assignments.
    ///
    /// Empty clusters keep their previous centroid.
    fn update_centroids(&self, vectors: &[f32], num_vectors: usize, assignments: &[usize]) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.k * self.dimension];
        let mut counts = vec![0usize; self.k];

        for (i, &cluster) in assignments.iter().enumerate().take(num_vectors) {
            counts[cluster] += 1;
            let sum = &mut sums[cluster * self.dimension..(cluster + 1) * self.dimension];
            for (s, &v) in sum.iter_mut().zip(self.get_vector(vectors, i)) {
                *s += v;
            }
        }

        for (cluster, &count) in counts.iter().enumerate() {
            let range = cluster * self.dimension..(cluster + 1) * self.dimension;
            if count > 0 {
                let inv = 1.0 / count as f32;
                sums[range].iter_mut().for_each(|s| *s *= inv);
            } else {
                sums[range.clone()].copy_from_slice(&self.centroids[range]);
            }
        }

        sums
    }

    /// Get vector from row-major storage.
    fn get_vector<'a>(&self, vectors: &'a [f32], idx: usize) -> &'a [f32] {
        let start = idx * self.dimension;
        let end = start + self.dimension;
        &vectors[start..end]
    }

    /// Get centroids (`k x dimension`, row-major).
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Consume the model and return its centroids.
    pub fn into_centroids(self) -> Vec<f32> {
        self.centroids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn separates_two_blobs() {
        let mut vectors = Vec::new();
        for i in 0..20 {
            let jitter = i as f32 * 0.001;
            vectors.extend_from_slice(&[0.0 + jitter, 0.0]);
            vectors.extend_from_slice(&[10.0 + jitter, 10.0]);
        }

        let mut km = KMeans::new(2, 2).unwrap().with_seed(7);
        km.fit(&vectors, 40).unwrap();
        let a = km.assign_clusters(&vectors, 40);

        for pair in a.chunks_exact(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert!(a.iter().step_by(2).all(|&c| c == a[0]));
    }

    #[test]
    fn rejects_too_few_vectors() {
        let mut km = KMeans::new(2, 4).unwrap();
        assert!(km.fit(&[0.0; 6], 3).is_err());
    }

    proptest! {
        #[test]
        fn prop_kmeans_fit_is_deterministic_given_seed(
            seed in any::<u64>(),
            dimension in 1usize..16,
            num_vectors in 2usize..64,
            k in 1usize..16,
            raw in proptest::collection::vec(-1.0f32..1.0f32, 2usize..(64*16)),
        ) {
            prop_assume!(k <= num_vectors);
            let needed = num_vectors * dimension;
            prop_assume!(raw.len() >= needed);
            let vectors = &raw[..needed];

            let mut km1 = KMeans::new(dimension, k).unwrap().with_seed(seed);
            let mut km2 = KMeans::new(dimension, k).unwrap().with_seed(seed);

            km1.fit(vectors, num_vectors).unwrap();
            km2.fit(vectors, num_vectors).unwrap();

            prop_assert_eq!(km1.centroids(), km2.centroids());
            let a1 = km1.assign_clusters(vectors, num_vectors);
            let a2 = km2.assign_clusters(vectors, num_vectors);
            prop_assert_eq!(a1, a2);
        }
    }
}
