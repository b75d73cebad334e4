//! Product Quantization (PQ) implementation.

use crate::partitioning::KMeans;
use crate::simd;
use crate::RetrieveError;

use serde::{Deserialize, Serialize};

/// Product Quantizer.
///
/// Decomposes `dimension`-d vectors into `num_subquantizers` subvectors of `dsub`
/// dimensions and quantizes each subvector against its own codebook of
/// `ksub = 2^nbits` centroids under squared L2.
///
/// Centroids are stored flat as `[m][ksub][dsub]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dimension: usize,
    num_subquantizers: usize,
    nbits: usize,
    ksub: usize,
    dsub: usize,
    centroids: Vec<f32>,
}

impl ProductQuantizer {
    /// Create new (untrained) product quantizer.
    pub fn new(
        dimension: usize,
        num_subquantizers: usize,
        nbits: usize,
    ) -> Result<Self, RetrieveError> {
        if dimension == 0 || num_subquantizers == 0 {
            return Err(RetrieveError::InvalidParameter(
                "dimension and num_subquantizers must be greater than 0".to_string(),
            ));
        }
        if !(1..=8).contains(&nbits) {
            return Err(RetrieveError::InvalidParameter(format!(
                "nbits must be in 1..=8, got {nbits}"
            )));
        }
        if dimension % num_subquantizers != 0 {
            return Err(RetrieveError::InvalidConfiguration(format!(
                "dimension {dimension} is not a multiple of {num_subquantizers} sub-quantizers"
            )));
        }

        Ok(Self {
            dimension,
            num_subquantizers,
            nbits,
            ksub: 1 << nbits,
            dsub: dimension / num_subquantizers,
            centroids: Vec::new(),
        })
    }

    /// Rebuild a trained quantizer from its centroids.
    pub fn from_centroids(
        dimension: usize,
        num_subquantizers: usize,
        nbits: usize,
        centroids: Vec<f32>,
    ) -> Result<Self, RetrieveError> {
        let mut pq = Self::new(dimension, num_subquantizers, nbits)?;
        let expected = num_subquantizers * pq.ksub * pq.dsub;
        if centroids.len() != expected {
            return Err(RetrieveError::InvalidConfiguration(format!(
                "expected {expected} PQ centroid values, got {}",
                centroids.len()
            )));
        }
        pq.centroids = centroids;
        Ok(pq)
    }

    /// Train one k-means codebook per subspace.
    ///
    /// Subspace `m` is seeded with `seed + m` so codebooks are reproducible.
    pub fn train(
        &mut self,
        vectors: &[f32],
        num_vectors: usize,
        seed: u64,
        max_iterations: usize,
    ) -> Result<(), RetrieveError> {
        if vectors.len() < num_vectors * self.dimension {
            return Err(RetrieveError::InvalidParameter(
                "Insufficient vectors".to_string(),
            ));
        }

        let mut centroids = Vec::with_capacity(self.num_subquantizers * self.ksub * self.dsub);
        let mut subvectors = Vec::with_capacity(num_vectors * self.dsub);

        for m in 0..self.num_subquantizers {
            subvectors.clear();
            for vec in vectors.chunks_exact(self.dimension).take(num_vectors) {
                subvectors.extend_from_slice(&vec[m * self.dsub..(m + 1) * self.dsub]);
            }

            let mut kmeans = KMeans::new(self.dsub, self.ksub)?
                .with_seed(seed.wrapping_add(m as u64))
                .with_max_iterations(max_iterations);
            kmeans.fit(&subvectors, num_vectors)?;
            centroids.extend_from_slice(kmeans.centroids());
        }

        self.centroids = centroids;
        Ok(())
    }

    /// Whether codebooks have been trained.
    #[inline]
    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    /// Centroid `j` of sub-quantizer `m`.
    #[inline]
    pub fn centroid(&self, m: usize, j: usize) -> &[f32] {
        let start = (m * self.ksub + j) * self.dsub;
        &self.centroids[start..start + self.dsub]
    }

    /// All centroids of sub-quantizer `m` (`ksub x dsub`).
    #[inline]
    pub fn subquantizer_centroids(&self, m: usize) -> &[f32] {
        let len = self.ksub * self.dsub;
        &self.centroids[m * len..(m + 1) * len]
    }

    /// Encode a vector into one code per sub-quantizer.
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut codes = vec![0u8; self.num_subquantizers];
        self.encode_into(vector, &mut codes);
        codes
    }

    /// Encode into a caller-provided buffer of `num_subquantizers` bytes.
    pub fn encode_into(&self, vector: &[f32], codes: &mut [u8]) {
        for (m, code) in codes.iter_mut().enumerate().take(self.num_subquantizers) {
            let subvector = &vector[m * self.dsub..(m + 1) * self.dsub];

            let mut best_code = 0usize;
            let mut best_dist = f32::INFINITY;
            for (j, codeword) in self.subquantizer_centroids(m).chunks_exact(self.dsub).enumerate() {
                let dist = simd::l2_distance_squared(subvector, codeword);
                if dist < best_dist {
                    best_dist = dist;
                    best_code = j;
                }
            }

            *code = best_code as u8;
        }
    }

    /// Reconstruct a vector from its codes.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimension);
        for (m, &code) in codes.iter().enumerate().take(self.num_subquantizers) {
            out.extend_from_slice(self.centroid(m, code as usize));
        }
        out
    }

    /// Squared L2 distances from each subvector of `x` to every codeword.
    ///
    /// `table` has layout `[m][ksub]`.
    pub fn compute_distance_table(&self, x: &[f32], table: &mut [f32]) {
        self.fill_table(x, table, simd::l2_distance_squared);
    }

    /// Inner products between each subvector of `x` and every codeword.
    ///
    /// `table` has layout `[m][ksub]`.
    pub fn compute_inner_prod_table(&self, x: &[f32], table: &mut [f32]) {
        self.fill_table(x, table, simd::dot);
    }

    fn fill_table(&self, x: &[f32], table: &mut [f32], f: impl Fn(&[f32], &[f32]) -> f32) {
        debug_assert_eq!(table.len(), self.table_len());
        for (m, row) in table.chunks_exact_mut(self.ksub).enumerate() {
            let subvector = &x[m * self.dsub..(m + 1) * self.dsub];
            for (out, codeword) in row
                .iter_mut()
                .zip(self.subquantizer_centroids(m).chunks_exact(self.dsub))
            {
                *out = f(subvector, codeword);
            }
        }
    }

    /// Vector dimension.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of sub-quantizers (`M`).
    #[inline]
    pub fn num_subquantizers(&self) -> usize {
        self.num_subquantizers
    }

    /// Bits per code.
    #[inline]
    pub fn nbits(&self) -> usize {
        self.nbits
    }

    /// Codewords per sub-quantizer.
    #[inline]
    pub fn ksub(&self) -> usize {
        self.ksub
    }

    /// Subvector dimension.
    #[inline]
    pub fn dsub(&self) -> usize {
        self.dsub
    }

    /// Length of a per-query lookup table (`M x ksub`).
    #[inline]
    pub fn table_len(&self) -> usize {
        self.num_subquantizers * self.ksub
    }

    /// Raw centroids, `[m][ksub][dsub]`.
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Whether the shape fields agree with each other and with the centroid count.
    ///
    /// Always true for quantizers built through [`new`](Self::new); deserialized
    /// ones must be checked before use.
    pub(crate) fn is_consistent(&self) -> bool {
        self.dimension > 0
            && self.num_subquantizers > 0
            && (1..=8).contains(&self.nbits)
            && self.ksub == 1 << self.nbits
            && self.dsub * self.num_subquantizers == self.dimension
            && (self.centroids.is_empty()
                || self.centroids.len() == self.num_subquantizers * self.ksub * self.dsub)
    }
}
