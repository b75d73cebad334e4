//! Flat coarse quantizer for the inverted file.

use crate::distance::MetricType;
use crate::partitioning::KMeans;
use crate::simd;
use crate::RetrieveError;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Probe list returned by [`CoarseQuantizer::search`].
pub type Probes = SmallVec<[(usize, f32); 16]>;

/// `nlist` centroids in `dimension`-d space, scanned exhaustively.
///
/// Centroids are trained with k-means under squared L2; assignment and probing
/// follow the quantizer's metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoarseQuantizer {
    dimension: usize,
    nlist: usize,
    metric: MetricType,
    centroids: Vec<f32>,
}

impl CoarseQuantizer {
    /// Create an untrained quantizer.
    pub fn new(dimension: usize, nlist: usize, metric: MetricType) -> Result<Self, RetrieveError> {
        if dimension == 0 || nlist == 0 {
            return Err(RetrieveError::InvalidParameter(
                "dimension and nlist must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            nlist,
            metric,
            centroids: Vec::new(),
        })
    }

    /// Build a trained quantizer from explicit centroids (`nlist x dimension`).
    pub fn from_centroids(
        dimension: usize,
        metric: MetricType,
        centroids: Vec<f32>,
    ) -> Result<Self, RetrieveError> {
        if dimension == 0 || centroids.is_empty() || centroids.len() % dimension != 0 {
            return Err(RetrieveError::InvalidConfiguration(format!(
                "{} centroid values do not form rows of dimension {dimension}",
                centroids.len()
            )));
        }
        Ok(Self {
            dimension,
            nlist: centroids.len() / dimension,
            metric,
            centroids,
        })
    }

    /// Train centroids with k-means.
    pub fn train(
        &mut self,
        vectors: &[f32],
        num_vectors: usize,
        seed: u64,
        max_iterations: usize,
    ) -> Result<(), RetrieveError> {
        let mut kmeans = KMeans::new(self.dimension, self.nlist)?
            .with_seed(seed)
            .with_max_iterations(max_iterations);
        kmeans.fit(vectors, num_vectors)?;
        self.centroids = kmeans.into_centroids();
        Ok(())
    }

    #[inline]
    pub fn is_trained(&self) -> bool {
        self.centroids.len() == self.nlist * self.dimension
    }

    #[inline]
    pub fn nlist(&self) -> usize {
        self.nlist
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn metric(&self) -> MetricType {
        self.metric
    }

    /// Centroid of list `list_no`.
    #[inline]
    pub fn reconstruct(&self, list_no: usize) -> &[f32] {
        let start = list_no * self.dimension;
        &self.centroids[start..start + self.dimension]
    }

    /// The `nprobe` best lists for `query`, best first, with their coarse scores.
    ///
    /// For L2 the score is `||query - centroid||^2`; for inner product it is
    /// `<query, centroid>`. Ties break on the lower list id.
    pub fn search(&self, query: &[f32], nprobe: usize) -> Probes {
        let metric = self.metric;
        let mut scored: Probes = self
            .centroids
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(list_no, centroid)| (list_no, metric.score(query, centroid)))
            .collect();

        scored.sort_by(|a, b| {
            metric
                .to_cost(a.1)
                .total_cmp(&metric.to_cost(b.1))
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(nprobe.min(self.nlist));
        scored
    }

    /// Nearest list for `vector`.
    pub fn assign(&self, vector: &[f32]) -> usize {
        let metric = self.metric;
        let mut best = 0;
        let mut best_cost = f32::INFINITY;
        for (list_no, centroid) in self.centroids.chunks_exact(self.dimension).enumerate() {
            let cost = metric.to_cost(metric.score(vector, centroid));
            if cost < best_cost {
                best_cost = cost;
                best = list_no;
            }
        }
        best
    }

    /// `residual = vector - centroid(list_no)`.
    #[inline]
    pub fn compute_residual(&self, vector: &[f32], list_no: usize, residual: &mut [f32]) {
        simd::sub(vector, self.reconstruct(list_no), residual);
    }

    /// Raw centroids (`nlist x dimension`).
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }
}
