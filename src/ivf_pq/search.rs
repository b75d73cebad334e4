//! IVF-PQ index: training, insertion, search and precomputed-table attachment.

use super::coarse::CoarseQuantizer;
use super::invlists::InvertedLists;
use super::layout::{CodeLayout, FastScan, Standard};
use super::pq::ProductQuantizer;
use super::precomputed::{
    initialize_precomputed_table_with_limit, precomputed_table_len, table_applicable,
    AlignedTable, TableRef, UsageMode, DEFAULT_PRECOMPUTED_TABLE_MAX_BYTES,
};
use super::scan::{LutBuilder, ScanScratch, TopK};
use crate::distance::MetricType;
use crate::partitioning::kmeans::DEFAULT_MAX_ITERATIONS;
use crate::simd;
use crate::RetrieveError;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// IVF-PQ parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IVFPQParams {
    /// Number of clusters (inverted lists)
    pub num_clusters: usize,

    /// Number of clusters to search (nprobe)
    pub nprobe: usize,

    /// Product quantization: number of sub-quantizers (M)
    pub num_codebooks: usize,

    /// Product quantization: bits per code (`ksub = 2^bits`)
    pub codebook_bits: usize,

    /// Encode residuals `x - y_C` rather than raw vectors
    pub by_residual: bool,

    pub metric: MetricType,

    /// Seed for k-means (coarse and PQ)
    pub seed: u64,

    pub max_train_iterations: usize,

    /// Automatic table construction is skipped above this size
    pub precomputed_table_max_bytes: usize,

    /// Log table construction at `info` rather than `debug`
    pub verbose: bool,
}

impl Default for IVFPQParams {
    fn default() -> Self {
        Self {
            num_clusters: 1024,
            nprobe: 1,
            num_codebooks: 8,
            codebook_bits: 8,
            by_residual: true,
            metric: MetricType::L2,
            seed: 42,
            max_train_iterations: DEFAULT_MAX_ITERATIONS,
            precomputed_table_max_bytes: DEFAULT_PRECOMPUTED_TABLE_MAX_BYTES,
            verbose: false,
        }
    }
}

impl IVFPQParams {
    pub fn new(num_clusters: usize, num_codebooks: usize, codebook_bits: usize) -> Self {
        Self {
            num_clusters,
            num_codebooks,
            codebook_bits,
            ..Self::default()
        }
    }

    pub fn with_nprobe(mut self, nprobe: usize) -> Self {
        self.nprobe = nprobe;
        self
    }

    pub fn with_metric(mut self, metric: MetricType) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_by_residual(mut self, by_residual: bool) -> Self {
        self.by_residual = by_residual;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_train_iterations(mut self, iterations: usize) -> Self {
        self.max_train_iterations = iterations;
        self
    }

    pub fn with_precomputed_table_max_bytes(mut self, bytes: usize) -> Self {
        self.precomputed_table_max_bytes = bytes;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Check parameter ranges that do not depend on the vector dimension.
    pub fn validate(&self) -> Result<(), RetrieveError> {
        if self.num_clusters == 0 {
            return Err(RetrieveError::InvalidParameter(
                "num_clusters must be greater than 0".to_string(),
            ));
        }
        if self.nprobe == 0 {
            return Err(RetrieveError::InvalidParameter(
                "nprobe must be greater than 0".to_string(),
            ));
        }
        if self.num_codebooks == 0 {
            return Err(RetrieveError::InvalidParameter(
                "num_codebooks must be greater than 0".to_string(),
            ));
        }
        if !(1..=8).contains(&self.codebook_bits) {
            return Err(RetrieveError::InvalidParameter(format!(
                "codebook_bits must be in 1..=8, got {}",
                self.codebook_bits
            )));
        }
        if self.max_train_iterations == 0 {
            return Err(RetrieveError::InvalidParameter(
                "max_train_iterations must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// IVF-PQ index for memory-efficient approximate nearest neighbor search.
///
/// The layout parameter selects how codes are stored and scanned; see
/// [`IVFPQFastScanIndex`]. The lifetime `'t` bounds any precomputed table the index
/// borrows through [`set_precomputed_table`](Self::set_precomputed_table). An index
/// that only ever owns its table can use `'static`.
#[derive(Debug)]
pub struct IVFPQIndex<'t, L: CodeLayout = Standard> {
    dimension: usize,
    params: IVFPQParams,

    // IVF components
    quantizer: CoarseQuantizer,
    invlists: InvertedLists,

    // PQ components
    pq: ProductQuantizer,

    use_precomputed_table: UsageMode,
    precomputed_table: Option<TableRef<'t>>,

    read_only: bool,
    _layout: PhantomData<L>,
}

/// IVF-PQ with 4-bit codes packed two per byte and quantized lookup tables.
pub type IVFPQFastScanIndex<'t> = IVFPQIndex<'t, FastScan>;

impl<'t, L: CodeLayout> IVFPQIndex<'t, L> {
    /// Create a new, untrained IVF-PQ index.
    pub fn new(dimension: usize, params: IVFPQParams) -> Result<Self, RetrieveError> {
        if dimension == 0 {
            return Err(RetrieveError::InvalidParameter(
                "dimension must be greater than 0".to_string(),
            ));
        }
        params.validate()?;
        L::validate(&params)?;

        let quantizer = CoarseQuantizer::new(dimension, params.num_clusters, params.metric)?;
        let pq = ProductQuantizer::new(dimension, params.num_codebooks, params.codebook_bits)?;
        let invlists = InvertedLists::new(params.num_clusters, L::code_size(params.num_codebooks));

        Ok(Self {
            dimension,
            params,
            quantizer,
            invlists,
            pq,
            use_precomputed_table: UsageMode::Unused,
            precomputed_table: None,
            read_only: false,
            _layout: PhantomData,
        })
    }

    /// Reassemble an index from persisted parts. No table is attached.
    pub(crate) fn from_parts(
        params: IVFPQParams,
        quantizer: CoarseQuantizer,
        pq: ProductQuantizer,
        invlists: InvertedLists,
    ) -> Result<Self, RetrieveError> {
        params.validate()?;
        L::validate(&params)?;
        if !quantizer.is_trained() || quantizer.dimension() == 0 || quantizer.nlist() == 0 {
            return Err(RetrieveError::InvalidConfiguration(
                "coarse quantizer is untrained or malformed".to_string(),
            ));
        }
        if !pq.is_consistent() || !pq.is_trained() {
            return Err(RetrieveError::InvalidConfiguration(
                "product quantizer is untrained or malformed".to_string(),
            ));
        }
        if params.num_clusters != quantizer.nlist()
            || params.num_codebooks != pq.num_subquantizers()
            || params.codebook_bits != pq.nbits()
            || params.metric != quantizer.metric()
        {
            return Err(RetrieveError::InvalidConfiguration(
                "parameters do not match the quantizers".to_string(),
            ));
        }
        let dimension = quantizer.dimension();
        if pq.dimension() != dimension {
            return Err(RetrieveError::InvalidConfiguration(format!(
                "coarse quantizer has dimension {dimension}, product quantizer has {}",
                pq.dimension()
            )));
        }
        if invlists.nlist() != quantizer.nlist()
            || invlists.code_size() != L::code_size(pq.num_subquantizers())
            || !invlists.is_consistent()
        {
            return Err(RetrieveError::InvalidConfiguration(
                "inverted lists do not match the quantizers".to_string(),
            ));
        }

        Ok(Self {
            dimension,
            params,
            quantizer,
            invlists,
            pq,
            use_precomputed_table: UsageMode::Unused,
            precomputed_table: None,
            read_only: false,
            _layout: PhantomData,
        })
    }

    /// Train the coarse quantizer, then the product quantizer (on residuals if
    /// `by_residual`), then build the precomputed table.
    ///
    /// Every stage runs on fresh state; the index is only updated once all of them
    /// succeed, so a failed retrain leaves quantizers, lists and table untouched.
    /// A successful retrain drops all indexed vectors.
    pub fn train(&mut self, vectors: &[f32], num_vectors: usize) -> Result<(), RetrieveError> {
        self.check_writable()?;
        if num_vectors == 0 {
            return Err(RetrieveError::EmptyIndex);
        }
        if vectors.len() != num_vectors * self.dimension {
            return Err(RetrieveError::DimensionMismatch {
                query_dim: vectors.len() / num_vectors,
                doc_dim: self.dimension,
            });
        }

        let dimension = self.dimension;
        let seed = self.params.seed;
        let iterations = self.params.max_train_iterations;

        // Stage 1: k-means clustering for IVF
        let mut quantizer =
            CoarseQuantizer::new(dimension, self.params.num_clusters, self.params.metric)?;
        quantizer.train(vectors, num_vectors, seed, iterations)?;

        // Stage 2: Product Quantization
        let mut pq = ProductQuantizer::new(
            dimension,
            self.params.num_codebooks,
            self.params.codebook_bits,
        )?;
        if self.params.by_residual {
            let mut residuals = vec![0.0f32; vectors.len()];
            residuals
                .par_chunks_exact_mut(dimension)
                .zip(vectors.par_chunks_exact(dimension))
                .for_each(|(residual, vector)| {
                    quantizer.compute_residual(vector, quantizer.assign(vector), residual);
                });
            pq.train(&residuals, num_vectors, seed, iterations)?;
        } else {
            pq.train(vectors, num_vectors, seed, iterations)?;
        }

        // Stage 3: precomputed table
        let mut mode = self.use_precomputed_table;
        let mut table = AlignedTable::new();
        initialize_precomputed_table_with_limit(
            &mut mode,
            &quantizer,
            &pq,
            &mut table,
            self.params.by_residual,
            self.params.verbose,
            self.params.precomputed_table_max_bytes,
        )?;

        self.invlists = InvertedLists::new(quantizer.nlist(), self.invlists.code_size());
        self.quantizer = quantizer;
        self.pq = pq;
        self.use_precomputed_table = mode;
        self.precomputed_table = Some(TableRef::Owned(table));

        tracing::info!(
            nlist = self.quantizer.nlist(),
            m = self.pq.num_subquantizers(),
            nbits = self.pq.nbits(),
            num_vectors,
            "trained IVF-PQ index"
        );
        Ok(())
    }

    #[inline]
    pub fn is_trained(&self) -> bool {
        self.quantizer.is_trained() && self.pq.is_trained()
    }

    /// Add vectors with sequential ids starting at [`ntotal`](Self::ntotal).
    pub fn add(&mut self, vectors: &[f32]) -> Result<(), RetrieveError> {
        let ids = sequential_ids(self.ntotal(), vectors.len() / self.dimension)?;
        self.add_with_ids(vectors, &ids)
    }

    /// Add vectors (row-major, `ids.len() x dimension`) under explicit ids.
    pub fn add_with_ids(&mut self, vectors: &[f32], ids: &[u32]) -> Result<(), RetrieveError> {
        self.check_writable()?;
        if !self.is_trained() {
            return Err(RetrieveError::NotTrained("IVF-PQ index"));
        }
        if vectors.len() != ids.len() * self.dimension {
            return Err(RetrieveError::DimensionMismatch {
                query_dim: if ids.is_empty() { 0 } else { vectors.len() / ids.len() },
                doc_dim: self.dimension,
            });
        }

        let dimension = self.dimension;
        let by_residual = self.params.by_residual;
        let code_size = self.invlists.code_size();
        let quantizer = &self.quantizer;
        let pq = &self.pq;

        let encoded: Vec<(usize, Vec<u8>)> = vectors
            .par_chunks_exact(dimension)
            .map_init(
                || (vec![0.0f32; dimension], vec![0u8; pq.num_subquantizers()]),
                |(residual, codes), vector| {
                    let list_no = quantizer.assign(vector);
                    if by_residual {
                        quantizer.compute_residual(vector, list_no, residual);
                        pq.encode_into(residual, codes);
                    } else {
                        pq.encode_into(vector, codes);
                    }
                    let mut packed = vec![0u8; code_size];
                    L::pack(codes, &mut packed);
                    (list_no, packed)
                },
            )
            .collect();

        for (&id, (list_no, packed)) in ids.iter().zip(&encoded) {
            self.invlists.add_entry(*list_no, id, packed);
        }

        tracing::debug!(added = ids.len(), ntotal = self.ntotal(), "added vectors");
        Ok(())
    }

    /// Search for the `k` best matches of `query`.
    ///
    /// L2 returns squared distances in ascending order; inner product returns
    /// similarities in descending order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u32, f32)>, RetrieveError> {
        self.check_searchable(query.len())?;
        let builder = self.lut_builder();
        let mut scratch = ScanScratch::default();
        Ok(self.search_one(&builder, query, k, &mut scratch))
    }

    /// Search `num_queries` row-major queries in parallel.
    pub fn search_batch(
        &self,
        queries: &[f32],
        num_queries: usize,
        k: usize,
    ) -> Result<Vec<Vec<(u32, f32)>>, RetrieveError> {
        if queries.len() != num_queries * self.dimension {
            return Err(RetrieveError::DimensionMismatch {
                query_dim: if num_queries == 0 { 0 } else { queries.len() / num_queries },
                doc_dim: self.dimension,
            });
        }
        if num_queries == 0 {
            return Ok(Vec::new());
        }
        self.check_searchable(self.dimension)?;

        let builder = self.lut_builder();
        Ok(queries
            .par_chunks_exact(self.dimension)
            .map_init(ScanScratch::default, |scratch, query| {
                self.search_one(&builder, query, k, scratch)
            })
            .collect())
    }

    fn search_one(
        &self,
        builder: &LutBuilder<'_>,
        query: &[f32],
        k: usize,
        scratch: &mut ScanScratch,
    ) -> Vec<(u32, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let metric = self.params.metric;
        let mut top = TopK::new(k, metric);

        let probes = self.quantizer.search(query, self.params.nprobe);
        builder.init_query(query, &mut scratch.lut);

        let code_size = self.invlists.code_size();
        let ksub = self.pq.ksub();
        for (list_no, coarse_dis) in probes {
            let Some(list) = self.invlists.list(list_no).filter(|l| !l.is_empty()) else {
                continue;
            };
            let (dis0, lut) = builder.list_lut(query, list_no, coarse_dis, &mut scratch.lut);
            L::scan_list(list, code_size, lut, ksub, dis0, metric, &mut top, &mut scratch.quantized);
        }

        top.into_sorted_vec()
    }

    fn lut_builder(&self) -> LutBuilder<'_> {
        LutBuilder::new(
            &self.quantizer,
            &self.pq,
            self.params.by_residual,
            self.active_table(),
        )
    }

    /// The table search consults, if any.
    fn active_table(&self) -> Option<&AlignedTable> {
        self.precomputed_table
            .as_deref()
            .filter(|_| self.use_precomputed_table.is_used())
    }

    fn check_searchable(&self, query_dim: usize) -> Result<(), RetrieveError> {
        if !self.is_trained() {
            return Err(RetrieveError::NotTrained("IVF-PQ index"));
        }
        if query_dim != self.dimension {
            return Err(RetrieveError::DimensionMismatch {
                query_dim,
                doc_dim: self.dimension,
            });
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), RetrieveError> {
        if self.read_only {
            return Err(RetrieveError::InvalidState(
                "index was loaded read-only".to_string(),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Precomputed table
    // -------------------------------------------------------------------------

    /// Build the precomputed table from the current quantizers and attach it as owned.
    ///
    /// The current usage mode is the builder's input, so a `Disabled` index stays
    /// disabled and a forced `PerList` ignores the size cap. The table is built into
    /// a fresh buffer; on error the current attachment is left in place.
    pub fn precompute_table(&mut self) -> Result<(), RetrieveError> {
        let mut mode = self.use_precomputed_table;
        let mut table = AlignedTable::new();
        initialize_precomputed_table_with_limit(
            &mut mode,
            &self.quantizer,
            &self.pq,
            &mut table,
            self.params.by_residual,
            self.params.verbose,
            self.params.precomputed_table_max_bytes,
        )?;
        self.use_precomputed_table = mode;
        self.precomputed_table = Some(TableRef::Owned(table));
        Ok(())
    }

    /// Attach a table owned by the caller.
    ///
    /// The index never frees `table`; it cannot outlive it. Any table the index
    /// owned before is dropped. Asking for [`UsageMode::PerList`] where the table is
    /// not applicable falls back to [`UsageMode::Unused`].
    ///
    /// # Errors
    ///
    /// [`RetrieveError::InvalidConfiguration`] if the mode is `PerList` and the
    /// table length is not `nlist * M * ksub`. The current attachment is kept.
    pub fn set_precomputed_table(
        &mut self,
        table: &'t AlignedTable,
        mode: UsageMode,
    ) -> Result<(), RetrieveError> {
        let mode = self.effective_mode(mode);
        self.check_table_len(table, mode)?;

        self.precomputed_table = Some(TableRef::Borrowed(table));
        self.use_precomputed_table = mode;
        tracing::debug!(
            mode = mode.as_i32(),
            len = table.len(),
            "attached shared precomputed table"
        );
        Ok(())
    }

    /// Change the usage mode without touching the attached table.
    ///
    /// Switching to `PerList` requires an attached table of the right length.
    pub fn set_use_precomputed_table(&mut self, mode: UsageMode) -> Result<(), RetrieveError> {
        let mode = self.effective_mode(mode);
        if mode.is_used() {
            let table = self.precomputed_table.as_deref().ok_or_else(|| {
                RetrieveError::InvalidConfiguration("no precomputed table attached".to_string())
            })?;
            self.check_table_len(table, mode)?;
        }
        self.use_precomputed_table = mode;
        Ok(())
    }

    /// Set the mode the next [`precompute_table`](Self::precompute_table) starts from.
    pub(crate) fn restore_use_precomputed_table(&mut self, mode: UsageMode) {
        self.use_precomputed_table = mode;
    }

    fn effective_mode(&self, mode: UsageMode) -> UsageMode {
        if mode.is_used() && !table_applicable(&self.quantizer, self.params.by_residual) {
            tracing::debug!(
                metric = ?self.params.metric,
                by_residual = self.params.by_residual,
                "precomputed table not applicable, using mode 0"
            );
            return UsageMode::Unused;
        }
        mode
    }

    fn check_table_len(&self, table: &AlignedTable, mode: UsageMode) -> Result<(), RetrieveError> {
        let expected = precomputed_table_len(&self.quantizer, &self.pq);
        if mode.is_used() && table.len() != expected {
            return Err(RetrieveError::InvalidConfiguration(format!(
                "precomputed table has {} entries, expected {expected}",
                table.len()
            )));
        }
        Ok(())
    }

    /// The attached table, owned or borrowed.
    pub fn precomputed_table(&self) -> Option<&AlignedTable> {
        self.precomputed_table.as_deref()
    }

    #[inline]
    pub fn use_precomputed_table(&self) -> UsageMode {
        self.use_precomputed_table
    }

    /// Whether the attached table will be dropped with this index.
    #[inline]
    pub fn owns_precomputed_table(&self) -> bool {
        self.precomputed_table
            .as_ref()
            .is_some_and(TableRef::is_owned)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn set_nprobe(&mut self, nprobe: usize) -> Result<(), RetrieveError> {
        if nprobe == 0 {
            return Err(RetrieveError::InvalidParameter(
                "nprobe must be greater than 0".to_string(),
            ));
        }
        self.params.nprobe = nprobe;
        Ok(())
    }

    #[inline]
    pub fn nprobe(&self) -> usize {
        self.params.nprobe
    }

    /// Number of indexed vectors.
    #[inline]
    pub fn ntotal(&self) -> usize {
        self.invlists.ntotal()
    }

    /// Number of entries in list `list_no`, or `None` if out of range.
    #[inline]
    pub fn list_len(&self, list_no: usize) -> Option<usize> {
        self.invlists.list_len(list_no)
    }

    #[inline]
    pub fn nlist(&self) -> usize {
        self.quantizer.nlist()
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn metric(&self) -> MetricType {
        self.params.metric
    }

    #[inline]
    pub fn by_residual(&self) -> bool {
        self.params.by_residual
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn params(&self) -> &IVFPQParams {
        &self.params
    }

    pub fn quantizer(&self) -> &CoarseQuantizer {
        &self.quantizer
    }

    pub fn pq(&self) -> &ProductQuantizer {
        &self.pq
    }

    pub fn invlists(&self) -> &InvertedLists {
        &self.invlists
    }

    /// Approximate reconstruction of the `offset`-th vector of list `list_no`.
    pub fn reconstruct(&self, list_no: usize, offset: usize) -> Option<Vec<f32>> {
        let packed = self.invlists.code(list_no, offset)?;
        let mut codes = vec![0u8; self.pq.num_subquantizers()];
        L::unpack(packed, &mut codes);
        let decoded = self.pq.decode(&codes);
        if !self.params.by_residual {
            return Some(decoded);
        }
        let mut vector = vec![0.0f32; self.dimension];
        simd::madd(self.quantizer.reconstruct(list_no), 1.0, &decoded, &mut vector);
        Some(vector)
    }

    /// Heap bytes held by codes, ids and an owned table.
    pub fn size_bytes(&self) -> usize {
        let table = match &self.precomputed_table {
            Some(TableRef::Owned(table)) => table.size_bytes(),
            _ => 0,
        };
        self.invlists.size_bytes() + table
    }
}

/// Ids `start..start + count`, all of which must fit in `u32`.
fn sequential_ids(start: usize, count: usize) -> Result<Vec<u32>, RetrieveError> {
    let fits = start
        .checked_add(count)
        .is_some_and(|end| u32::try_from(end.saturating_sub(1)).is_ok());
    if !fits {
        return Err(RetrieveError::InvalidParameter(format!(
            "adding {count} vectors to {start} would exceed the u32 id space"
        )));
    }
    Ok((start..start + count).map(|id| id as u32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_vectors(n: usize, d: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * d).map(|_| rng.random::<f32>()).collect()
    }

    fn trained<'t, L: CodeLayout>(metric: MetricType) -> (IVFPQIndex<'t, L>, Vec<f32>) {
        let (d, n) = (16, 500);
        let data = random_vectors(n, d, 1);
        let params = IVFPQParams::new(8, 4, 4).with_metric(metric).with_nprobe(4);
        let mut index = IVFPQIndex::<L>::new(d, params).unwrap();
        index.train(&data, n).unwrap();
        index.add(&data).unwrap();
        (index, data)
    }

    #[test]
    fn test_train_builds_owned_table_for_l2() {
        let (index, _) = trained::<Standard>(MetricType::L2);
        assert_eq!(index.use_precomputed_table(), UsageMode::PerList);
        assert!(index.owns_precomputed_table());
        assert_eq!(index.precomputed_table().map(AlignedTable::len), Some(8 * 4 * 16));
        assert_eq!(index.ntotal(), 500);
        assert_eq!((0..8).filter_map(|l| index.list_len(l)).sum::<usize>(), 500);
        assert_eq!(index.list_len(8), None);
        assert!(index.reconstruct(8, 0).is_none());
    }

    #[test]
    fn test_inner_product_skips_table() {
        let (index, _) = trained::<Standard>(MetricType::InnerProduct);
        assert_eq!(index.use_precomputed_table(), UsageMode::Unused);
        assert!(index.owns_precomputed_table());
        assert!(index.precomputed_table().is_some_and(AlignedTable::is_empty));
    }

    #[test]
    fn test_search_finds_indexed_vector() {
        let (index, data) = trained::<Standard>(MetricType::L2);
        let query = &data[7 * 16..8 * 16];
        let results = index.search(query, 10).unwrap();
        assert_eq!(results.len(), 10);
        assert!(results.windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(results.iter().any(|&(id, _)| id == 7));
    }

    #[test]
    fn test_inner_product_results_descend() {
        let (index, data) = trained::<Standard>(MetricType::InnerProduct);
        let results = index.search(&data[..16], 10).unwrap();
        assert_eq!(results.len(), 10);
        assert!(results.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_table_and_no_table_agree() {
        let (mut index, data) = trained::<Standard>(MetricType::L2);
        let with_table = index.search_batch(&data[..20 * 16], 20, 10).unwrap();
        index.set_use_precomputed_table(UsageMode::Unused).unwrap();
        let without = index.search_batch(&data[..20 * 16], 20, 10).unwrap();

        for (a, b) in with_table.iter().zip(&without) {
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(b) {
                assert!((x.1 - y.1).abs() <= 1e-4 * y.1.abs().max(1.0));
            }
        }
    }

    #[test]
    fn test_search_batch_matches_search() {
        let (index, data) = trained::<FastScan>(MetricType::L2);
        let batch = index.search_batch(&data[..10 * 16], 10, 5).unwrap();
        for (i, results) in batch.iter().enumerate() {
            let single = index.search(&data[i * 16..(i + 1) * 16], 5).unwrap();
            assert_eq!(results, &single);
        }
    }

    #[test]
    fn test_borrowed_table_is_not_owned() {
        let (mut index, _) = trained::<Standard>(MetricType::L2);
        let table = index.precomputed_table().cloned().unwrap();
        index.set_precomputed_table(&table, UsageMode::PerList).unwrap();
        assert!(!index.owns_precomputed_table());
        assert_eq!(index.use_precomputed_table(), UsageMode::PerList);
    }

    #[test]
    fn test_wrong_length_table_is_rejected() {
        let (mut index, _) = trained::<Standard>(MetricType::L2);
        let short = AlignedTable::with_len(3);
        let err = index.set_precomputed_table(&short, UsageMode::PerList);
        assert!(matches!(err, Err(RetrieveError::InvalidConfiguration(_))));
        assert!(index.owns_precomputed_table());
    }

    #[test]
    fn test_forced_table_under_inner_product_falls_back() {
        let (mut index, _) = trained::<Standard>(MetricType::InnerProduct);
        let table = AlignedTable::with_len(8 * 4 * 16);
        index.set_precomputed_table(&table, UsageMode::PerList).unwrap();
        assert_eq!(index.use_precomputed_table(), UsageMode::Unused);
    }

    #[test]
    fn test_untrained_errors() {
        let mut index = IVFPQIndex::<Standard>::new(8, IVFPQParams::new(2, 2, 4)).unwrap();
        assert!(matches!(
            index.search(&[0.0; 8], 1),
            Err(RetrieveError::NotTrained(_))
        ));
        assert!(matches!(
            index.add(&[0.0; 8]),
            Err(RetrieveError::NotTrained(_))
        ));
        assert!(matches!(
            index.precompute_table(),
            Err(RetrieveError::NotTrained(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let (index, _) = trained::<Standard>(MetricType::L2);
        assert!(matches!(
            index.search(&[0.0; 3], 1),
            Err(RetrieveError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_params() {
        assert!(IVFPQIndex::<Standard>::new(10, IVFPQParams::new(4, 3, 8)).is_err());
        assert!(IVFPQIndex::<Standard>::new(8, IVFPQParams::new(0, 2, 8)).is_err());
        assert!(IVFPQFastScanIndex::new(8, IVFPQParams::new(4, 2, 8)).is_err());
    }

    #[test]
    fn test_reconstruct_is_close() {
        let (index, data) = trained::<Standard>(MetricType::L2);
        let list_no = index.quantizer().assign(&data[..16]);
        let offset = index
            .invlists()
            .list(list_no)
            .unwrap()
            .ids()
            .iter()
            .position(|&id| id == 0)
            .unwrap();
        let approx = index.reconstruct(list_no, offset).unwrap();
        let err = simd::l2_distance_squared(&approx, &data[..16]);
        let norm = simd::norm_squared(&data[..16]);
        assert!(err < norm);
    }

    #[test]
    fn test_add_with_ids_keeps_ids() {
        let (d, n) = (8, 200);
        let data = random_vectors(n, d, 5);
        let mut index = IVFPQIndex::<Standard>::new(d, IVFPQParams::new(4, 2, 4)).unwrap();
        index.train(&data, n).unwrap();

        let mut rng = StdRng::seed_from_u64(9);
        let ids: Vec<u32> = (0..n).map(|_| rng.random_range(1000..2000)).collect();
        index.add_with_ids(&data, &ids).unwrap();
        index.set_nprobe(4).unwrap();

        let results = index.search(&data[..d], 50).unwrap();
        assert!(results.iter().all(|(id, _)| (1000..2000).contains(id)));
    }

    #[test]
    fn test_failed_retrain_keeps_index() {
        let (mut index, data) = trained::<Standard>(MetricType::L2);
        let queries = &data[..20 * 16];
        let before = index.search_batch(queries, 20, 10).unwrap();

        // 10 vectors cover the 8 coarse lists but not the 16 PQ centroids.
        let small = random_vectors(10, 16, 3);
        assert!(index.train(&small, 10).is_err());

        assert!(index.is_trained());
        assert_eq!(index.ntotal(), 500);
        assert_eq!(index.use_precomputed_table(), UsageMode::PerList);
        let after = index.search_batch(queries, 20, 10).unwrap();
        assert_eq!(after, before);

        index.set_use_precomputed_table(UsageMode::Unused).unwrap();
        let without = index.search_batch(queries, 20, 10).unwrap();
        for (a, b) in after.iter().zip(&without) {
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(b) {
                assert!((x.1 - y.1).abs() <= 1e-4 * y.1.abs().max(1.0));
            }
        }
    }

    #[test]
    fn test_from_parts_rejects_mismatched_quantizers() {
        let (index, _) = trained::<Standard>(MetricType::L2);
        let parts = || {
            (
                index.quantizer().clone(),
                index.pq().clone(),
                index.invlists().clone(),
            )
        };

        let (quantizer, pq, invlists) = parts();
        assert!(
            IVFPQIndex::<Standard>::from_parts(index.params().clone(), quantizer, pq, invlists)
                .is_ok()
        );

        let (quantizer, pq, invlists) = parts();
        let params = index.params().clone().with_metric(MetricType::InnerProduct);
        assert!(matches!(
            IVFPQIndex::<Standard>::from_parts(params, quantizer, pq, invlists),
            Err(RetrieveError::InvalidConfiguration(_))
        ));

        let (quantizer, _, invlists) = parts();
        let untrained = ProductQuantizer::new(16, 4, 4).unwrap();
        assert!(matches!(
            IVFPQIndex::<Standard>::from_parts(index.params().clone(), quantizer, untrained, invlists),
            Err(RetrieveError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_sequential_ids_stay_in_u32() {
        let last = u32::MAX as usize;
        assert_eq!(sequential_ids(last, 1).unwrap(), vec![u32::MAX]);
        assert!(sequential_ids(last, 0).unwrap().is_empty());
        assert!(matches!(
            sequential_ids(last, 2),
            Err(RetrieveError::InvalidParameter(_))
        ));
        assert!(matches!(
            sequential_ids(usize::MAX, 1),
            Err(RetrieveError::InvalidParameter(_))
        ));
    }
}
