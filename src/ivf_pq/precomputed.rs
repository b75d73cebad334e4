//! Precomputed distance tables for IVF-PQ with residual encoding.
//!
//! With residual encoding a database vector is approximated as `y_C + y_R`, where
//! `y_C` is its coarse centroid and `y_R` the PQ reconstruction of its residual.
//! Under squared L2 the distance to a query `x` expands as
//!
//! ```text
//! d = ||x - y_C||^2 + ||y_R||^2 + 2<y_C, y_R> - 2<x, y_R>
//!     ---term 1---   -------term 2--------   --term 3--
//! ```
//!
//! - term 1 comes for free from the coarse quantizer (one scalar per probed list)
//! - term 2 depends only on the list and the code: it is the precomputed table,
//!   `nlist x M x ksub` floats
//! - term 3 depends only on the query and the code: one `M x ksub` table per query
//!
//! Every term splits across sub-quantizers, so a code is scored with `M` lookups
//! into `table[list] - 2 * ip_table(x)`.
//!
//! ## Ownership
//!
//! Building term 2 costs `O(nlist x M x ksub x dsub)`. Processes that load several
//! replicas of one index build it once and hand the same [`AlignedTable`] to each
//! replica by reference. An index therefore holds its table as a [`TableRef`]:
//! either a table it built and owns, or a borrow whose lifetime bounds the index.

use super::coarse::CoarseQuantizer;
use super::pq::ProductQuantizer;
use crate::simd;
use crate::RetrieveError;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::Deref;

/// Tables larger than this are not built unless explicitly requested (2 GiB).
pub const DEFAULT_PRECOMPUTED_TABLE_MAX_BYTES: usize = 1 << 31;

/// Whether and how an index consults a precomputed table.
///
/// The integer codes (`-1`, `0`, `1`) are stable and used in logs and manifests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageMode {
    /// The caller opted out; the builder clears the table and never builds one.
    Disabled,
    /// No table is consulted. On input to the builder this means "decide for me".
    #[default]
    Unused,
    /// One `M x ksub` table per inverted list.
    PerList,
}

impl UsageMode {
    pub fn as_i32(self) -> i32 {
        match self {
            UsageMode::Disabled => -1,
            UsageMode::Unused => 0,
            UsageMode::PerList => 1,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self, RetrieveError> {
        match value {
            -1 => Ok(UsageMode::Disabled),
            0 => Ok(UsageMode::Unused),
            1 => Ok(UsageMode::PerList),
            other => Err(RetrieveError::InvalidParameter(format!(
                "unknown precomputed table mode {other}"
            ))),
        }
    }

    /// Whether search reads the table in this mode.
    #[inline]
    pub fn is_used(self) -> bool {
        matches!(self, UsageMode::PerList)
    }
}

const LANE_WIDTH: usize = 16;

/// One cache line of floats.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C, align(64))]
struct Lane([f32; LANE_WIDTH]);

// SAFETY: `Lane` is `repr(C)` over a plain `f32` array whose size (64 bytes) equals
// its alignment, so it has no padding and every bit pattern is valid.
unsafe impl Zeroable for Lane {}
unsafe impl Pod for Lane {}

/// Contiguous `f32` buffer aligned to 64 bytes.
///
/// Holds a precomputed table laid out as `[list][m][ksub]`. Read-only once built, so
/// one instance can back any number of indices searching concurrently.
#[derive(Debug, Clone, Default)]
pub struct AlignedTable {
    lanes: Vec<Lane>,
    len: usize,
}

impl AlignedTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-filled table of `len` floats.
    pub fn with_len(len: usize) -> Self {
        let mut table = Self::new();
        table.resize(len);
        table
    }

    /// Copy `values` into a fresh aligned buffer.
    pub fn from_slice(values: &[f32]) -> Self {
        let mut table = Self::with_len(values.len());
        table.as_mut_slice().copy_from_slice(values);
        table
    }

    /// Resize to `len` floats. Existing values are kept; new ones are zero.
    pub fn resize(&mut self, len: usize) {
        self.lanes.resize(len.div_ceil(LANE_WIDTH), Lane::default());
        if len < self.len {
            // Stale values past `len` must read as zero if the table grows again.
            self.as_full_mut_slice()[len..].iter_mut().for_each(|v| *v = 0.0);
        }
        self.len = len;
    }

    /// Drop all values and release the allocation.
    pub fn clear(&mut self) {
        self.lanes = Vec::new();
        self.len = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &bytemuck::cast_slice::<Lane, f32>(&self.lanes)[..self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        let len = self.len;
        &mut self.as_full_mut_slice()[..len]
    }

    fn as_full_mut_slice(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut::<Lane, f32>(&mut self.lanes)
    }

    /// Heap bytes held by the buffer.
    pub fn size_bytes(&self) -> usize {
        self.lanes.len() * std::mem::size_of::<Lane>()
    }
}

impl PartialEq for AlignedTable {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Serialize for AlignedTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.as_slice())
    }
}

impl<'de> Deserialize<'de> for AlignedTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<f32>::deserialize(deserializer)?;
        Ok(Self::from_slice(&values))
    }
}

/// A precomputed table attached to an index.
///
/// `Owned` tables are dropped with the index. `Borrowed` tables belong to the caller;
/// the index cannot outlive them.
#[derive(Debug, Clone)]
pub enum TableRef<'t> {
    Owned(AlignedTable),
    Borrowed(&'t AlignedTable),
}

impl TableRef<'_> {
    #[inline]
    pub fn is_owned(&self) -> bool {
        matches!(self, TableRef::Owned(_))
    }
}

impl Deref for TableRef<'_> {
    type Target = AlignedTable;

    fn deref(&self) -> &AlignedTable {
        match self {
            TableRef::Owned(table) => table,
            TableRef::Borrowed(table) => table,
        }
    }
}

/// Number of floats in the table for this quantizer pair.
#[inline]
pub fn precomputed_table_len(quantizer: &CoarseQuantizer, pq: &ProductQuantizer) -> usize {
    quantizer.nlist() * pq.num_subquantizers() * pq.ksub()
}

/// Whether a table can be used at all for this configuration.
#[inline]
pub fn table_applicable(quantizer: &CoarseQuantizer, by_residual: bool) -> bool {
    by_residual && quantizer.metric().has_residual_decomposition()
}

/// Build the precomputed table for `quantizer` and `pq` into `table`.
///
/// `use_precomputed_table` is read and updated in place:
///
/// - [`UsageMode::Disabled`]: `table` is cleared, nothing is built.
/// - [`UsageMode::Unused`]: the builder decides. If the metric has no residual
///   decomposition or `by_residual` is false, or the table would exceed
///   [`DEFAULT_PRECOMPUTED_TABLE_MAX_BYTES`], the mode stays `Unused` and `table` is
///   left untouched. Otherwise the table is built and the mode becomes `PerList`.
/// - [`UsageMode::PerList`]: build regardless of size. Under a metric without the
///   decomposition this silently falls back to `Unused`.
///
/// # Errors
///
/// - [`RetrieveError::InvalidConfiguration`] if the quantizers disagree on dimension
/// - [`RetrieveError::NotTrained`] if either quantizer is untrained
pub fn initialize_precomputed_table(
    use_precomputed_table: &mut UsageMode,
    quantizer: &CoarseQuantizer,
    pq: &ProductQuantizer,
    table: &mut AlignedTable,
    by_residual: bool,
    verbose: bool,
) -> Result<(), RetrieveError> {
    initialize_precomputed_table_with_limit(
        use_precomputed_table,
        quantizer,
        pq,
        table,
        by_residual,
        verbose,
        DEFAULT_PRECOMPUTED_TABLE_MAX_BYTES,
    )
}

/// [`initialize_precomputed_table`] with an explicit size cap for automatic mode.
pub fn initialize_precomputed_table_with_limit(
    use_precomputed_table: &mut UsageMode,
    quantizer: &CoarseQuantizer,
    pq: &ProductQuantizer,
    table: &mut AlignedTable,
    by_residual: bool,
    verbose: bool,
    max_bytes: usize,
) -> Result<(), RetrieveError> {
    check_quantizers(quantizer, pq)?;

    if *use_precomputed_table == UsageMode::Disabled {
        table.clear();
        return Ok(());
    }

    if !table_applicable(quantizer, by_residual) {
        if *use_precomputed_table == UsageMode::PerList {
            tracing::debug!(
                metric = ?quantizer.metric(),
                by_residual,
                "precomputed table requested but not applicable, falling back to unused"
            );
        }
        log(verbose, "precomputed table not needed");
        *use_precomputed_table = UsageMode::Unused;
        return Ok(());
    }

    let len = precomputed_table_len(quantizer, pq);
    if *use_precomputed_table == UsageMode::Unused {
        let bytes = len * std::mem::size_of::<f32>();
        if bytes > max_bytes {
            tracing::warn!(
                bytes,
                max_bytes,
                "not precomputing IVF-PQ table, it would be too big"
            );
            return Ok(());
        }
        *use_precomputed_table = UsageMode::PerList;
    }

    log(verbose, "precomputing IVF-PQ tables type 1");

    let ksub = pq.ksub();
    let m = pq.num_subquantizers();

    // ||c_{m,j}||^2 for every codeword
    let r_norms: Vec<f32> = (0..m)
        .flat_map(|mi| (0..ksub).map(move |j| (mi, j)))
        .map(|(mi, j)| simd::norm_squared(pq.centroid(mi, j)))
        .collect();

    table.resize(len);
    table
        .as_mut_slice()
        .par_chunks_exact_mut(m * ksub)
        .enumerate()
        .for_each(|(list_no, tab)| {
            pq.compute_inner_prod_table(quantizer.reconstruct(list_no), tab);
            for (t, &r) in tab.iter_mut().zip(&r_norms) {
                *t = r + 2.0 * *t;
            }
        });

    tracing::debug!(
        nlist = quantizer.nlist(),
        m,
        ksub,
        bytes = table.size_bytes(),
        "precomputed table built"
    );
    Ok(())
}

/// Run the builder in automatic mode on a fresh buffer.
///
/// Returns the resulting mode and the table (empty unless the mode is `PerList`).
pub fn build_precomputed_table(
    quantizer: &CoarseQuantizer,
    pq: &ProductQuantizer,
    by_residual: bool,
    verbose: bool,
) -> Result<(UsageMode, AlignedTable), RetrieveError> {
    build_precomputed_table_with_limit(
        quantizer,
        pq,
        by_residual,
        verbose,
        DEFAULT_PRECOMPUTED_TABLE_MAX_BYTES,
    )
}

/// [`build_precomputed_table`] with an explicit size cap.
pub fn build_precomputed_table_with_limit(
    quantizer: &CoarseQuantizer,
    pq: &ProductQuantizer,
    by_residual: bool,
    verbose: bool,
    max_bytes: usize,
) -> Result<(UsageMode, AlignedTable), RetrieveError> {
    let mut mode = UsageMode::Unused;
    let mut table = AlignedTable::new();
    initialize_precomputed_table_with_limit(
        &mut mode,
        quantizer,
        pq,
        &mut table,
        by_residual,
        verbose,
        max_bytes,
    )?;
    Ok((mode, table))
}

fn check_quantizers(quantizer: &CoarseQuantizer, pq: &ProductQuantizer) -> Result<(), RetrieveError> {
    if quantizer.dimension() != pq.dimension() {
        return Err(RetrieveError::InvalidConfiguration(format!(
            "coarse quantizer has dimension {}, product quantizer has {}",
            quantizer.dimension(),
            pq.dimension()
        )));
    }
    if pq.num_subquantizers() * pq.dsub() != pq.dimension() {
        return Err(RetrieveError::InvalidConfiguration(format!(
            "{} sub-quantizers of dimension {} do not cover dimension {}",
            pq.num_subquantizers(),
            pq.dsub(),
            pq.dimension()
        )));
    }
    if !quantizer.is_trained() {
        return Err(RetrieveError::NotTrained("coarse quantizer"));
    }
    if !pq.is_trained() {
        return Err(RetrieveError::NotTrained("product quantizer"));
    }
    Ok(())
}

fn log(verbose: bool, message: &str) {
    if verbose {
        tracing::info!("{message}");
    } else {
        tracing::debug!("{message}");
    }
}
