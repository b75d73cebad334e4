//! IVF-PQ: Inverted File with Product Quantization.
//!
//! Combines two ideas:
//!
//! 1. **IVF (Inverted File)**: Partition space into Voronoi cells, only search
//!    cells near the query
//! 2. **PQ (Product Quantization)**: Compress vectors to a few bytes while
//!    preserving distance estimation
//!
//! ```text
//!           Query
//!             |
//!     +-------+-------+
//!     |               |
//!   Cell A          Cell B      (probe 2 cells)
//!   |__|__|         |__|__|
//!   v  v  v         v  v  v
//!  [codes]         [codes]      (score codes with a lookup table)
//! ```
//!
//! ## Residual encoding
//!
//! With `by_residual` (the default) a vector `y` is stored as the code of
//! `y - y_C`, where `y_C` is the centroid of its cell. Residuals are smaller than
//! the raw vectors, so the same codebooks quantize them more accurately.
//!
//! ## Asymmetric Distance Computation (ADC)
//!
//! Don't compress the query, only compress database vectors.
//!
//! ```text
//! d(query, db) ≈ dis0 + Σₘ lut[m][db_code[m]]
//! ```
//!
//! Under residual encoding the LUT depends on the probed cell. Building it from
//! scratch costs `M × ksub × dsub` per (query, cell). The [`precomputed`] table moves
//! the cell-only part of that work to build time, leaving a query-only table that
//! is computed once per query. The table is read-only after construction and can
//! be shared by reference between indices; see [`IVFPQIndex::set_precomputed_table`].
//!
//! ## Usage
//!
//! ```rust
//! use ivfpq_share::ivf_pq::{IVFPQIndex, IVFPQParams};
//!
//! # fn main() -> ivfpq_share::Result<()> {
//! let (d, n) = (16, 256);
//! let vectors: Vec<f32> = (0..n * d).map(|i| ((i * 7919) % 101) as f32 / 101.0).collect();
//!
//! let params = IVFPQParams::new(4, 4, 4).with_nprobe(2);
//! let mut index: IVFPQIndex = IVFPQIndex::new(d, params)?;
//! index.train(&vectors, n)?;
//! index.add(&vectors)?;
//!
//! let results = index.search(&vectors[..d], 5)?;
//! assert_eq!(results.len(), 5);
//! # Ok(())
//! # }
//! ```
//!
//! ## Trade-offs
//!
//! | Parameter | ↑ Effect |
//! |-----------|----------|
//! | nprobe | Better recall, slower search |
//! | num_clusters | Better partitioning, slower training, larger precomputed table |
//! | num_codebooks | More memory, better accuracy |
//!
//! ## References
//!
//! - Jégou, Douze, Schmid (2011). "Product Quantization for Nearest Neighbor Search."
//! - André, Kermarrec, Le Scouarnec (2015). "Cache locality is not enough:
//!   High-performance nearest neighbor search with product quantization fast scan."

pub mod coarse;
pub mod invlists;
pub mod layout;
pub mod pq;
pub mod precomputed;
mod scan;
pub mod search;

pub use coarse::CoarseQuantizer;
pub use invlists::{InvertedList, InvertedLists};
pub use layout::{CodeLayout, FastScan, Standard};
pub use pq::ProductQuantizer;
pub use precomputed::{
    build_precomputed_table, build_precomputed_table_with_limit, initialize_precomputed_table,
    initialize_precomputed_table_with_limit, precomputed_table_len, table_applicable,
    AlignedTable, TableRef, UsageMode, DEFAULT_PRECOMPUTED_TABLE_MAX_BYTES,
};
pub use search::{IVFPQFastScanIndex, IVFPQIndex, IVFPQParams};
