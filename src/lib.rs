//! ivfpq-share: IVF-PQ approximate nearest neighbor search with shareable
//! precomputed distance tables.
//!
//! - `ivf_pq/`: coarse quantizer, product quantizer, inverted lists, the
//!   precomputed table builder and the index itself (standard and fast-scan layouts)
//! - `partitioning/`: k-means used to train both quantizers
//! - `persistence/`: directory-based save/load with load-time flags
//!
//! # Critical Nuances
//!
//! ## The precomputed table is big
//!
//! It holds `nlist × M × ksub` floats. For `nlist = 65536`, `M = 32`, `ksub = 256`
//! that is 2 GiB, which is exactly where automatic construction stops. Processes
//! that load several replicas of one index should build it once and attach it to
//! every replica by reference:
//!
//! ```text
//! read_index(.., SKIP_PRECOMPUTE_TABLE) ─┐
//! read_index(.., SKIP_PRECOMPUTE_TABLE) ─┼─ set_precomputed_table(&table, mode)
//! read_index(.., SKIP_PRECOMPUTE_TABLE) ─┘
//! ```
//!
//! The borrow checker guarantees the table outlives every index it is attached to.
//!
//! ## Only L2 benefits
//!
//! The table relies on `||x - y_C - y_R||²` splitting into per-cell and per-query
//! terms. Inner product has no such split; requesting a table under inner product
//! silently falls back to computing lookup tables per query.

pub mod distance;
pub mod error;
pub mod ivf_pq;
pub mod partitioning;
pub mod persistence;
pub mod simd;

// Re-exports
pub use distance::MetricType;
pub use error::{Result, RetrieveError};
pub use ivf_pq::{
    AlignedTable, IVFPQFastScanIndex, IVFPQIndex, IVFPQParams, TableRef, UsageMode,
};
pub use persistence::{read_index, write_index, IoFlags, LoadedIndex};
