//! Disk persistence for IVF-PQ indexes.
//!
//! - [`directory`]: storage backends (`FsDirectory`, `MemoryDirectory`)
//! - [`format`]: manifest, load flags and the checksummed binary envelope
//! - [`ivf_pq`]: index and precomputed-table read/write
//!
//! The precomputed table is derived data. Indexes are saved without it and
//! rebuild it on load unless [`IoFlags::SKIP_PRECOMPUTE_TABLE`] is given.

pub mod directory;
pub mod error;
pub mod format;
pub mod ivf_pq;

pub use directory::{Directory, FsDirectory, MemoryDirectory};
pub use error::{PersistenceError, PersistenceResult};
pub use format::{IndexManifest, IndexType, IoFlags};
pub use ivf_pq::{
    read_index, read_manifest, read_precomputed_table, write_index, write_precomputed_table,
    LoadedIndex,
};
