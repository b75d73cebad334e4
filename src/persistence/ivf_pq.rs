//! IVF-PQ index persistence.
//!
//! [`write_index`] stores the quantizers and inverted lists. [`read_index`] restores
//! them and, unless told otherwise by [`IoFlags`], rebuilds the precomputed table.
//!
//! Loading several replicas of one index with [`IoFlags::SKIP_PRECOMPUTE_TABLE`] and
//! attaching one shared table avoids building (and holding) the table once per
//! replica:
//!
//! ```no_run
//! use ivfpq_share::persistence::{read_index, FsDirectory, IoFlags};
//!
//! # fn main() -> ivfpq_share::Result<()> {
//! let dir = FsDirectory::new("/data/index")?;
//! let mut a = read_index(&dir, IoFlags::SKIP_PRECOMPUTE_TABLE)?;
//! let mut b = read_index(&dir, IoFlags::SKIP_PRECOMPUTE_TABLE)?;
//!
//! let (mode, table) = a.build_precomputed_table()?;
//! a.set_precomputed_table(&table, mode)?;
//! b.set_precomputed_table(&table, mode)?;
//! # Ok(())
//! # }
//! ```

use super::directory::Directory;
use super::error::PersistenceError;
use super::format::{
    decode_envelope, encode_envelope, IndexManifest, IndexType, IoFlags, FORMAT_VERSION,
    INDEX_MAGIC, TABLE_MAGIC,
};
use crate::distance::MetricType;
use crate::ivf_pq::{
    build_precomputed_table_with_limit, AlignedTable, CodeLayout, CoarseQuantizer, FastScan,
    IVFPQIndex, IVFPQParams, InvertedLists, ProductQuantizer, Standard, UsageMode,
};
use crate::RetrieveError;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const INDEX_FILE: &str = "index.bin";
pub const TABLE_FILE: &str = "precomputed_table.bin";

#[derive(Serialize)]
struct IndexBodyRef<'a> {
    params: &'a IVFPQParams,
    quantizer: &'a CoarseQuantizer,
    pq: &'a ProductQuantizer,
    invlists: &'a InvertedLists,
}

#[derive(Deserialize)]
struct IndexBody {
    params: IVFPQParams,
    quantizer: CoarseQuantizer,
    pq: ProductQuantizer,
    invlists: InvertedLists,
}

/// Write `index` to the root of `dir`.
///
/// The body is written before the manifest, so a reader never sees a manifest
/// without its body. The precomputed table is not written.
pub fn write_index<L: CodeLayout>(
    index: &IVFPQIndex<'_, L>,
    dir: &dyn Directory,
) -> Result<(), RetrieveError> {
    if !index.is_trained() {
        return Err(RetrieveError::NotTrained("IVF-PQ index"));
    }

    let body = IndexBodyRef {
        params: index.params(),
        quantizer: index.quantizer(),
        pq: index.pq(),
        invlists: index.invlists(),
    };
    let bytes = encode_envelope(INDEX_MAGIC, &body)?;
    dir.atomic_write(INDEX_FILE, &bytes)?;

    let manifest = IndexManifest {
        version: FORMAT_VERSION,
        index_type: L::INDEX_TYPE,
        dimension: index.dimension() as u32,
        total_vectors: index.ntotal() as u64,
        use_precomputed_table: index.use_precomputed_table().as_i32(),
        config: serde_json::to_value(index.params()).map_err(PersistenceError::from)?,
        created_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    };
    let json = serde_json::to_vec_pretty(&manifest).map_err(PersistenceError::from)?;
    dir.atomic_write(MANIFEST_FILE, &json)?;

    tracing::info!(
        index_type = ?L::INDEX_TYPE,
        ntotal = index.ntotal(),
        bytes = bytes.len(),
        "wrote IVF-PQ index"
    );
    Ok(())
}

/// Read the index stored at the root of `dir`.
///
/// - By default the precomputed table is rebuilt and owned by the loaded index.
/// - [`IoFlags::SKIP_PRECOMPUTE_TABLE`]: no table, usage mode `0`, until the caller
///   attaches one.
/// - [`IoFlags::READ_ONLY`]: the loaded index rejects insertions.
pub fn read_index<'t>(dir: &dyn Directory, flags: IoFlags) -> Result<LoadedIndex<'t>, RetrieveError> {
    let manifest = read_manifest(dir)?;
    let index = match manifest.index_type {
        IndexType::IvfPq => LoadedIndex::Standard(read_body::<Standard>(dir, &manifest, flags)?),
        IndexType::IvfPqFastScan => {
            LoadedIndex::FastScan(read_body::<FastScan>(dir, &manifest, flags)?)
        }
    };

    tracing::info!(
        index_type = ?manifest.index_type,
        ntotal = index.ntotal(),
        use_precomputed_table = index.use_precomputed_table().as_i32(),
        read_only = flags.contains(IoFlags::READ_ONLY),
        "loaded IVF-PQ index"
    );
    Ok(index)
}

/// Read only the manifest.
pub fn read_manifest(dir: &dyn Directory) -> Result<IndexManifest, RetrieveError> {
    let bytes = dir.read_all(MANIFEST_FILE)?;
    let manifest: IndexManifest = serde_json::from_slice(&bytes).map_err(PersistenceError::from)?;
    if manifest.version != FORMAT_VERSION {
        return Err(PersistenceError::Format(format!(
            "unsupported manifest version {}, expected {FORMAT_VERSION}",
            manifest.version
        ))
        .into());
    }
    Ok(manifest)
}

fn read_body<'t, L: CodeLayout>(
    dir: &dyn Directory,
    manifest: &IndexManifest,
    flags: IoFlags,
) -> Result<IVFPQIndex<'t, L>, RetrieveError> {
    let bytes = dir.read_all(INDEX_FILE)?;
    let body: IndexBody = decode_envelope(INDEX_MAGIC, &bytes)?;

    if body.quantizer.dimension() != manifest.dimension as usize
        || body.invlists.ntotal() as u64 != manifest.total_vectors
    {
        return Err(PersistenceError::InvalidConfig(
            "index body does not match its manifest".to_string(),
        )
        .into());
    }

    let mut index = IVFPQIndex::<L>::from_parts(body.params, body.quantizer, body.pq, body.invlists)?;

    if !flags.contains(IoFlags::SKIP_PRECOMPUTE_TABLE) {
        index.restore_use_precomputed_table(UsageMode::from_i32(manifest.use_precomputed_table)?);
        index.precompute_table()?;
    }
    if flags.contains(IoFlags::READ_ONLY) {
        index.set_read_only(true);
    }
    Ok(index)
}

/// Store a precomputed table in `dir` under `path`.
pub fn write_precomputed_table(
    dir: &dyn Directory,
    path: &str,
    table: &AlignedTable,
) -> Result<(), RetrieveError> {
    let bytes = encode_envelope(TABLE_MAGIC, table)?;
    dir.atomic_write(path, &bytes)?;
    tracing::debug!(path, len = table.len(), "wrote precomputed table");
    Ok(())
}

/// Read a table written by [`write_precomputed_table`].
pub fn read_precomputed_table(dir: &dyn Directory, path: &str) -> Result<AlignedTable, RetrieveError> {
    let bytes = dir.read_all(path)?;
    Ok(decode_envelope(TABLE_MAGIC, &bytes)?)
}

/// An index loaded from disk, of whichever layout it was saved with.
#[derive(Debug)]
pub enum LoadedIndex<'t> {
    Standard(IVFPQIndex<'t, Standard>),
    FastScan(IVFPQIndex<'t, FastScan>),
}

macro_rules! dispatch {
    ($self:expr, $index:ident => $body:expr) => {
        match $self {
            LoadedIndex::Standard($index) => $body,
            LoadedIndex::FastScan($index) => $body,
        }
    };
}

impl<'t> LoadedIndex<'t> {
    pub fn index_type(&self) -> IndexType {
        match self {
            LoadedIndex::Standard(_) => IndexType::IvfPq,
            LoadedIndex::FastScan(_) => IndexType::IvfPqFastScan,
        }
    }

    pub fn as_standard(&self) -> Option<&IVFPQIndex<'t, Standard>> {
        match self {
            LoadedIndex::Standard(index) => Some(index),
            LoadedIndex::FastScan(_) => None,
        }
    }

    pub fn as_fast_scan(&self) -> Option<&IVFPQIndex<'t, FastScan>> {
        match self {
            LoadedIndex::FastScan(index) => Some(index),
            LoadedIndex::Standard(_) => None,
        }
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u32, f32)>, RetrieveError> {
        dispatch!(self, index => index.search(query, k))
    }

    pub fn search_batch(
        &self,
        queries: &[f32],
        num_queries: usize,
        k: usize,
    ) -> Result<Vec<Vec<(u32, f32)>>, RetrieveError> {
        dispatch!(self, index => index.search_batch(queries, num_queries, k))
    }

    pub fn add(&mut self, vectors: &[f32]) -> Result<(), RetrieveError> {
        dispatch!(self, index => index.add(vectors))
    }

    pub fn add_with_ids(&mut self, vectors: &[f32], ids: &[u32]) -> Result<(), RetrieveError> {
        dispatch!(self, index => index.add_with_ids(vectors, ids))
    }

    /// Build a fresh table for this index's quantizers without attaching it.
    pub fn build_precomputed_table(&self) -> Result<(UsageMode, AlignedTable), RetrieveError> {
        dispatch!(self, index => build_precomputed_table_with_limit(
            index.quantizer(),
            index.pq(),
            index.by_residual(),
            index.params().verbose,
            index.params().precomputed_table_max_bytes,
        ))
    }

    pub fn precompute_table(&mut self) -> Result<(), RetrieveError> {
        dispatch!(self, index => index.precompute_table())
    }

    pub fn set_precomputed_table(
        &mut self,
        table: &'t AlignedTable,
        mode: UsageMode,
    ) -> Result<(), RetrieveError> {
        dispatch!(self, index => index.set_precomputed_table(table, mode))
    }

    pub fn precomputed_table(&self) -> Option<&AlignedTable> {
        dispatch!(self, index => index.precomputed_table())
    }

    pub fn use_precomputed_table(&self) -> UsageMode {
        dispatch!(self, index => index.use_precomputed_table())
    }

    pub fn owns_precomputed_table(&self) -> bool {
        dispatch!(self, index => index.owns_precomputed_table())
    }

    pub fn set_nprobe(&mut self, nprobe: usize) -> Result<(), RetrieveError> {
        dispatch!(self, index => index.set_nprobe(nprobe))
    }

    pub fn ntotal(&self) -> usize {
        dispatch!(self, index => index.ntotal())
    }

    pub fn dimension(&self) -> usize {
        dispatch!(self, index => index.dimension())
    }

    pub fn metric(&self) -> MetricType {
        dispatch!(self, index => index.metric())
    }

    pub fn is_read_only(&self) -> bool {
        dispatch!(self, index => index.is_read_only())
    }
}

impl<'t> From<IVFPQIndex<'t, Standard>> for LoadedIndex<'t> {
    fn from(index: IVFPQIndex<'t, Standard>) -> Self {
        LoadedIndex::Standard(index)
    }
}

impl<'t> From<IVFPQIndex<'t, FastScan>> for LoadedIndex<'t> {
    fn from(index: IVFPQIndex<'t, FastScan>) -> Self {
        LoadedIndex::FastScan(index)
    }
}
