//! On-disk format for IVF-PQ indexes.
//!
//! # File Layout
//!
//! ```text
//! <index dir>
//! ├── manifest.json          # Index metadata, version, config
//! ├── index.bin              # Quantizers + inverted lists (envelope below)
//! └── precomputed_table.bin  # Optional, written only on request
//! ```
//!
//! The precomputed table is never part of `index.bin`: it is derived data and is
//! rebuilt at load time unless [`IoFlags::SKIP_PRECOMPUTE_TABLE`] is given.
//!
//! # Envelope
//!
//! Binary files share one envelope:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Magic (4B): "IVPQ" or "IVPT"            │
//! │ Format version (4B, LE)                 │
//! │ Payload length (8B, LE)                 │
//! │ Payload (postcard)                      │
//! │ CRC32 of payload (4B, LE)               │
//! └─────────────────────────────────────────┘
//! ```

use super::error::{PersistenceError, PersistenceResult};
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Magic bytes for index body files.
pub const INDEX_MAGIC: [u8; 4] = *b"IVPQ";

/// Magic bytes for standalone precomputed table files.
pub const TABLE_MAGIC: [u8; 4] = *b"IVPT";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8;
const FOOTER_LEN: usize = 4;

/// Index types supported by persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    /// Inverted File with Product Quantization
    IvfPq,
    /// IVF-PQ with packed 4-bit codes
    IvfPqFastScan,
}

/// Manifest for the index directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Format version
    pub version: u32,
    /// Index type
    pub index_type: IndexType,
    /// Vector dimension
    pub dimension: u32,
    /// Total vector count
    pub total_vectors: u64,
    /// Usage mode the index had when saved (`-1`, `0`, `1`)
    pub use_precomputed_table: i32,
    /// Index-specific configuration
    pub config: serde_json::Value,
    /// Creation timestamp (Unix seconds)
    pub created_at: u64,
}

/// Flags controlling how an index is read.
///
/// Combine with `|`:
///
/// ```
/// use ivfpq_share::persistence::IoFlags;
///
/// let flags = IoFlags::READ_ONLY | IoFlags::SKIP_PRECOMPUTE_TABLE;
/// assert!(flags.contains(IoFlags::SKIP_PRECOMPUTE_TABLE));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct IoFlags(u32);

impl IoFlags {
    pub const NONE: IoFlags = IoFlags(0);
    /// The loaded index rejects insertions.
    pub const READ_ONLY: IoFlags = IoFlags(1 << 0);
    /// Do not build the precomputed table; the caller attaches one later.
    pub const SKIP_PRECOMPUTE_TABLE: IoFlags = IoFlags(1 << 1);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: IoFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for IoFlags {
    type Output = IoFlags;

    fn bitor(self, rhs: IoFlags) -> IoFlags {
        IoFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoFlags {
    fn bitor_assign(&mut self, rhs: IoFlags) {
        self.0 |= rhs.0;
    }
}

/// Serialize `value` with postcard and wrap it in the checksummed envelope.
pub fn encode_envelope<T: Serialize>(magic: [u8; 4], value: &T) -> PersistenceResult<Vec<u8>> {
    let payload = postcard::to_allocvec(value)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + FOOTER_LEN);
    out.extend_from_slice(&magic);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(out)
}

/// Validate the envelope in `bytes` and deserialize its payload.
pub fn decode_envelope<T: for<'de> Deserialize<'de>>(
    magic: [u8; 4],
    bytes: &[u8],
) -> PersistenceResult<T> {
    if bytes.len() < HEADER_LEN + FOOTER_LEN {
        return Err(PersistenceError::Format(format!(
            "file too short: {} bytes",
            bytes.len()
        )));
    }
    let (header, rest) = bytes.split_at(HEADER_LEN);
    if header[..4] != magic {
        return Err(PersistenceError::Format(format!(
            "bad magic {:?}, expected {:?}",
            &header[..4],
            magic
        )));
    }
    let version = read_u32(&header[4..8]);
    if version != FORMAT_VERSION {
        return Err(PersistenceError::Format(format!(
            "unsupported format version {version}, expected {FORMAT_VERSION}"
        )));
    }
    let payload_len = read_u64(&header[8..16]) as usize;
    if payload_len.checked_add(FOOTER_LEN) != Some(rest.len()) {
        return Err(PersistenceError::Format(format!(
            "payload length {payload_len} does not match file size"
        )));
    }

    let (payload, footer) = rest.split_at(payload_len);
    let expected = read_u32(footer);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(PersistenceError::ChecksumMismatch { expected, actual });
    }

    postcard::from_bytes(payload)
        .map_err(|e| PersistenceError::Deserialization(format!("postcard error: {}", e)))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
