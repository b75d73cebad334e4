//! Storage backends for index persistence.
//!
//! Everything under [`persistence`](crate::persistence) reads and writes whole files
//! through the [`Directory`] trait, with paths given relative to the directory root
//! and `/` as separator.
//!
//! - [`FsDirectory`]: a directory on the local filesystem. `atomic_write` stages to a
//!   temporary file and renames it into place.
//! - [`MemoryDirectory`]: an in-memory map, shared between clones. For tests.

use crate::persistence::error::{PersistenceError, PersistenceResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Whole-file storage used by index and table persistence.
pub trait Directory: Send + Sync {
    /// Read a whole file. Missing files are [`PersistenceError::NotFound`].
    fn read_all(&self, path: &str) -> PersistenceResult<Vec<u8>>;

    /// Replace `path` with `data` so readers see either the old or the new content.
    fn atomic_write(&self, path: &str, data: &[u8]) -> PersistenceResult<()>;
}

fn not_found(path: &str) -> PersistenceError {
    PersistenceError::NotFound(path.to_string())
}

// -----------------------------------------------------------------------------
// Filesystem
// -----------------------------------------------------------------------------

/// A directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Open `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Directory for FsDirectory {
    fn read_all(&self, path: &str) -> PersistenceResult<Vec<u8>> {
        match fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> PersistenceResult<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.resolve(&format!("{path}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(tmp, target)?;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Memory
// -----------------------------------------------------------------------------

/// In-memory directory. Clones share the same files.
#[derive(Debug, Default, Clone)]
pub struct MemoryDirectory {
    files: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for MemoryDirectory {
    fn read_all(&self, path: &str) -> PersistenceResult<Vec<u8>> {
        self.files
            .read()
            .get(path)
            .map(|data| data.as_ref().clone())
            .ok_or_else(|| not_found(path))
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> PersistenceResult<()> {
        self.files
            .write()
            .insert(path.to_string(), Arc::new(data.to_vec()));
        Ok(())
    }
}
