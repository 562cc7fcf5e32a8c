// elspeth-landscape/src/payload.rs
// ============================================================================
// Module: Landscape Payload Store
// Description: Content-addressed filesystem store for full payloads.
// Purpose: Keep large request/response/row payloads out of the audit rows.
// Dependencies: elspeth-core
// ============================================================================

//! ## Overview
//! Audit rows store only hashes; the bytes behind them live here, sharded by
//! hash prefix (`ab/cd/<hash>`). Writes are idempotent because the address
//! is the content hash. A retention purge deletes payload files but never
//! touches the referencing hash in the audit row; readers treat a missing
//! payload as "purged", which replay surfaces as a typed error instead of
//! fabricating data.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use elspeth_core::PayloadStore;
use elspeth_core::PayloadStoreError;

// ============================================================================
// SECTION: Filesystem Store
// ============================================================================

/// Content-addressed payload store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FilesystemPayloadStore {
    /// Root directory of the sharded hierarchy.
    root: PathBuf,
}

impl FilesystemPayloadStore {
    /// Opens (creating if needed) a payload store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError::Io`] when the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PayloadStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        Ok(Self {
            root,
        })
    }

    /// Sharded path for a hash: `root/ab/cd/<hash>`.
    fn shard_path(&self, hash: &str) -> PathBuf {
        let first = hash.get(0..2).unwrap_or("00");
        let second = hash.get(2..4).unwrap_or("00");
        self.root.join(first).join(second).join(hash)
    }

    /// Deletes payloads last modified before `cutoff`.
    ///
    /// Returns the number of payloads removed. Audit rows keep their hashes;
    /// a later read of a purged payload yields `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadStoreError::Io`] when the walk or deletion fails.
    pub fn purge_older_than(&self, cutoff: SystemTime) -> Result<u64, PayloadStoreError> {
        let mut removed = 0;
        for shard in read_dirs(&self.root)? {
            for subshard in read_dirs(&shard)? {
                for entry in
                    fs::read_dir(&subshard).map_err(|err| PayloadStoreError::Io(err.to_string()))?
                {
                    let entry = entry.map_err(|err| PayloadStoreError::Io(err.to_string()))?;
                    let metadata =
                        entry.metadata().map_err(|err| PayloadStoreError::Io(err.to_string()))?;
                    let modified = metadata
                        .modified()
                        .map_err(|err| PayloadStoreError::Io(err.to_string()))?;
                    if modified < cutoff {
                        fs::remove_file(entry.path())
                            .map_err(|err| PayloadStoreError::Io(err.to_string()))?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Lists subdirectories of a directory, tolerating absence.
fn read_dirs(path: &Path) -> Result<Vec<PathBuf>, PayloadStoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path).map_err(|err| PayloadStoreError::Io(err.to_string()))? {
        let entry = entry.map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

impl PayloadStore for FilesystemPayloadStore {
    fn put(&self, hash: &str, bytes: &[u8]) -> Result<(), PayloadStoreError> {
        let path = self.shard_path(hash);
        if path.exists() {
            // Same hash, same bytes: idempotent write.
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        let mut file =
            fs::File::create(&tmp).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        file.write_all(bytes).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        file.sync_all().map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        fs::rename(&tmp, &path).map_err(|err| PayloadStoreError::Io(err.to_string()))?;
        Ok(())
    }

    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, PayloadStoreError> {
        let path = self.shard_path(hash);
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path).map(Some).map_err(|err| PayloadStoreError::Io(err.to_string()))
    }

    fn contains(&self, hash: &str) -> Result<bool, PayloadStoreError> {
        Ok(self.shard_path(hash).exists())
    }
}
