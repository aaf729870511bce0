//! Content digests for staleness detection
//!
//! Checksums are SHA-256 over file contents, hex-encoded. A small
//! same-process cache avoids re-hashing a file that appears as a dependency
//! of many targets within one invocation.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Hash a byte slice, hex-encoded
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash a file's contents, hex-encoded
pub fn checksum_file(path: &Path) -> Result<String> {
    let content =
        fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;
    Ok(checksum_bytes(&content))
}

/// Same-process checksum cache
///
/// Finalizing workers hash dependencies concurrently, so the map sits behind
/// a mutex. Entries must be invalidated for targets rewritten during the
/// current invocation.
#[derive(Debug, Default)]
pub struct ChecksumCache {
    entries: Mutex<HashMap<PathBuf, String>>,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum of the file at `path`, hashed at most once per invocation
    pub fn checksum(&self, path: &Path) -> Result<String> {
        if let Some(sum) = self.entries.lock().unwrap().get(path) {
            return Ok(sum.clone());
        }
        let sum = checksum_file(path)?;
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), sum.clone());
        Ok(sum)
    }

    /// Drop the cached entry for a file that was just rewritten
    pub fn invalidate(&self, path: &Path) {
        self.entries.lock().unwrap().remove(path);
    }
}
