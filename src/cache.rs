//! Persistent fingerprint cache
//!
//! One JSON document per build tree records, for every target ever built,
//! the content checksum of its output, a hash of the exact command used to
//! build it, and the checksum of every dependency at build time. The next
//! invocation compares current state against these records to decide what is
//! stale. Directories created by the engine are recorded too, so a clean
//! operation can reverse exactly what the engine created.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::checksum::ChecksumCache;
use crate::target::Target;

/// Bumped whenever the on-disk document shape changes; a version mismatch
/// invalidates old caches and forces a rewrite on save.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// One dependency as it looked when the target was last built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepRecord {
    pub path: String,
    pub checksum: String,
}

/// Per-target build record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetRecord {
    /// Content checksum of the built target; empty for phony targets
    #[serde(default)]
    pub checksum: String,
    /// Hash identifying the exact command/configuration used
    pub command: String,
    #[serde(default)]
    pub deps: Vec<DepRecord>,
    #[serde(default)]
    pub user_deps: Vec<DepRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    targets: BTreeMap<String, TargetRecord>,
    #[serde(default)]
    directories: BTreeMap<String, bool>,
}

/// Knobs for a staleness check
#[derive(Debug, Clone, Copy, Default)]
pub struct StalenessOptions {
    /// Require the exact same ordered dependency list instead of the default
    /// subset comparison
    pub strict_deps: bool,
    /// Explain which condition failed via debug-level log events
    pub explain: bool,
}

/// The persisted fingerprint table plus the same-process checksum cache
///
/// A single instance is shared by the whole build; concurrent finalizers
/// serialize their writes through the mutex the owner wraps this in.
pub struct FingerprintCache {
    path: PathBuf,
    targets: BTreeMap<String, TargetRecord>,
    directories: BTreeMap<String, bool>,
    checksums: ChecksumCache,
    loaded_version: u32,
    dirty: bool,
}

impl FingerprintCache {
    /// Load the cache document at `path`
    ///
    /// A missing, unreadable, or malformed file is not fatal: the cache
    /// starts empty and a warning is emitted.
    pub fn load<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let (targets, directories, loaded_version) = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheDocument>(&bytes) {
                Ok(doc) if doc.version == CACHE_FORMAT_VERSION => {
                    (doc.targets, doc.directories, doc.version)
                }
                Ok(doc) => {
                    warn!(
                        path = %path.display(),
                        found = doc.version,
                        expected = CACHE_FORMAT_VERSION,
                        "fingerprint cache has a different format version, starting empty"
                    );
                    (BTreeMap::new(), BTreeMap::new(), doc.version)
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "fingerprint cache is corrupt, starting empty"
                    );
                    (BTreeMap::new(), BTreeMap::new(), 0)
                }
            },
            Err(_) => (BTreeMap::new(), BTreeMap::new(), CACHE_FORMAT_VERSION),
        };

        Self {
            path,
            targets,
            directories,
            checksums: ChecksumCache::new(),
            loaded_version,
            dirty: false,
        }
    }

    /// Whether every given target is up to date for the given command and
    /// dependency lists
    ///
    /// Staleness is never an error; with `explain` set the failing condition
    /// is reported as a debug event.
    pub fn is_up_to_date(
        &self,
        targets: &[Target],
        command: &str,
        deps: &[Target],
        user_deps: &[Target],
        opts: &StalenessOptions,
    ) -> bool {
        targets
            .iter()
            .all(|t| self.target_up_to_date(t, command, deps, user_deps, opts))
    }

    fn target_up_to_date(
        &self,
        target: &Target,
        command: &str,
        deps: &[Target],
        user_deps: &[Target],
        opts: &StalenessOptions,
    ) -> bool {
        let explain = |reason: &str| {
            if opts.explain {
                debug!(output = %target, reason, "target is stale");
            }
            false
        };

        let Some(record) = self.targets.get(&target.cache_key()) else {
            return explain("no cache record");
        };

        // Phony targets have no on-disk presence to verify
        if let Some(path) = target.path() {
            match self.checksums.checksum(path) {
                Ok(current) if current == record.checksum => {}
                Ok(_) => return explain("target content changed"),
                Err(_) => return explain("target missing on disk"),
            }
        }

        if record.command != command {
            return explain("build command changed");
        }

        if opts.strict_deps {
            let cached: Vec<&str> = record.deps.iter().map(|d| d.path.as_str()).collect();
            let current: Vec<String> = deps.iter().map(|d| d.cache_key()).collect();
            if cached.len() != current.len()
                || cached.iter().zip(&current).any(|(a, b)| *a != b.as_str())
            {
                return explain("dependency list changed");
            }
        } else {
            // Subset mode: the cached list may be a superset, e.g. from a
            // previously wider dependency list.
            for dep in deps {
                let key = dep.cache_key();
                if !record.deps.iter().any(|d| d.path == key) {
                    return explain("new dependency not present in cache record");
                }
            }
        }

        // User dependencies always compare as an exact ordered list
        let cached_user: Vec<&str> = record.user_deps.iter().map(|d| d.path.as_str()).collect();
        let current_user: Vec<String> = user_deps.iter().map(|d| d.cache_key()).collect();
        if cached_user.len() != current_user.len()
            || cached_user.iter().zip(&current_user).any(|(a, b)| *a != b.as_str())
        {
            return explain("user dependency list changed");
        }

        // Every cached dependency must still have its recorded checksum.
        // This is what rebuilds from a changed header even though the
        // target's own content is unchanged.
        for dep in record.deps.iter().chain(record.user_deps.iter()) {
            if !self.dep_checksum_current(dep) {
                return explain("dependency content changed");
            }
        }

        true
    }

    fn dep_checksum_current(&self, dep: &DepRecord) -> bool {
        // Phony dependencies carry an empty checksum and are always current
        if dep.checksum.is_empty() {
            return true;
        }
        match self.checksums.checksum(Path::new(&dep.path)) {
            Ok(current) => current == dep.checksum,
            Err(_) => false,
        }
    }

    /// Record a successful build, replacing any prior record for each target
    pub fn register_build(
        &mut self,
        targets: &[Target],
        command: &str,
        deps: &[Target],
        user_deps: &[Target],
    ) -> Result<()> {
        let deps = self.dep_records(deps)?;
        let user_deps = self.dep_records(user_deps)?;

        for target in targets {
            let checksum = match target.path() {
                Some(path) => {
                    // The build just rewrote this file
                    self.checksums.invalidate(path);
                    self.checksums
                        .checksum(path)
                        .with_context(|| format!("Failed to checksum built target: {target}"))?
                }
                None => String::new(),
            };

            self.targets.insert(
                target.cache_key(),
                TargetRecord {
                    checksum,
                    command: command.to_string(),
                    deps: deps.clone(),
                    user_deps: user_deps.clone(),
                },
            );
        }

        self.dirty = true;
        Ok(())
    }

    fn dep_records(&self, deps: &[Target]) -> Result<Vec<DepRecord>> {
        deps.iter()
            .map(|dep| {
                let checksum = match dep.path() {
                    Some(path) => self
                        .checksums
                        .checksum(path)
                        .with_context(|| format!("Failed to checksum dependency: {dep}"))?,
                    None => String::new(),
                };
                Ok(DepRecord {
                    path: dep.cache_key(),
                    checksum,
                })
            })
            .collect()
    }

    /// Create `path` (and intermediate levels), recording each level this
    /// call actually created
    pub fn record_directory(&mut self, path: &Path) -> Result<()> {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component.as_os_str());
            if matches!(component, Component::RootDir | Component::Prefix(_)) {
                continue;
            }
            if !current.exists() {
                fs::create_dir(&current).with_context(|| {
                    format!("Failed to create directory: {}", current.display())
                })?;
                self.directories
                    .insert(current.to_string_lossy().into_owned(), true);
                self.dirty = true;
            }
        }
        Ok(())
    }

    /// Directories the engine created, deepest first
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.directories.keys().map(PathBuf::from).collect();
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        dirs
    }

    /// Remove recorded directories that are still empty, forgetting each one
    /// that was removed
    pub fn remove_recorded_directories(&mut self) -> Result<()> {
        for dir in self.directories() {
            let empty = match fs::read_dir(&dir) {
                Ok(mut entries) => entries.next().is_none(),
                // Already gone; just forget it
                Err(_) => true,
            };
            if empty {
                if dir.exists() {
                    fs::remove_dir(&dir).with_context(|| {
                        format!("Failed to remove directory: {}", dir.display())
                    })?;
                }
                self.directories.remove(&dir.to_string_lossy().into_owned());
                self.dirty = true;
            }
        }
        Ok(())
    }

    /// Shared checksum cache for this invocation
    pub fn checksums(&self) -> &ChecksumCache {
        &self.checksums
    }

    /// Forget the record for a target (used by tests and clean operations)
    pub fn forget(&mut self, target: &Target) {
        if self.targets.remove(&target.cache_key()).is_some() {
            self.dirty = true;
        }
    }

    pub fn record(&self, target: &Target) -> Option<&TargetRecord> {
        self.targets.get(&target.cache_key())
    }

    /// Persist the cache document if anything changed or the loaded version
    /// differs from the running engine's, writing atomically
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty && self.loaded_version == CACHE_FORMAT_VERSION {
            return Ok(());
        }

        let doc = CacheDocument {
            version: CACHE_FORMAT_VERSION,
            targets: self.targets.clone(),
            directories: self.directories.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc).context("Failed to serialize cache")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create cache directory")?;
            }
        }

        // Write to a temp file then rename so a crash never leaves a
        // truncated document.
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).context("Failed to create temp file")?;
        file.write_all(&bytes).context("Failed to write cache")?;
        file.sync_all().context("Failed to sync cache file")?;
        fs::rename(&temp_path, &self.path).context("Failed to rename cache file")?;

        self.loaded_version = CACHE_FORMAT_VERSION;
        self.dirty = false;
        debug!(path = %self.path.display(), targets = doc.targets.len(), "fingerprint cache saved");
        Ok(())
    }
}
