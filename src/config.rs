use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::runtime::WorkerPool;

/// Engine configuration (loaded from a TOML file or built in code)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker thread count; `None` falls back to `WERK_JOBS`, then the
    /// detected CPU count
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Fingerprint cache file, relative to the build root
    #[serde(default = "default_cache_file")]
    pub cache_file: String,

    /// Compare dependency lists as exact ordered sequences instead of the
    /// default subset comparison
    #[serde(default)]
    pub strict_deps: bool,

    /// Explain staleness decisions via debug-level log events
    #[serde(default)]
    pub explain: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            cache_file: default_cache_file(),
            strict_deps: false,
            explain: false,
        }
    }
}

fn default_cache_file() -> String {
    ".werk/fingerprints.json".to_string()
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Resolved worker parallelism, always at least one
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(WorkerPool::default_jobs).max(1)
    }
}
