use std::fmt;
use std::path::{Path, PathBuf};

/// Reserved cache-key prefix for phony targets
///
/// A phony name is stored under this prefix so it can never collide with a
/// real file path in the fingerprint cache, even if a file with the same
/// name exists in the build tree.
pub const PHONY_KEY_PREFIX: &str = "phony:";

/// A named build product: either a real file or a phony (non-file) marker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// A file produced (or consumed) by the build
    File(PathBuf),
    /// A non-file marker such as "all" or "test"
    Phony(String),
}

impl Target {
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Target::File(path.into())
    }

    pub fn phony<S: Into<String>>(name: S) -> Self {
        Target::Phony(name.into())
    }

    pub fn is_phony(&self) -> bool {
        matches!(self, Target::Phony(_))
    }

    /// The on-disk path of a file target; `None` for phony targets
    pub fn path(&self) -> Option<&Path> {
        match self {
            Target::File(path) => Some(path),
            Target::Phony(_) => None,
        }
    }

    /// Key under which this target is stored in the fingerprint cache
    pub fn cache_key(&self) -> String {
        match self {
            Target::File(path) => path.to_string_lossy().into_owned(),
            Target::Phony(name) => format!("{PHONY_KEY_PREFIX}{name}"),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::File(path) => write!(f, "{}", path.display()),
            Target::Phony(name) => write!(f, "{name}"),
        }
    }
}

impl From<&str> for Target {
    fn from(path: &str) -> Self {
        Target::file(path)
    }
}

impl From<PathBuf> for Target {
    fn from(path: PathBuf) -> Self {
        Target::File(path)
    }
}
