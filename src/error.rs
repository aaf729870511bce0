use thiserror::Error;

/// Fatal engine errors
///
/// Staleness conditions (missing files, checksum mismatches, absent cache
/// records) are never errors; they just mean "rebuild" and are surfaced as
/// debug-level explanations. Everything here aborts the build.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("circular dependency detected involving target `{0}`")]
    CircularDependency(String),

    #[error("cannot expand value of unknown shape while substituting `{0}`")]
    UnknownVariableType(String),

    #[error("no build step registered under name `{0}`")]
    UnknownStep(String),

    #[error("build failed for {} target(s): {}", targets.len(), targets.join(", "))]
    TargetsFailed { targets: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_failed_lists_offenders() {
        let err = BuildError::TargetsFailed {
            targets: vec!["out/a.o".into(), "out/b.o".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 target(s)"));
        assert!(msg.contains("out/a.o"));
        assert!(msg.contains("out/b.o"));
    }
}
