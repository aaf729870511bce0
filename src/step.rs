//! Build-step plugin contract
//!
//! A build step knows how to produce one or more targets from sources. The
//! engine hands it a [`StepContext`] with the job's expanded scope and the
//! shared fingerprint cache; the step either completes synchronously or
//! returns a [`ThreadedCommand`] for the worker pool, in which case its
//! `finalize` runs once the command exits.

use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::cache::FingerprintCache;
use crate::error::BuildError;
use crate::runtime::{CommandStatus, ThreadedCommand, WaitHandle};
use crate::target::Target;
use crate::vars::{Scope, Value, VarMap};

/// Result of a build step's `run`
pub enum StepOutcome {
    /// The target was produced synchronously
    Done,
    /// The step failed; the target and its dependents will not build
    Failed,
    /// Run this command asynchronously and call `finalize` with its status
    Command(ThreadedCommand),
    /// Adopt an external completion (e.g. a delegated sub-invocation) and
    /// call `finalize` when it resolves
    Wait(WaitHandle),
}

/// Result of a build step's `finalize`
pub enum FinalOutcome {
    Done,
    Failed,
}

/// Everything a build step may consult while running one job
pub struct StepContext {
    target: Target,
    sources: Vec<Target>,
    /// The target plus its declared side-effect files
    targets: Vec<Target>,
    user_deps: Vec<Target>,
    scope: Scope,
    cache: Arc<Mutex<FingerprintCache>>,
    command: String,
}

impl StepContext {
    pub(crate) fn new(
        target: Target,
        sources: Vec<Target>,
        targets: Vec<Target>,
        user_deps: Vec<Target>,
        scope: Scope,
        cache: Arc<Mutex<FingerprintCache>>,
        command: String,
    ) -> Self {
        Self {
            target,
            sources,
            targets,
            user_deps,
            scope,
            cache,
            command,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn sources(&self) -> &[Target] {
        &self.sources
    }

    /// The job's scope, with `TARGET` and `SOURCES` already injected
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Hash identifying this job's exact command/configuration
    pub fn command_identity(&self) -> &str {
        &self.command
    }

    /// Expand a template against the job scope
    pub fn expand(&self, template: &Value) -> Result<Value> {
        self.scope.expand(template, &VarMap::new())
    }

    /// Expand a template into a flat argument vector
    pub fn expand_strings(&self, template: &Value) -> Result<Vec<String>> {
        self.expand(template)?.try_strings()
    }

    /// Record this job's build in the fingerprint cache
    ///
    /// The engine calls this itself on a successful outcome; steps only need
    /// it when registering extra targets of their own.
    pub fn register_build(&self) -> Result<()> {
        self.cache.lock().unwrap().register_build(
            &self.targets,
            &self.command,
            &self.sources,
            &self.user_deps,
        )
    }

    /// Create a directory tree, recording the levels the engine created
    pub fn record_directory(&self, path: &Path) -> Result<()> {
        self.cache.lock().unwrap().record_directory(path)
    }
}

/// A pluggable unit of work producing targets from sources
pub trait BuildStep: Send + Sync {
    /// Build the job's target, or hand back asynchronous work
    fn run(&self, ctx: &StepContext) -> Result<StepOutcome>;

    /// Called after a `Command`/`Wait` outcome completes
    fn finalize(&self, _ctx: &StepContext, status: CommandStatus) -> Result<FinalOutcome> {
        Ok(if status.success() {
            FinalOutcome::Done
        } else {
            FinalOutcome::Failed
        })
    }

    /// Whether building `target` also creates `path`, for files whose names
    /// are only known after expansion
    fn produces_target(&self, _target: &Target, _path: &Target) -> bool {
        false
    }
}

/// Explicit name-to-step registry
///
/// Steps are looked up once, when a job is registered; `register_alias`
/// makes one step value reachable under several names (e.g. a copy step
/// doubling as an install step).
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn BuildStep>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<String>>(&mut self, name: S, step: Arc<dyn BuildStep>) {
        self.steps.insert(name.into(), step);
    }

    /// Make `alias` resolve to the step registered under `name`
    pub fn register_alias(&mut self, alias: &str, name: &str) -> Result<()> {
        let step = self.get(name)?;
        self.steps.insert(alias.to_string(), step);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BuildStep>> {
        self.steps
            .get(name)
            .cloned()
            .ok_or_else(|| BuildError::UnknownStep(name.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopStep;

    impl BuildStep for NoopStep {
        fn run(&self, _ctx: &StepContext) -> Result<StepOutcome> {
            Ok(StepOutcome::Done)
        }
    }

    #[test]
    fn registry_resolves_aliases_to_the_same_step() {
        let mut registry = StepRegistry::new();
        registry.register("copy", Arc::new(NoopStep));
        registry.register_alias("install", "copy").unwrap();

        let copy = registry.get("copy").unwrap();
        let install = registry.get("install").unwrap();
        assert!(Arc::ptr_eq(&copy, &install));
    }

    #[test]
    fn unknown_step_name_is_fatal() {
        let registry = StepRegistry::new();
        let err = registry.get("link").err().unwrap();
        assert!(err.to_string().contains("no build step registered"));

        let mut registry = StepRegistry::new();
        assert!(registry.register_alias("install", "copy").is_err());
    }

    #[test]
    fn default_finalize_maps_exit_status() {
        let step = NoopStep;
        let ctx = StepContext::new(
            Target::phony("t"),
            vec![],
            vec![Target::phony("t")],
            vec![],
            Scope::new(),
            Arc::new(Mutex::new(FingerprintCache::load("unused.json"))),
            "cmd".to_string(),
        );

        assert!(matches!(
            step.finalize(&ctx, CommandStatus::new(0, "x")).unwrap(),
            FinalOutcome::Done
        ));
        assert!(matches!(
            step.finalize(&ctx, CommandStatus::new(2, "x")).unwrap(),
            FinalOutcome::Failed
        ));
    }
}
