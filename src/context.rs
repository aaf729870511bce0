//! Build context: the façade that drives a build to quiescence
//!
//! A context owns one variable scope, the step registry, and the shared
//! fingerprint cache, and turns registered jobs into a dependency-ordered,
//! bounded-parallel execution. Deriving a context yields a cheap variant
//! configuration: the scope chains copy-on-write onto the parent's, the
//! registry and cache are shared, and the job set starts empty.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::cache::{FingerprintCache, StalenessOptions};
use crate::checksum::checksum_bytes;
use crate::config::EngineConfig;
use crate::error::BuildError;
use crate::graph::{BuildGraph, Job, Schedule};
use crate::runtime::{Completion, WorkerPool};
use crate::step::{BuildStep, FinalOutcome, StepContext, StepOutcome, StepRegistry};
use crate::target::Target;
use crate::vars::{Scope, Value, VarMap};

/// Pseudo-variable holding the resolved target path
pub const TARGET_VAR: &str = "TARGET";
/// Pseudo-variable holding the resolved source paths
pub const SOURCES_VAR: &str = "SOURCES";

/// One unit of build configuration and the engine driving it
pub struct BuildContext {
    scope: Scope,
    registry: StepRegistry,
    cache: Arc<Mutex<FingerprintCache>>,
    config: EngineConfig,
    /// Jobs grouped by barrier epoch; the last entry is open for registration
    epochs: Vec<Vec<Job>>,
    user_deps: HashMap<Target, Vec<Target>>,
    /// (side-effect file, producing target)
    side_effects: Vec<(Target, Target)>,
    next_job_id: u64,
}

// Per-job state computed at scheduling time
struct JobWork {
    scope: Scope,
    /// The job's target plus its declared side-effect files
    targets: Vec<Target>,
    user_deps: Vec<Target>,
    identity: String,
}

// A job whose command is running on the worker pool
struct InFlight {
    job: Job,
    ctx: StepContext,
}

impl BuildContext {
    pub fn new(config: EngineConfig) -> Self {
        let cache = Arc::new(Mutex::new(FingerprintCache::load(&config.cache_file)));
        Self::with_cache(config, cache)
    }

    /// Construct a context around an existing shared cache instance
    pub fn with_cache(config: EngineConfig, cache: Arc<Mutex<FingerprintCache>>) -> Self {
        Self {
            scope: Scope::new(),
            registry: StepRegistry::new(),
            cache,
            config,
            epochs: vec![Vec::new()],
            user_deps: HashMap::new(),
            side_effects: Vec::new(),
            next_job_id: 0,
        }
    }

    /// The context's root variable scope
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The cache shared by every context of this build
    pub fn cache(&self) -> &Arc<Mutex<FingerprintCache>> {
        &self.cache
    }

    pub fn register_step<S: Into<String>>(&mut self, name: S, step: Arc<dyn BuildStep>) {
        self.registry.register(name, step);
    }

    /// Make `alias` resolve to an already-registered step
    pub fn register_alias(&mut self, alias: &str, name: &str) -> Result<()> {
        self.registry.register_alias(alias, name)
    }

    /// Register one invocation of a build step against a target
    ///
    /// The step name is resolved now; an unknown name is fatal here rather
    /// than at build time.
    pub fn register_job(
        &mut self,
        step_name: &str,
        target: Target,
        sources: Vec<Target>,
        overrides: VarMap,
    ) -> Result<()> {
        let step = self.registry.get(step_name)?;
        let job = Job {
            id: self.next_job_id,
            target,
            step,
            step_name: step_name.to_string(),
            sources,
            overrides,
        };
        self.next_job_id += 1;
        self.epochs
            .last_mut()
            .expect("an epoch is always open")
            .push(job);
        Ok(())
    }

    /// Declare extra dependencies for a target beyond its source list
    pub fn depends_on(&mut self, target: Target, deps: Vec<Target>) {
        self.user_deps.entry(target).or_default().extend(deps);
    }

    /// Declare that building `target` also creates `effect`
    pub fn produces(&mut self, target: Target, effect: Target) {
        self.side_effects.push((effect, target));
    }

    /// All jobs registered before this point must complete before any job
    /// registered after it may start, regardless of dependency analysis
    pub fn barrier(&mut self) {
        if !self.epochs.last().is_some_and(Vec::is_empty) {
            self.epochs.push(Vec::new());
        }
    }

    /// A variant configuration: copy-on-write scope, shared registry and
    /// cache, empty job set
    pub fn derive(&self) -> BuildContext {
        BuildContext {
            scope: self.scope.derive(VarMap::new()),
            registry: self.registry.clone(),
            cache: Arc::clone(&self.cache),
            config: self.config.clone(),
            epochs: vec![Vec::new()],
            user_deps: HashMap::new(),
            side_effects: Vec::new(),
            next_job_id: 0,
        }
    }

    /// Drive every registered job to completion
    ///
    /// Pulls ready jobs up to the configured parallelism, dispatches their
    /// commands to the worker pool, finalizes completions, and drains each
    /// barrier epoch fully before admitting the next. A failing job stops
    /// its dependents but independent branches keep building; failures are
    /// reported in aggregate once in-flight work drains.
    pub fn process(&mut self) -> Result<()> {
        let max_jobs = self.config.jobs();
        let mut pool = WorkerPool::new(max_jobs);
        let epochs = std::mem::replace(&mut self.epochs, vec![Vec::new()]);
        let mut failed: HashSet<Target> = HashSet::new();
        let mut failures: Vec<String> = Vec::new();

        debug!(jobs = max_jobs, epochs = epochs.len(), "starting build");

        let mut fatal = None;
        for jobs in epochs {
            // A failed wave stops later epochs entirely
            if !failures.is_empty() {
                break;
            }
            if let Err(e) = self.process_epoch(jobs, &mut pool, max_jobs, &mut failed, &mut failures)
            {
                fatal = Some(e);
                break;
            }
        }

        // Jobs that completed before an abort keep their records
        self.cache.lock().unwrap().save()?;

        if let Some(e) = fatal {
            return Err(e);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BuildError::TargetsFailed { targets: failures }.into())
        }
    }

    fn process_epoch(
        &self,
        jobs: Vec<Job>,
        pool: &mut WorkerPool,
        max_jobs: usize,
        failed: &mut HashSet<Target>,
        failures: &mut Vec<String>,
    ) -> Result<()> {
        let mut graph = BuildGraph::new();
        for (target, deps) in &self.user_deps {
            graph.add_user_deps(target.clone(), deps.clone());
        }
        for (effect, producer) in &self.side_effects {
            graph.add_side_effect(effect.clone(), producer.clone());
        }
        for job in jobs {
            graph.insert(job);
        }
        debug!(pending = graph.len(), "processing epoch");

        let mut building: HashSet<Target> = HashSet::new();
        let mut awaiting: HashMap<u64, InFlight> = HashMap::new();

        loop {
            while building.len() < max_jobs {
                match graph.next_ready(&building, failed)? {
                    Schedule::Ready(job) => {
                        self.start_job(job, pool, &mut building, &mut awaiting, failed, failures)?;
                    }
                    Schedule::FailedDeps(job) => {
                        debug!(output = %job.target, "skipped: a dependency failed");
                        failed.insert(job.target.clone());
                    }
                    Schedule::Blocked | Schedule::Idle => break,
                }
            }

            if graph.is_empty() && pool.in_flight() == 0 {
                break;
            }

            if pool.in_flight() > 0 {
                let completion = pool.wait_any()?;
                self.finish_job(completion, &mut awaiting, &mut building, failed, failures)?;
            }
        }

        Ok(())
    }

    fn start_job(
        &self,
        job: Job,
        pool: &mut WorkerPool,
        building: &mut HashSet<Target>,
        awaiting: &mut HashMap<u64, InFlight>,
        failed: &mut HashSet<Target>,
        failures: &mut Vec<String>,
    ) -> Result<()> {
        let work = self.prepare(&job)?;

        let opts = StalenessOptions {
            strict_deps: self.config.strict_deps,
            explain: self.config.explain,
        };
        let fresh = self.cache.lock().unwrap().is_up_to_date(
            &work.targets,
            &work.identity,
            &job.sources,
            &work.user_deps,
            &opts,
        );
        if fresh {
            debug!(output = %job.target, "up to date");
            return Ok(());
        }

        let ctx = StepContext::new(
            job.target.clone(),
            job.sources.clone(),
            work.targets,
            work.user_deps,
            work.scope,
            Arc::clone(&self.cache),
            work.identity,
        );

        match job.step.run(&ctx)? {
            StepOutcome::Done => {
                ctx.register_build()?;
                debug!(output = %job.target, "built");
            }
            StepOutcome::Failed => {
                warn!(output = %job.target, "build step failed");
                failed.insert(job.target.clone());
                failures.push(job.target.to_string());
            }
            StepOutcome::Command(cmd) => {
                building.insert(job.target.clone());
                pool.dispatch(job.id, cmd)?;
                awaiting.insert(job.id, InFlight { job, ctx });
            }
            StepOutcome::Wait(handle) => {
                building.insert(job.target.clone());
                pool.adopt(job.id, handle);
                awaiting.insert(job.id, InFlight { job, ctx });
            }
        }

        Ok(())
    }

    fn finish_job(
        &self,
        completion: Completion,
        awaiting: &mut HashMap<u64, InFlight>,
        building: &mut HashSet<Target>,
        failed: &mut HashSet<Target>,
        failures: &mut Vec<String>,
    ) -> Result<()> {
        let Some(inflight) = awaiting.remove(&completion.job_id) else {
            warn!(job_id = completion.job_id, "completion for an unknown job");
            return Ok(());
        };
        building.remove(&inflight.job.target);

        let exit_code = completion.status.exit_code;
        let command_line = completion.status.command_line.clone();

        match inflight.job.step.finalize(&inflight.ctx, completion.status)? {
            FinalOutcome::Done => {
                inflight.ctx.register_build()?;
                debug!(output = %inflight.job.target, "built");
            }
            FinalOutcome::Failed => {
                warn!(
                    output = %inflight.job.target,
                    exit_code,
                    command = %command_line,
                    "build command failed"
                );
                failed.insert(inflight.job.target.clone());
                failures.push(inflight.job.target.to_string());
            }
        }

        Ok(())
    }

    fn prepare(&self, job: &Job) -> Result<JobWork> {
        let mut targets = vec![job.target.clone()];
        for (effect, producer) in &self.side_effects {
            if producer == &job.target {
                targets.push(effect.clone());
            }
        }

        let user_deps = self
            .user_deps
            .get(&job.target)
            .cloned()
            .unwrap_or_default();

        let mut extra = job.overrides.clone();
        extra.insert(TARGET_VAR.to_string(), Value::str(job.target.to_string()));
        extra.insert(
            SOURCES_VAR.to_string(),
            Value::list(job.sources.iter().map(|s| Value::str(s.to_string()))),
        );
        let scope = self.scope.derive(extra);

        let identity = self.command_identity(job, &scope)?;

        Ok(JobWork {
            scope,
            targets,
            user_deps,
            identity,
        })
    }

    // Hash of everything that determines the command this job would run:
    // the step, the target and source set, and each override as expanded
    // against the job scope. A flag change rebuilds even when no file
    // changed. Source order is left to the dependency comparison (exact
    // only under strict_deps), so it is hashed sorted here.
    fn command_identity(&self, job: &Job, scope: &Scope) -> Result<String> {
        let mut buf = String::new();
        buf.push_str(&job.step_name);
        buf.push('\n');
        buf.push_str(&job.target.cache_key());
        buf.push('\n');
        let mut sources: Vec<String> = job.sources.iter().map(Target::cache_key).collect();
        sources.sort();
        for source in sources {
            buf.push_str(&source);
            buf.push('\n');
        }

        let mut names: Vec<&String> = job.overrides.keys().collect();
        names.sort();
        for name in names {
            let expanded = scope.expand(&job.overrides[name], &VarMap::new())?;
            buf.push_str(name);
            buf.push('=');
            buf.push_str(&expanded.canonical_text());
            buf.push('\n');
        }

        Ok(checksum_bytes(buf.as_bytes()))
    }
}
