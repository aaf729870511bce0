//! Build graph and ready-queue scheduler
//!
//! Tracks the pending build jobs per target and hands the driving loop the
//! next job whose dependencies are satisfied. A dependency blocks a job
//! while it is still building, still pending, or a declared side effect of
//! some pending or building target. If the graph is non-empty, nothing is
//! building, and nothing is ready, the graph contains a cycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::BuildError;
use crate::step::BuildStep;
use crate::target::Target;
use crate::vars::VarMap;

/// One registered invocation of a build step, consumed exactly once
pub struct Job {
    pub id: u64,
    pub target: Target,
    pub step: Arc<dyn BuildStep>,
    /// Name the step was registered under; part of the command identity
    pub step_name: String,
    pub sources: Vec<Target>,
    pub overrides: VarMap,
}

/// What the scheduler found on one scan
pub enum Schedule {
    /// This job's dependencies are all satisfied
    Ready(Job),
    /// This job was dropped because a dependency failed
    FailedDeps(Job),
    /// Nothing is ready, but in-flight work may unblock the graph
    Blocked,
    /// The graph is empty
    Idle,
}

#[derive(Default)]
pub struct BuildGraph {
    /// Pending targets in registration order
    order: VecDeque<Target>,
    /// Pending jobs per target; multiple jobs per target run in order
    pending: HashMap<Target, VecDeque<Job>>,
    /// Extra dependencies declared outside any job's source list
    user_deps: HashMap<Target, Vec<Target>>,
    /// Side-effect file -> the target whose job produces it
    side_effects: HashMap<Target, Target>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) {
        let queue = self.pending.entry(job.target.clone()).or_default();
        if queue.is_empty() {
            self.order.push_back(job.target.clone());
        }
        queue.push_back(job);
    }

    pub fn add_user_deps(&mut self, target: Target, deps: Vec<Target>) {
        self.user_deps.entry(target).or_default().extend(deps);
    }

    /// Declare that building `producer` also creates `effect`
    pub fn add_side_effect(&mut self, effect: Target, producer: Target) {
        self.side_effects.insert(effect, producer);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Find the next job whose dependencies are all satisfied
    ///
    /// `building` holds the targets currently in flight; `failed` holds
    /// targets whose job failed (directly or transitively). A job with a
    /// failed dependency is popped and returned as `FailedDeps` so the
    /// caller can record the cascade. If the graph cannot make progress
    /// while nothing is building, that is a circular dependency.
    pub fn next_ready(
        &mut self,
        building: &HashSet<Target>,
        failed: &HashSet<Target>,
    ) -> Result<Schedule, BuildError> {
        if self.pending.is_empty() {
            return Ok(Schedule::Idle);
        }

        let scan: Vec<Target> = self.order.iter().cloned().collect();
        for target in scan {
            // Jobs for one target run strictly in registration order
            if building.contains(&target) {
                continue;
            }

            let deps = self.job_deps(&target);

            if deps.iter().any(|dep| failed.contains(dep)) || failed.contains(&target) {
                return Ok(Schedule::FailedDeps(self.pop(&target)));
            }

            if deps.iter().any(|dep| self.dep_busy(dep, building)) {
                continue;
            }

            return Ok(Schedule::Ready(self.pop(&target)));
        }

        if building.is_empty() {
            let offender = self
                .order
                .front()
                .map(|t| t.to_string())
                .unwrap_or_default();
            return Err(BuildError::CircularDependency(offender));
        }

        Ok(Schedule::Blocked)
    }

    // Static sources of the target's first pending job plus its declared
    // user dependencies.
    fn job_deps(&self, target: &Target) -> Vec<Target> {
        let mut deps: Vec<Target> = self
            .pending
            .get(target)
            .and_then(|jobs| jobs.front())
            .map(|job| job.sources.clone())
            .unwrap_or_default();
        if let Some(user) = self.user_deps.get(target) {
            deps.extend(user.iter().cloned());
        }
        deps
    }

    fn dep_busy(&self, dep: &Target, building: &HashSet<Target>) -> bool {
        if building.contains(dep) || self.pending.contains_key(dep) {
            return true;
        }

        // A declared side effect is not independently buildable; it blocks
        // consumers until its producer completes.
        if let Some(producer) = self.side_effects.get(dep) {
            if building.contains(producer) || self.pending.contains_key(producer) {
                return true;
            }
        }

        // Steps may produce files whose names are only known after
        // expansion; ask each pending job whether this dependency is one.
        for (target, jobs) in &self.pending {
            if jobs
                .front()
                .is_some_and(|job| job.step.produces_target(target, dep))
            {
                return true;
            }
        }

        false
    }

    fn pop(&mut self, target: &Target) -> Job {
        let queue = self.pending.get_mut(target).expect("target is pending");
        let job = queue.pop_front().expect("target has a pending job");
        if queue.is_empty() {
            self.pending.remove(target);
            self.order.retain(|t| t != target);
        }
        job
    }
}
