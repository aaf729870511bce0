//! Bounded worker pool for external commands
//!
//! A build step that needs to run an external command does not block the
//! scheduling loop: it returns a [`ThreadedCommand`] and the pool executes
//! it on one of a fixed number of worker threads. Completions come back on
//! a shared channel, at which point the owning step's `finalize` runs. A
//! step can also hand the pool an arbitrary asynchronous [`WaitHandle`],
//! which joins the same completion stream.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Parallelism override honored when no explicit job count is configured
pub const JOBS_ENV_VAR: &str = "WERK_JOBS";

/// An external command plus execution options, issued by a build step and
/// owned by the pool until the underlying process exits
#[derive(Debug, Clone)]
pub struct ThreadedCommand {
    argv: Vec<String>,
    env: Vec<(String, String)>,
    stdout_to: Option<PathBuf>,
    description: String,
}

impl ThreadedCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        let description = argv.join(" ");
        Self {
            argv,
            env: Vec::new(),
            stdout_to: None,
            description,
        }
    }

    /// Add an environment-variable override for the child process
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Redirect the child's standard output to a file
    pub fn stdout_to<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    /// Short human-readable description used for progress display
    pub fn describe<S: Into<String>>(mut self, text: S) -> Self {
        self.description = text.into();
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Replayable command line for failure reports
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Exit information handed to a build step's `finalize`
#[derive(Debug, Clone)]
pub struct CommandStatus {
    pub exit_code: i32,
    /// The command line that ran, for failure replay
    pub command_line: String,
}

impl CommandStatus {
    pub fn new(exit_code: i32, command_line: impl Into<String>) -> Self {
        Self {
            exit_code,
            command_line: command_line.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Receiving side of an arbitrary asynchronous completion
///
/// Lets a build step adopt work it did not run itself, e.g. a delegated
/// sub-invocation: the completer side resolves the handle, and the pool
/// reports it like any finished command.
pub struct WaitHandle {
    rx: Receiver<CommandStatus>,
}

/// Resolving side of a [`WaitHandle`]
pub struct WaitCompleter {
    tx: Sender<CommandStatus>,
}

impl WaitHandle {
    pub fn pair() -> (WaitCompleter, WaitHandle) {
        let (tx, rx) = bounded(1);
        (WaitCompleter { tx }, WaitHandle { rx })
    }

    /// Block until the handle resolves
    pub fn wait(self) -> Result<CommandStatus> {
        self.rx
            .recv()
            .context("wait handle was dropped without completing")
    }
}

impl WaitCompleter {
    pub fn complete(self, status: CommandStatus) {
        // The handle side may already be gone; nothing to report then
        let _ = self.tx.send(status);
    }
}

struct WorkItem {
    job_id: u64,
    cmd: ThreadedCommand,
}

/// A finished unit of asynchronous work
pub struct Completion {
    pub job_id: u64,
    pub status: CommandStatus,
}

/// Fixed-size pool of worker threads executing [`ThreadedCommand`]s
pub struct WorkerPool {
    work_tx: Option<Sender<WorkItem>>,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    workers: Vec<JoinHandle<()>>,
    in_flight: usize,
}

impl WorkerPool {
    /// Spawn `jobs` workers over a bounded work channel
    pub fn new(jobs: usize) -> Self {
        let jobs = jobs.max(1);
        let (work_tx, work_rx) = bounded::<WorkItem>(jobs);
        let (done_tx, done_rx) = unbounded::<Completion>();

        let mut workers = Vec::with_capacity(jobs);
        for worker in 0..jobs {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            workers.push(thread::spawn(move || {
                // Exits when the pool drops its sender
                while let Ok(item) = work_rx.recv() {
                    debug!(worker, job_id = item.job_id, "worker picked up command");
                    let status = run_command(&item.cmd);
                    if done_tx
                        .send(Completion {
                            job_id: item.job_id,
                            status,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        Self {
            work_tx: Some(work_tx),
            done_tx,
            done_rx,
            workers,
            in_flight: 0,
        }
    }

    /// Default parallelism: `WERK_JOBS` override, else detected CPU count
    pub fn default_jobs() -> usize {
        std::env::var(JOBS_ENV_VAR)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(num_cpus::get)
    }

    /// Hand a command to a worker; blocks only when every worker is busy
    /// and the work queue is full
    pub fn dispatch(&mut self, job_id: u64, cmd: ThreadedCommand) -> Result<()> {
        info!(job_id, description = cmd.description(), "running");
        self.work_tx
            .as_ref()
            .context("worker pool is shut down")?
            .send(WorkItem { job_id, cmd })
            .context("worker pool is shut down")?;
        self.in_flight += 1;
        Ok(())
    }

    /// Adopt an external completion into the pool's completion stream
    pub fn adopt(&mut self, job_id: u64, handle: WaitHandle) {
        let done_tx = self.done_tx.clone();
        self.workers.push(thread::spawn(move || {
            let status = match handle.wait() {
                Ok(status) => status,
                // Completer dropped without resolving: report failure
                Err(_) => CommandStatus::new(-1, "<abandoned wait handle>"),
            };
            let _ = done_tx.send(Completion { job_id, status });
        }));
        self.in_flight += 1;
    }

    /// Block until at least one dispatched unit of work finishes
    pub fn wait_any(&mut self) -> Result<Completion> {
        let completion = self
            .done_rx
            .recv()
            .context("worker pool completion channel closed")?;
        self.in_flight -= 1;
        Ok(completion)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Close the work channel so idle workers exit, then join them
        self.work_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_command(cmd: &ThreadedCommand) -> CommandStatus {
    let command_line = cmd.command_line();

    let Some(program) = cmd.argv.first() else {
        warn!("threaded command has an empty argument vector");
        return CommandStatus::new(-1, command_line);
    };

    let mut child = Command::new(program);
    child.args(&cmd.argv[1..]);
    for (key, value) in &cmd.env {
        child.env(key, value);
    }

    if let Some(path) = &cmd.stdout_to {
        match File::create(path) {
            Ok(file) => {
                child.stdout(Stdio::from(file));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot redirect stdout");
                return CommandStatus::new(-1, command_line);
            }
        }
    }

    match child.status() {
        Ok(status) => {
            let exit_code = status.code().unwrap_or(-1);
            debug!(exit_code, command = %command_line, "command finished");
            CommandStatus::new(exit_code, command_line)
        }
        Err(e) => {
            warn!(command = %command_line, error = %e, "failed to spawn command");
            CommandStatus::new(127, command_line)
        }
    }
}
