//! End-to-end engine scenarios
//!
//! Each test drives a full BuildContext against a temp directory, across
//! several invocations where the scenario calls for it (a new context per
//! invocation, sharing the same on-disk cache file).

use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

use werk::runtime::WaitHandle;
use werk::{
    BuildContext, BuildStep, CommandStatus, EngineConfig, FinalOutcome, StepContext, StepOutcome,
    Target, ThreadedCommand, Value, VarMap,
};

/// Copies the first source to the target, counting invocations
struct CopyStep {
    runs: Arc<AtomicUsize>,
}

impl BuildStep for CopyStep {
    fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let src = ctx.sources()[0].path().expect("copy source is a file");
        let dst = ctx.target().path().expect("copy target is a file");
        fs::copy(src, dst)?;
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutcome::Done)
    }
}

/// Writes declared files and appends events, for ordering assertions
struct TouchStep {
    events: Arc<Mutex<Vec<String>>>,
    writes: Vec<PathBuf>,
}

impl BuildStep for TouchStep {
    fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        for path in &self.writes {
            fs::write(path, ctx.target().to_string())?;
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("run {}", ctx.target()));
        Ok(StepOutcome::Done)
    }
}

/// Sleeps on a worker thread; records start and end of every job
struct SleepStep {
    events: Arc<Mutex<Vec<String>>>,
}

impl BuildStep for SleepStep {
    fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        self.events
            .lock()
            .unwrap()
            .push(format!("start {}", ctx.target()));
        let cmd = ThreadedCommand::new(["sh", "-c", "sleep 0.05"])
            .describe(format!("sleep for {}", ctx.target()));
        Ok(StepOutcome::Command(cmd))
    }

    fn finalize(&self, ctx: &StepContext, status: CommandStatus) -> Result<FinalOutcome> {
        self.events
            .lock()
            .unwrap()
            .push(format!("end {}", ctx.target()));
        Ok(if status.success() {
            FinalOutcome::Done
        } else {
            FinalOutcome::Failed
        })
    }
}

/// Runs a shell command expanded from the job's `CMD` override
struct ShellStep;

impl BuildStep for ShellStep {
    fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let script = ctx.expand_strings(&Value::str("${CMD}"))?;
        let mut argv = vec!["sh".to_string(), "-c".to_string()];
        argv.extend(script);
        Ok(StepOutcome::Command(ThreadedCommand::new(argv)))
    }
}

fn config(temp: &TempDir, jobs: usize) -> EngineConfig {
    EngineConfig {
        jobs: Some(jobs),
        cache_file: temp
            .path()
            .join("fingerprints.json")
            .to_string_lossy()
            .into_owned(),
        strict_deps: false,
        explain: true,
    }
}

fn target_in(temp: &TempDir, name: &str) -> Target {
    Target::File(temp.path().join(name))
}

#[test]
fn copy_scenario_builds_skips_and_rebuilds() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let src = target_in(&temp, "in.txt");
    let out = target_in(&temp, "out");
    fs::write(src.path().unwrap(), b"first contents").unwrap();

    let invoke = |runs: &Arc<AtomicUsize>| {
        let mut ctx = BuildContext::new(config(&temp, 2));
        ctx.register_step("copy", Arc::new(CopyStep { runs: runs.clone() }));
        ctx.register_job("copy", out.clone(), vec![src.clone()], VarMap::new())
            .unwrap();
        ctx.process().unwrap();
        let record = ctx
            .cache()
            .lock()
            .unwrap()
            .record(&out)
            .cloned()
            .expect("out has a cache record");
        record
    };

    // First run copies and records the checksum
    let first = invoke(&runs);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read(out.path().unwrap()).unwrap(), b"first contents");
    assert!(!first.checksum.is_empty());

    // Second run with an unmodified input performs no copy
    let second = invoke(&runs);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(second.checksum, first.checksum);

    // Appending one byte rebuilds and the recorded checksum changes
    let mut bytes = fs::read(src.path().unwrap()).unwrap();
    bytes.push(b'!');
    fs::write(src.path().unwrap(), &bytes).unwrap();

    let third = invoke(&runs);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_ne!(third.checksum, first.checksum);
}

#[test]
fn rewriting_identical_bytes_does_not_rebuild() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let src = target_in(&temp, "in.txt");
    let out = target_in(&temp, "out");
    fs::write(src.path().unwrap(), b"stable").unwrap();

    for round in 0..2 {
        if round == 1 {
            // Touch: fresh mtime, same bytes
            fs::write(src.path().unwrap(), b"stable").unwrap();
        }
        let mut ctx = BuildContext::new(config(&temp, 2));
        ctx.register_step("copy", Arc::new(CopyStep { runs: runs.clone() }));
        ctx.register_job("copy", out.clone(), vec![src.clone()], VarMap::new())
            .unwrap();
        ctx.process().unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn changed_input_rebuilds_transitively() {
    let temp = TempDir::new().unwrap();
    let mid_runs = Arc::new(AtomicUsize::new(0));
    let out_runs = Arc::new(AtomicUsize::new(0));
    let src = target_in(&temp, "in.txt");
    let mid = target_in(&temp, "mid");
    let out = target_in(&temp, "out");
    fs::write(src.path().unwrap(), b"v1").unwrap();

    let invoke = || {
        let mut ctx = BuildContext::new(config(&temp, 2));
        ctx.register_step(
            "copy-mid",
            Arc::new(CopyStep {
                runs: mid_runs.clone(),
            }),
        );
        ctx.register_step(
            "copy-out",
            Arc::new(CopyStep {
                runs: out_runs.clone(),
            }),
        );
        ctx.register_job("copy-mid", mid.clone(), vec![src.clone()], VarMap::new())
            .unwrap();
        ctx.register_job("copy-out", out.clone(), vec![mid.clone()], VarMap::new())
            .unwrap();
        ctx.process().unwrap();
    };

    invoke();
    assert_eq!(mid_runs.load(Ordering::SeqCst), 1);
    assert_eq!(out_runs.load(Ordering::SeqCst), 1);

    // No changes: zero work
    invoke();
    assert_eq!(mid_runs.load(Ordering::SeqCst), 1);
    assert_eq!(out_runs.load(Ordering::SeqCst), 1);

    // Changing the leaf rebuilds the chain
    fs::write(src.path().unwrap(), b"v2").unwrap();
    invoke();
    assert_eq!(mid_runs.load(Ordering::SeqCst), 2);
    assert_eq!(out_runs.load(Ordering::SeqCst), 2);
}

#[test]
fn changed_flags_rebuild_without_file_changes() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let src = target_in(&temp, "in.txt");
    let out = target_in(&temp, "out");
    fs::write(src.path().unwrap(), b"same").unwrap();

    let invoke = |flags: &str| {
        let mut ctx = BuildContext::new(config(&temp, 2));
        ctx.register_step("copy", Arc::new(CopyStep { runs: runs.clone() }));
        let mut overrides = VarMap::new();
        overrides.insert("FLAGS".to_string(), Value::str(flags));
        ctx.register_job("copy", out.clone(), vec![src.clone()], overrides)
            .unwrap();
        ctx.process().unwrap();
    };

    invoke("-O0");
    invoke("-O0");
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    invoke("-O2");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn circular_dependency_fails_before_any_job_runs() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let a = target_in(&temp, "a");
    let b = target_in(&temp, "b");

    let mut ctx = BuildContext::new(config(&temp, 2));
    ctx.register_step("copy", Arc::new(CopyStep { runs: runs.clone() }));
    ctx.register_job("copy", a.clone(), vec![b.clone()], VarMap::new())
        .unwrap();
    ctx.register_job("copy", b, vec![a], VarMap::new()).unwrap();

    let err = ctx.process().unwrap_err();
    assert!(err.to_string().contains("circular dependency"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn completed_work_is_cached_when_a_cycle_aborts_the_build() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let src = target_in(&temp, "in.txt");
    let good = target_in(&temp, "good");
    let a = target_in(&temp, "a");
    let b = target_in(&temp, "b");
    fs::write(src.path().unwrap(), b"ok").unwrap();

    // The independent job runs before the cycle is discovered
    let mut ctx = BuildContext::new(config(&temp, 2));
    ctx.register_step("copy", Arc::new(CopyStep { runs: runs.clone() }));
    ctx.register_job("copy", good.clone(), vec![src.clone()], VarMap::new())
        .unwrap();
    ctx.register_job("copy", a.clone(), vec![b.clone()], VarMap::new())
        .unwrap();
    ctx.register_job("copy", b, vec![a], VarMap::new()).unwrap();

    let err = ctx.process().unwrap_err();
    assert!(err.to_string().contains("circular dependency"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Its record survived the abort: the next invocation skips it
    let mut ctx = BuildContext::new(config(&temp, 2));
    ctx.register_step("copy", Arc::new(CopyStep { runs: runs.clone() }));
    ctx.register_job("copy", good.clone(), vec![src], VarMap::new())
        .unwrap();
    ctx.process().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn side_effect_gates_consumers_of_undeclared_files() {
    let temp = TempDir::new().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let x = target_in(&temp, "x");
    let y = target_in(&temp, "y");
    let z = target_in(&temp, "z");

    let mut ctx = BuildContext::new(config(&temp, 2));
    ctx.register_step(
        "make-x",
        Arc::new(TouchStep {
            events: events.clone(),
            writes: vec![
                x.path().unwrap().to_path_buf(),
                y.path().unwrap().to_path_buf(),
            ],
        }),
    );
    ctx.register_step(
        "make-z",
        Arc::new(TouchStep {
            events: events.clone(),
            writes: vec![z.path().unwrap().to_path_buf()],
        }),
    );

    // z consumes y, which is never registered as its own target; it only
    // appears as a declared side effect of building x.
    ctx.register_job("make-z", z.clone(), vec![y.clone()], VarMap::new())
        .unwrap();
    ctx.register_job("make-x", x.clone(), vec![], VarMap::new())
        .unwrap();
    ctx.produces(x.clone(), y);
    ctx.process().unwrap();

    let events = events.lock().unwrap();
    let x_pos = events.iter().position(|e| e == &format!("run {x}")).unwrap();
    let z_pos = events.iter().position(|e| e == &format!("run {z}")).unwrap();
    assert!(x_pos < z_pos, "producer must finish before the consumer");
}

#[test]
fn barrier_separates_epochs_under_concurrency() {
    let temp = TempDir::new().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut ctx = BuildContext::new(config(&temp, 4));
    ctx.register_step(
        "sleep",
        Arc::new(SleepStep {
            events: events.clone(),
        }),
    );

    for name in ["a", "b", "c"] {
        ctx.register_job("sleep", Target::phony(name), vec![], VarMap::new())
            .unwrap();
    }
    ctx.barrier();
    for name in ["d", "e", "f"] {
        ctx.register_job("sleep", Target::phony(name), vec![], VarMap::new())
            .unwrap();
    }
    ctx.process().unwrap();

    let events = events.lock().unwrap();
    let last_pre_end = ["a", "b", "c"]
        .iter()
        .map(|n| events.iter().position(|e| e == &format!("end {n}")).unwrap())
        .max()
        .unwrap();
    let first_post_start = ["d", "e", "f"]
        .iter()
        .map(|n| {
            events
                .iter()
                .position(|e| e == &format!("start {n}"))
                .unwrap()
        })
        .min()
        .unwrap();
    assert!(
        last_pre_end < first_post_start,
        "all pre-barrier jobs must finish before any post-barrier job starts: {events:?}"
    );
}

#[test]
fn independent_branches_survive_a_failure() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let src = target_in(&temp, "in.txt");
    let good = target_in(&temp, "good");
    let bad = target_in(&temp, "bad");
    let dependent = target_in(&temp, "dependent");
    fs::write(src.path().unwrap(), b"ok").unwrap();

    let mut ctx = BuildContext::new(config(&temp, 2));
    ctx.register_step("copy", Arc::new(CopyStep { runs: runs.clone() }));
    ctx.register_step("shell", Arc::new(ShellStep));

    let mut fail_cmd = VarMap::new();
    fail_cmd.insert("CMD".to_string(), Value::str("exit 3"));
    ctx.register_job("shell", bad.clone(), vec![], fail_cmd)
        .unwrap();
    ctx.register_job("copy", dependent.clone(), vec![bad.clone()], VarMap::new())
        .unwrap();
    ctx.register_job("copy", good.clone(), vec![src.clone()], VarMap::new())
        .unwrap();

    let err = ctx.process().unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("bad"), "failure names the offender: {msg}");

    // The independent branch completed and was cached
    assert!(good.path().unwrap().exists());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The dependent target never ran
    assert!(!dependent.path().unwrap().exists());
}

#[test]
fn reordering_sources_does_not_rebuild_without_strict_deps() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let a = target_in(&temp, "a.h");
    let b = target_in(&temp, "b.h");
    let out = target_in(&temp, "out");
    fs::write(a.path().unwrap(), b"a").unwrap();
    fs::write(b.path().unwrap(), b"b").unwrap();

    let invoke = |sources: Vec<Target>| {
        let mut ctx = BuildContext::new(config(&temp, 2));
        ctx.register_step("copy", Arc::new(CopyStep { runs: runs.clone() }));
        ctx.register_job("copy", out.clone(), sources, VarMap::new())
            .unwrap();
        ctx.process().unwrap();
    };

    invoke(vec![a.clone(), b.clone()]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    invoke(vec![b, a]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn delegated_wait_handle_completes_the_job() {
    let temp = TempDir::new().unwrap();
    let out = target_in(&temp, "out");
    let src = target_in(&temp, "in.txt");
    fs::write(src.path().unwrap(), b"payload").unwrap();

    struct DelegatingStep;

    impl BuildStep for DelegatingStep {
        fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
            let src = ctx.sources()[0].path().unwrap().to_path_buf();
            let dst = ctx.target().path().unwrap().to_path_buf();
            let (completer, handle) = WaitHandle::pair();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                let code = match fs::copy(&src, &dst) {
                    Ok(_) => 0,
                    Err(_) => 1,
                };
                completer.complete(CommandStatus::new(code, "delegated copy"));
            });
            Ok(StepOutcome::Wait(handle))
        }
    }

    let mut ctx = BuildContext::new(config(&temp, 2));
    ctx.register_step("delegate", Arc::new(DelegatingStep));
    ctx.register_job("delegate", out.clone(), vec![src], VarMap::new())
        .unwrap();
    ctx.process().unwrap();

    assert_eq!(fs::read(out.path().unwrap()).unwrap(), b"payload");
    assert!(ctx.cache().lock().unwrap().record(&out).is_some());
}

#[test]
fn shell_step_expands_its_command_template() {
    let temp = TempDir::new().unwrap();
    let out = target_in(&temp, "greeting.txt");

    let mut ctx = BuildContext::new(config(&temp, 2));
    ctx.register_step("shell", Arc::new(ShellStep));
    ctx.scope().set("GREETING", "hello");

    let mut overrides = VarMap::new();
    overrides.insert(
        "CMD".to_string(),
        Value::str("echo ${GREETING} > ${TARGET}"),
    );
    ctx.register_job("shell", out.clone(), vec![], overrides)
        .unwrap();
    ctx.process().unwrap();

    assert_eq!(
        fs::read_to_string(out.path().unwrap()).unwrap().trim(),
        "hello"
    );
}

#[test]
fn alias_registers_the_same_step_under_two_names() {
    let temp = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let src = target_in(&temp, "in.txt");
    let copied = target_in(&temp, "copied");
    let installed = target_in(&temp, "installed");
    fs::write(src.path().unwrap(), b"data").unwrap();

    let mut ctx = BuildContext::new(config(&temp, 2));
    ctx.register_step("copy", Arc::new(CopyStep { runs: runs.clone() }));
    ctx.register_alias("install", "copy").unwrap();

    ctx.register_job("copy", copied.clone(), vec![src.clone()], VarMap::new())
        .unwrap();
    ctx.register_job("install", installed.clone(), vec![src], VarMap::new())
        .unwrap();
    ctx.process().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(copied.path().unwrap().exists());
    assert!(installed.path().unwrap().exists());
}
