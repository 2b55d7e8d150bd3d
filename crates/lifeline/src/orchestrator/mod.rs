//! Dependency-ordered task orchestrator
//!
//! Tasks are grouped into tiers and run one tier at a time, ascending.
//! Within a tier, registration order is kept. Dependencies are checked with
//! a single forward pass: a task whose dependencies have not completed by
//! the time it is reached is skipped, not deferred.
//!
//! Every task runs in its own transaction. A task that returns an error is
//! rolled back before the next one starts. Completion is recorded as a
//! marker file per task.

mod kinds;

pub use kinds::{inverse_rule, register_configured};

use crate::error::{LifelineError, Result};
use crate::fsutil;
use crate::txn::{signals, Engine};
use crate::watchdog::Watchdog;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// A task body. It performs its own check-then-mutate and registers undo
/// actions in the open transaction.
pub type TaskFn = Box<dyn Fn(&mut TaskContext<'_>) -> Result<()>>;

/// Box a closure as a [`TaskFn`].
pub fn task_fn<F>(f: F) -> TaskFn
where
    F: Fn(&mut TaskContext<'_>) -> Result<()> + 'static,
{
    Box::new(f)
}

/// Returns a description of the stop request, if one is pending.
pub type StopCheck = Box<dyn Fn() -> Option<String>>;

/// What a running task gets to work with
pub struct TaskContext<'a> {
    /// Name of the running task
    pub task: &'a str,
    /// Engine with the task's transaction open
    pub engine: &'a mut Engine,
    pub watchdog: Option<&'a Watchdog>,
    /// Mutations must be skipped
    pub dry_run: bool,
}

/// What to do after a task fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the run at the first failure
    FailFast,
    /// Keep going; dependents of the failed task will be skipped
    #[default]
    Continue,
}

impl FailurePolicy {
    #[must_use]
    pub fn from_fail_fast(fail_fast: bool) -> Self {
        if fail_fast {
            Self::FailFast
        } else {
            Self::Continue
        }
    }
}

/// Where a task stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Not run yet
    Pending,
    /// Ran successfully (marker written)
    Completed,
    /// Marker from an earlier run; not re-run
    AlreadyCompleted,
    /// Dependencies were not completed when the task was reached
    Skipped { missing: Vec<String> },
    /// Returned an error and was rolled back
    Failed { error: String },
    /// Ran in dry-run mode; no marker written
    DryRun,
}

impl TaskState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed | Self::AlreadyCompleted => "completed",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
            Self::DryRun => "dry-run",
        }
    }
}

/// One row of [`Orchestrator::status`]
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub name: String,
    pub tier: u32,
    pub depends_on: Vec<String>,
    pub state: TaskState,
}

/// Outcome of a run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub already_completed: Vec<String>,
    pub skipped: Vec<(String, Vec<String>)>,
    pub failed: Vec<(String, String)>,
    pub dry_run: Vec<String>,
    /// The failure policy stopped the run early
    pub aborted: bool,
}

impl RunSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.aborted
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

struct Task {
    name: String,
    tier: u32,
    depends_on: Vec<String>,
    run: TaskFn,
}

/// Runs registered tasks
pub struct Orchestrator {
    engine: Engine,
    watchdog: Option<Watchdog>,
    markers_dir: PathBuf,
    policy: FailurePolicy,
    force: bool,
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    last_run: HashMap<String, TaskState>,
    stop_check: StopCheck,
}

impl Orchestrator {
    /// Create an orchestrator writing completion markers to `markers_dir`.
    pub fn new(engine: Engine, markers_dir: &Path) -> Result<Self> {
        fsutil::ensure_dir(markers_dir, 0o750)?;
        Ok(Self {
            engine,
            watchdog: None,
            markers_dir: markers_dir.to_path_buf(),
            policy: FailurePolicy::default(),
            force: false,
            tasks: Vec::new(),
            index: HashMap::new(),
            last_run: HashMap::new(),
            stop_check: Box::new(|| signals::termination_requested().map(|s| s.to_string())),
        })
    }

    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Re-run tasks that already have a completion marker.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Replace the check consulted between tasks for a stop request.
    #[must_use]
    pub fn with_stop_check(mut self, check: StopCheck) -> Self {
        self.stop_check = check;
        self
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    #[must_use]
    pub fn watchdog(&self) -> Option<&Watchdog> {
        self.watchdog.as_ref()
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.markers_dir.join(format!("{name}.done"))
    }

    fn is_marked(&self, name: &str) -> bool {
        self.marker_path(name).exists()
    }

    /// Add a task. Names double as marker file names, so they are limited
    /// to ASCII letters, digits, `-`, `_` and `.` and may not start with
    /// a dot.
    pub fn register_task(
        &mut self,
        name: &str,
        tier: u32,
        depends_on: &[&str],
        run: TaskFn,
    ) -> Result<()> {
        validate_task_name(name)?;
        if self.index.contains_key(name) {
            return Err(LifelineError::DuplicateTask(name.to_string()));
        }
        if depends_on.contains(&name) {
            return Err(LifelineError::InvalidTask {
                task: name.to_string(),
                reason: "task depends on itself".to_string(),
            });
        }
        self.index.insert(name.to_string(), self.tasks.len());
        self.tasks.push(Task {
            name: name.to_string(),
            tier,
            depends_on: depends_on.iter().map(|d| (*d).to_string()).collect(),
            run,
        });
        Ok(())
    }

    /// Names of registered tasks in registration order.
    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Check the task graph before running anything.
    ///
    /// Cycles are an error. Dependencies on unregistered tasks are only
    /// warned about: such tasks are skipped at run time.
    pub fn validate(&self) -> Result<()> {
        for task in &self.tasks {
            for dep in &task.depends_on {
                if !self.index.contains_key(dep) {
                    warn!("Task '{}' depends on unregistered task '{dep}'", task.name);
                }
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            tasks: &[Task],
            index: &HashMap<String, usize>,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
            at: usize,
        ) -> std::result::Result<(), Vec<String>> {
            match marks[at] {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    let start = path.iter().position(|&i| i == at).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|&i| tasks[i].name.clone()).collect();
                    cycle.push(tasks[at].name.clone());
                    return Err(cycle);
                }
                Mark::New => {}
            }
            marks[at] = Mark::Active;
            path.push(at);
            for dep in &tasks[at].depends_on {
                if let Some(&next) = index.get(dep) {
                    visit(tasks, index, marks, path, next)?;
                }
            }
            path.pop();
            marks[at] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.tasks.len()];
        for start in 0..self.tasks.len() {
            let mut path = Vec::new();
            visit(&self.tasks, &self.index, &mut marks, &mut path, start)
                .map_err(LifelineError::DependencyCycle)?;
        }
        Ok(())
    }

    /// Run every tier in ascending order.
    pub fn run_all(&mut self) -> Result<RunSummary> {
        self.validate()?;
        let tiers: BTreeSet<u32> = self.tasks.iter().map(|t| t.tier).collect();
        let mut summary = RunSummary::default();
        for tier in tiers {
            info!("Running tier {tier}");
            self.run_indices(self.tier_indices(tier), &mut summary)?;
            if summary.aborted {
                break;
            }
        }
        Ok(summary)
    }

    /// Run the tasks of one tier.
    pub fn run_tier(&mut self, tier: u32) -> Result<RunSummary> {
        self.validate()?;
        let indices = self.tier_indices(tier);
        if indices.is_empty() {
            warn!("No tasks registered in tier {tier}");
        }
        let mut summary = RunSummary::default();
        self.run_indices(indices, &mut summary)?;
        Ok(summary)
    }

    /// Run one task by name, with the usual completion and dependency checks.
    pub fn run_one(&mut self, name: &str) -> Result<RunSummary> {
        self.validate()?;
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| LifelineError::UnknownTask(name.to_string()))?;
        let mut summary = RunSummary::default();
        self.run_indices(vec![idx], &mut summary)?;
        Ok(summary)
    }

    fn tier_indices(&self, tier: u32) -> Vec<usize> {
        (0..self.tasks.len())
            .filter(|&i| self.tasks[i].tier == tier)
            .collect()
    }

    fn run_indices(&mut self, indices: Vec<usize>, summary: &mut RunSummary) -> Result<()> {
        for idx in indices {
            self.run_task(idx, summary)?;
            if summary.aborted {
                warn!("Fail-fast: stopping after failed task");
                break;
            }
        }
        Ok(())
    }

    /// A dependency counts as met when it has a marker or ran in this
    /// process (dry runs included, so a dry run can walk the whole graph).
    fn is_satisfied(&self, name: &str) -> bool {
        self.is_marked(name)
            || matches!(
                self.last_run.get(name),
                Some(TaskState::Completed | TaskState::DryRun)
            )
    }

    fn run_task(&mut self, idx: usize, summary: &mut RunSummary) -> Result<()> {
        if let Some(reason) = (self.stop_check)() {
            warn!("Stop requested ({reason}); not starting further tasks");
            return Err(LifelineError::Interrupted(reason));
        }

        let name = self.tasks[idx].name.clone();
        if !self.force && self.is_marked(&name) {
            info!("Task '{name}' already completed, skipping");
            self.last_run.insert(name.clone(), TaskState::AlreadyCompleted);
            summary.already_completed.push(name);
            return Ok(());
        }

        let missing: Vec<String> = self.tasks[idx]
            .depends_on
            .iter()
            .filter(|d| !self.is_satisfied(d))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let unmet = LifelineError::DependencyUnmet {
                task: name.clone(),
                missing: missing.clone(),
            };
            warn!("Skipping: {unmet}");
            self.last_run
                .insert(name.clone(), TaskState::Skipped { missing: missing.clone() });
            summary.skipped.push((name, missing));
            return Ok(());
        }

        self.engine.begin(&name)?;
        let dry_run = self.engine.dry_run();
        info!("Running task '{name}'");
        let result = {
            let mut ctx = TaskContext {
                task: &name,
                engine: &mut self.engine,
                watchdog: self.watchdog.as_ref(),
                dry_run,
            };
            (self.tasks[idx].run)(&mut ctx)
        };

        if let Some(reason) = (self.stop_check)() {
            let report = self.engine.rollback(&format!("interrupted by {reason}"));
            warn!(
                "Stop requested during '{name}'; rolled back {} actions",
                report.outcomes.len()
            );
            self.last_run.insert(
                name,
                TaskState::Failed {
                    error: format!("interrupted by {reason}"),
                },
            );
            return Err(LifelineError::Interrupted(reason));
        }

        match result {
            Ok(()) => {
                self.engine.commit()?;
                if dry_run {
                    info!("[dry-run] task '{name}' checked");
                    self.last_run.insert(name.clone(), TaskState::DryRun);
                    summary.dry_run.push(name);
                } else {
                    self.write_marker(&name)?;
                    info!("Task '{name}' completed");
                    self.last_run.insert(name.clone(), TaskState::Completed);
                    summary.completed.push(name);
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!("Task '{name}' failed: {message}");
                let report = self.engine.rollback(&message);
                if !report.is_clean() {
                    error!(
                        "Rollback of '{name}' left {} actions failed",
                        report.failures()
                    );
                }
                self.last_run.insert(
                    name.clone(),
                    TaskState::Failed {
                        error: message.clone(),
                    },
                );
                summary.failed.push((name, message));
                if self.policy == FailurePolicy::FailFast {
                    summary.aborted = true;
                }
            }
        }
        Ok(())
    }

    fn write_marker(&self, name: &str) -> Result<()> {
        fsutil::atomic_write(
            &self.marker_path(name),
            format!("{}\n", Utc::now().to_rfc3339()).as_bytes(),
        )
    }

    /// Completion state of every registered task, tier order.
    #[must_use]
    pub fn status(&self) -> Vec<TaskStatus> {
        let mut rows: Vec<TaskStatus> = self
            .tasks
            .iter()
            .map(|task| {
                let state = match self.last_run.get(&task.name) {
                    Some(state) => state.clone(),
                    None if self.is_marked(&task.name) => TaskState::Completed,
                    None => TaskState::Pending,
                };
                TaskStatus {
                    name: task.name.clone(),
                    tier: task.tier,
                    depends_on: task.depends_on.clone(),
                    state,
                }
            })
            .collect();
        rows.sort_by_key(|row| row.tier);
        rows
    }
}

fn validate_task_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| LifelineError::InvalidTask {
        task: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.starts_with('.') {
        return Err(invalid("name may not start with a dot"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("name may only contain letters, digits, '-', '_' and '.'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::store::BackupStore;
    use std::cell::{Cell, RefCell};
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn orchestrator(dir: &Path) -> Orchestrator {
        let store = BackupStore::open(&dir.join("backups")).expect("store");
        let engine =
            Engine::new(store, SystemConfig::default(), &dir.join("state")).expect("engine");
        Orchestrator::new(engine, &dir.join("state/markers"))
            .expect("orchestrator")
            .with_stop_check(Box::new(|| None))
    }

    type Calls = Rc<RefCell<Vec<String>>>;

    fn recording(calls: &Calls, name: &str) -> TaskFn {
        let calls = Rc::clone(calls);
        let name = name.to_string();
        task_fn(move |_ctx| {
            calls.borrow_mut().push(name.clone());
            Ok(())
        })
    }

    fn failing(calls: &Calls, name: &str) -> TaskFn {
        let calls = Rc::clone(calls);
        let name = name.to_string();
        task_fn(move |_ctx| {
            calls.borrow_mut().push(name.clone());
            Err(LifelineError::Aborted(format!("{name} broke")))
        })
    }

    #[test]
    fn tiers_run_in_ascending_order() {
        let dir = TempDir::new().expect("tempdir");
        let calls = Calls::default();
        let mut orch = orchestrator(dir.path());
        orch.register_task("late", 2, &[], recording(&calls, "late")).expect("register");
        orch.register_task("early", 1, &[], recording(&calls, "early")).expect("register");
        orch.register_task("early2", 1, &[], recording(&calls, "early2")).expect("register");

        let summary = orch.run_all().expect("run");
        assert_eq!(*calls.borrow(), vec!["early", "early2", "late"]);
        assert_eq!(summary.completed.len(), 3);
        assert!(summary.is_success());
        assert!(dir.path().join("state/markers/late.done").exists());
    }

    #[test]
    fn completed_tasks_are_not_rerun_unless_forced() {
        let dir = TempDir::new().expect("tempdir");
        let calls = Calls::default();
        let mut orch = orchestrator(dir.path());
        orch.register_task("a", 1, &[], recording(&calls, "a")).expect("register");
        orch.run_all().expect("run");

        let summary = orch.run_all().expect("run");
        assert_eq!(summary.already_completed, vec!["a"]);
        assert_eq!(calls.borrow().len(), 1);

        let mut orch = orch.with_force(true);
        let summary = orch.run_one("a").expect("run");
        assert_eq!(summary.completed, vec!["a"]);
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn task_with_never_run_dependency_is_always_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let calls = Calls::default();
        let mut orch = orchestrator(dir.path());
        orch.register_task("base", 1, &[], recording(&calls, "base")).expect("register");
        orch.register_task("needs-ghost", 2, &["ghost"], recording(&calls, "needs-ghost"))
            .expect("register");

        for _ in 0..2 {
            let summary = orch.run_all().expect("run");
            assert_eq!(summary.skipped.len(), 1);
            assert_eq!(summary.skipped[0].1, vec!["ghost"]);
        }
        assert!(!calls.borrow().contains(&"needs-ghost".to_string()));

        let status = orch.status();
        assert_eq!(status[0].state.label(), "completed");
        assert_eq!(
            status[1].state,
            TaskState::Skipped {
                missing: vec!["ghost".to_string()]
            }
        );
    }

    #[test]
    fn fail_fast_stops_later_tiers() {
        let dir = TempDir::new().expect("tempdir");
        let calls = Calls::default();
        let mut orch = orchestrator(dir.path()).with_policy(FailurePolicy::FailFast);
        orch.register_task("broken", 1, &[], failing(&calls, "broken")).expect("register");
        orch.register_task("next", 2, &[], recording(&calls, "next")).expect("register");

        let summary = orch.run_all().expect("run");
        assert!(summary.aborted);
        assert_eq!(summary.failure_count(), 1);
        assert_eq!(*calls.borrow(), vec!["broken"]);
    }

    #[test]
    fn continue_policy_runs_later_tiers() {
        let dir = TempDir::new().expect("tempdir");
        let calls = Calls::default();
        let mut orch = orchestrator(dir.path()).with_policy(FailurePolicy::Continue);
        orch.register_task("broken", 1, &[], failing(&calls, "broken")).expect("register");
        orch.register_task("next", 2, &[], recording(&calls, "next")).expect("register");
        orch.register_task("after-broken", 2, &["broken"], recording(&calls, "after-broken"))
            .expect("register");

        let summary = orch.run_all().expect("run");
        assert!(!summary.aborted);
        assert_eq!(summary.failure_count(), 1);
        assert_eq!(summary.completed, vec!["next"]);
        assert_eq!(summary.skipped.len(), 1);
        assert!(!dir.path().join("state/markers/broken.done").exists());
        assert!(matches!(orch.status()[0].state, TaskState::Failed { .. }));
    }

    #[test]
    fn failed_task_is_rolled_back() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("motd");
        fs::write(&target, "original").expect("write");

        let mut orch = orchestrator(dir.path());
        let path = target.clone();
        orch.register_task(
            "half-done",
            1,
            &[],
            task_fn(move |ctx| {
                ctx.engine.atomic_file_update(&path, |work| {
                    fs::write(work, "changed").map_err(crate::error::io_err(work))
                })?;
                Err(LifelineError::Aborted("second step failed".to_string()))
            }),
        )
        .expect("register");

        let summary = orch.run_all().expect("run");
        assert_eq!(summary.failure_count(), 1);
        assert_eq!(fs::read_to_string(&target).expect("read"), "original");
        assert!(!orch.engine().is_open());
    }

    #[test]
    fn cycles_are_rejected_before_running() {
        let dir = TempDir::new().expect("tempdir");
        let calls = Calls::default();
        let mut orch = orchestrator(dir.path());
        orch.register_task("a", 1, &["c"], recording(&calls, "a")).expect("register");
        orch.register_task("b", 1, &["a"], recording(&calls, "b")).expect("register");
        orch.register_task("c", 1, &["b"], recording(&calls, "c")).expect("register");
        orch.register_task("free", 0, &[], recording(&calls, "free")).expect("register");

        match orch.run_all() {
            Err(LifelineError::DependencyCycle(cycle)) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn registration_rejects_bad_tasks() {
        let dir = TempDir::new().expect("tempdir");
        let calls = Calls::default();
        let mut orch = orchestrator(dir.path());
        orch.register_task("a", 1, &[], recording(&calls, "a")).expect("register");
        assert!(matches!(
            orch.register_task("a", 1, &[], recording(&calls, "a")),
            Err(LifelineError::DuplicateTask(_))
        ));
        for bad in ["", "../x", ".hidden", "a b"] {
            assert!(matches!(
                orch.register_task(bad, 1, &[], recording(&calls, bad)),
                Err(LifelineError::InvalidTask { .. })
            ));
        }
        assert!(matches!(
            orch.register_task("self", 1, &["self"], recording(&calls, "self")),
            Err(LifelineError::InvalidTask { .. })
        ));
        assert!(matches!(orch.run_one("nope"), Err(LifelineError::UnknownTask(_))));
    }

    #[test]
    fn dry_run_writes_no_markers_but_satisfies_dependents() {
        let dir = TempDir::new().expect("tempdir");
        let calls = Calls::default();
        let store = BackupStore::open(&dir.path().join("backups")).expect("store");
        let engine = Engine::new(store, SystemConfig::default(), &dir.path().join("state"))
            .expect("engine")
            .with_dry_run(true);
        let mut orch = Orchestrator::new(engine, &dir.path().join("markers"))
            .expect("orchestrator")
            .with_stop_check(Box::new(|| None));
        let seen = Rc::new(Cell::new(false));
        let flag = Rc::clone(&seen);
        orch.register_task(
            "a",
            1,
            &[],
            task_fn(move |ctx| {
                flag.set(ctx.dry_run);
                Ok(())
            }),
        )
        .expect("register");
        orch.register_task("b", 2, &["a"], recording(&calls, "b")).expect("register");

        let summary = orch.run_all().expect("run");
        assert!(seen.get());
        assert_eq!(summary.dry_run, vec!["a", "b"]);
        assert!(fs::read_dir(dir.path().join("markers")).expect("dir").next().is_none());
    }

    #[test]
    fn stop_request_rolls_back_and_interrupts() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("file");
        fs::write(&target, "before").expect("write");

        let stop = Rc::new(Cell::new(false));
        let check = Rc::clone(&stop);
        let calls = Calls::default();
        let mut orch = orchestrator(dir.path())
            .with_stop_check(Box::new(move || check.get().then(|| "SIGTERM".to_string())));

        let path = target.clone();
        let trigger = Rc::clone(&stop);
        orch.register_task(
            "first",
            1,
            &[],
            task_fn(move |ctx| {
                ctx.engine.atomic_file_update(&path, |work| {
                    fs::write(work, "after").map_err(crate::error::io_err(work))
                })?;
                trigger.set(true);
                Ok(())
            }),
        )
        .expect("register");
        orch.register_task("second", 1, &[], recording(&calls, "second")).expect("register");

        match orch.run_all() {
            Err(LifelineError::Interrupted(reason)) => assert_eq!(reason, "SIGTERM"),
            other => panic!("expected interruption, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(&target).expect("read"), "before");
        assert!(calls.borrow().is_empty());
        assert!(!dir.path().join("state/markers/first.done").exists());
    }

    #[test]
    fn run_tier_only_touches_that_tier() {
        let dir = TempDir::new().expect("tempdir");
        let calls = Calls::default();
        let mut orch = orchestrator(dir.path());
        orch.register_task("one", 1, &[], recording(&calls, "one")).expect("register");
        orch.register_task("two", 2, &[], recording(&calls, "two")).expect("register");

        let summary = orch.run_tier(2).expect("run");
        assert_eq!(summary.completed, vec!["two"]);
        assert_eq!(*calls.borrow(), vec!["two"]);
        assert_eq!(orch.status()[0].state, TaskState::Pending);
    }
}
