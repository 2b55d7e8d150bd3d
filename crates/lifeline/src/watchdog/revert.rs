//! The independent revert timer
//!
//! The worker must outlive the process that armed the session, so in
//! production it is a separate process: the `lifeline` binary re-executed
//! as `lifeline watchdog revert-worker --session <dir>` in its own session
//! with stdio detached. It only reads the session directory.

use crate::error::{LifelineError, Result};
use crate::txn::log::{LogEvent, RollbackLog};
use crate::watchdog::session::{release_armed_marker, Decision, SessionDir};
use chrono::Utc;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll granularity of the worker loop
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Starts a revert worker for a session directory
pub trait RevertSpawner: Send + Sync {
    /// Start the worker. Returns its PID when it is a separate process.
    fn spawn(&self, session_dir: &Path) -> Result<Option<u32>>;
}

/// Spawns the worker as a detached process
#[derive(Debug, Clone)]
pub struct DetachedProcess {
    program: PathBuf,
    args: Vec<String>,
}

impl DetachedProcess {
    /// `program args... --session <dir>`
    #[must_use]
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Re-execute the running binary's revert-worker subcommand.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| LifelineError::CommandSpawn {
            command: "current executable".to_string(),
            source: e,
        })?;
        Ok(Self::new(
            program,
            vec!["watchdog".to_string(), "revert-worker".to_string()],
        ))
    }
}

impl RevertSpawner for DetachedProcess {
    fn spawn(&self, session_dir: &Path) -> Result<Option<u32>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--session")
            .arg(session_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // SAFETY: setsid() is async-signal-safe and touches no memory of
        // the parent.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let mut child = cmd.spawn().map_err(|e| LifelineError::CommandSpawn {
            command: format!("{} {}", self.program.display(), self.args.join(" ")),
            source: e,
        })?;
        let pid = child.id();
        info!("Revert worker started (pid {pid})");

        // Reap the worker if this process is still alive when it exits
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(Some(pid))
    }
}

/// How a worker run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Cancelled,
    /// The arming process already reverted (e.g. a failed reload)
    RevertedElsewhere,
    Reverted { errors: Vec<String> },
    /// Someone else decided, but the decision could not be read
    Undetermined,
}

/// Worker loop: wait for cancellation or the deadline, then act.
pub fn run_worker(dir: &Path) -> Result<WorkerOutcome> {
    let sdir = SessionDir::new(dir.to_path_buf());
    let session = sdir.load()?;
    let deadline = session.deadline();
    debug!("Revert worker for {} waiting until {deadline}", session.id);

    loop {
        match sdir.decision() {
            Some(Decision::Cancel) => {
                info!("Watchdog session {} cancelled", session.id);
                return Ok(WorkerOutcome::Cancelled);
            }
            Some(Decision::Revert) => {
                debug!("Watchdog session {} already reverted", session.id);
                return Ok(WorkerOutcome::RevertedElsewhere);
            }
            None => {}
        }
        if Utc::now() >= deadline {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    // Re-check right before acting: a cancel may have landed since the
    // last poll. The claim decides the race.
    if !sdir.claim(Decision::Revert)? {
        info!("Watchdog session {} decided at the deadline", session.id);
        return Ok(match sdir.decision() {
            Some(Decision::Revert) => WorkerOutcome::RevertedElsewhere,
            Some(Decision::Cancel) => WorkerOutcome::Cancelled,
            None => {
                warn!(
                    "Watchdog session {} has an unreadable decision in {}",
                    session.id,
                    sdir.path().display()
                );
                WorkerOutcome::Undetermined
            }
        });
    }

    warn!(
        "Watchdog session {} ({}) not confirmed within {}s, reverting",
        session.id, session.label, session.timeout_secs
    );
    let errors = session.revert.execute();
    sdir.mark_reverted(&errors)?;
    release_armed_marker(&session.armed_marker, &session.id);

    let detail = if errors.is_empty() {
        format!("watchdog revert of {}: ok", session.label)
    } else {
        format!(
            "watchdog revert of {}: {} errors: {}",
            session.label,
            errors.len(),
            errors.join("; ")
        )
    };
    if let Err(e) = RollbackLog::new(session.rollback_log.clone()).record(
        LogEvent::Rollback,
        &session.id,
        &detail,
    ) {
        warn!("Failed to write rollback log: {e}");
    }

    Ok(WorkerOutcome::Reverted { errors })
}

/// Runs the worker loop on a thread of the current process.
#[cfg(test)]
pub(crate) struct ThreadSpawner;

#[cfg(test)]
impl RevertSpawner for ThreadSpawner {
    fn spawn(&self, session_dir: &Path) -> Result<Option<u32>> {
        let dir = session_dir.to_path_buf();
        std::thread::spawn(move || {
            let _ = run_worker(&dir);
        });
        Ok(None)
    }
}
