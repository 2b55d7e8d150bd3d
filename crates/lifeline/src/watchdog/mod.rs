//! Control-channel watchdog
//!
//! A change that could sever the operator's remote shell goes through:
//!
//! 1. [`Watchdog::validate_syntax`]: the daemon's own checker, no side effects
//! 2. [`Watchdog::test_parallel_instance`]: a throwaway daemon on the
//!    alternate address must answer before production is touched
//! 3. [`Watchdog::arm`]: swap the config in, reload, and start an independent
//!    revert worker
//! 4. [`Watchdog::confirm_reachability`]: probe production; success cancels
//!    the revert, failure leaves the timer running
//!
//! Everything up to the swap fails closed. After it, an unconfirmed change
//! fails open toward the pre-change backup.

mod probe;
mod render;
mod revert;
mod session;

pub use probe::{connect_address, probe_banner, wait_for_banner};
pub use render::render_permissive_config;
pub use revert::{run_worker, DetachedProcess, RevertSpawner, WorkerOutcome, POLL_INTERVAL};
pub use session::{FileRestore, RevertPlan, WatchdogSession};

use crate::config::ChannelConfig;
use crate::error::{io_err, LifelineError, Result};
use crate::exec;
use crate::fsutil;
use crate::store::{generate_id, validate_id};
use crate::txn::log::{LogEvent, RollbackLog};
use crate::txn::{Engine, UndoAction};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use session::{release_armed_marker, Decision, SessionDir};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[cfg(test)]
pub(crate) use probe::{banner_server, closed_port};
#[cfg(test)]
pub(crate) use revert::ThreadSpawner;

/// Marker file name inside the watchdog directory
pub const ARMED_MARKER: &str = "armed";

/// How long a stopped test instance gets to exit before SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(2);

static SESSION_SEQ: AtomicU32 = AtomicU32::new(0);

/// Result of a cancellation attempt
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The revert is suppressed; the change stays
    Cancelled(WatchdogSession),
    /// The revert worker won the race and restored the backup
    AlreadyReverted(WatchdogSession),
}

/// Result of [`Watchdog::run_flow`]
#[derive(Debug, Clone)]
pub enum FlowOutcome {
    /// Armed, confirmed and cancelled: the change is live
    Confirmed(WatchdogSession),
    /// Validation and the parallel test passed; nothing was swapped
    DryRun,
}

/// Snapshot of the armed session
#[derive(Debug, Clone)]
pub struct ArmedStatus {
    pub session: WatchdogSession,
    pub deadline: DateTime<Utc>,
    /// Seconds until the revert fires (negative once past)
    pub remaining_secs: i64,
    /// Whether the worker process still exists, when its PID is known
    pub worker_alive: Option<bool>,
    /// Deadline long past and no worker left to act on it
    pub stale: bool,
}

/// The watchdog for one control channel
pub struct Watchdog {
    channel: ChannelConfig,
    dir: PathBuf,
    log: RollbackLog,
    spawner: Box<dyn RevertSpawner>,
}

impl Watchdog {
    /// Create a watchdog keeping its sessions under `<state_dir>/watchdog`.
    pub fn new(
        channel: ChannelConfig,
        state_dir: &Path,
        spawner: Box<dyn RevertSpawner>,
    ) -> Result<Self> {
        let dir = state_dir.join("watchdog");
        fsutil::ensure_dir(&dir.join("sessions"), 0o700)?;
        Ok(Self {
            channel,
            dir,
            log: RollbackLog::new(state_dir.join("rollback.log")),
            spawner,
        })
    }

    #[must_use]
    pub fn channel(&self) -> &ChannelConfig {
        &self.channel
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn armed_marker(&self) -> PathBuf {
        self.dir.join(ARMED_MARKER)
    }

    fn session_dir(&self, id: &str) -> SessionDir {
        SessionDir::new(self.dir.join("sessions").join(id))
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.channel.probe_timeout_secs.max(1))
    }

    fn log_event(&self, event: LogEvent, id: &str, detail: &str) {
        if let Err(e) = self.log.record(event, id, detail) {
            warn!("Failed to write rollback log: {e}");
        }
    }

    /// Run the daemon's own syntax checker on `candidate`.
    pub fn validate_syntax(&self, candidate: &Path) -> Result<()> {
        if !candidate.is_file() {
            return Err(LifelineError::Validation {
                path: candidate.to_path_buf(),
                reason: "candidate config does not exist".to_string(),
            });
        }
        let argv = exec::render_path(&self.channel.validate_command, "config", candidate);
        exec::run(&argv).map_err(|e| LifelineError::Validation {
            path: candidate.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("Syntax check passed for {}", candidate.display());
        Ok(())
    }

    /// Start a permissive copy of `candidate` on the alternate address and
    /// require it to answer within the probe timeout.
    ///
    /// The instance is always stopped and its rendered config removed.
    /// Production is never touched. Returns the greeting line.
    pub fn test_parallel_instance(&self, candidate: &Path) -> Result<String> {
        let base = fs::read_to_string(candidate).map_err(io_err(candidate))?;
        let work = self.dir.join(format!(
            "test-{}-{}",
            std::process::id(),
            SESSION_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fsutil::ensure_dir(&work, 0o700)?;

        let result = self.run_test_instance(&base, &work);
        if let Err(e) = fs::remove_dir_all(&work) {
            warn!("Failed to remove {}: {e}", work.display());
        }
        result
    }

    fn run_test_instance(&self, base: &str, work: &Path) -> Result<String> {
        let alt = self.channel.alt_address;
        let rendered = work.join("sshd_config");
        let text = render_permissive_config(base, alt, &work.join("sshd.pid"));
        fsutil::atomic_write_mode(&rendered, text.as_bytes(), Some(0o600))?;
        self.validate_syntax(&rendered)?;

        let argv = exec::render_path(&self.channel.test_instance_command, "config", &rendered);
        let mut child = exec::spawn(&argv)?;
        info!("Parallel test instance started on {alt}");

        let result = self.await_instance(&mut child);
        stop_child(&mut child);
        match &result {
            Ok(banner) => info!("Parallel test instance answered: {banner}"),
            Err(e) => error!("Parallel test instance failed: {e}"),
        }
        result
    }

    fn await_instance(&self, child: &mut Child) -> Result<String> {
        let alt = self.channel.alt_address;
        let timeout = self.probe_timeout();
        let started = Instant::now();
        let mut last = String::from("no attempt made");

        while started.elapsed() < timeout {
            if let Ok(Some(status)) = child.try_wait() {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    use std::io::Read;
                    let _ = pipe.read_to_string(&mut stderr);
                }
                return Err(LifelineError::ReachabilityTimeout {
                    address: connect_address(alt).to_string(),
                    timeout_secs: timeout.as_secs(),
                    detail: format!("test instance exited with {status}: {}", stderr.trim()),
                });
            }
            let attempt = timeout.saturating_sub(started.elapsed()).min(Duration::from_secs(1));
            match probe_banner(alt, &self.channel.banner_prefix, attempt) {
                Ok(banner) => return Ok(banner),
                Err(e) => {
                    debug!("Test instance not answering yet: {e}");
                    last = e.to_string();
                }
            }
            std::thread::sleep(Duration::from_millis(200));
        }

        Err(LifelineError::ReachabilityTimeout {
            address: connect_address(alt).to_string(),
            timeout_secs: timeout.as_secs(),
            detail: last,
        })
    }

    /// Take the single-session marker, recording `id` in it.
    fn claim_marker(&self, id: &str) -> Result<()> {
        let marker = self.armed_marker();
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(mut file) => file
                .write_all(id.as_bytes())
                .and_then(|()| file.sync_all())
                .map_err(io_err(&marker)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&marker).unwrap_or_default();
                Err(LifelineError::AlreadyArmed(holder.trim().to_string()))
            }
            Err(e) => Err(io_err(&marker)(e)),
        }
    }

    fn new_session(&self, label: &str, plan: RevertPlan, timeout_secs: u64) -> WatchdogSession {
        WatchdogSession {
            id: format!(
                "{}-{}",
                generate_id(),
                SESSION_SEQ.fetch_add(1, Ordering::Relaxed)
            ),
            label: label.to_string(),
            production_config: None,
            backup: None,
            test_config: None,
            alt_address: None,
            armed_at: Utc::now(),
            timeout_secs,
            revert: plan,
            armed_marker: self.armed_marker(),
            rollback_log: self.log.path().to_path_buf(),
            worker_pid: None,
            cancelled: false,
        }
    }

    /// Persist the session and start its worker. The marker must be held.
    fn launch(&self, mut session: WatchdogSession) -> Result<WatchdogSession> {
        let sdir = self.session_dir(&session.id);
        sdir.save(&session)?;
        session.worker_pid = self.spawner.spawn(sdir.path())?;
        sdir.save(&session)?;
        Ok(session)
    }

    /// Revert right away and settle the session, e.g. after a failure
    /// during arming or when the owning task fails.
    pub(crate) fn abort_session(&self, session: &WatchdogSession, reason: &str) {
        let sdir = self.session_dir(&session.id);
        match sdir.claim(Decision::Revert) {
            Ok(true) => {
                let errors = session.revert.execute();
                if let Err(e) = sdir.mark_reverted(&errors) {
                    warn!("Failed to mark session {} reverted: {e}", session.id);
                }
                release_armed_marker(&session.armed_marker, &session.id);
                self.log_event(
                    LogEvent::Rollback,
                    &session.id,
                    &format!("arming {} aborted: {reason}", session.label),
                );
            }
            Ok(false) => debug!("Session {} already decided", session.id),
            Err(e) => error!("Failed to abort session {}: {e}", session.id),
        }
    }

    /// Swap `candidate` in as the production config under a revert timer.
    ///
    /// The production file is backed up, the revert worker is started, and
    /// only then is the file replaced and the daemon reloaded. If `engine`
    /// has an open transaction the restore and reload are registered in it
    /// as well. Fails with [`LifelineError::AlreadyArmed`] while another
    /// session holds the marker.
    pub fn arm(
        &self,
        engine: &mut Engine,
        candidate: &Path,
        timeout_secs: u64,
    ) -> Result<WatchdogSession> {
        if timeout_secs == 0 {
            return Err(LifelineError::ZeroTimeout);
        }
        let production = self.channel.config_path.clone();
        let content = fs::read(candidate).map_err(io_err(candidate))?;

        let mut session = self.new_session(
            &format!("control channel {}", production.display()),
            RevertPlan::default(),
            timeout_secs,
        );
        self.claim_marker(&session.id)?;

        let armed = (|| -> Result<WatchdogSession> {
            let backup = engine.store().backup_file(&production)?;
            session.revert = RevertPlan {
                restore: vec![FileRestore {
                    backup: backup.backup.clone(),
                    target: production.clone(),
                    checksum: backup.checksum,
                }],
                commands: vec![self.channel.reload_command.clone()],
            };
            session.production_config = Some(production.clone());
            session.backup = Some(backup.clone());
            session.test_config = Some(candidate.to_path_buf());
            session.alt_address = Some(self.channel.alt_address);

            if engine.is_open() {
                engine.register_undo(UndoAction::RunInverseCommand {
                    command: self.channel.reload_command.clone(),
                })?;
                engine.register_undo(UndoAction::RestoreFile {
                    backup,
                    target: production.clone(),
                })?;
            }
            self.launch(session.clone())
        })();

        let session = match armed {
            Ok(session) => session,
            Err(e) => {
                release_armed_marker(&self.armed_marker(), &session.id);
                return Err(e);
            }
        };

        let mode = fsutil::file_mode(&production).ok();
        if let Err(e) = fsutil::atomic_write_mode(&production, &content, mode) {
            self.abort_session(&session, &e.to_string());
            return Err(e);
        }
        if let Err(e) = exec::run(&self.channel.reload_command) {
            error!("Reload after swap failed, reverting now: {e}");
            self.abort_session(&session, &e.to_string());
            return Err(e);
        }

        // A worker that fired before the swap restored a file we then
        // overwrote. Put the backup back again.
        if self.session_dir(&session.id).decision() == Some(Decision::Revert) {
            error!(
                "Session {} was reverted while arming, restoring the backup again",
                session.id
            );
            let errors = session.revert.execute();
            if !errors.is_empty() {
                error!("Re-revert of session {} had errors: {}", session.id, errors.join("; "));
            }
            return Err(LifelineError::ReachabilityTimeout {
                address: connect_address(self.channel.production_address).to_string(),
                timeout_secs,
                detail: "revert timer fired before the swap completed".to_string(),
            });
        }

        self.log_event(
            LogEvent::Begin,
            &session.id,
            &format!("armed {} for {}s", session.label, timeout_secs),
        );
        warn!(
            "Armed watchdog session {}: {} reverts at {} unless confirmed",
            session.id,
            production.display(),
            session.deadline()
        );
        Ok(session)
    }

    /// Arm an arbitrary revert plan, e.g. restoring a packet filter dump.
    ///
    /// The caller mutates the system after this returns and then confirms
    /// or cancels.
    pub fn arm_guard(
        &self,
        label: &str,
        plan: RevertPlan,
        timeout_secs: u64,
    ) -> Result<WatchdogSession> {
        if timeout_secs == 0 {
            return Err(LifelineError::ZeroTimeout);
        }
        let session = self.new_session(label, plan, timeout_secs);
        self.claim_marker(&session.id)?;
        let session = match self.launch(session.clone()) {
            Ok(session) => session,
            Err(e) => {
                release_armed_marker(&self.armed_marker(), &session.id);
                return Err(e);
            }
        };
        self.log_event(
            LogEvent::Begin,
            &session.id,
            &format!("armed guard {label} for {timeout_secs}s"),
        );
        info!("Armed guard session {} for {label}", session.id);
        Ok(session)
    }

    /// Id of the armed session, if any.
    pub fn armed_id(&self) -> Result<Option<String>> {
        let marker = self.armed_marker();
        match fs::read_to_string(&marker) {
            Ok(id) => Ok(Some(id.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&marker)(e)),
        }
    }

    pub fn load_session(&self, id: &str) -> Result<WatchdogSession> {
        validate_id(id)?;
        let sdir = self.session_dir(id);
        if !sdir.path().exists() {
            return Err(LifelineError::NotFound(format!("watchdog session {id}")));
        }
        sdir.load()
    }

    fn active_session(&self) -> Result<WatchdogSession> {
        let id = self.armed_id()?.ok_or(LifelineError::NotArmed)?;
        self.load_session(&id)
    }

    /// Probe the production channel and cancel the armed revert on success.
    ///
    /// On failure the timer keeps running and the error is returned.
    pub fn confirm_reachability(&self) -> Result<CancelOutcome> {
        let session = self.active_session()?;
        self.confirm_session(&session)
    }

    pub(crate) fn confirm_session(&self, session: &WatchdogSession) -> Result<CancelOutcome> {
        let address = self.channel.production_address;
        let probed = wait_for_banner(address, &self.channel.banner_prefix, self.probe_timeout())
            .and_then(|banner| {
                debug!("Production channel answered: {banner}");
                match &self.channel.probe_command {
                    Some(argv) => exec::run(argv).map(|_| ()).map_err(|e| {
                        LifelineError::ReachabilityTimeout {
                            address: connect_address(address).to_string(),
                            timeout_secs: self.channel.probe_timeout_secs,
                            detail: format!("authenticated probe failed: {e}"),
                        }
                    }),
                    None => Ok(()),
                }
            });

        if let Err(e) = probed {
            warn!(
                "Session {} not confirmed, revert still fires at {}: {e}",
                session.id,
                session.deadline()
            );
            return Err(e);
        }
        self.cancel_session(session)
    }

    /// Suppress the armed revert without probing.
    pub fn cancel(&self) -> Result<CancelOutcome> {
        let session = self.active_session()?;
        self.cancel_session(&session)
    }

    fn cancel_session(&self, session: &WatchdogSession) -> Result<CancelOutcome> {
        let sdir = self.session_dir(&session.id);
        if !sdir.claim(Decision::Cancel)? {
            warn!("Session {} was already reverted", session.id);
            return Ok(CancelOutcome::AlreadyReverted(sdir.load()?));
        }
        sdir.mark_cancelled()?;
        release_armed_marker(&session.armed_marker, &session.id);
        self.log_event(
            LogEvent::Commit,
            &session.id,
            &format!("confirmed {}", session.label),
        );
        info!("Watchdog session {} confirmed, revert cancelled", session.id);
        Ok(CancelOutcome::Cancelled(sdir.load()?))
    }

    /// The armed session, if any.
    pub fn status(&self) -> Result<Option<ArmedStatus>> {
        let Some(id) = self.armed_id()? else {
            return Ok(None);
        };
        let session = self.load_session(&id)?;
        let deadline = session.deadline();
        let now = Utc::now();
        let worker_alive = session.worker_pid.map(|pid| {
            i32::try_from(pid)
                .map(|pid| kill(Pid::from_raw(pid), None).is_ok())
                .unwrap_or(false)
        });
        let grace = ChronoDuration::seconds(i64::from(
            u32::try_from(self.channel.grace_secs).unwrap_or(u32::MAX),
        ));
        let stale = now > deadline + grace && worker_alive != Some(true);

        Ok(Some(ArmedStatus {
            remaining_secs: (deadline - now).num_seconds(),
            deadline,
            worker_alive,
            stale,
            session,
        }))
    }

    /// Validate, test, arm and confirm `candidate` in one go.
    ///
    /// If confirmation fails the session is reverted and settled before the
    /// error is returned. In dry-run mode the sequence stops after the
    /// parallel test.
    pub fn run_flow(
        &self,
        engine: &mut Engine,
        candidate: &Path,
        timeout_secs: u64,
    ) -> Result<FlowOutcome> {
        self.validate_syntax(candidate)?;
        self.test_parallel_instance(candidate)?;
        if engine.dry_run() {
            info!(
                "[dry-run] {} passed validation and the parallel test; not arming",
                candidate.display()
            );
            return Ok(FlowOutcome::DryRun);
        }

        let session = self.arm(engine, candidate, timeout_secs)?;
        // A failed confirmation fails the task and unwinds its transaction;
        // the timer must not outlive it and revert a later change.
        let outcome = match self.confirm_session(&session) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abort_session(&session, &format!("confirmation failed: {e}"));
                return Err(e);
            }
        };
        match outcome {
            CancelOutcome::Cancelled(session) => Ok(FlowOutcome::Confirmed(session)),
            CancelOutcome::AlreadyReverted(session) => Err(LifelineError::ReachabilityTimeout {
                address: connect_address(self.channel.production_address).to_string(),
                timeout_secs: session.timeout_secs,
                detail: "reverted before confirmation completed".to_string(),
            }),
        }
    }
}

/// SIGTERM, a short wait, then SIGKILL.
fn stop_child(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
    let started = Instant::now();
    while started.elapsed() < STOP_GRACE {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    warn!("Test instance ignored SIGTERM, killing it");
    let _ = child.kill();
    let _ = child.wait();
}
