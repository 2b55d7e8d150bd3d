//! Watchdog session state on disk
//!
//! The arming process and the revert worker share nothing but this
//! directory:
//!
//! ```text
//! <watchdog>/armed                       session id; exists while armed
//! <watchdog>/sessions/<id>/session.json  the session and its revert plan
//! <watchdog>/sessions/<id>/decision      "cancel" or "revert", created once
//! <watchdog>/sessions/<id>/cancelled     written after a confirmed cancel
//! <watchdog>/sessions/<id>/reverted      written after the plan ran
//! ```
//!
//! `decision` is linked into place only if absent, so a cancel racing the
//! revert timer has exactly one winner and readers never see it half written.

use crate::error::{io_err, LifelineError, Result};
use crate::exec;
use crate::fsutil::{self, hash_file};
use crate::store::{BackupRecord, Checksum};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// One file the revert worker copies back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRestore {
    pub backup: PathBuf,
    pub target: PathBuf,
    pub checksum: Option<Checksum>,
}

/// Everything the revert worker does when the timer fires
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertPlan {
    /// Files restored first, in order
    pub restore: Vec<FileRestore>,
    /// Commands run afterwards, in order (e.g. a service reload)
    pub commands: Vec<Vec<String>>,
}

impl RevertPlan {
    /// Run the plan. Every step is attempted; failures are returned as
    /// messages. Running the plan twice has the same effect as once.
    pub fn execute(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for item in &self.restore {
            match fsutil::copy_atomic(&item.backup, &item.target) {
                Ok(_) => {
                    if let Some(expected) = item.checksum {
                        if hash_file(&item.target).ok() != Some(expected) {
                            warn!(
                                "Reverted {} but its checksum differs from the backup",
                                item.target.display()
                            );
                        }
                    }
                    info!("Reverted {}", item.target.display());
                }
                Err(e) => {
                    error!("Failed to revert {}: {e}", item.target.display());
                    errors.push(format!("restore {}: {e}", item.target.display()));
                }
            }
        }

        for argv in &self.commands {
            if let Err(e) = exec::run(argv) {
                error!("Revert command failed: {e}");
                errors.push(e.to_string());
            }
        }
        errors
    }
}

/// An armed (or formerly armed) watchdog session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSession {
    pub id: String,
    /// What was armed, for status output
    pub label: String,
    /// Production config swapped by a control-channel arm
    pub production_config: Option<PathBuf>,
    /// Pre-change backup of the production config
    pub backup: Option<BackupRecord>,
    /// Rendered config of the parallel test instance
    pub test_config: Option<PathBuf>,
    pub alt_address: Option<SocketAddr>,
    pub armed_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub revert: RevertPlan,
    /// Marker released when the session ends
    pub armed_marker: PathBuf,
    /// Rollback log the worker reports to
    pub rollback_log: PathBuf,
    /// PID of the detached revert worker, when known
    #[serde(default)]
    pub worker_pid: Option<u32>,
    /// Filled in from the session directory on load
    #[serde(skip)]
    pub cancelled: bool,
}

impl WatchdogSession {
    /// When the revert fires unless cancelled
    #[must_use]
    pub fn deadline(&self) -> DateTime<Utc> {
        self.armed_at + Duration::seconds(i64::from(u32::try_from(self.timeout_secs).unwrap_or(u32::MAX)))
    }
}

/// Which side won the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Cancel,
    Revert,
}

impl Decision {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Revert => "revert",
        }
    }
}

/// Handle on `sessions/<id>/`
#[derive(Debug, Clone)]
pub struct SessionDir {
    path: PathBuf,
}

impl SessionDir {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn session_file(&self) -> PathBuf {
        self.path.join("session.json")
    }

    pub fn save(&self, session: &WatchdogSession) -> Result<()> {
        fsutil::ensure_dir(&self.path, 0o700)?;
        let json = serde_json::to_vec_pretty(session).map_err(|e| {
            LifelineError::Backup(format!("Failed to serialize watchdog session: {e}"))
        })?;
        fsutil::atomic_write_mode(&self.session_file(), &json, Some(0o600))
    }

    pub fn load(&self) -> Result<WatchdogSession> {
        let path = self.session_file();
        let content = fs::read_to_string(&path).map_err(io_err(&path))?;
        let mut session: WatchdogSession = serde_json::from_str(&content).map_err(|e| {
            LifelineError::Backup(format!("Corrupt watchdog session {}: {e}", path.display()))
        })?;
        session.cancelled = self.decision() == Some(Decision::Cancel);
        Ok(session)
    }

    /// Try to decide the session. Returns `false` if the other side already
    /// decided it.
    ///
    /// The decision is written to a private temp file and hard-linked into
    /// place, so `decision` never exists without its content.
    pub fn claim(&self, decision: Decision) -> Result<bool> {
        let path = self.path.join("decision");
        let staging = fsutil::sibling_temp_path(&path, "claim");
        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .and_then(|mut file| {
                file.write_all(decision.as_str().as_bytes())?;
                file.sync_all()
            })
            .map_err(io_err(&staging));
        if let Err(e) = written {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }

        let linked = fs::hard_link(&staging, &path);
        let _ = fs::remove_file(&staging);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    #[must_use]
    pub fn decision(&self) -> Option<Decision> {
        match fs::read_to_string(self.path.join("decision")).ok()?.trim() {
            "cancel" => Some(Decision::Cancel),
            "revert" => Some(Decision::Revert),
            _ => None,
        }
    }

    pub fn mark_cancelled(&self) -> Result<()> {
        fsutil::atomic_write(&self.path.join("cancelled"), Utc::now().to_rfc3339().as_bytes())
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.path.join("cancelled").exists()
    }

    pub fn mark_reverted(&self, errors: &[String]) -> Result<()> {
        let mut content = Utc::now().to_rfc3339();
        for e in errors {
            content.push('\n');
            content.push_str(e);
        }
        fsutil::atomic_write(&self.path.join("reverted"), content.as_bytes())
    }

    #[cfg(test)]
    pub fn is_reverted(&self) -> bool {
        self.path.join("reverted").exists()
    }
}

/// Remove the armed marker, but only if it still names `id`.
pub fn release_armed_marker(marker: &Path, id: &str) {
    match fs::read_to_string(marker) {
        Ok(current) if current.trim() == id => {
            if let Err(e) = fs::remove_file(marker) {
                warn!("Failed to release watchdog marker {}: {e}", marker.display());
            }
        }
        Ok(current) => warn!(
            "Watchdog marker now belongs to session {}, leaving it",
            current.trim()
        ),
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(dir: &Path) -> WatchdogSession {
        WatchdogSession {
            id: "s1".to_string(),
            label: "test".to_string(),
            production_config: None,
            backup: None,
            test_config: None,
            alt_address: None,
            armed_at: Utc::now(),
            timeout_secs: 30,
            revert: RevertPlan::default(),
            armed_marker: dir.join("armed"),
            rollback_log: dir.join("rollback.log"),
            worker_pid: None,
            cancelled: false,
        }
    }

    #[test]
    fn decision_has_exactly_one_winner() {
        let dir = TempDir::new().expect("tempdir");
        let sdir = SessionDir::new(dir.path().join("s1"));
        sdir.save(&session(dir.path())).expect("save");

        assert!(sdir.claim(Decision::Revert).expect("claim"));
        assert!(!sdir.claim(Decision::Cancel).expect("claim"));
        assert_eq!(sdir.decision(), Some(Decision::Revert));
        assert!(!sdir.load().expect("load").cancelled);
    }

    #[test]
    fn racing_claims_agree_on_one_complete_decision() {
        let dir = TempDir::new().expect("tempdir");
        let sdir = SessionDir::new(dir.path().join("s1"));
        sdir.save(&session(dir.path())).expect("save");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sdir = sdir.clone();
                std::thread::spawn(move || {
                    let want = if i % 2 == 0 { Decision::Cancel } else { Decision::Revert };
                    let won = sdir.claim(want).expect("claim");
                    // Anyone who lost must already read a decision
                    let seen = sdir.decision().expect("decision visible");
                    (won, want, seen)
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();

        let winners: Vec<_> = results.iter().filter(|(won, _, _)| *won).collect();
        assert_eq!(winners.len(), 1);
        let decided = winners[0].1;
        assert!(results.iter().all(|(_, _, seen)| *seen == decided));

        let mut names: Vec<_> = fs::read_dir(sdir.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["decision".to_string(), "session.json".to_string()]);
    }

    #[test]
    fn cancelled_flag_comes_from_the_directory() {
        let dir = TempDir::new().expect("tempdir");
        let sdir = SessionDir::new(dir.path().join("s1"));
        sdir.save(&session(dir.path())).expect("save");
        assert!(sdir.claim(Decision::Cancel).expect("claim"));
        sdir.mark_cancelled().expect("mark");
        assert!(sdir.load().expect("load").cancelled);
        assert!(sdir.is_cancelled());
    }

    #[test]
    fn plan_execution_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let backup = dir.path().join("backup");
        let target = dir.path().join("target");
        fs::write(&backup, b"good").expect("write");
        fs::write(&target, b"bad").expect("write");

        let plan = RevertPlan {
            restore: vec![FileRestore {
                backup: backup.clone(),
                target: target.clone(),
                checksum: Some(hash_file(&backup).expect("hash")),
            }],
            commands: vec![vec!["true".to_string()]],
        };
        assert!(plan.execute().is_empty());
        assert!(plan.execute().is_empty());
        assert_eq!(fs::read(&target).expect("read"), b"good");
    }

    #[test]
    fn marker_release_checks_owner() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("armed");
        fs::write(&marker, "other").expect("write");
        release_armed_marker(&marker, "s1");
        assert!(marker.exists());
        fs::write(&marker, "s1\n").expect("write");
        release_armed_marker(&marker, "s1");
        assert!(!marker.exists());
    }
}
