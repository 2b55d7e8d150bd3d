//! Durable transaction journal
//!
//! The in-memory undo stack is mirrored into a JSON-lines file, one record
//! per state change, each fsynced before the call returns. If the process
//! dies with a transaction open, the journal still describes it and
//! [`Journal::replay`] reconstructs the undo stack for crash recovery.

use crate::error::{LifelineError, Result};
use crate::fsutil;
use crate::txn::action::UndoAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One journal line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
pub enum JournalRecord {
    Begin {
        id: String,
        name: String,
        at: DateTime<Utc>,
    },
    Undo {
        action: UndoAction,
    },
    Checkpoint {
        name: String,
        len: usize,
    },
    /// Stack cut back to `len` after a checkpoint rollback
    Truncate {
        len: usize,
    },
    Commit,
    RolledBack {
        reason: String,
    },
}

/// A transaction found open in the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub id: String,
    pub name: String,
    pub started: DateTime<Utc>,
    pub actions: Vec<UndoAction>,
    pub checkpoints: Vec<(String, usize)>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record and flush it to disk.
    pub fn append(&self, record: &JournalRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| LifelineError::Journal(format!("Failed to serialize record: {e}")))?;
        fsutil::append_line(&self.path, &line)
            .map_err(|e| LifelineError::Journal(format!("Failed to append to journal: {e}")))
    }

    /// Rebuild the transaction left open by the journal, if any.
    ///
    /// A line that does not parse is skipped with a warning; a torn final
    /// line from a crash mid-append is expected.
    pub fn replay(&self) -> Result<Option<PendingTransaction>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LifelineError::Journal(format!(
                    "Failed to read journal {}: {e}",
                    self.path.display()
                )))
            }
        };

        let mut pending: Option<PendingTransaction> = None;
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: JournalRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        "Skipping unreadable journal line {} in {}: {e}",
                        lineno + 1,
                        self.path.display()
                    );
                    continue;
                }
            };

            match record {
                JournalRecord::Begin { id, name, at } => {
                    pending = Some(PendingTransaction {
                        id,
                        name,
                        started: at,
                        actions: Vec::new(),
                        checkpoints: Vec::new(),
                    });
                }
                JournalRecord::Undo { action } => {
                    if let Some(txn) = pending.as_mut() {
                        txn.actions.push(action);
                    }
                }
                JournalRecord::Checkpoint { name, len } => {
                    if let Some(txn) = pending.as_mut() {
                        txn.checkpoints.push((name, len));
                    }
                }
                JournalRecord::Truncate { len } => {
                    if let Some(txn) = pending.as_mut() {
                        txn.actions.truncate(len);
                        txn.checkpoints.retain(|(_, at)| *at <= len);
                    }
                }
                JournalRecord::Commit | JournalRecord::RolledBack { .. } => pending = None,
            }
        }
        Ok(pending)
    }

    /// Remove the journal file.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LifelineError::Journal(format!(
                "Failed to remove journal {}: {e}",
                self.path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cmd(name: &str) -> UndoAction {
        UndoAction::RunInverseCommand {
            command: vec![name.to_string()],
        }
    }

    fn begin(id: &str) -> JournalRecord {
        JournalRecord::Begin {
            id: id.to_string(),
            name: "task".to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn replay_reconstructs_open_transaction() {
        let dir = TempDir::new().expect("tempdir");
        let journal = Journal::new(dir.path().join("journal.jsonl"));

        journal.append(&begin("t1")).expect("append");
        journal.append(&JournalRecord::Undo { action: cmd("a") }).expect("append");
        journal
            .append(&JournalRecord::Checkpoint {
                name: "cp".to_string(),
                len: 1,
            })
            .expect("append");
        journal.append(&JournalRecord::Undo { action: cmd("b") }).expect("append");
        journal.append(&JournalRecord::Undo { action: cmd("c") }).expect("append");
        journal.append(&JournalRecord::Truncate { len: 1 }).expect("append");
        journal.append(&JournalRecord::Undo { action: cmd("d") }).expect("append");

        let pending = journal.replay().expect("replay").expect("pending");
        assert_eq!(pending.id, "t1");
        assert_eq!(pending.actions, vec![cmd("a"), cmd("d")]);
        assert_eq!(pending.checkpoints, vec![("cp".to_string(), 1)]);
    }

    #[test]
    fn closed_transactions_replay_to_none() {
        let dir = TempDir::new().expect("tempdir");
        let journal = Journal::new(dir.path().join("journal.jsonl"));
        assert!(journal.replay().expect("replay").is_none());

        journal.append(&begin("t1")).expect("append");
        journal.append(&JournalRecord::Undo { action: cmd("a") }).expect("append");
        journal.append(&JournalRecord::Commit).expect("append");
        assert!(journal.replay().expect("replay").is_none());
    }

    #[test]
    fn torn_last_line_is_tolerated() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::new(path.clone());
        journal.append(&begin("t1")).expect("append");
        journal.append(&JournalRecord::Undo { action: cmd("a") }).expect("append");
        fsutil::append_line(&path, r#"{"record":"undo","action":{"act"#).expect("torn");

        let pending = journal.replay().expect("replay").expect("pending");
        assert_eq!(pending.actions, vec![cmd("a")]);
    }

    #[test]
    fn unknown_actions_survive_replay() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::new(path.clone());
        journal.append(&begin("t1")).expect("append");
        fsutil::append_line(
            &path,
            r#"{"record":"undo","action":{"action":"restore-acl","path":"/srv"}}"#,
        )
        .expect("append");

        let pending = journal.replay().expect("replay").expect("pending");
        assert_eq!(pending.actions, vec![UndoAction::Unknown]);
    }
}
