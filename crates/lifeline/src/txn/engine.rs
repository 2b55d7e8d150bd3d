//! Transaction engine
//!
//! One [`Engine`] exists per run. It owns at most one open transaction and
//! that transaction's undo stack. Every state change is written to the
//! journal before it takes effect in memory, so a crashed run can be
//! unwound by the next one.
//!
//! # Rollback triggers
//!
//! - explicit [`Engine::rollback`]
//! - dropping the engine while a transaction is open (panic, early return)
//! - a termination signal, observed by the orchestrator between tasks
//! - [`Engine::recover_interrupted`] after the process died outright

use crate::config::SystemConfig;
use crate::error::{LifelineError, Result};
use crate::fsutil;
use crate::store::{BackupRecord, BackupStore};
use crate::txn::action::{UndoAction, UndoContext};
use crate::txn::journal::{Journal, JournalRecord, PendingTransaction};
use crate::txn::log::{LogEvent, RollbackLog};
use crate::txn::signals;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use tracing::{debug, error, info, warn};

static TXN_COUNTER: AtomicU64 = AtomicU64::new(0);
static SIGNAL_HANDLERS: Once = Once::new();

/// Rollback reason used when a dropped engine still had a transaction open
pub const ABNORMAL_EXIT: &str = "abnormal-exit";

/// Rollback reason used by crash recovery
pub const RECOVERED_AFTER_CRASH: &str = "recovered-after-crash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionStatus {
    Open,
    Committed,
    RolledBack,
}

/// The currently open transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub name: String,
    pub started: DateTime<Utc>,
    pub status: TransactionStatus,
    actions: Vec<UndoAction>,
    checkpoints: Vec<(String, usize)>,
}

impl Transaction {
    /// Registered undo actions in registration order
    #[must_use]
    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }
}

/// Outcome of one undone action
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// Position of the action in the undo stack
    pub index: usize,
    pub action: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// What a rollback did, action by action (in execution order)
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub transaction: Option<String>,
    pub reason: String,
    pub outcomes: Vec<ActionOutcome>,
}

impl RollbackReport {
    /// True when every action was undone successfully
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.ok)
    }

    #[must_use]
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.ok).count()
    }
}

/// Transactional undo engine
pub struct Engine {
    store: BackupStore,
    system: SystemConfig,
    journal: Journal,
    log: RollbackLog,
    dry_run: bool,
    current: Option<Transaction>,
}

impl Engine {
    /// Create an engine keeping its journal and rollback log in `state_dir`.
    pub fn new(store: BackupStore, system: SystemConfig, state_dir: &Path) -> Result<Self> {
        fsutil::ensure_dir(state_dir, 0o750)?;
        Ok(Self {
            store,
            system,
            journal: Journal::new(state_dir.join("journal.jsonl")),
            log: RollbackLog::new(state_dir.join("rollback.log")),
            dry_run: false,
            current: None,
        })
    }

    /// In dry-run mode mutations are skipped and rollbacks only log.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    #[must_use]
    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    #[must_use]
    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    #[must_use]
    pub fn rollback_log(&self) -> &RollbackLog {
        &self.log
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    #[must_use]
    pub fn current(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    /// A transaction left open in the journal by a previous process.
    pub fn pending(&self) -> Result<Option<PendingTransaction>> {
        self.journal.replay()
    }

    /// Open a transaction. Transactions do not nest.
    ///
    /// Refuses to start while the journal still holds an interrupted
    /// transaction; that one must be recovered first.
    pub fn begin(&mut self, name: &str) -> Result<String> {
        if let Some(txn) = &self.current {
            return Err(LifelineError::AlreadyOpen(txn.name.clone()));
        }
        if let Some(pending) = self.journal.replay()? {
            return Err(LifelineError::Journal(format!(
                "transaction '{}' ({}) was interrupted and must be recovered first",
                pending.name, pending.id
            )));
        }

        SIGNAL_HANDLERS.call_once(signals::install_termination_handlers);

        let seq = TXN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let started = Utc::now();
        let id = format!(
            "{}-{}-{seq}",
            started.format("%Y%m%d-%H%M%S"),
            std::process::id()
        );

        self.journal.append(&JournalRecord::Begin {
            id: id.clone(),
            name: name.to_string(),
            at: started,
        })?;
        self.log.record(LogEvent::Begin, &id, name)?;

        debug!("Transaction {id} ({name}) opened");
        self.current = Some(Transaction {
            id: id.clone(),
            name: name.to_string(),
            started,
            status: TransactionStatus::Open,
            actions: Vec::new(),
            checkpoints: Vec::new(),
        });
        Ok(id)
    }

    fn open_mut(&mut self) -> Result<&mut Transaction> {
        self.current.as_mut().ok_or(LifelineError::NoOpenTransaction)
    }

    /// Push an undo action. The journal write happens first; if it fails
    /// the action is not registered and the caller must not mutate.
    pub fn register_undo(&mut self, action: UndoAction) -> Result<()> {
        if self.current.is_none() {
            return Err(LifelineError::NoOpenTransaction);
        }
        self.journal.append(&JournalRecord::Undo {
            action: action.clone(),
        })?;
        debug!("Registered undo: {}", action.describe());
        self.open_mut()?.actions.push(action);
        Ok(())
    }

    /// Mark the current stack height under `name`.
    pub fn checkpoint(&mut self, name: &str) -> Result<()> {
        let len = self.open_mut()?.actions.len();
        self.journal.append(&JournalRecord::Checkpoint {
            name: name.to_string(),
            len,
        })?;
        self.open_mut()?.checkpoints.push((name.to_string(), len));
        Ok(())
    }

    /// Undo everything registered after checkpoint `name`, newest first,
    /// then cut the stack back to it. The checkpoint itself remains.
    pub fn rollback_to_checkpoint(&mut self, name: &str) -> Result<RollbackReport> {
        let txn = self.open_mut()?;
        let (position, len) = txn
            .checkpoints
            .iter()
            .enumerate()
            .rev()
            .find(|(_, (cp, _))| cp == name)
            .map(|(i, (_, len))| (i, *len))
            .ok_or_else(|| LifelineError::UnknownCheckpoint(name.to_string()))?;

        let tail: Vec<UndoAction> = txn.actions.split_off(len);
        txn.checkpoints.truncate(position + 1);
        let id = txn.id.clone();

        let reason = format!("checkpoint {name}");
        let outcomes = self.unwind(&id, &reason, len, &tail);

        if let Err(e) = self.journal.append(&JournalRecord::Truncate { len }) {
            error!("Failed to journal checkpoint rollback: {e}");
        }

        Ok(RollbackReport {
            transaction: Some(id),
            reason,
            outcomes,
        })
    }

    /// Close the transaction, keeping every change. Idempotent.
    pub fn commit(&mut self) -> Result<()> {
        let Some(txn) = self.current.as_ref() else {
            warn!("Commit requested with no open transaction");
            return Ok(());
        };

        self.journal.clear()?;
        let id = txn.id.clone();
        let detail = format!("{} ({} actions)", txn.name, txn.actions.len());
        if let Err(e) = self.log.record(LogEvent::Commit, &id, &detail) {
            warn!("Failed to write rollback log: {e}");
        }
        if let Some(mut txn) = self.current.take() {
            txn.status = TransactionStatus::Committed;
            info!("Transaction {} ({}) committed", txn.id, txn.name);
        }
        Ok(())
    }

    /// Undo every registered action in reverse order and close the
    /// transaction.
    ///
    /// Never fails: individual failures are logged and recorded in the
    /// report, and the unwind continues.
    pub fn rollback(&mut self, reason: &str) -> RollbackReport {
        let Some(mut txn) = self.current.take() else {
            warn!("Rollback requested with no open transaction; nothing to undo");
            return RollbackReport {
                transaction: None,
                reason: reason.to_string(),
                outcomes: Vec::new(),
            };
        };

        warn!(
            "Rolling back transaction {} ({}): {reason}",
            txn.id, txn.name
        );
        let actions = std::mem::take(&mut txn.actions);
        let outcomes = self.unwind(&txn.id, reason, 0, &actions);

        if let Err(e) = self.journal.append(&JournalRecord::RolledBack {
            reason: reason.to_string(),
        }) {
            error!("Failed to journal rollback: {e}");
        }
        if let Err(e) = self.journal.clear() {
            error!("Failed to clear journal: {e}");
        }

        let failures = outcomes.iter().filter(|o| !o.ok).count();
        let summary = format!(
            "{}: {reason} ({} undone, {failures} failed)",
            txn.name,
            outcomes.len()
        );
        if let Err(e) = self.log.record(LogEvent::Rollback, &txn.id, &summary) {
            error!("Failed to write rollback log: {e}");
        }
        txn.status = TransactionStatus::RolledBack;

        RollbackReport {
            transaction: Some(txn.id),
            reason: reason.to_string(),
            outcomes,
        }
    }

    /// Execute `actions` newest first. `base` is the stack index of
    /// `actions[0]`.
    fn unwind(
        &self,
        txid: &str,
        reason: &str,
        base: usize,
        actions: &[UndoAction],
    ) -> Vec<ActionOutcome> {
        let ctx = UndoContext {
            store: &self.store,
            system: &self.system,
            dry_run: self.dry_run,
        };

        let mut outcomes = Vec::with_capacity(actions.len());
        for (offset, action) in actions.iter().enumerate().rev() {
            let index = base + offset;
            let description = action.describe();
            let result = action.undo(&ctx);
            let (ok, err) = match result {
                Ok(()) => (true, None),
                Err(e) => {
                    error!("Undo of '{description}' failed: {e}");
                    (false, Some(e.to_string()))
                }
            };

            let detail = match &err {
                None => format!("{reason}: #{index} {description}: ok"),
                Some(e) => format!("{reason}: #{index} {description}: FAILED {e}"),
            };
            if let Err(e) = self.log.record(LogEvent::Rollback, txid, &detail) {
                error!("Failed to write rollback log: {e}");
            }

            outcomes.push(ActionOutcome {
                index,
                action: description,
                ok,
                error: err,
            });
        }
        outcomes
    }

    /// Replace `path` through a working copy.
    ///
    /// The file is backed up, copied to a working copy next to it and
    /// handed to `mutate`. Only if `mutate` succeeds is the restore action
    /// registered and the working copy renamed over `path`. On failure the
    /// working copy is removed and nothing is registered.
    pub fn atomic_file_update<F>(&mut self, path: &Path, mutate: F) -> Result<BackupRecord>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if self.current.is_none() {
            return Err(LifelineError::NoOpenTransaction);
        }

        let record = self.store.backup_file(path)?;
        let work = fsutil::sibling_temp_path(path, "work");
        fsutil::copy_atomic(path, &work)?;

        if let Err(e) = mutate(&work) {
            let _ = fs::remove_file(&work);
            return Err(e);
        }

        if self.dry_run {
            info!("[dry-run] would replace {}", path.display());
            let _ = fs::remove_file(&work);
            return Ok(record);
        }

        if let Err(e) = self.register_undo(UndoAction::RestoreFile {
            backup: record.clone(),
            target: path.to_path_buf(),
        }) {
            let _ = fs::remove_file(&work);
            return Err(e);
        }

        fs::rename(&work, path).map_err(|e| {
            let _ = fs::remove_file(&work);
            LifelineError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        })?;
        info!("Updated {}", path.display());
        Ok(record)
    }

    /// Register `action`, then run `mutate`.
    ///
    /// The action stays registered if `mutate` fails, so a rollback also
    /// covers a partially applied mutation. In dry-run mode `mutate` is not
    /// called.
    pub fn register_and_mutate<F>(&mut self, action: UndoAction, mutate: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let description = action.describe();
        self.register_undo(action)?;
        if self.dry_run {
            info!("[dry-run] would apply change (undo: {description})");
            return Ok(());
        }
        mutate()
    }

    /// Roll back a transaction a previous process left open in the journal.
    pub fn recover_interrupted(&mut self) -> Result<Option<RollbackReport>> {
        if let Some(txn) = &self.current {
            return Err(LifelineError::AlreadyOpen(txn.name.clone()));
        }
        let Some(pending) = self.journal.replay()? else {
            return Ok(None);
        };

        warn!(
            "Recovering interrupted transaction {} ({}) with {} undo actions",
            pending.id,
            pending.name,
            pending.actions.len()
        );
        self.current = Some(Transaction {
            id: pending.id,
            name: pending.name,
            started: pending.started,
            status: TransactionStatus::Open,
            actions: pending.actions,
            checkpoints: pending.checkpoints,
        });
        Ok(Some(self.rollback(RECOVERED_AFTER_CRASH)))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.current.is_some() {
            let report = self.rollback(ABNORMAL_EXIT);
            if !report.is_clean() {
                error!(
                    "Abnormal-exit rollback finished with {} failed actions",
                    report.failures()
                );
            }
        }
    }
}
