//! Snapshots: a tracked file set plus raw system-state dumps, captured
//! together under one id.
//!
//! The `SNAPSHOT` manifest line is written last. Until it exists the
//! snapshot directory is ignored by every reader, so a capture interrupted
//! halfway is never restored from.

use crate::config::SnapshotConfig;
use crate::error::{io_err, LifelineError, Result};
use crate::exec;
use crate::fsutil::{self, hash_bytes};
use crate::store::backup::{BackupStore, STORE_DIR_MODE};
use crate::store::types::{BackupKind, BackupRecord, SnapshotInfo, StateDump};
use crate::store::{generate_id, validate_id};
use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const SNAPSHOT_FILE: &str = "snapshot.json";

/// Outcome of replaying a snapshot onto the live system
#[derive(Debug, Default)]
pub struct SnapshotRestoreReport {
    pub restored: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// State dumps re-applied through their restore command
    pub states_applied: Vec<String>,
    /// Restore or reload commands that failed
    pub commands_failed: Vec<(String, String)>,
}

impl SnapshotRestoreReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.commands_failed.is_empty()
    }
}

/// Flattened name for `path` that no earlier entry of `used` has taken.
///
/// Flattening is lossy (`/etc/ssh/config` and `/etc/ssh_config` meet), so
/// later arrivals get a numeric suffix.
fn distinct_name(used: &mut HashSet<String>, path: &Path) -> String {
    let base = fsutil::flatten_path(path);
    let mut name = base.clone();
    let mut n = 0u32;
    while !used.insert(name.clone()) {
        n += 1;
        name = format!("{base}.{n}");
    }
    name
}

impl BackupStore {
    /// Capture a snapshot of the configured file set and state dumps.
    ///
    /// Missing or unreadable files and failing dump commands are logged and
    /// listed in [`SnapshotInfo::skipped`]; they never fail the snapshot.
    pub fn create_snapshot(&self, id: Option<&str>, config: &SnapshotConfig) -> Result<SnapshotInfo> {
        let id = match id {
            Some(id) => id.to_string(),
            None => generate_id(),
        };
        validate_id(&id)?;

        let dir = self.snapshots_dir().join(&id);
        if dir.exists() {
            return Err(LifelineError::Snapshot(format!(
                "Snapshot '{id}' already exists"
            )));
        }
        let files_dir = dir.join("files");
        let state_dir = dir.join("state");
        for d in [&dir, &files_dir, &state_dir] {
            fsutil::ensure_dir(d, STORE_DIR_MODE).map_err(|e| {
                LifelineError::Snapshot(format!(
                    "Failed to create snapshot directory {}: {e}",
                    d.display()
                ))
            })?;
        }

        let mut files = Vec::new();
        let mut skipped = Vec::new();

        let mut used = HashSet::new();
        for path in &config.files {
            let dest = files_dir.join(distinct_name(&mut used, path));
            match self.backup_file_into(path, &dest) {
                Ok(record) => files.push(record),
                Err(e) => {
                    warn!("Snapshot {id}: skipping {}: {e}", path.display());
                    skipped.push(path.clone());
                }
            }
        }

        let mut states = Vec::new();
        for capture in &config.states {
            let content = if let Some(command) = &capture.command {
                exec::capture(command)
            } else if let Some(source) = &capture.source {
                fs::read(source).map_err(io_err(source))
            } else {
                warn!("Snapshot {id}: state '{}' has no command or source", capture.name);
                continue;
            };

            let content = match content {
                Ok(c) => c,
                Err(e) => {
                    warn!("Snapshot {id}: skipping state '{}': {e}", capture.name);
                    skipped.push(PathBuf::from(&capture.name));
                    continue;
                }
            };

            if validate_id(&capture.name).is_err() {
                warn!("Snapshot {id}: invalid state name '{}'", capture.name);
                skipped.push(PathBuf::from(&capture.name));
                continue;
            }
            let path = state_dir.join(&capture.name);
            fsutil::atomic_write_mode(&path, &content, Some(0o600))?;
            let checksum = hash_bytes(&content);
            self.manifest().append(&BackupRecord {
                source: PathBuf::from(&capture.name),
                backup: path.clone(),
                timestamp: Utc::now(),
                checksum: Some(checksum),
                kind: BackupKind::State,
            })?;
            states.push(StateDump {
                name: capture.name.clone(),
                path,
                checksum,
                restore: capture.restore.clone(),
            });
        }

        let info = SnapshotInfo {
            id: id.clone(),
            created: Utc::now(),
            files,
            states,
            skipped,
        };

        let json = serde_json::to_vec_pretty(&info)
            .map_err(|e| LifelineError::Snapshot(format!("Failed to serialize snapshot: {e}")))?;
        fsutil::atomic_write(&dir.join(SNAPSHOT_FILE), &json)?;

        self.manifest().append(&BackupRecord {
            source: PathBuf::from(&id),
            backup: dir,
            timestamp: info.created,
            checksum: Some(hash_bytes(&json)),
            kind: BackupKind::Snapshot,
        })?;

        info!(
            "Snapshot {id}: {} files, {} state dumps, {} skipped",
            info.files.len(),
            info.states.len(),
            info.skipped.len()
        );
        Ok(info)
    }

    /// Load a snapshot by id. Only snapshots with a manifest line exist.
    pub fn find_snapshot(&self, id: &str) -> Result<SnapshotInfo> {
        validate_id(id)?;
        let record = self
            .records()?
            .into_iter()
            .rev()
            .find(|r| r.kind == BackupKind::Snapshot && r.source == Path::new(id))
            .ok_or_else(|| LifelineError::NotFound(format!("snapshot '{id}'")))?;
        load_snapshot_info(&record.backup)
    }

    /// The newest complete snapshot, if any.
    pub fn latest_snapshot(&self) -> Result<Option<SnapshotInfo>> {
        for record in self.records()?.into_iter().rev() {
            if record.kind != BackupKind::Snapshot {
                continue;
            }
            match load_snapshot_info(&record.backup) {
                Ok(info) => return Ok(Some(info)),
                Err(e) => warn!("Ignoring unreadable snapshot {}: {e}", record.source.display()),
            }
        }
        Ok(None)
    }

    /// Every complete snapshot, oldest first. Unreadable ones are skipped.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.kind == BackupKind::Snapshot)
            .filter_map(|r| load_snapshot_info(&r.backup).ok())
            .collect())
    }

    /// Replay a snapshot onto the live system.
    ///
    /// `confirm` is shown the snapshot and must return `true` to proceed.
    /// Files are restored first, then each dump with a restore command is
    /// re-applied, then `reload_commands` run. Individual failures are
    /// collected in the report instead of stopping the restore.
    pub fn restore_snapshot<F>(
        &self,
        id: &str,
        reload_commands: &[Vec<String>],
        confirm: F,
    ) -> Result<SnapshotRestoreReport>
    where
        F: FnOnce(&SnapshotInfo) -> bool,
    {
        let info = self.find_snapshot(id)?;
        self.restore_snapshot_info(&info, reload_commands, confirm)
    }

    /// [`restore_snapshot`](Self::restore_snapshot) for an already loaded snapshot.
    pub fn restore_snapshot_info<F>(
        &self,
        info: &SnapshotInfo,
        reload_commands: &[Vec<String>],
        confirm: F,
    ) -> Result<SnapshotRestoreReport>
    where
        F: FnOnce(&SnapshotInfo) -> bool,
    {
        if !confirm(info) {
            return Err(LifelineError::Aborted(format!(
                "restore of snapshot '{}' not confirmed",
                info.id
            )));
        }

        let mut report = SnapshotRestoreReport::default();

        for record in &info.files {
            match self.restore_file(record) {
                Ok(()) => report.restored.push(record.source.clone()),
                Err(e) => {
                    error!("Failed to restore {}: {e}", record.source.display());
                    report.failed.push((record.source.clone(), e.to_string()));
                }
            }
        }

        for dump in &info.states {
            let Some(template) = &dump.restore else {
                continue;
            };
            let argv = exec::render_path(template, "dump", &dump.path);
            match exec::run(&argv) {
                Ok(_) => report.states_applied.push(dump.name.clone()),
                Err(e) => {
                    error!("Failed to re-apply state '{}': {e}", dump.name);
                    report.commands_failed.push((exec::argv_display(&argv), e.to_string()));
                }
            }
        }

        for argv in reload_commands {
            if let Err(e) = exec::run(argv) {
                error!("Reload command failed: {e}");
                report.commands_failed.push((exec::argv_display(argv), e.to_string()));
            }
        }

        info!(
            "Restored snapshot {}: {} files, {} failures",
            info.id,
            report.restored.len(),
            report.failed.len() + report.commands_failed.len()
        );
        Ok(report)
    }
}

fn load_snapshot_info(dir: &Path) -> Result<SnapshotInfo> {
    let path = dir.join(SNAPSHOT_FILE);
    let content = fs::read_to_string(&path).map_err(io_err(&path))?;
    serde_json::from_str(&content).map_err(|e| {
        LifelineError::Snapshot(format!("Corrupt snapshot metadata {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateCapture;
    use tempfile::TempDir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// Five tracked files, the last of which does not exist, plus two dumps.
    fn fixture(dir: &Path) -> SnapshotConfig {
        let etc = dir.join("etc");
        fs::create_dir_all(&etc).expect("mkdir");
        let mut files = Vec::new();
        for (i, name) in ["sshd_config", "sysctl.conf", "fstab", "hosts.allow", "hosts.deny"]
            .iter()
            .enumerate()
        {
            let path = etc.join(name);
            if i < 4 {
                fs::write(&path, format!("{name} contents\n")).expect("write");
            }
            files.push(path);
        }
        let mounts = dir.join("mounts");
        fs::write(&mounts, b"proc /proc proc rw 0 0\n").expect("write");
        let applied = dir.join("applied");

        SnapshotConfig {
            files,
            states: vec![
                StateCapture {
                    name: "rules".to_string(),
                    command: Some(argv(&["sh", "-c", "echo '-P INPUT DROP'"])),
                    source: None,
                    restore: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!("cp \"$0\" {}", applied.display()),
                        "{dump}".to_string(),
                    ]),
                },
                StateCapture {
                    name: "mounts".to_string(),
                    command: None,
                    source: Some(mounts),
                    restore: None,
                },
            ],
            reload_commands: vec![argv(&["true"])],
        }
    }

    #[test]
    fn missing_tracked_file_is_skipped_not_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let store = BackupStore::open(&dir.path().join("store")).expect("open");
        let config = fixture(dir.path());

        let info = store.create_snapshot(Some("s1"), &config).expect("snapshot");
        assert_eq!(info.files.len(), 4);
        assert_eq!(info.states.len(), 2);
        assert_eq!(info.skipped, vec![config.files[4].clone()]);

        let records = store.records().expect("records");
        let count = |kind: BackupKind| records.iter().filter(|r| r.kind == kind).count();
        assert_eq!(count(BackupKind::File), 4);
        assert_eq!(count(BackupKind::State), 2);
        assert_eq!(count(BackupKind::Snapshot), 1);
        // Completion line comes last
        assert_eq!(
            records.last().map(|r| r.kind),
            Some(BackupKind::Snapshot)
        );
    }

    #[test]
    fn duplicate_and_invalid_ids_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = BackupStore::open(&dir.path().join("store")).expect("open");
        let config = fixture(dir.path());

        store.create_snapshot(Some("s1"), &config).expect("first");
        assert!(store.create_snapshot(Some("s1"), &config).is_err());
        assert!(store.create_snapshot(Some("../x"), &config).is_err());
    }

    #[test]
    fn snapshot_without_manifest_line_does_not_exist() {
        let dir = TempDir::new().expect("tempdir");
        let store = BackupStore::open(&dir.path().join("store")).expect("open");
        let orphan = store.snapshots_dir().join("orphan");
        fs::create_dir_all(&orphan).expect("mkdir");
        fs::write(orphan.join(SNAPSHOT_FILE), b"{}").expect("write");

        assert!(matches!(
            store.find_snapshot("orphan"),
            Err(LifelineError::NotFound(_))
        ));
        assert!(store.latest_snapshot().expect("latest").is_none());
    }

    #[test]
    fn restore_snapshot_replays_files_and_dumps() {
        let dir = TempDir::new().expect("tempdir");
        let store = BackupStore::open(&dir.path().join("store")).expect("open");
        let config = fixture(dir.path());
        store.create_snapshot(Some("before"), &config).expect("snapshot");

        fs::write(&config.files[0], b"PermitRootLogin yes\n").expect("modify");

        let report = store
            .restore_snapshot("before", &config.reload_commands, |info| {
                info.id == "before"
            })
            .expect("restore");
        assert!(report.is_clean());
        assert_eq!(report.restored.len(), 4);
        assert_eq!(report.states_applied, vec!["rules".to_string()]);
        assert_eq!(
            fs::read_to_string(&config.files[0]).expect("read"),
            "sshd_config contents\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("applied")).expect("read"),
            "-P INPUT DROP\n"
        );
    }

    #[test]
    fn colliding_flat_names_keep_their_own_content() {
        let dir = TempDir::new().expect("tempdir");
        let store = BackupStore::open(&dir.path().join("store")).expect("open");
        let ssh = dir.path().join("etc").join("ssh");
        fs::create_dir_all(&ssh).expect("mkdir");
        let nested = ssh.join("config");
        let flat = dir.path().join("etc").join("ssh_config");
        fs::write(&nested, b"nested\n").expect("write");
        fs::write(&flat, b"flat\n").expect("write");

        let config = SnapshotConfig {
            files: vec![nested.clone(), flat.clone(), nested.clone()],
            states: Vec::new(),
            reload_commands: Vec::new(),
        };
        let info = store.create_snapshot(Some("pair"), &config).expect("snapshot");
        assert_eq!(info.files.len(), 3);
        let backups: HashSet<_> = info.files.iter().map(|r| r.backup.clone()).collect();
        assert_eq!(backups.len(), 3);

        fs::write(&nested, b"changed\n").expect("modify");
        fs::write(&flat, b"changed\n").expect("modify");
        let report = store
            .restore_snapshot("pair", &[], |_| true)
            .expect("restore");
        assert!(report.is_clean());
        assert_eq!(fs::read_to_string(&nested).expect("read"), "nested\n");
        assert_eq!(fs::read_to_string(&flat).expect("read"), "flat\n");
    }

    #[test]
    fn restore_requires_confirmation() {
        let dir = TempDir::new().expect("tempdir");
        let store = BackupStore::open(&dir.path().join("store")).expect("open");
        let config = fixture(dir.path());
        store.create_snapshot(Some("s"), &config).expect("snapshot");
        fs::write(&config.files[0], b"changed").expect("modify");

        let err = store
            .restore_snapshot("s", &[], |_| false)
            .expect_err("should abort");
        assert!(matches!(err, LifelineError::Aborted(_)));
        assert_eq!(fs::read(&config.files[0]).expect("read"), b"changed");
    }

    #[test]
    fn latest_snapshot_prefers_newest() {
        let dir = TempDir::new().expect("tempdir");
        let store = BackupStore::open(&dir.path().join("store")).expect("open");
        let config = fixture(dir.path());
        store.create_snapshot(Some("a"), &config).expect("a");
        store.create_snapshot(Some("b"), &config).expect("b");

        let latest = store.latest_snapshot().expect("latest").expect("some");
        assert_eq!(latest.id, "b");
        assert_eq!(store.list_snapshots().expect("list").len(), 2);
    }
}
