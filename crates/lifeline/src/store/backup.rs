//! File and directory backups
//!
//! Every mutating call writes its copy first and appends the manifest line
//! last. A crash in between leaves an orphaned copy that no reader will ever
//! return, which is the same as the backup never having happened.

use crate::error::{io_err, LifelineError, Result};
use crate::fsutil::{self, copy_atomic, hash_bytes, hash_file};
use crate::store::manifest::Manifest;
use crate::store::types::{BackupKind, BackupRecord, Checksum};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Permission bits for every store directory
pub const STORE_DIR_MODE: u32 = 0o750;

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of a retention sweep
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Manifest rows removed
    pub removed: Vec<BackupRecord>,
    /// Rows whose copy could not be deleted (the row is still removed)
    pub failed: Vec<(PathBuf, String)>,
}

/// Result of re-hashing stored copies
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub ok: usize,
    /// Copies whose content no longer matches the recorded checksum
    pub corrupt: Vec<BackupRecord>,
    /// Copies that are referenced by the manifest but gone from disk
    pub missing: Vec<BackupRecord>,
    /// Records without a checksum (written by other tooling)
    pub unchecked: usize,
}

impl VerifyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.missing.is_empty()
    }
}

/// Handle on a backup store directory
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
    manifest: Manifest,
}

impl BackupStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [
            root.to_path_buf(),
            root.join("files"),
            root.join("dirs"),
            root.join("state"),
            root.join("snapshots"),
        ] {
            fsutil::ensure_dir(&dir, STORE_DIR_MODE).map_err(|e| {
                LifelineError::Backup(format!(
                    "Failed to prepare store directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            manifest: Manifest::new(root.join("manifest")),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub(crate) fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// A fresh, never-reused name for a copy of `source`.
    fn unique_name(source: &Path) -> String {
        let seq = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}.{}-{}-{seq}",
            fsutil::flatten_path(source),
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            std::process::id()
        )
    }

    /// Copy a single file into the store.
    pub fn backup_file(&self, path: &Path) -> Result<BackupRecord> {
        let dest = self.root.join("files").join(Self::unique_name(path));
        self.backup_file_into(path, &dest)
    }

    /// Copy `path` to `dest`, verify the copy, and record it.
    pub(crate) fn backup_file_into(&self, path: &Path, dest: &Path) -> Result<BackupRecord> {
        let metadata = fs::metadata(path).map_err(io_err(path))?;
        if !metadata.is_file() {
            return Err(LifelineError::Backup(format!(
                "Not a regular file: {}",
                path.display()
            )));
        }

        let checksum = copy_atomic(path, dest)?;
        let stored = hash_file(dest)?;
        if stored != checksum {
            let _ = fs::remove_file(dest);
            return Err(LifelineError::ChecksumMismatch {
                path: dest.to_path_buf(),
                expected: checksum.to_string(),
                actual: stored.to_string(),
            });
        }

        let record = BackupRecord {
            source: path.to_path_buf(),
            backup: dest.to_path_buf(),
            timestamp: Utc::now(),
            checksum: Some(checksum),
            kind: BackupKind::File,
        };
        self.manifest.append(&record)?;
        debug!(
            "Backed up {} -> {} ({})",
            path.display(),
            dest.display(),
            checksum.short()
        );
        Ok(record)
    }

    /// Copy a whole directory tree into the store.
    ///
    /// The record checksum is a digest over the sorted relative paths and
    /// content hashes of the tree, see [`tree_digest`].
    pub fn backup_directory(&self, path: &Path) -> Result<BackupRecord> {
        let metadata = fs::metadata(path).map_err(io_err(path))?;
        if !metadata.is_dir() {
            return Err(LifelineError::Backup(format!(
                "Not a directory: {}",
                path.display()
            )));
        }

        let dest = self.root.join("dirs").join(Self::unique_name(path));
        let staging = fsutil::sibling_temp_path(&dest, "partial");

        let copied = copy_tree(path, &staging);
        let entries = match copied {
            Ok(entries) => entries,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
        };
        fs::rename(&staging, &dest).map_err(|e| {
            let _ = fs::remove_dir_all(&staging);
            LifelineError::Io {
                path: dest.clone(),
                source: e,
            }
        })?;

        let record = BackupRecord {
            source: path.to_path_buf(),
            backup: dest.clone(),
            timestamp: Utc::now(),
            checksum: Some(tree_digest(&entries)),
            kind: BackupKind::Directory,
        };
        self.manifest.append(&record)?;
        info!(
            "Backed up directory {} ({} entries) -> {}",
            path.display(),
            entries.len(),
            dest.display()
        );
        Ok(record)
    }

    /// Store a raw state dump (e.g. the output of `iptables-save`).
    pub fn capture_state(&self, name: &str, content: &[u8]) -> Result<BackupRecord> {
        crate::store::validate_id(name)?;
        let dest = self
            .root
            .join("state")
            .join(Self::unique_name(Path::new(name)));
        fsutil::atomic_write_mode(&dest, content, Some(0o600))?;

        let record = BackupRecord {
            source: PathBuf::from(name),
            backup: dest,
            timestamp: Utc::now(),
            checksum: Some(hash_bytes(content)),
            kind: BackupKind::State,
        };
        self.manifest.append(&record)?;
        Ok(record)
    }

    /// Copy a file backup back over its original location.
    pub fn restore_file(&self, record: &BackupRecord) -> Result<()> {
        self.restore_file_to(record, &record.source)
    }

    /// Copy a file backup over `target`.
    ///
    /// The restored content is re-hashed afterwards. A mismatch is only a
    /// warning: the target has already been replaced at that point.
    pub fn restore_file_to(&self, record: &BackupRecord, target: &Path) -> Result<()> {
        if !matches!(record.kind, BackupKind::File | BackupKind::State) {
            return Err(LifelineError::Backup(format!(
                "{} is a {} backup, not a file",
                record.backup.display(),
                record.kind
            )));
        }
        if !record.backup.is_file() {
            return Err(LifelineError::NotFound(format!(
                "backup copy {}",
                record.backup.display()
            )));
        }
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }

        copy_atomic(&record.backup, target)?;

        if let Some(expected) = record.checksum {
            match hash_file(target) {
                Ok(actual) if actual == expected => {}
                Ok(actual) => warn!(
                    "Restored {} but checksum differs from backup (expected {}, got {})",
                    target.display(),
                    expected.short(),
                    actual.short()
                ),
                Err(e) => warn!("Restored {} but could not re-hash it: {e}", target.display()),
            }
        }
        info!("Restored {} from {}", target.display(), record.backup.display());
        Ok(())
    }

    /// Restore a directory backup over its original location.
    ///
    /// Files in the backup overwrite their counterparts; files that exist
    /// only on disk are left alone. Returns the number of entries restored.
    pub fn restore_directory(&self, record: &BackupRecord) -> Result<usize> {
        if record.kind != BackupKind::Directory {
            return Err(LifelineError::Backup(format!(
                "{} is a {} backup, not a directory",
                record.backup.display(),
                record.kind
            )));
        }
        if !record.backup.is_dir() {
            return Err(LifelineError::NotFound(format!(
                "backup copy {}",
                record.backup.display()
            )));
        }

        let entries = copy_tree(&record.backup, &record.source)?;

        if let Some(expected) = record.checksum {
            let actual = tree_digest(&entries);
            if actual != expected {
                warn!(
                    "Restored directory {} but tree digest differs from backup",
                    record.source.display()
                );
            }
        }
        info!(
            "Restored directory {} ({} entries)",
            record.source.display(),
            entries.len()
        );
        Ok(entries.len())
    }

    /// Every parseable manifest record, oldest first.
    pub fn records(&self) -> Result<Vec<BackupRecord>> {
        self.manifest.read()
    }

    /// The newest file or directory backup of `source` whose copy still exists.
    pub fn latest_for(&self, source: &Path) -> Result<Option<BackupRecord>> {
        Ok(self.records()?.into_iter().rev().find(|r| {
            matches!(r.kind, BackupKind::File | BackupKind::Directory)
                && r.source == source
                && r.backup.exists()
        }))
    }

    /// Delete backups older than `days` and their manifest rows.
    ///
    /// Only copies inside the store root are ever deleted.
    pub fn prune_older_than(&self, days: u32) -> Result<PruneReport> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let removed = self.manifest.retain(|r| r.timestamp >= cutoff)?;

        let mut report = PruneReport::default();
        for record in &removed {
            if !record.backup.starts_with(&self.root) {
                warn!(
                    "Not deleting {}: outside the store root",
                    record.backup.display()
                );
                continue;
            }
            if let Err(e) = fsutil::remove_path(&record.backup) {
                report
                    .failed
                    .push((record.backup.clone(), e.to_string()));
            }
        }
        info!(
            "Pruned {} manifest rows older than {days} days",
            removed.len()
        );
        report.removed = removed;
        Ok(report)
    }

    /// Re-hash every file and state copy against its recorded checksum.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for record in self.records()? {
            if !matches!(record.kind, BackupKind::File | BackupKind::State) {
                continue;
            }
            let Some(expected) = record.checksum else {
                report.unchecked += 1;
                continue;
            };
            if !record.backup.is_file() {
                report.missing.push(record);
                continue;
            }
            match hash_file(&record.backup) {
                Ok(actual) if actual == expected => report.ok += 1,
                _ => report.corrupt.push(record),
            }
        }
        Ok(report)
    }
}

/// Copy the tree at `src` onto `dst`, returning `(relative path, digest)`
/// for every entry in walk order.
fn copy_tree(src: &Path, dst: &Path) -> Result<Vec<(PathBuf, Checksum)>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
            LifelineError::Io { path, source }
        })?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(r) => r.to_path_buf(),
            Err(_) => continue,
        };
        let target = dst.join(&rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
            let mode = fsutil::file_mode(entry.path())?;
            fsutil::set_mode(&target, mode)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(io_err(entry.path()))?;
            fsutil::remove_path(&target)?;
            symlink(&link, &target).map_err(io_err(&target))?;
            let marker = format!("link:{}", link.display());
            entries.push((rel, hash_bytes(marker.as_bytes())));
        } else if file_type.is_file() {
            let checksum = copy_atomic(entry.path(), &target)?;
            entries.push((rel, checksum));
        } else {
            debug!("Skipping special file {}", entry.path().display());
        }
    }

    Ok(entries)
}

/// Digest over sorted `(relative path, content hash)` pairs.
#[must_use]
pub fn tree_digest(entries: &[(PathBuf, Checksum)]) -> Checksum {
    let mut sorted: Vec<&(PathBuf, Checksum)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (rel, sum) in sorted {
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(sum.as_bytes());
    }
    Checksum::from_bytes(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BackupStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = BackupStore::open(&dir.path().join("store")).expect("open store");
        (dir, store)
    }

    #[test]
    fn open_creates_layout_with_restricted_mode() {
        let (_dir, store) = setup();
        for sub in ["files", "dirs", "state", "snapshots"] {
            assert!(store.root().join(sub).is_dir());
        }
        assert_eq!(fsutil::file_mode(store.root()).expect("mode"), STORE_DIR_MODE);
    }

    #[test]
    fn backup_file_is_bit_identical_and_recorded() {
        let (dir, store) = setup();
        let source = dir.path().join("sshd_config");
        fs::write(&source, b"PermitRootLogin yes\n").expect("write");

        let record = store.backup_file(&source).expect("backup");
        assert_eq!(record.kind, BackupKind::File);
        assert_eq!(fs::read(&record.backup).expect("read"), b"PermitRootLogin yes\n");
        assert_eq!(record.checksum, Some(hash_file(&source).expect("hash")));

        let records = store.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].backup, record.backup);
    }

    #[test]
    fn backup_missing_file_fails_without_manifest_line() {
        let (dir, store) = setup();
        let err = store
            .backup_file(&dir.path().join("absent"))
            .expect_err("should fail");
        assert!(matches!(err, LifelineError::Io { .. }));
        assert!(store.records().expect("records").is_empty());
    }

    #[test]
    fn repeated_backups_never_collide() {
        let (dir, store) = setup();
        let source = dir.path().join("f");
        fs::write(&source, b"1").expect("write");
        let a = store.backup_file(&source).expect("a");
        fs::write(&source, b"2").expect("write");
        let b = store.backup_file(&source).expect("b");
        assert_ne!(a.backup, b.backup);
        assert_eq!(fs::read(&a.backup).expect("read"), b"1");

        let latest = store.latest_for(&source).expect("latest").expect("some");
        assert_eq!(latest.backup, b.backup);
    }

    #[test]
    fn restore_file_brings_back_content_and_mode() {
        let (dir, store) = setup();
        let source = dir.path().join("hosts.deny");
        fs::write(&source, b"ALL: ALL\n").expect("write");
        fsutil::set_mode(&source, 0o640).expect("chmod");
        let record = store.backup_file(&source).expect("backup");

        fs::write(&source, b"").expect("truncate");
        fsutil::set_mode(&source, 0o666).expect("chmod");
        store.restore_file(&record).expect("restore");

        assert_eq!(fs::read(&source).expect("read"), b"ALL: ALL\n");
        assert_eq!(fsutil::file_mode(&source).expect("mode"), 0o640);
    }

    #[test]
    fn restore_with_corrupt_copy_still_succeeds() {
        let (dir, store) = setup();
        let source = dir.path().join("f");
        fs::write(&source, b"original").expect("write");
        let record = store.backup_file(&source).expect("backup");
        fs::write(&record.backup, b"tampered").expect("tamper");

        // Mismatch is a warning, not an error
        store.restore_file(&record).expect("restore");
        assert_eq!(fs::read(&source).expect("read"), b"tampered");
    }

    #[test]
    fn directory_backup_and_additive_restore() {
        let (dir, store) = setup();
        let tree = dir.path().join("ssh");
        fs::create_dir_all(tree.join("sshd_config.d")).expect("mkdir");
        fs::write(tree.join("sshd_config"), b"Port 22\n").expect("write");
        fs::write(tree.join("sshd_config.d/10-local.conf"), b"X11Forwarding no\n")
            .expect("write");

        let record = store.backup_directory(&tree).expect("backup dir");
        assert_eq!(record.kind, BackupKind::Directory);
        assert!(record.backup.join("sshd_config.d/10-local.conf").is_file());

        fs::write(tree.join("sshd_config"), b"Port 2200\n").expect("modify");
        fs::write(tree.join("extra"), b"new").expect("add");
        fs::remove_file(tree.join("sshd_config.d/10-local.conf")).expect("remove");

        let restored = store.restore_directory(&record).expect("restore dir");
        assert_eq!(restored, 2);
        assert_eq!(fs::read(tree.join("sshd_config")).expect("read"), b"Port 22\n");
        assert!(tree.join("sshd_config.d/10-local.conf").is_file());
        assert!(tree.join("extra").is_file());
    }

    #[test]
    fn tree_digest_is_order_independent() {
        let a = (PathBuf::from("a"), hash_bytes(b"a"));
        let b = (PathBuf::from("b"), hash_bytes(b"b"));
        assert_eq!(
            tree_digest(&[a.clone(), b.clone()]),
            tree_digest(&[b.clone(), a.clone()])
        );
        assert_ne!(tree_digest(&[a.clone()]), tree_digest(&[a, b]));
    }

    #[test]
    fn prune_removes_only_expired_rows() {
        let (dir, store) = setup();
        let source = dir.path().join("f");
        fs::write(&source, b"x").expect("write");
        let fresh = store.backup_file(&source).expect("fresh");

        let old_copy = store.root().join("files").join("old-copy");
        fs::write(&old_copy, b"x").expect("write");
        let old = BackupRecord {
            source: source.clone(),
            backup: old_copy.clone(),
            timestamp: Utc::now() - Duration::days(45),
            checksum: Some(hash_bytes(b"x")),
            kind: BackupKind::File,
        };
        store.manifest().append(&old).expect("append old");

        let report = store.prune_older_than(30).expect("prune");
        assert_eq!(report.removed.len(), 1);
        assert!(!old_copy.exists());
        assert!(fresh.backup.exists());

        let records = store.records().expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].backup, fresh.backup);
    }

    #[test]
    fn prune_never_deletes_outside_root() {
        let (dir, store) = setup();
        let outside = dir.path().join("precious");
        fs::write(&outside, b"keep").expect("write");
        store
            .manifest()
            .append(&BackupRecord {
                source: PathBuf::from("/etc/x"),
                backup: outside.clone(),
                timestamp: Utc::now() - Duration::days(90),
                checksum: None,
                kind: BackupKind::File,
            })
            .expect("append");

        let report = store.prune_older_than(30).expect("prune");
        assert_eq!(report.removed.len(), 1);
        assert!(outside.exists());
    }

    #[test]
    fn verify_detects_corruption_and_missing_copies() {
        let (dir, store) = setup();
        let source = dir.path().join("f");
        fs::write(&source, b"x").expect("write");
        let good = store.backup_file(&source).expect("good");
        let corrupt = store.backup_file(&source).expect("corrupt");
        let missing = store.backup_file(&source).expect("missing");
        fs::write(&corrupt.backup, b"y").expect("tamper");
        fs::remove_file(&missing.backup).expect("remove");

        let report = store.verify().expect("verify");
        assert_eq!(report.ok, 1);
        assert_eq!(report.corrupt.len(), 1);
        assert_eq!(report.corrupt[0].backup, corrupt.backup);
        assert_eq!(report.missing.len(), 1);
        assert!(!report.is_clean());
        assert!(good.backup.exists());
    }

    #[test]
    fn capture_state_records_dump() {
        let (_dir, store) = setup();
        let record = store
            .capture_state("iptables", b"*filter\nCOMMIT\n")
            .expect("capture");
        assert_eq!(record.kind, BackupKind::State);
        assert_eq!(record.source, PathBuf::from("iptables"));
        assert_eq!(fs::read(&record.backup).expect("read"), b"*filter\nCOMMIT\n");
        assert!(store.capture_state("../escape", b"").is_err());
    }
}
