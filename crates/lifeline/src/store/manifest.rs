//! Append-only backup manifest
//!
//! One record per line: `timestamp|KIND|source|backup|checksum`. The first
//! four fields are the interchange format shared with older tooling; the
//! checksum is an extra trailing field, and readers ignore anything after it.
//! Lines that do not parse are skipped with a warning, never fatal.

use crate::error::{LifelineError, Result};
use crate::fsutil;
use crate::store::types::{BackupKind, BackupRecord, Checksum};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Field separator
const SEP: char = '|';

/// Timestamp formats accepted from foreign writers, after RFC 3339
const LEGACY_TIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y%m%d_%H%M%S", "%Y%m%d-%H%M%S"];

/// Handle on the manifest file of a backup store
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
}

impl Manifest {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. This is the durability boundary of a backup.
    pub fn append(&self, record: &BackupRecord) -> Result<()> {
        let line = format_line(record)?;
        fsutil::append_line(&self.path, &line)
    }

    /// Read every parseable record in file order.
    pub fn read(&self) -> Result<Vec<BackupRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(LifelineError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(record) => records.push(record),
                None => warn!(
                    "Skipping unparseable manifest line {} in {}",
                    lineno + 1,
                    self.path.display()
                ),
            }
        }
        Ok(records)
    }

    /// Rewrite the manifest keeping only records for which `keep` is true.
    ///
    /// Lines that do not parse are preserved verbatim since they may belong
    /// to another writer. Returns the removed records.
    pub fn retain<F>(&self, mut keep: F) -> Result<Vec<BackupRecord>>
    where
        F: FnMut(&BackupRecord) -> bool,
    {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(LifelineError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let mut kept = String::with_capacity(content.len());
        let mut removed = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(record) if !keep(&record) => removed.push(record),
                _ => {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }

        if !removed.is_empty() {
            fsutil::atomic_write(&self.path, kept.as_bytes())?;
        }
        Ok(removed)
    }
}

fn check_field(field: &str, what: &str) -> Result<()> {
    if field.contains(SEP) || field.contains('\n') || field.contains('\r') {
        return Err(LifelineError::Backup(format!(
            "{what} cannot be recorded in the manifest (contains a separator): {field}"
        )));
    }
    Ok(())
}

/// Render a record as a manifest line (without the newline).
pub fn format_line(record: &BackupRecord) -> Result<String> {
    let source = record.source.to_string_lossy();
    let backup = record.backup.to_string_lossy();
    check_field(&source, "source path")?;
    check_field(&backup, "backup path")?;

    let checksum = record
        .checksum
        .map(|c| c.to_string())
        .unwrap_or_default();

    Ok(format!(
        "{}{SEP}{}{SEP}{}{SEP}{}{SEP}{}",
        record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        record.kind,
        source,
        backup,
        checksum
    ))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    LEGACY_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Parse one manifest line. Extra trailing fields are ignored.
#[must_use]
pub fn parse_line(line: &str) -> Option<BackupRecord> {
    let mut fields = line.split(SEP);
    let timestamp = parse_timestamp(fields.next()?.trim())?;
    let kind: BackupKind = fields.next()?.trim().parse().ok()?;
    let source = fields.next()?;
    let backup = fields.next()?;
    if source.is_empty() || backup.is_empty() {
        return None;
    }
    let checksum = fields
        .next()
        .and_then(|raw| raw.trim().parse::<Checksum>().ok());

    Some(BackupRecord {
        source: PathBuf::from(source),
        backup: PathBuf::from(backup),
        timestamp,
        checksum,
        kind,
    })
}
