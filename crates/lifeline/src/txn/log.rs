//! Human-readable rollback log
//!
//! Append-only lines `timestamp|EVENT|transaction-id|detail`. The journal is
//! what recovery reads; this log is what an operator reads.

use crate::error::Result;
use crate::fsutil;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Begin,
    Commit,
    Rollback,
}

impl LogEvent {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed log line
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub transaction: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct RollbackLog {
    path: PathBuf,
}

impl RollbackLog {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line.
    pub fn record(&self, event: LogEvent, transaction: &str, detail: &str) -> Result<()> {
        let line = format!(
            "{}|{}|{}|{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
            sanitize(transaction),
            sanitize(detail)
        );
        fsutil::append_line(&self.path, &line)
    }

    /// The last `limit` parseable entries, oldest first.
    pub fn tail(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(crate::error::io_err(&self.path)(e)),
        };
        let entries: Vec<LogEntry> = content.lines().filter_map(parse_line).collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

/// Keep a free-text field on one line and out of the separator.
fn sanitize(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            '|' => '/',
            '\n' | '\r' => ' ',
            other => other,
        })
        .collect()
}

fn parse_line(line: &str) -> Option<LogEntry> {
    let mut fields = line.splitn(4, '|');
    let timestamp = DateTime::parse_from_rfc3339(fields.next()?)
        .ok()?
        .with_timezone(&Utc);
    Some(LogEntry {
        timestamp,
        event: fields.next()?.to_string(),
        transaction: fields.next()?.to_string(),
        detail: fields.next().unwrap_or_default().to_string(),
    })
}
