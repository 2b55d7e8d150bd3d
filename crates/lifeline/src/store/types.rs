//! Core types for the backup store
//!
//! Defines content checksums, manifest record kinds, backup records and
//! snapshot metadata shared by the store, the transaction engine and the
//! watchdog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A SHA-256 content checksum (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Create a Checksum from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 12 hex characters, for compact display
    #[must_use]
    pub fn short(&self) -> String {
        self.to_string()[..12].to_string()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self)
    }
}

impl FromStr for Checksum {
    type Err = ChecksumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ChecksumParseError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk).map_err(|_| ChecksumParseError::InvalidHex)?;
            bytes[i] = u8::from_str_radix(hex_str, 16).map_err(|_| ChecksumParseError::InvalidHex)?;
        }
        Ok(Self(bytes))
    }
}

/// Error parsing a Checksum from a hex string
#[derive(Debug, Clone)]
pub enum ChecksumParseError {
    /// Hex string was not 64 characters
    InvalidLength(usize),
    /// Hex string contained invalid characters
    InvalidHex,
}

impl fmt::Display for ChecksumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength(len) => write!(f, "expected 64 hex characters, got {len}"),
            Self::InvalidHex => write!(f, "invalid hex character"),
        }
    }
}

impl std::error::Error for ChecksumParseError {}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Kind of a manifest record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupKind {
    /// Single file copy
    File,
    /// Full directory tree copy
    #[serde(rename = "DIR")]
    Directory,
    /// Snapshot completion record (the snapshot's durability boundary)
    Snapshot,
    /// Raw system-state dump captured by a snapshot or a guarded task
    State,
}

impl BackupKind {
    /// Manifest token for this kind
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "FILE",
            Self::Directory => "DIR",
            Self::Snapshot => "SNAPSHOT",
            Self::State => "STATE",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "FILE" => Ok(Self::File),
            "DIR" => Ok(Self::Directory),
            "SNAPSHOT" => Ok(Self::Snapshot),
            "STATE" => Ok(Self::State),
            other => Err(format!("unknown record kind '{other}'")),
        }
    }
}

/// An immutable, manifest-indexed backup.
///
/// A record only exists once its manifest line has been written; a copy on
/// disk without a manifest line is treated as if it did not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Original location (for STATE records, the dump name)
    pub source: PathBuf,
    /// Location of the copy inside the store
    pub backup: PathBuf,
    /// When the copy was taken
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the copy at capture time (None for foreign manifest lines)
    pub checksum: Option<Checksum>,
    /// Record kind
    pub kind: BackupKind,
}

/// A raw state dump captured as part of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDump {
    /// Dump name (e.g. `iptables`, `sysctl`)
    pub name: String,
    /// Location of the dump inside the snapshot directory
    pub path: PathBuf,
    /// SHA-256 of the dump
    pub checksum: Checksum,
    /// Command template that re-applies the dump (`{dump}` is substituted)
    pub restore: Option<Vec<String>>,
}

/// Metadata of a snapshot, persisted as `snapshot.json` in its directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot identifier
    pub id: String,
    /// Capture time
    pub created: DateTime<Utc>,
    /// Files captured by the snapshot
    pub files: Vec<BackupRecord>,
    /// State dumps captured by the snapshot
    pub states: Vec<StateDump>,
    /// Tracked files that were missing or unreadable at capture time
    pub skipped: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_hex_roundtrip() {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7);
        }
        let sum = Checksum::from_bytes(bytes);
        let parsed: Checksum = sum.to_string().parse().expect("should parse");
        assert_eq!(sum, parsed);
        assert_eq!(sum.short().len(), 12);
    }

    #[test]
    fn checksum_rejects_bad_input() {
        assert!("abc".parse::<Checksum>().is_err());
        assert!("zz".repeat(32).parse::<Checksum>().is_err());
    }

    #[test]
    fn kind_tokens_match_manifest_format() {
        for kind in [
            BackupKind::File,
            BackupKind::Directory,
            BackupKind::Snapshot,
            BackupKind::State,
        ] {
            assert_eq!(kind.as_str().parse::<BackupKind>(), Ok(kind));
        }
        assert!("ARCHIVE".parse::<BackupKind>().is_err());
    }

    #[test]
    fn record_serde_keeps_kind_token() {
        let record = BackupRecord {
            source: PathBuf::from("/etc/ssh/sshd_config"),
            backup: PathBuf::from("/var/backups/lifeline/files/x"),
            timestamp: Utc::now(),
            checksum: Some(Checksum::from_bytes([1u8; 32])),
            kind: BackupKind::Directory,
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"DIR\""));
        let parsed: BackupRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, record);
    }
}
