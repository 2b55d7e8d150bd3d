//! Filesystem primitives shared by the store, engine and watchdog
//!
//! Every write that replaces a live file goes through temp file + fsync +
//! rename so a reader never observes a half-written file.

use crate::error::{io_err, LifelineError, Result};
use crate::store::Checksum;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of the read buffer for streaming file hashing
const HASH_BUFFER_SIZE: usize = 8192;

/// Per-process counter keeping temp names unique across threads
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Hash a file's content in streaming fashion.
pub fn hash_file(path: &Path) -> Result<Checksum> {
    let mut file = fs::File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(io_err(path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Checksum::from_bytes(hasher.finalize().into()))
}

/// Hash an in-memory buffer.
#[must_use]
pub fn hash_bytes(content: &[u8]) -> Checksum {
    Checksum::from_bytes(Sha256::digest(content).into())
}

/// A temp path next to `path` that no other writer in this process will pick.
#[must_use]
pub fn sibling_temp_path(path: &Path, tag: &str) -> PathBuf {
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{name}.lifeline-{tag}-{}-{seq}", std::process::id()))
}

/// Write content to a file atomically via temp file + rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    atomic_write_mode(path, content, None)
}

/// Atomic write that also sets the permission bits before the rename, so the
/// file never appears with the wrong mode.
pub fn atomic_write_mode(path: &Path, content: &[u8], mode: Option<u32>) -> Result<()> {
    if path.parent().is_none() {
        return Err(LifelineError::Backup(format!(
            "Path has no parent directory: {}",
            path.display()
        )));
    }

    let temp_path = sibling_temp_path(path, "tmp");

    let write_result = (|| -> Result<()> {
        let mut file = fs::File::create(&temp_path).map_err(io_err(&temp_path))?;
        file.write_all(content).map_err(io_err(&temp_path))?;
        if let Some(mode) = mode {
            file.set_permissions(fs::Permissions::from_mode(mode))
                .map_err(io_err(&temp_path))?;
        }
        file.sync_all().map_err(io_err(&temp_path))?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        LifelineError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Copy `src` over `dst` atomically, keeping `src`'s permission bits.
///
/// Returns the checksum of the bytes written.
pub fn copy_atomic(src: &Path, dst: &Path) -> Result<Checksum> {
    let content = fs::read(src).map_err(io_err(src))?;
    let mode = file_mode(src)?;
    atomic_write_mode(dst, &content, Some(mode))?;
    Ok(hash_bytes(&content))
}

/// Permission bits of a path (without the file type bits).
pub fn file_mode(path: &Path) -> Result<u32> {
    let metadata = fs::metadata(path).map_err(io_err(path))?;
    Ok(metadata.permissions().mode() & 0o7777)
}

/// Set permission bits on an existing path.
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err(path))
}

/// Create a directory tree and pin the leaf's mode.
pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path).map_err(io_err(path))?;
    set_mode(path, mode)
}

/// Append one line to a log-style file and flush it to disk.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes()).map_err(io_err(path))?;
    file.sync_data().map_err(io_err(path))
}

/// Remove a file or directory tree if it exists.
///
/// Returns `true` if something was removed.
pub fn remove_path(path: &Path) -> Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(io_err(path)(e)),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path).map_err(io_err(path))?;
    } else {
        fs::remove_file(path).map_err(io_err(path))?;
    }
    Ok(true)
}

/// Flatten an absolute path into a single file name component.
///
/// `/etc/ssh/sshd_config` becomes `etc_ssh_sshd_config`.
#[must_use]
pub fn flatten_path(path: &Path) -> String {
    let flat: String = path
        .to_string_lossy()
        .trim_start_matches('/')
        .chars()
        .map(|c| match c {
            '/' => '_',
            '|' | '\n' | '\0' => '-',
            other => other,
        })
        .collect();
    if flat.is_empty() {
        "root".to_string()
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("target.conf");
        fs::write(&path, b"old").expect("write");

        atomic_write(&path, b"new content").expect("atomic write");
        assert_eq!(fs::read(&path).expect("read"), b"new content");

        // No temp files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("lifeline-tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn atomic_write_mode_sets_permissions() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("secret");
        atomic_write_mode(&path, b"x", Some(0o600)).expect("write");
        assert_eq!(file_mode(&path).expect("mode"), 0o600);
    }

    #[test]
    fn copy_atomic_preserves_mode_and_returns_checksum() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"payload").expect("write");
        set_mode(&src, 0o640).expect("chmod");

        let sum = copy_atomic(&src, &dst).expect("copy");
        assert_eq!(sum, hash_bytes(b"payload"));
        assert_eq!(hash_file(&dst).expect("hash"), sum);
        assert_eq!(file_mode(&dst).expect("mode"), 0o640);
    }

    #[test]
    fn append_line_accumulates() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("log");
        append_line(&path, "one").expect("append");
        append_line(&path, "two").expect("append");
        assert_eq!(fs::read_to_string(&path).expect("read"), "one\ntwo\n");
    }

    #[test]
    fn remove_path_handles_missing_files_and_trees() {
        let dir = TempDir::new().expect("tempdir");
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("nested")).expect("mkdir");
        fs::write(tree.join("nested/file"), b"x").expect("write");

        assert!(remove_path(&tree).expect("remove tree"));
        assert!(!tree.exists());
        assert!(!remove_path(&tree).expect("remove missing"));
    }

    #[test]
    fn flatten_path_examples() {
        assert_eq!(
            flatten_path(Path::new("/etc/ssh/sshd_config")),
            "etc_ssh_sshd_config"
        );
        assert_eq!(flatten_path(Path::new("/")), "root");
        assert_eq!(flatten_path(Path::new("/a|b")), "a-b");
    }
}
