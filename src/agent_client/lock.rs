//! Single-instance file lock — an advisory exclusive lock on a well-known
//! pid file, so a second `baihu-agent` process on the same host aborts
//! immediately instead of racing the first for the WebSocket connection.
//!
//! Grounded on the teacher pack's `fs2`-based pid-file pattern: open (or
//! create) the file, take an exclusive lock, write the current pid, and
//! keep the file handle alive for the process lifetime so the OS lock
//! holds until exit or an explicit release.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;

pub fn write_pid_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .read(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("opening pid file {}: {e}", path.display()))?;

    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!("another baihu-agent instance is already running (pid file {} is locked)", path.display())
    })?;

    let pid = std::process::id();
    {
        let mut f = &file;
        writeln!(f, "{pid}")?;
        f.flush()?;
    }

    tracing::info!(path = %path.display(), pid, "pid file written");
    Ok(file)
}

pub fn remove_pid_file(path: &Path, _handle: File) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove pid file");
    }
}

/// Read the pid currently recorded in the lock file, if any — used by the
/// `stop`/`status` subcommands which don't hold the lock themselves.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_remove_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("agent.pid");

        let handle = write_pid_file(&pid_path).unwrap();
        assert_eq!(read_pid(&pid_path), Some(std::process::id()));

        let second = write_pid_file(&pid_path);
        assert!(second.is_err());

        remove_pid_file(&pid_path, handle);
        assert!(!pid_path.exists());
    }

    #[test]
    fn creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("nested").join("data").join("agent.pid");
        let handle = write_pid_file(&pid_path).unwrap();
        assert!(pid_path.exists());
        remove_pid_file(&pid_path, handle);
    }
}
