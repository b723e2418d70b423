//! Single-instance guard: only one watchdog may supervise the worker at a time.
//!
//! Two watchdogs would race each other's kill/stop/restart commands, so the
//! `run` command holds an exclusive advisory lock for its whole lifetime.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held for as long as the value lives; the OS drops the lock on exit.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock at `path` without blocking and record our pid in it.
    pub fn acquire(path: &Path) -> Result<Self, InstanceLockError> {
        let io_err = |source| InstanceLockError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(InstanceLockError::Held {
                    path: path.to_path_buf(),
                });
            }
            return Err(io_err(e));
        }

        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;

        tracing::debug!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
pub enum InstanceLockError {
    /// Another watchdog holds the lock.
    Held { path: PathBuf },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for InstanceLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceLockError::Held { path } => write!(
                f,
                "another watchdog instance is already running (lock {})",
                path.display()
            ),
            InstanceLockError::Io { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for InstanceLockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstanceLockError::Held { .. } => None,
            InstanceLockError::Io { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watchdog.lock");
        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watchdog.lock");
        let _first = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, InstanceLockError::Held { .. }));
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watchdog.lock");
        drop(InstanceLock::acquire(&path).unwrap());
        InstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_unwritable_location_is_io_error() {
        let err = InstanceLock::acquire(Path::new("/nonexistent/dir/watchdog.lock")).unwrap_err();
        assert!(matches!(err, InstanceLockError::Io { .. }));
    }
}
