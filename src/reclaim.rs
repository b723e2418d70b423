//! Orphan session reclamation.
//!
//! Browser instances leave a lock marker inside every session folder they
//! open. When a browser dies without cleaning up, the folder (and its lock)
//! stays behind. Reclamation finds every lock under the sessions root, maps
//! each to its session folder, collects the profile directories that live
//! browser processes were launched with, and deletes only the folders that
//! no live browser references.
//!
//! Both sides of the comparison go through `resolve_path`, so a profile given
//! through a symlink or with `..` segments still protects its folder. A
//! relative profile is anchored at the browser's own working directory.

use crate::process_table::{BrowserProcess, ProcessTable, ProcessTableError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

const PROFILE_FLAG: &str = "--user-data-dir";

/// Summary of one reclamation run. Built once, never mutated afterwards.
///
/// Invariant: `deleted_folders_count <= orphan_folders_count <=
/// total_locked_folders <= total_locks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclamationReport {
    pub timestamp: DateTime<Utc>,
    pub total_locks: usize,
    pub total_locked_folders: usize,
    pub active_profiles_count: usize,
    pub orphan_folders_count: usize,
    pub deleted_folders_count: usize,
    pub deleted_folders: BTreeSet<PathBuf>,
    /// Orphans that could not be deleted, with the error message.
    pub failed_folders: BTreeMap<PathBuf, String>,
}

impl ReclamationReport {
    /// The all-zero report returned when there is nothing to do.
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            total_locks: 0,
            total_locked_folders: 0,
            active_profiles_count: 0,
            orphan_folders_count: 0,
            deleted_folders_count: 0,
            deleted_folders: BTreeSet::new(),
            failed_folders: BTreeMap::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.deleted_folders_count == self.deleted_folders.len()
            && self.deleted_folders_count + self.failed_folders.len() == self.orphan_folders_count
            && self.deleted_folders_count <= self.orphan_folders_count
            && self.orphan_folders_count <= self.total_locked_folders
            && self.total_locked_folders <= self.total_locks
    }
}

/// Deletes session folders whose lock marker is not backed by a live browser.
pub struct OrphanSessionReclaimer {
    table: Arc<dyn ProcessTable>,
    lock_file_name: String,
    levels_above_lock_dir: usize,
    delete: fn(&Path) -> io::Result<()>,
}

impl OrphanSessionReclaimer {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        lock_file_name: impl Into<String>,
        levels_above_lock_dir: usize,
    ) -> Self {
        Self {
            table,
            lock_file_name: lock_file_name.into(),
            levels_above_lock_dir,
            delete: delete_folder,
        }
    }

    #[cfg(test)]
    fn with_deleter(mut self, delete: fn(&Path) -> io::Result<()>) -> Self {
        self.delete = delete;
        self
    }

    /// Run one reclamation pass over `sessions_root`.
    ///
    /// Fails without touching the filesystem when the live browser set
    /// cannot be read, since every folder would then look orphaned.
    pub fn reclaim(
        &self,
        sessions_root: &Path,
        process_name_filter: &str,
    ) -> Result<ReclamationReport, ReclaimError> {
        tracing::info!(root = %sessions_root.display(), "searching for session lock files");
        let locks = find_lock_files(sessions_root, &self.lock_file_name);
        if locks.is_empty() {
            tracing::info!("no session lock files found, nothing to reclaim");
            return Ok(ReclamationReport::empty());
        }

        let root = resolve_path(sessions_root);
        let folders = self.locked_folders(&root, &locks);
        tracing::info!(locks = locks.len(), folders = folders.len(), "locked session folders found");

        let browsers = self
            .table
            .command_lines(process_name_filter)
            .map_err(|e| ReclaimError::ActiveProfiles { source: e })?;
        let active = ActiveProfiles::from_processes(&browsers);
        tracing::info!(active = active.len(), "active browser profiles detected");

        let orphans: Vec<PathBuf> = folders
            .iter()
            .filter(|folder| !active.protects(folder))
            .cloned()
            .collect();
        tracing::info!(orphans = orphans.len(), "orphan session folders identified");

        let mut deleted_folders = BTreeSet::new();
        let mut failed_folders = BTreeMap::new();
        for folder in orphans.iter() {
            match (self.delete)(folder) {
                Ok(()) => {
                    tracing::info!(folder = %folder.display(), "deleted orphan session folder");
                    deleted_folders.insert(folder.clone());
                }
                Err(e) => {
                    tracing::error!(
                        folder = %folder.display(),
                        error = %e,
                        "failed to delete orphan session folder"
                    );
                    failed_folders.insert(folder.clone(), e.to_string());
                }
            }
        }

        let report = ReclamationReport {
            timestamp: Utc::now(),
            total_locks: locks.len(),
            total_locked_folders: folders.len(),
            active_profiles_count: active.len(),
            orphan_folders_count: orphans.len(),
            deleted_folders_count: deleted_folders.len(),
            deleted_folders,
            failed_folders,
        };
        debug_assert!(report.is_consistent());
        tracing::info!(
            deleted = report.deleted_folders_count,
            orphans = report.orphan_folders_count,
            "session reclamation finished"
        );
        Ok(report)
    }

    /// Map locks to resolved session folders strictly inside `root`.
    fn locked_folders(&self, root: &Path, locks: &[PathBuf]) -> BTreeSet<PathBuf> {
        let mut folders = BTreeSet::new();
        for lock in locks {
            let Some(folder) = session_folder(lock, self.levels_above_lock_dir) else {
                continue;
            };
            let folder = resolve_path(&folder);
            if folder == root || !folder.starts_with(root) {
                tracing::warn!(
                    lock = %lock.display(),
                    folder = %folder.display(),
                    "ignoring lock whose session folder is not inside the sessions root"
                );
                continue;
            }
            folders.insert(folder);
        }
        folders
    }
}

/// Every non-directory entry named `lock_file_name` below `root`.
///
/// Browsers create the lock as a dangling symlink, so symlinks count as
/// markers. Links are not followed during the walk.
pub fn find_lock_files(root: &Path, lock_file_name: &str) -> Vec<PathBuf> {
    if !root.is_dir() {
        tracing::debug!(root = %root.display(), "sessions root does not exist");
        return Vec::new();
    }

    let mut locks = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        match entry {
            Ok(entry) => {
                if !entry.file_type().is_dir() && entry.file_name() == lock_file_name {
                    locks.push(entry.into_path());
                }
            }
            Err(e) => {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                tracing::warn!(path = %path, error = %e, "skipping unreadable path");
            }
        }
    }
    locks
}

/// The session folder owning `lock`: its directory, `levels` levels up.
pub fn session_folder(lock: &Path, levels: usize) -> Option<PathBuf> {
    lock.parent()?.ancestors().nth(levels).map(Path::to_path_buf)
}

/// Extract the `--user-data-dir` value from one argument vector.
///
/// Accepts `--user-data-dir=<path>` and `--user-data-dir <path>`.
pub fn extract_profile_dir(argv: &[String]) -> Option<PathBuf> {
    let mut args = argv.iter();
    while let Some(arg) = args.next() {
        let value = if let Some(rest) = arg.strip_prefix(PROFILE_FLAG) {
            match rest.strip_prefix('=') {
                Some(v) => v,
                None if rest.is_empty() => match args.next() {
                    Some(next) => next.as_str(),
                    None => return None,
                },
                // Some other flag sharing the prefix.
                None => continue,
            }
        } else {
            continue;
        };

        let value = value.trim_matches(|c| c == '"' || c == '\'');
        if value.is_empty() {
            continue;
        }
        return Some(PathBuf::from(value));
    }
    None
}

/// Profile directories of live browser processes.
///
/// Processes without a profile argument contribute nothing.
#[derive(Debug, Default)]
pub struct ActiveProfiles {
    /// Resolved absolute directories.
    resolved: BTreeSet<PathBuf>,
    /// Relative profiles of browsers whose working directory is unknown.
    /// Any folder ending in one of these is kept.
    unanchored: BTreeSet<PathBuf>,
    /// Set when an unanchored profile climbs with `..`; nothing can be
    /// ruled out, so every folder is kept.
    protect_all: bool,
}

impl ActiveProfiles {
    pub fn from_processes(processes: &[BrowserProcess]) -> Self {
        let mut active = Self::default();
        for process in processes {
            let Some(dir) = extract_profile_dir(&process.argv) else {
                continue;
            };
            match &process.cwd {
                // `join` keeps `dir` as is when it is already absolute.
                Some(cwd) => {
                    active.resolved.insert(resolve_path(&cwd.join(&dir)));
                }
                None if dir.is_absolute() => {
                    active.resolved.insert(resolve_path(&dir));
                }
                None => active.add_unanchored(&dir),
            }
        }
        active
    }

    fn add_unanchored(&mut self, dir: &Path) {
        tracing::warn!(
            profile = %dir.display(),
            "browser working directory unknown, keeping every folder matching its relative profile"
        );
        let mut suffix = PathBuf::new();
        for component in dir.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => suffix.push(part),
                _ => {
                    self.protect_all = true;
                    return;
                }
            }
        }
        if suffix.as_os_str().is_empty() {
            self.protect_all = true;
        } else {
            self.unanchored.insert(suffix);
        }
    }

    pub fn len(&self) -> usize {
        self.resolved.len() + self.unanchored.len()
    }

    /// True when `folder` may be in use by a live browser.
    pub fn protects(&self, folder: &Path) -> bool {
        self.protect_all
            || self.resolved.contains(folder)
            || self.unanchored.iter().any(|suffix| folder.ends_with(suffix))
    }
}

/// Canonical form of `path` for equality checks.
///
/// Existing paths are canonicalized (symlinks resolved). Paths that do not
/// exist are made absolute against the current directory and normalized
/// lexically.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Recursively delete `folder`. A folder that is already gone counts as deleted.
fn delete_folder(folder: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(folder) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::debug!(folder = %folder.display(), "permission denied, retrying after chmod");
            make_owner_writable(folder);
            match std::fs::remove_dir_all(folder) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        }
        Err(e) => Err(e),
    }
}

/// Best-effort `u+rwx` on every directory of the tree so its entries can be unlinked.
#[cfg(unix)]
fn make_owner_writable(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::symlink_metadata(dir) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o700);
    let _ = std::fs::set_permissions(dir, perms);

    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            make_owner_writable(&entry.path());
        }
    }
}

#[cfg(not(unix))]
fn make_owner_writable(_dir: &Path) {}

#[derive(Debug)]
pub enum ReclaimError {
    /// The live browser set could not be read; nothing was deleted.
    ActiveProfiles { source: ProcessTableError },
}

impl std::fmt::Display for ReclaimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimError::ActiveProfiles { source } => {
                write!(f, "failed to list active browser profiles: {source}")
            }
        }
    }
}

impl std::error::Error for ReclaimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReclaimError::ActiveProfiles { source } => Some(source),
        }
    }
}
