/// Status file: writes the watchdog's state as JSON on every state transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::recovery::{RecoveryOutcome, RecoveryStatus};
use crate::sampler::ProcessSample;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Watchdog states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogState {
    Starting,
    Monitoring,
    WorkerAbsent,
    Recovering,
    ShuttingDown,
}

/// Short form of the last recovery, kept in the status file.
#[derive(Debug, Clone, Serialize)]
pub struct RecoverySummary {
    pub status: RecoveryStatus,
    pub cpu: f64,
    pub ram_mb: u64,
    pub deleted_folders: usize,
    pub finished_at: DateTime<Utc>,
}

impl From<&RecoveryOutcome> for RecoverySummary {
    fn from(outcome: &RecoveryOutcome) -> Self {
        Self {
            status: outcome.status,
            cpu: outcome.breach.cpu,
            ram_mb: outcome.breach.ram_mb,
            deleted_folders: outcome
                .reclamation
                .as_ref()
                .map_or(0, |r| r.deleted_folders_count),
            finished_at: outcome.finished_at,
        }
    }
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: WatchdogState,
    pub worker_pid: Option<u32>,
    pub last_sample: Option<ProcessSample>,
    pub last_recovery: Option<RecoverySummary>,
    pub recoveries: u64,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Create a new StatusFile writer for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".watchdog.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Accumulates what the loop knows and writes it out when the state changes.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    state: Option<WatchdogState>,
    worker_pid: Option<u32>,
    last_sample: Option<ProcessSample>,
    last_recovery: Option<RecoverySummary>,
    recoveries: u64,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            state: None,
            worker_pid: None,
            last_sample: None,
            last_recovery: None,
            recoveries: 0,
        }
    }

    /// Move to `state`, writing the file only if the state changed.
    pub fn transition(&mut self, state: WatchdogState) {
        if self.state == Some(state) {
            return;
        }
        self.state = Some(state);
        self.flush();
    }

    /// Write the current snapshot regardless of state changes.
    pub fn flush(&self) {
        let Some(state) = self.state else {
            return;
        };
        let data = StatusData {
            pid: self.pid,
            state,
            worker_pid: self.worker_pid,
            last_sample: self.last_sample.clone(),
            last_recovery: self.last_recovery.clone(),
            recoveries: self.recoveries,
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn set_worker_pid(&mut self, pid: Option<u32>) {
        self.worker_pid = pid;
    }

    pub fn set_last_sample(&mut self, sample: &ProcessSample) {
        self.last_sample = Some(sample.clone());
    }

    /// Record a finished recovery and write it out immediately.
    pub fn record_recovery(&mut self, outcome: &RecoveryOutcome) {
        self.recoveries += 1;
        self.last_recovery = Some(RecoverySummary::from(outcome));
        self.flush();
    }

    /// Remove the status file.
    pub fn remove(&self) {
        self.file.remove();
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
