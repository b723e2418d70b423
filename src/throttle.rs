//! Standing CPU cap on the worker, enforced by an external limiter tool.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;

#[async_trait]
pub trait CpuThrottle: Send + Sync {
    /// Cap `pid` at `cap_percent`. Safe to call on every tick.
    async fn throttle(&self, pid: u32, cap_percent: u32) -> Result<(), ThrottleError>;
}

/// Runs `cpulimit -p <pid> -l <cap> --background`.
///
/// `cpulimit` detaches and keeps limiting until the target exits, so the
/// adapter remembers the last (pid, cap) it launched a limiter for and does
/// not stack a second limiter on the same process.
pub struct CpuLimit {
    command: String,
    applied: Mutex<Option<(u32, u32)>>,
}

impl CpuLimit {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            applied: Mutex::new(None),
        }
    }

    fn already_applied(&self, pid: u32, cap_percent: u32) -> bool {
        self.applied
            .lock()
            .map(|applied| *applied == Some((pid, cap_percent)))
            .unwrap_or(false)
    }

    fn remember(&self, pid: u32, cap_percent: u32) {
        if let Ok(mut applied) = self.applied.lock() {
            *applied = Some((pid, cap_percent));
        }
    }
}

#[async_trait]
impl CpuThrottle for CpuLimit {
    async fn throttle(&self, pid: u32, cap_percent: u32) -> Result<(), ThrottleError> {
        if self.already_applied(pid, cap_percent) {
            tracing::debug!(pid, cap_percent, "cpu cap already in place");
            return Ok(());
        }

        tracing::info!(pid, cap_percent, "applying cpu cap");
        let output = Command::new(&self.command)
            .args(["-p", &pid.to_string(), "-l", &cap_percent.to_string(), "--background"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ThrottleError::Spawn {
                command: self.command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ThrottleError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        self.remember(pid, cap_percent);
        Ok(())
    }
}

/// Throttle used when `[throttle] enabled = false`.
pub struct NoThrottle;

#[async_trait]
impl CpuThrottle for NoThrottle {
    async fn throttle(&self, _pid: u32, _cap_percent: u32) -> Result<(), ThrottleError> {
        Ok(())
    }
}

#[derive(Debug)]
pub enum ThrottleError {
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Failed {
        code: Option<i32>,
        stderr: String,
    },
}

impl std::fmt::Display for ThrottleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThrottleError::Spawn { command, source } => {
                write!(f, "failed to run throttle tool {command}: {source}")
            }
            ThrottleError::Failed { code, stderr } => {
                write!(f, "throttle tool exited with {code:?}: {stderr}")
            }
        }
    }
}

impl std::error::Error for ThrottleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ThrottleError::Spawn { source, .. } => Some(source),
            ThrottleError::Failed { .. } => None,
        }
    }
}
