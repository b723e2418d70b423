//! The external process manager that owns the worker's lifecycle.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Current pid of `app`, or `None` when it is not running.
    async fn pid(&self, app: &str) -> Result<Option<u32>, ProcessManagerError>;
    async fn stop(&self, app: &str) -> Result<(), ProcessManagerError>;
    async fn start(&self, app: &str) -> Result<(), ProcessManagerError>;
}

/// Drives pm2 through its CLI.
pub struct Pm2 {
    program: String,
}

impl Pm2 {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, ProcessManagerError> {
        tracing::debug!(program = %self.program, args = ?args, "invoking process manager");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProcessManagerError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ProcessManagerError::Failed {
                action: args.first().copied().unwrap_or_default().to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ProcessManager for Pm2 {
    async fn pid(&self, app: &str) -> Result<Option<u32>, ProcessManagerError> {
        let stdout = self.run(&["pid", app]).await?;
        parse_pid(&stdout)
    }

    async fn stop(&self, app: &str) -> Result<(), ProcessManagerError> {
        self.run(&["stop", app]).await.map(|_| ())
    }

    async fn start(&self, app: &str) -> Result<(), ProcessManagerError> {
        self.run(&["start", app]).await.map(|_| ())
    }
}

/// Parse `pm2 pid` output. Empty output or `0` means the app is not running.
fn parse_pid(stdout: &str) -> Result<Option<u32>, ProcessManagerError> {
    // pm2 prints one pid per instance; the watchdog supervises the first.
    let Some(first) = stdout.split_whitespace().next() else {
        return Ok(None);
    };
    match first.parse::<u32>() {
        Ok(0) => Ok(None),
        Ok(pid) => Ok(Some(pid)),
        Err(_) => Err(ProcessManagerError::BadPid {
            raw: stdout.to_string(),
        }),
    }
}

#[derive(Debug)]
pub enum ProcessManagerError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    Failed {
        action: String,
        code: Option<i32>,
        stderr: String,
    },
    BadPid {
        raw: String,
    },
}

impl std::fmt::Display for ProcessManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessManagerError::Spawn { program, source } => {
                write!(f, "failed to run {program}: {source}")
            }
            ProcessManagerError::Failed {
                action,
                code,
                stderr,
            } => write!(f, "process manager {action} exited with {code:?}: {stderr}"),
            ProcessManagerError::BadPid { raw } => {
                write!(f, "process manager returned an unparseable pid: {raw:?}")
            }
        }
    }
}

impl std::error::Error for ProcessManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessManagerError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}
