//! OS process table access.
//!
//! The watchdog needs three things from the process table: resource usage of
//! a single pid, the command lines of browser processes (to find which
//! profile directories are live), and a way to signal stray browsers.
//! `SystemProcessTable` provides them through `sysinfo` and `nix`.

use crate::sampler::SampleError;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, System, UpdateKind};

/// Raw resource usage of a single process, as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub resident_kb: u64,
}

/// A live process as seen by session reclamation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrowserProcess {
    pub argv: Vec<String>,
    /// Working directory, used to anchor relative path arguments.
    /// `None` when the OS would not tell us.
    pub cwd: Option<PathBuf>,
}

/// Queryable view of running processes.
pub trait ProcessTable: Send + Sync {
    /// Instantaneous usage of `pid`.
    fn usage(&self, pid: u32) -> Result<ProcessUsage, SampleError>;

    /// Every process whose command line contains `name_filter`.
    fn command_lines(&self, name_filter: &str) -> Result<Vec<BrowserProcess>, ProcessTableError>;

    /// Send SIGTERM to every process whose joined command line matches `pattern`.
    ///
    /// Returns the number of processes signalled. Zero is not an error.
    fn terminate_matching(&self, pattern: &Regex) -> Result<usize, ProcessTableError>;
}

/// `sysinfo`-backed process table.
///
/// The `System` is kept across calls so that CPU usage is measured over the
/// interval between two consecutive refreshes of the same pid, which is one
/// watchdog tick in practice. A pid reads 0% CPU until it has been refreshed
/// twice with some CPU time already on its clock, so a freshly started
/// worker needs two ticks before its CPU can trip a threshold.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        // Seed the global CPU times that per-process usage is divided by.
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, System>, ProcessTableError> {
        self.system.lock().map_err(|_| ProcessTableError::Poisoned)
    }

    fn refresh_command_lines(sys: &mut System) {
        sys.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::Always)
                .with_cwd(UpdateKind::Always),
        );
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn usage(&self, pid: u32) -> Result<ProcessUsage, SampleError> {
        let mut sys = self.lock().map_err(|e| SampleError::Unreadable {
            pid,
            reason: e.to_string(),
        })?;

        let sys_pid = Pid::from_u32(pid);
        let refreshed =
            sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new().with_cpu().with_memory());
        if !refreshed {
            return Err(SampleError::NotFound { pid });
        }
        sys.refresh_memory();
        let total_bytes = sys.total_memory();

        let process = sys.process(sys_pid).ok_or(SampleError::NotFound { pid })?;
        let cpu_percent = f64::from(process.cpu_usage());
        if !cpu_percent.is_finite() {
            return Err(SampleError::Parse {
                pid,
                raw: format!("cpu_usage={cpu_percent}"),
            });
        }

        let resident_bytes = process.memory();
        let mem_percent = if total_bytes > 0 {
            resident_bytes as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };

        Ok(ProcessUsage {
            cpu_percent,
            mem_percent,
            resident_kb: resident_bytes / 1024,
        })
    }

    fn command_lines(&self, name_filter: &str) -> Result<Vec<BrowserProcess>, ProcessTableError> {
        let mut sys = self.lock()?;
        Self::refresh_command_lines(&mut sys);

        let own_pid = std::process::id();
        let lines = sys
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .filter(|(_, process)| {
                process.name().contains(name_filter)
                    || process.cmd().iter().any(|arg| arg.contains(name_filter))
            })
            .map(|(_, process)| BrowserProcess {
                argv: process.cmd().to_vec(),
                cwd: process
                    .cwd()
                    .filter(|cwd| !cwd.as_os_str().is_empty())
                    .map(|cwd| cwd.to_path_buf()),
            })
            .collect();
        Ok(lines)
    }

    fn terminate_matching(&self, pattern: &Regex) -> Result<usize, ProcessTableError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;

        let targets: Vec<u32> = {
            let mut sys = self.lock()?;
            Self::refresh_command_lines(&mut sys);
            let own_pid = std::process::id();
            sys.processes()
                .iter()
                .filter(|(pid, _)| pid.as_u32() != own_pid)
                .filter(|(_, process)| pattern.is_match(&process.cmd().join(" ")))
                .map(|(pid, _)| pid.as_u32())
                .collect()
        };

        let mut signalled = 0;
        let mut failures = Vec::new();
        for pid in targets {
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match kill(NixPid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => {
                    tracing::debug!(pid, "sent SIGTERM to stray browser process");
                    signalled += 1;
                }
                // Already gone between enumeration and signal.
                Err(Errno::ESRCH) => {}
                Err(e) => failures.push(format!("pid {pid}: {e}")),
            }
        }

        if signalled == 0 && !failures.is_empty() {
            return Err(ProcessTableError::Signal {
                details: failures.join("; "),
            });
        }
        for failure in &failures {
            tracing::warn!(failure = %failure, "failed to signal stray browser process");
        }
        Ok(signalled)
    }
}

/// Errors from enumerating or signalling processes.
#[derive(Debug)]
pub enum ProcessTableError {
    /// A previous holder of the process table panicked.
    Poisoned,
    /// Every matching process refused the signal.
    Signal { details: String },
}

impl std::fmt::Display for ProcessTableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessTableError::Poisoned => write!(f, "process table lock poisoned"),
            ProcessTableError::Signal { details } => {
                write!(f, "failed to signal matching processes: {details}")
            }
        }
    }
}

impl std::error::Error for ProcessTableError {}
