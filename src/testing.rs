//! In-memory collaborators for sequencer and loop tests.
//!
//! Every fake appends a short tag to a shared call log so tests can assert
//! the order in which the watchdog talked to the outside world.

use crate::alert::{AlertDelivery, AlertError, AlertSink, RecoveryAlert};
use crate::process_manager::{ProcessManager, ProcessManagerError};
use crate::process_table::{BrowserProcess, ProcessTable, ProcessTableError, ProcessUsage};
use crate::reclaim::ReclamationReport;
use crate::sampler::SampleError;
use crate::throttle::{CpuThrottle, ThrottleError};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    pub fn push(&self, call: &'static str) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| **c == call).count()
    }
}

fn failed(action: &str) -> ProcessManagerError {
    ProcessManagerError::Failed {
        action: action.to_string(),
        code: Some(1),
        stderr: format!("{action} refused"),
    }
}

#[derive(Default)]
pub struct FakeManager {
    pub log: CallLog,
    pub pid: Mutex<Option<u32>>,
    pub fail_pid: bool,
    pub fail_stop: bool,
    pub fail_start: bool,
    /// When set, `start` waits for a notification before returning.
    pub start_gate: Option<Arc<Notify>>,
}

#[async_trait]
impl ProcessManager for FakeManager {
    async fn pid(&self, _app: &str) -> Result<Option<u32>, ProcessManagerError> {
        self.log.push("pid");
        if self.fail_pid {
            return Err(failed("pid"));
        }
        Ok(*self.pid.lock().unwrap())
    }

    async fn stop(&self, _app: &str) -> Result<(), ProcessManagerError> {
        self.log.push("stop");
        if self.fail_stop {
            return Err(failed("stop"));
        }
        *self.pid.lock().unwrap() = None;
        Ok(())
    }

    async fn start(&self, _app: &str) -> Result<(), ProcessManagerError> {
        self.log.push("start");
        if let Some(gate) = &self.start_gate {
            gate.notified().await;
        }
        if self.fail_start {
            return Err(failed("start"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTable {
    pub log: CallLog,
    pub usage: Mutex<Option<ProcessUsage>>,
    pub browsers: Mutex<Vec<BrowserProcess>>,
    pub fail_kill: bool,
    pub fail_list: bool,
}

impl FakeTable {
    pub fn set_usage(&self, cpu_percent: f64, resident_mb: u64) {
        *self.usage.lock().unwrap() = Some(ProcessUsage {
            cpu_percent,
            mem_percent: 1.0,
            resident_kb: resident_mb * 1024,
        });
    }
}

impl ProcessTable for FakeTable {
    fn usage(&self, pid: u32) -> Result<ProcessUsage, SampleError> {
        self.log.push("usage");
        self.usage.lock().unwrap().ok_or(SampleError::NotFound { pid })
    }

    fn command_lines(&self, _name_filter: &str) -> Result<Vec<BrowserProcess>, ProcessTableError> {
        self.log.push("list");
        if self.fail_list {
            return Err(ProcessTableError::Poisoned);
        }
        Ok(self.browsers.lock().unwrap().clone())
    }

    fn terminate_matching(&self, _pattern: &Regex) -> Result<usize, ProcessTableError> {
        self.log.push("kill");
        if self.fail_kill {
            return Err(ProcessTableError::Signal {
                details: "pid 1: EPERM".to_string(),
            });
        }
        Ok(2)
    }
}

#[derive(Default)]
pub struct FakeThrottle {
    pub log: CallLog,
}

#[async_trait]
impl CpuThrottle for FakeThrottle {
    async fn throttle(&self, _pid: u32, _cap_percent: u32) -> Result<(), ThrottleError> {
        self.log.push("throttle");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeAlerts {
    pub log: CallLog,
    pub fail: bool,
    pub sent: Mutex<Vec<RecoveryAlert>>,
}

#[async_trait]
impl AlertSink for FakeAlerts {
    async fn send_recovery(&self, alert: &RecoveryAlert) -> Result<AlertDelivery, AlertError> {
        self.log.push("alert");
        if self.fail {
            return Err(AlertError::Status {
                url: "http://alerts.invalid".to_string(),
                status: 503,
            });
        }
        self.sent.lock().unwrap().push(alert.clone());
        Ok(AlertDelivery::Delivered)
    }

    async fn send_report(&self, _report: &ReclamationReport) -> Result<AlertDelivery, AlertError> {
        self.log.push("report");
        Ok(AlertDelivery::Skipped)
    }
}
