/// Per-tick resource sampling of the supervised worker.
use crate::process_table::ProcessTable;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// One point-in-time measurement of the worker. Never mutated after capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub resident_mb: u64,
    pub captured_at: DateTime<Utc>,
}

/// Reads worker usage from the process table and converts it into a sample.
#[derive(Clone)]
pub struct ProcessMetricsSampler {
    table: Arc<dyn ProcessTable>,
}

impl ProcessMetricsSampler {
    pub fn new(table: Arc<dyn ProcessTable>) -> Self {
        Self { table }
    }

    /// Sample `pid`. A process that vanished since its pid was looked up
    /// yields `SampleError::NotFound`.
    pub fn sample(&self, pid: u32) -> Result<ProcessSample, SampleError> {
        let usage = self.table.usage(pid)?;
        if usage.cpu_percent < 0.0 || usage.mem_percent < 0.0 {
            return Err(SampleError::Parse {
                pid,
                raw: format!("cpu={} mem={}", usage.cpu_percent, usage.mem_percent),
            });
        }
        Ok(ProcessSample {
            pid,
            cpu_percent: usage.cpu_percent,
            mem_percent: usage.mem_percent,
            resident_mb: kb_to_mb(usage.resident_kb),
            captured_at: Utc::now(),
        })
    }
}

/// Kilobytes to megabytes, rounded to nearest.
fn kb_to_mb(kb: u64) -> u64 {
    (kb + 512) / 1024
}

/// The sample could not be taken. All variants mean "skip this tick".
#[derive(Debug)]
pub enum SampleError {
    /// The process exited between pid lookup and sampling.
    NotFound { pid: u32 },
    /// The OS refused or failed the query.
    Unreadable { pid: u32, reason: String },
    /// The OS answered with values that make no sense.
    Parse { pid: u32, raw: String },
}

impl std::fmt::Display for SampleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleError::NotFound { pid } => write!(f, "sample unavailable: pid {pid} not found"),
            SampleError::Unreadable { pid, reason } => {
                write!(f, "sample unavailable: pid {pid} unreadable: {reason}")
            }
            SampleError::Parse { pid, raw } => {
                write!(f, "sample unavailable: pid {pid} returned unparseable usage ({raw})")
            }
        }
    }
}

impl std::error::Error for SampleError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_table::{BrowserProcess, ProcessTableError, ProcessUsage};
    use regex::Regex;

    struct FixedTable(Option<ProcessUsage>);

    impl ProcessTable for FixedTable {
        fn usage(&self, pid: u32) -> Result<ProcessUsage, SampleError> {
            self.0.ok_or(SampleError::NotFound { pid })
        }
        fn command_lines(&self, _: &str) -> Result<Vec<BrowserProcess>, ProcessTableError> {
            Ok(Vec::new())
        }
        fn terminate_matching(&self, _: &Regex) -> Result<usize, ProcessTableError> {
            Ok(0)
        }
    }

    fn sampler(usage: Option<ProcessUsage>) -> ProcessMetricsSampler {
        ProcessMetricsSampler::new(Arc::new(FixedTable(usage)))
    }

    #[test]
    fn test_sample_converts_resident_kb_to_mb() {
        let s = sampler(Some(ProcessUsage {
            cpu_percent: 42.5,
            mem_percent: 3.1,
            resident_kb: 460_800,
        }));
        let sample = s.sample(1234).unwrap();
        assert_eq!(sample.pid, 1234);
        assert_eq!(sample.cpu_percent, 42.5);
        assert_eq!(sample.mem_percent, 3.1);
        assert_eq!(sample.resident_mb, 450);
    }

    #[test]
    fn test_kb_to_mb_rounds_to_nearest() {
        assert_eq!(kb_to_mb(0), 0);
        assert_eq!(kb_to_mb(511), 0);
        assert_eq!(kb_to_mb(512), 1);
        assert_eq!(kb_to_mb(1024), 1);
        assert_eq!(kb_to_mb(1535), 1);
        assert_eq!(kb_to_mb(1536), 2);
    }

    #[test]
    fn test_vanished_process_is_unavailable() {
        let err = sampler(None).sample(99).unwrap_err();
        assert!(matches!(err, SampleError::NotFound { pid: 99 }));
        assert!(err.to_string().contains("sample unavailable"));
    }

    #[test]
    fn test_negative_usage_is_parse_error() {
        let s = sampler(Some(ProcessUsage {
            cpu_percent: -1.0,
            mem_percent: 0.0,
            resident_kb: 10,
        }));
        assert!(matches!(s.sample(7), Err(SampleError::Parse { pid: 7, .. })));
    }
}
