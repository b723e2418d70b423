/// Threshold evaluation: standing CPU cap, pre-warning band, and breach detection.
use crate::config::ThresholdConfig;
use crate::sampler::ProcessSample;
use crate::throttle::CpuThrottle;
use serde::Serialize;
use std::sync::Arc;

/// Resource thresholds the worker is held to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub ram_mb: u64,
    pub cpu_cap_percent: u32,
    pub prewarn_ratio: f64,
}

impl From<&ThresholdConfig> for Thresholds {
    fn from(cfg: &ThresholdConfig) -> Self {
        Self {
            cpu_percent: cfg.cpu_percent,
            ram_mb: cfg.ram_mb,
            cpu_cap_percent: cfg.cpu_cap_percent,
            prewarn_ratio: cfg.prewarn_ratio,
        }
    }
}

/// Classification of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "level")]
pub enum Verdict {
    Normal,
    /// At or above the pre-warning fraction of a threshold. Observability only.
    Elevated,
    /// Strictly above a threshold; triggers recovery.
    ThresholdExceeded { cpu: f64, ram_mb: u64 },
}

impl Verdict {
    pub fn is_breach(&self) -> bool {
        matches!(self, Verdict::ThresholdExceeded { .. })
    }
}

/// Pure classification of `sample` against `thresholds`.
pub fn classify(sample: &ProcessSample, thresholds: &Thresholds) -> Verdict {
    let cpu = sample.cpu_percent;
    let ram_mb = sample.resident_mb;

    if cpu > thresholds.cpu_percent || ram_mb > thresholds.ram_mb {
        return Verdict::ThresholdExceeded { cpu, ram_mb };
    }

    let cpu_warn = thresholds.cpu_percent * thresholds.prewarn_ratio;
    let ram_warn = thresholds.ram_mb as f64 * thresholds.prewarn_ratio;
    if cpu >= cpu_warn || ram_mb as f64 >= ram_warn {
        return Verdict::Elevated;
    }
    Verdict::Normal
}

/// Applies the standing CPU cap and classifies samples.
pub struct ThresholdEvaluator {
    thresholds: Thresholds,
    throttle: Arc<dyn CpuThrottle>,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: Thresholds, throttle: Arc<dyn CpuThrottle>) -> Self {
        Self {
            thresholds,
            throttle,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Re-apply the CPU cap to the sampled pid, then classify the sample.
    ///
    /// A throttle failure is logged and does not change the verdict.
    pub async fn evaluate(&self, sample: &ProcessSample) -> Verdict {
        if let Err(e) = self
            .throttle
            .throttle(sample.pid, self.thresholds.cpu_cap_percent)
            .await
        {
            tracing::warn!(pid = sample.pid, error = %e, "failed to apply cpu cap");
        }
        classify(sample, &self.thresholds)
    }
}
