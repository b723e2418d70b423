/// Periodic driver: resolve the worker pid, sample it, evaluate thresholds,
/// and hand breaches to the recovery sequencer.
///
/// At most one recovery runs at a time. It runs on its own task so the loop
/// keeps ticking, but every tick that fires while it is in flight is ignored.
use crate::evaluator::{ThresholdEvaluator, Verdict};
use crate::process_manager::ProcessManager;
use crate::recovery::{Breach, RecoveryOutcome, RecoverySequencer, RecoveryStatus, RecoveryStep};
use crate::sampler::ProcessMetricsSampler;
use crate::status::{StatusTracker, WatchdogState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Rate limiter for a repeating log line.
#[derive(Debug)]
pub struct LogThrottle {
    every: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(every: Duration) -> Self {
        Self { every, last: None }
    }

    /// True at most once per `every`; the first call is always true.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.every => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A recovery was still running; the tick did nothing.
    RecoveryInFlight,
    WorkerAbsent,
    ManagerUnavailable,
    SampleUnavailable,
    Sampled(Verdict),
    RecoveryStarted(Breach),
}

pub struct WatchdogLoop {
    app_name: String,
    manager: Arc<dyn ProcessManager>,
    sampler: ProcessMetricsSampler,
    evaluator: ThresholdEvaluator,
    sequencer: Arc<RecoverySequencer>,
    in_flight: Option<JoinHandle<Option<RecoveryOutcome>>>,
    usage_log: LogThrottle,
    absent_log: LogThrottle,
    status: Option<StatusTracker>,
    last_outcome: Option<RecoveryOutcome>,
}

impl WatchdogLoop {
    pub fn new(
        app_name: impl Into<String>,
        manager: Arc<dyn ProcessManager>,
        sampler: ProcessMetricsSampler,
        evaluator: ThresholdEvaluator,
        sequencer: Arc<RecoverySequencer>,
        log_every: Duration,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            manager,
            sampler,
            evaluator,
            sequencer,
            in_flight: None,
            usage_log: LogThrottle::new(log_every),
            absent_log: LogThrottle::new(log_every),
            status: None,
            last_outcome: None,
        }
    }

    pub fn with_status(mut self, status: StatusTracker) -> Self {
        self.status = Some(status);
        self
    }

    pub fn recovery_in_flight(&self) -> bool {
        self.in_flight.is_some() || self.sequencer.is_running()
    }

    /// The most recent finished recovery, if any.
    pub fn last_outcome(&self) -> Option<&RecoveryOutcome> {
        self.last_outcome.as_ref()
    }

    fn transition(&mut self, state: WatchdogState) {
        if let Some(status) = self.status.as_mut() {
            status.transition(state);
        }
    }

    /// Collect a finished recovery task, if there is one.
    async fn reap_recovery(&mut self) {
        let finished = self.in_flight.as_ref().is_some_and(JoinHandle::is_finished);
        if !finished {
            return;
        }
        let Some(handle) = self.in_flight.take() else {
            return;
        };
        self.finish_recovery(handle).await;
    }

    async fn finish_recovery(&mut self, handle: JoinHandle<Option<RecoveryOutcome>>) {
        match handle.await {
            Ok(Some(outcome)) => {
                if !outcome.succeeded(RecoveryStep::ReclaimSessions) {
                    tracing::warn!("orphaned sessions were not reclaimed this time");
                }
                if outcome.status == RecoveryStatus::PartiallyFailed {
                    tracing::error!(app = %self.app_name, "recovery left the worker down");
                }
                if let Some(status) = self.status.as_mut() {
                    status.record_recovery(&outcome);
                }
                self.last_outcome = Some(outcome);
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "recovery task failed"),
        }
        self.usage_log.reset();
        self.absent_log.reset();
    }

    /// One pass of pid lookup, sampling, evaluation and, on a breach, recovery.
    pub async fn tick(&mut self) -> TickOutcome {
        self.reap_recovery().await;
        if self.recovery_in_flight() {
            tracing::debug!(state = ?self.sequencer.state(), "recovery in progress, skipping tick");
            return TickOutcome::RecoveryInFlight;
        }

        let pid = match self.manager.pid(&self.app_name).await {
            Ok(Some(pid)) => pid,
            Ok(None) => {
                if self.absent_log.ready() {
                    tracing::info!(app = %self.app_name, "worker not running");
                } else {
                    tracing::debug!(app = %self.app_name, "worker not running");
                }
                if let Some(status) = self.status.as_mut() {
                    status.set_worker_pid(None);
                }
                self.transition(WatchdogState::WorkerAbsent);
                return TickOutcome::WorkerAbsent;
            }
            Err(e) => {
                tracing::warn!(app = %self.app_name, error = %e, "failed to query process manager");
                return TickOutcome::ManagerUnavailable;
            }
        };

        let sample = match self.sampler.sample(pid) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::debug!(pid, error = %e, "skipping tick");
                return TickOutcome::SampleUnavailable;
            }
        };

        let verdict = self.evaluator.evaluate(&sample).await;
        if let Some(status) = self.status.as_mut() {
            status.set_worker_pid(Some(pid));
            status.set_last_sample(&sample);
        }

        match verdict {
            Verdict::Normal => {
                if self.usage_log.ready() {
                    tracing::info!(pid, cpu = sample.cpu_percent, ram_mb = sample.resident_mb, "worker usage");
                } else {
                    tracing::debug!(pid, cpu = sample.cpu_percent, ram_mb = sample.resident_mb, "worker usage");
                }
            }
            Verdict::Elevated => {
                tracing::warn!(
                    pid,
                    cpu = sample.cpu_percent,
                    ram_mb = sample.resident_mb,
                    "worker usage approaching thresholds"
                );
            }
            Verdict::ThresholdExceeded { cpu, ram_mb } => {
                let breach = Breach { cpu, ram_mb };
                self.transition(WatchdogState::Recovering);
                let sequencer = Arc::clone(&self.sequencer);
                self.in_flight = Some(tokio::spawn(async move { sequencer.try_run(breach).await }));
                return TickOutcome::RecoveryStarted(breach);
            }
        }

        self.transition(WatchdogState::Monitoring);
        TickOutcome::Sampled(verdict)
    }

    /// Wait for an in-flight recovery to finish.
    pub async fn drain(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            tracing::info!("waiting for in-flight recovery to finish");
            self.finish_recovery(handle).await;
        }
    }

    /// Tick every `period` until `shutdown` resolves.
    ///
    /// Ticks that come due while a previous tick is still running are
    /// dropped rather than queued.
    pub async fn run<F>(mut self, period: Duration, shutdown: F)
    where
        F: Future,
    {
        let thresholds = self.evaluator.thresholds();
        tracing::info!(
            app = %self.app_name,
            period_secs = period.as_secs(),
            cpu_percent = thresholds.cpu_percent,
            ram_mb = thresholds.ram_mb,
            cpu_cap = thresholds.cpu_cap_percent,
            "watchdog started"
        );
        self.transition(WatchdogState::Starting);

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.transition(WatchdogState::ShuttingDown);
        self.drain().await;
        if let Some(status) = self.status.as_ref() {
            status.remove();
        }
        tracing::info!("watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::Thresholds;
    use crate::reclaim::OrphanSessionReclaimer;
    use crate::recovery::RecoverySettings;
    use crate::testing::{CallLog, FakeAlerts, FakeManager, FakeTable, FakeThrottle};
    use regex::Regex;
    use tokio::sync::Notify;

    struct Harness {
        log: CallLog,
        table: Arc<FakeTable>,
        watchdog: WatchdogLoop,
        _dir: tempfile::TempDir,
    }

    fn harness(manager: FakeManager) -> Harness {
        let log = CallLog::default();
        let manager = Arc::new(FakeManager {
            log: log.clone(),
            ..manager
        });
        let table = Arc::new(FakeTable {
            log: log.clone(),
            ..Default::default()
        });
        let throttle = Arc::new(FakeThrottle { log: log.clone() });
        let alerts = Arc::new(FakeAlerts {
            log: log.clone(),
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();

        let thresholds = Thresholds {
            cpu_percent: 90.0,
            ram_mb: 1024,
            cpu_cap_percent: 50,
            prewarn_ratio: 0.7,
        };
        let reclaimer = Arc::new(OrphanSessionReclaimer::new(table.clone(), "SingletonLock", 2));
        let sequencer = Arc::new(RecoverySequencer::new(
            RecoverySettings {
                app_name: "bpub-prod".to_string(),
                kill_pattern: Regex::new("chrome.*WH_SESSIONS").unwrap(),
                sessions_root: dir.path().to_path_buf(),
                browser_process_name: "chrome".to_string(),
                stop_grace: Duration::from_secs(2),
            },
            manager.clone(),
            table.clone(),
            reclaimer,
            alerts,
        ));
        let watchdog = WatchdogLoop::new(
            "bpub-prod",
            manager,
            ProcessMetricsSampler::new(table.clone()),
            ThresholdEvaluator::new(thresholds, throttle),
            sequencer,
            Duration::from_secs(60),
        );
        Harness {
            log,
            table,
            watchdog,
            _dir: dir,
        }
    }

    fn running(pid: u32) -> FakeManager {
        FakeManager {
            pid: std::sync::Mutex::new(Some(pid)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_absent_worker_skips_sampling_and_recovery() {
        let mut h = harness(FakeManager::default());
        h.table.set_usage(99.0, 5000);

        assert_eq!(h.watchdog.tick().await, TickOutcome::WorkerAbsent);
        assert_eq!(h.log.calls(), vec!["pid"]);
        assert!(!h.watchdog.recovery_in_flight());
    }

    #[tokio::test]
    async fn test_manager_error_skips_tick() {
        let mut h = harness(FakeManager {
            fail_pid: true,
            ..Default::default()
        });
        assert_eq!(h.watchdog.tick().await, TickOutcome::ManagerUnavailable);
        assert_eq!(h.log.calls(), vec!["pid"]);
    }

    #[tokio::test]
    async fn test_vanished_process_skips_evaluation() {
        let mut h = harness(running(42));
        assert_eq!(h.watchdog.tick().await, TickOutcome::SampleUnavailable);
        assert_eq!(h.log.calls(), vec!["pid", "usage"]);
    }

    #[tokio::test]
    async fn test_normal_usage_applies_cap_without_recovery() {
        let mut h = harness(running(42));
        h.table.set_usage(10.0, 100);

        assert_eq!(h.watchdog.tick().await, TickOutcome::Sampled(Verdict::Normal));
        assert_eq!(h.log.calls(), vec!["pid", "usage", "throttle"]);
    }

    #[tokio::test]
    async fn test_prewarning_does_not_recover() {
        let mut h = harness(running(42));
        // 70% of the 90% cpu threshold.
        h.table.set_usage(63.0, 100);

        assert_eq!(h.watchdog.tick().await, TickOutcome::Sampled(Verdict::Elevated));
        assert!(!h.watchdog.recovery_in_flight());
        assert_eq!(h.log.count("kill"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_breach_starts_recovery() {
        let mut h = harness(running(42));
        h.table.set_usage(95.0, 200);

        let outcome = h.watchdog.tick().await;
        assert_eq!(
            outcome,
            TickOutcome::RecoveryStarted(Breach {
                cpu: 95.0,
                ram_mb: 200
            })
        );
        h.watchdog.drain().await;

        let last = h.watchdog.last_outcome().unwrap();
        assert_eq!(last.status, RecoveryStatus::Completed);
        assert_eq!(
            h.log.calls(),
            vec!["pid", "usage", "throttle", "kill", "stop", "start", "alert"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_during_recovery_are_ignored() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(FakeManager {
            start_gate: Some(gate.clone()),
            ..running(42)
        });
        h.table.set_usage(95.0, 200);

        assert!(matches!(h.watchdog.tick().await, TickOutcome::RecoveryStarted(_)));
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            assert_eq!(h.watchdog.tick().await, TickOutcome::RecoveryInFlight);
        }

        gate.notify_one();
        h.watchdog.drain().await;
        assert_eq!(h.log.count("kill"), 1);
        assert_eq!(h.log.count("stop"), 1);
        assert_eq!(h.log.count("start"), 1);
        assert!(!h.watchdog.recovery_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_recovery_is_reaped_on_next_tick() {
        let mut h = harness(running(42));
        h.table.set_usage(95.0, 200);
        assert!(matches!(h.watchdog.tick().await, TickOutcome::RecoveryStarted(_)));

        // Let the recovery (including its grace sleep) finish.
        tokio::time::sleep(Duration::from_secs(10)).await;
        while !h.watchdog.in_flight.as_ref().is_some_and(JoinHandle::is_finished) {
            tokio::task::yield_now().await;
        }

        // The fake manager forgot the pid on stop, so the worker now looks absent.
        assert_eq!(h.watchdog.tick().await, TickOutcome::WorkerAbsent);
        assert!(h.watchdog.last_outcome().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown_and_drains() {
        let h = harness(running(42));
        h.table.set_usage(10.0, 100);
        let log = h.log.clone();

        h.watchdog
            .run(
                Duration::from_secs(5),
                tokio::time::sleep(Duration::from_secs(12)),
            )
            .await;

        // Ticks at 0s, 5s and 10s.
        assert_eq!(log.count("pid"), 3);
        assert_eq!(log.count("throttle"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_throttle() {
        let mut throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!throttle.ready());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(throttle.ready());
        throttle.reset();
        assert!(throttle.ready());
    }
}
