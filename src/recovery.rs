//! The five-step recovery sequence run when the worker breaches a threshold.
//!
//! Steps run strictly in order and every step is attempted even when an
//! earlier one failed. There is no rollback. Only a failed restart marks the
//! run as `PartiallyFailed`, because it is the one failure that leaves the
//! service down.

use crate::alert::{AlertDelivery, AlertSink, RecoveryAlert};
use crate::process_manager::ProcessManager;
use crate::process_table::ProcessTable;
use crate::reclaim::{OrphanSessionReclaimer, ReclamationReport};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Where the sequencer currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Idle,
    KillingStrayProcesses,
    StoppingWorker,
    ReclaimingSessions,
    RestartingWorker,
    EmittingAlert,
    Completed,
    PartiallyFailed,
}

impl RecoveryState {
    /// Idle or finished: a new sequence may begin.
    pub fn is_at_rest(self) -> bool {
        matches!(
            self,
            RecoveryState::Idle | RecoveryState::Completed | RecoveryState::PartiallyFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    KillStrayProcesses,
    StopWorker,
    ReclaimSessions,
    RestartWorker,
    EmitAlert,
}

impl RecoveryStep {
    fn state(self) -> RecoveryState {
        match self {
            RecoveryStep::KillStrayProcesses => RecoveryState::KillingStrayProcesses,
            RecoveryStep::StopWorker => RecoveryState::StoppingWorker,
            RecoveryStep::ReclaimSessions => RecoveryState::ReclaimingSessions,
            RecoveryStep::RestartWorker => RecoveryState::RestartingWorker,
            RecoveryStep::EmitAlert => RecoveryState::EmittingAlert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum StepResult {
    Done,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: RecoveryStep,
    #[serde(flatten)]
    pub result: StepResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Completed,
    PartiallyFailed,
}

/// What tripped the recovery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Breach {
    pub cpu: f64,
    pub ram_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AlertStatus {
    Delivered,
    Skipped,
    Failed { error: String },
}

/// Terminal result of one sequencer run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    pub breach: Breach,
    pub steps: Vec<StepRecord>,
    /// Present when the reclaim step produced a report.
    pub reclamation: Option<ReclamationReport>,
    pub alert: AlertStatus,
    pub status: RecoveryStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RecoveryOutcome {
    pub fn succeeded(&self, step: RecoveryStep) -> bool {
        self.steps
            .iter()
            .any(|r| r.step == step && r.result == StepResult::Done)
    }
}

/// Fixed inputs of a recovery run.
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub app_name: String,
    pub kill_pattern: Regex,
    pub sessions_root: PathBuf,
    pub browser_process_name: String,
    pub stop_grace: Duration,
}

pub struct RecoverySequencer {
    settings: RecoverySettings,
    manager: Arc<dyn ProcessManager>,
    table: Arc<dyn ProcessTable>,
    reclaimer: Arc<OrphanSessionReclaimer>,
    alerts: Arc<dyn AlertSink>,
    state: Mutex<RecoveryState>,
    running: AtomicBool,
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RecoverySequencer {
    pub fn new(
        settings: RecoverySettings,
        manager: Arc<dyn ProcessManager>,
        table: Arc<dyn ProcessTable>,
        reclaimer: Arc<OrphanSessionReclaimer>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            settings,
            manager,
            table,
            reclaimer,
            alerts,
            state: Mutex::new(RecoveryState::Idle),
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn enter(&self, state: RecoveryState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Run the sequence unless one is already in progress, in which case
    /// nothing happens and `None` is returned.
    pub async fn try_run(&self, breach: Breach) -> Option<RecoveryOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("recovery already in progress, ignoring trigger");
            return None;
        }
        let _guard = RunGuard(&self.running);
        let previous = self.state();
        if !previous.is_at_rest() {
            tracing::warn!(state = ?previous, "previous recovery did not finish cleanly");
        }
        Some(self.run(breach).await)
    }

    async fn run(&self, breach: Breach) -> RecoveryOutcome {
        let started_at = Utc::now();
        let app = self.settings.app_name.as_str();
        tracing::warn!(
            app,
            cpu = breach.cpu,
            ram_mb = breach.ram_mb,
            "threshold exceeded, starting recovery"
        );

        let mut steps = Vec::with_capacity(5);

        self.enter(RecoveryStep::KillStrayProcesses.state());
        let result = self.kill_stray_processes();
        steps.push(self.record(RecoveryStep::KillStrayProcesses, result));

        self.enter(RecoveryStep::StopWorker.state());
        let result = self.stop_worker().await;
        steps.push(self.record(RecoveryStep::StopWorker, result));

        self.enter(RecoveryStep::ReclaimSessions.state());
        let (result, reclamation) = self.reclaim_sessions().await;
        steps.push(self.record(RecoveryStep::ReclaimSessions, result));

        self.enter(RecoveryStep::RestartWorker.state());
        let result = self
            .manager
            .start(app)
            .await
            .map_err(|e| e.to_string());
        let restarted = result.is_ok();
        if let Err(e) = &result {
            tracing::error!(
                app,
                error = %e,
                "failed to restart worker; worker left stopped, manual intervention required"
            );
        }
        steps.push(self.record(RecoveryStep::RestartWorker, result));

        self.enter(RecoveryStep::EmitAlert.state());
        let alert = self.emit_alert(breach, restarted).await;
        let result = match &alert {
            AlertStatus::Failed { error } => Err(error.clone()),
            _ => Ok(()),
        };
        steps.push(self.record(RecoveryStep::EmitAlert, result));

        let status = if restarted {
            RecoveryStatus::Completed
        } else {
            RecoveryStatus::PartiallyFailed
        };
        self.enter(match status {
            RecoveryStatus::Completed => RecoveryState::Completed,
            RecoveryStatus::PartiallyFailed => RecoveryState::PartiallyFailed,
        });
        tracing::info!(app, status = ?status, "recovery finished");

        RecoveryOutcome {
            breach,
            steps,
            reclamation,
            alert,
            status,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn record(&self, step: RecoveryStep, result: Result<(), String>) -> StepRecord {
        let result = match result {
            Ok(()) => {
                tracing::debug!(step = ?step, "recovery step done");
                StepResult::Done
            }
            Err(error) => {
                tracing::warn!(step = ?step, error = %error, "recovery step failed, continuing");
                StepResult::Failed { error }
            }
        };
        StepRecord { step, result }
    }

    fn kill_stray_processes(&self) -> Result<(), String> {
        let pattern = &self.settings.kill_pattern;
        match self.table.terminate_matching(pattern) {
            Ok(0) => {
                tracing::info!(pattern = %pattern, "no stray browser processes to kill");
                Ok(())
            }
            Ok(killed) => {
                tracing::info!(killed, pattern = %pattern, "killed stray browser processes");
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Stop the worker, then give its processes time to release file handles
    /// before the reclaimer looks at the sessions directory.
    async fn stop_worker(&self) -> Result<(), String> {
        let app = self.settings.app_name.as_str();
        let result = self.manager.stop(app).await.map_err(|e| e.to_string());
        if result.is_ok() {
            tracing::info!(app, "worker stopped");
        }
        tokio::time::sleep(self.settings.stop_grace).await;
        result
    }

    async fn reclaim_sessions(&self) -> (Result<(), String>, Option<ReclamationReport>) {
        let reclaimer = Arc::clone(&self.reclaimer);
        let root = self.settings.sessions_root.clone();
        let filter = self.settings.browser_process_name.clone();

        let joined =
            tokio::task::spawn_blocking(move || reclaimer.reclaim(&root, &filter)).await;
        match joined {
            Ok(Ok(report)) => (Ok(()), Some(report)),
            Ok(Err(e)) => (Err(e.to_string()), None),
            Err(e) => (Err(format!("reclaimer task failed: {e}")), None),
        }
    }

    async fn emit_alert(&self, breach: Breach, restarted: bool) -> AlertStatus {
        let action = if restarted { "restarted" } else { "restart_failed" };
        let alert = RecoveryAlert {
            app: self.settings.app_name.clone(),
            cpu: breach.cpu,
            ram_mb: breach.ram_mb,
            time: Utc::now(),
            action: action.to_string(),
        };
        match self.alerts.send_recovery(&alert).await {
            Ok(AlertDelivery::Delivered) => {
                tracing::info!("recovery alert sent");
                AlertStatus::Delivered
            }
            Ok(AlertDelivery::Skipped) => AlertStatus::Skipped,
            Err(e) => AlertStatus::Failed {
                error: e.to_string(),
            },
        }
    }
}
