mod alert;
mod config;
mod evaluator;
mod instance;
mod process_manager;
mod process_table;
mod reclaim;
mod recovery;
mod sampler;
mod signals;
mod status;
mod throttle;
mod watchdog;

#[cfg(test)]
mod testing;

use alert::{AlertDelivery, AlertSink, HttpAlertSink};
use clap::{Parser, Subcommand};
use config::WatchdogConfig;
use evaluator::{classify, ThresholdEvaluator, Thresholds};
use instance::InstanceLock;
use process_manager::{Pm2, ProcessManager};
use process_table::{ProcessTable, SystemProcessTable};
use reclaim::OrphanSessionReclaimer;
use recovery::{RecoverySequencer, RecoverySettings};
use regex::Regex;
use sampler::ProcessMetricsSampler;
use signals::SignalHandler;
use status::StatusTracker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use throttle::{CpuLimit, CpuThrottle, NoThrottle};
use tracing_subscriber::EnvFilter;
use watchdog::WatchdogLoop;

/// Resource watchdog for a process-managed browser-automation worker:
/// caps its CPU, restarts it when it runs away, and reclaims orphaned
/// browser session folders.
#[derive(Parser, Debug)]
#[command(name = "worker-watchdog", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "watchdog.toml")]
    config: PathBuf,

    /// Process manager app name (overrides config)
    #[arg(long)]
    app: Option<String>,

    /// Polling interval in seconds (overrides config)
    #[arg(long)]
    interval: Option<u64>,

    /// Debug logging (every sample, throttle and skip decision)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the worker until interrupted (default)
    Run,
    /// Reclaim orphaned session folders once and exit
    Cleanup,
    /// Validate config and print resolved settings, don't run
    Check,
    /// Sample the worker once, print the verdict and exit
    Sample,
}

fn init_logging(cli: &Cli) {
    let fallback = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Load the config file and apply CLI overrides.
fn load_config(cli: &Cli) -> Result<WatchdogConfig, config::ConfigError> {
    let mut config = WatchdogConfig::load(&cli.config)?;
    if let Some(app) = &cli.app {
        config.worker.app_name = app.clone();
    }
    if let Some(interval) = cli.interval {
        config.watchdog.interval_secs = interval;
    }
    config.validate()?;
    Ok(config)
}

fn fail(message: &str, error: &dyn std::fmt::Display) -> ! {
    tracing::error!(error = %error, "{message}");
    std::process::exit(1);
}

fn build_throttle(config: &WatchdogConfig) -> Arc<dyn CpuThrottle> {
    if config.throttle.enabled {
        Arc::new(CpuLimit::new(config.throttle.command.clone()))
    } else {
        tracing::info!("cpu cap disabled");
        Arc::new(NoThrottle)
    }
}

fn build_alerts(config: &WatchdogConfig) -> Arc<dyn AlertSink> {
    let sink = HttpAlertSink::new(
        config.alert.endpoint.clone(),
        config.alert.report_endpoint.clone(),
        Duration::from_secs(config.alert.timeout_secs),
    );
    match sink {
        Ok(sink) => Arc::new(sink),
        Err(e) => fail("failed to build alert client", &e),
    }
}

fn build_reclaimer(config: &WatchdogConfig, table: Arc<dyn ProcessTable>) -> OrphanSessionReclaimer {
    OrphanSessionReclaimer::new(
        table,
        config.sessions.lock_file_name.clone(),
        config.sessions.levels_above_lock_dir,
    )
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => fail("invalid configuration", &e),
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Cleanup => cleanup(config).await,
        Command::Check => check(&config),
        Command::Sample => sample(config).await,
    }
}

async fn run(config: WatchdogConfig) {
    let lock = match InstanceLock::acquire(&config.watchdog.lock_file) {
        Ok(lock) => lock,
        Err(e) => fail("cannot start watchdog", &e),
    };
    tracing::debug!(path = %lock.path().display(), "instance lock acquired");
    let signals = match SignalHandler::install() {
        Ok(signals) => signals,
        Err(e) => fail("failed to install signal handlers", &e),
    };
    let kill_pattern = match Regex::new(&config.sessions.kill_pattern) {
        Ok(re) => re,
        Err(e) => fail("invalid sessions.kill_pattern", &e),
    };

    let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
    let manager: Arc<dyn ProcessManager> = Arc::new(Pm2::new(config.worker.process_manager.clone()));
    let reclaimer = Arc::new(build_reclaimer(&config, Arc::clone(&table)));

    let sequencer = Arc::new(RecoverySequencer::new(
        RecoverySettings {
            app_name: config.worker.app_name.clone(),
            kill_pattern,
            sessions_root: config.sessions.root.clone(),
            browser_process_name: config.sessions.browser_process_name.clone(),
            stop_grace: config.watchdog.stop_grace(),
        },
        Arc::clone(&manager),
        Arc::clone(&table),
        reclaimer,
        build_alerts(&config),
    ));

    let evaluator = ThresholdEvaluator::new(Thresholds::from(&config.thresholds), build_throttle(&config));
    let mut watchdog = WatchdogLoop::new(
        config.worker.app_name.clone(),
        manager,
        ProcessMetricsSampler::new(table),
        evaluator,
        sequencer,
        config.watchdog.log_every(),
    );
    if let Some(path) = &config.watchdog.status_file {
        watchdog = watchdog.with_status(StatusTracker::new(path.clone()));
    }

    watchdog.run(config.watchdog.interval(), signals.wait()).await;
    drop(lock);
}

async fn cleanup(config: WatchdogConfig) {
    let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
    let reclaimer = build_reclaimer(&config, table);
    let root = config.sessions.root.clone();
    let filter = config.sessions.browser_process_name.clone();

    let result = tokio::task::spawn_blocking(move || reclaimer.reclaim(&root, &filter)).await;
    let report = match result {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => fail("session cleanup aborted", &e),
        Err(e) => fail("session cleanup task failed", &e),
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => fail("failed to serialize report", &e),
    }

    match build_alerts(&config).send_report(&report).await {
        Ok(AlertDelivery::Delivered) => tracing::info!("cleanup report delivered"),
        Ok(AlertDelivery::Skipped) => tracing::debug!("no report endpoint configured"),
        Err(e) => tracing::warn!(error = %e, "failed to deliver cleanup report"),
    }

    if !report.failed_folders.is_empty() {
        std::process::exit(1);
    }
}

fn check(config: &WatchdogConfig) {
    match toml::to_string_pretty(config) {
        Ok(resolved) => {
            println!("Config OK");
            println!();
            print!("{resolved}");
        }
        Err(e) => fail("failed to render config", &e),
    }
}

async fn sample(config: WatchdogConfig) {
    let manager = Pm2::new(config.worker.process_manager.clone());
    let pid = match manager.pid(&config.worker.app_name).await {
        Ok(Some(pid)) => pid,
        Ok(None) => {
            println!("{} is not running", config.worker.app_name);
            return;
        }
        Err(e) => fail("failed to query process manager", &e),
    };

    let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
    let sampler = ProcessMetricsSampler::new(table);
    // A pid reads 0% CPU until it has been refreshed twice, so prime it twice.
    let spacing = sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(500));
    for _ in 0..2 {
        let _ = sampler.sample(pid);
        tokio::time::sleep(spacing).await;
    }

    let sample = match sampler.sample(pid) {
        Ok(sample) => sample,
        Err(e) => fail("failed to sample worker", &e),
    };
    let verdict = classify(&sample, &Thresholds::from(&config.thresholds));

    let out = serde_json::json!({
        "sample": sample,
        "verdict": verdict,
        "breach": verdict.is_breach(),
    });
    match serde_json::to_string_pretty(&out) {
        Ok(json) => println!("{json}"),
        Err(e) => fail("failed to serialize sample", &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::parse_from(["worker-watchdog"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("watchdog.toml"));
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog.toml");
        std::fs::write(&path, "[worker]\napp_name = \"from-file\"\n").unwrap();

        let cli = Cli::parse_from([
            "worker-watchdog",
            "--config",
            path.to_str().unwrap(),
            "--app",
            "from-cli",
            "--interval",
            "9",
            "check",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.worker.app_name, "from-cli");
        assert_eq!(config.watchdog.interval_secs, 9);
        assert!(matches!(cli.command, Some(Command::Check)));
    }

    #[test]
    fn test_zero_interval_override_is_rejected() {
        let cli = Cli::parse_from(["worker-watchdog", "--config", "/nonexistent.toml", "--interval", "0"]);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["worker-watchdog", "-v", "-q"]).is_err());
    }
}
