use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from watchdog.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct WatchdogConfig {
    pub worker: WorkerConfig,
    pub thresholds: ThresholdConfig,
    pub throttle: ThrottleConfig,
    pub sessions: SessionsConfig,
    pub alert: AlertConfig,
    pub watchdog: LoopConfig,
}

/// The supervised worker as known to the process manager.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub app_name: String,
    pub process_manager: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// CPU percentage above which recovery is triggered.
    pub cpu_percent: f64,
    /// Resident memory (MB) above which recovery is triggered.
    pub ram_mb: u64,
    /// Standing CPU cap applied to the worker on every tick.
    pub cpu_cap_percent: u32,
    /// Fraction of a threshold at which the elevated (pre-warning) state starts.
    pub prewarn_ratio: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub command: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub root: PathBuf,
    pub lock_file_name: String,
    /// Levels to ascend from the lock file's directory to reach the session folder.
    pub levels_above_lock_dir: usize,
    pub browser_process_name: String,
    /// Regex matched against full command lines when killing stray browsers.
    pub kill_pattern: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    pub endpoint: Option<String>,
    pub report_endpoint: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopConfig {
    pub interval_secs: u64,
    pub stop_grace_secs: u64,
    pub log_every_secs: u64,
    pub status_file: Option<PathBuf>,
    pub lock_file: PathBuf,
}

// --- Default implementations ---

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_name: "bpub-prod".to_string(),
            process_manager: "pm2".to_string(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            ram_mb: 450,
            cpu_cap_percent: 50,
            prewarn_ratio: 0.7,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            command: "cpulimit".to_string(),
            enabled: true,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/www/node-apps/boostpub-api/WH_SESSIONS/PROD"),
            lock_file_name: "SingletonLock".to_string(),
            levels_above_lock_dir: 2,
            browser_process_name: "chrome".to_string(),
            kill_pattern: "chrome.*WH_SESSIONS".to_string(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            report_endpoint: None,
            timeout_secs: 10,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            stop_grace_secs: 2,
            log_every_secs: 60,
            status_file: None,
            lock_file: PathBuf::from("/tmp/worker-watchdog.lock"),
        }
    }
}

impl LoopConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn log_every(&self) -> Duration {
        Duration::from_secs(self.log_every_secs)
    }
}

impl WatchdogConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the built-in defaults; a file that exists but
    /// cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })
    }

    /// Check values that serde cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| ConfigError::Invalid { field, reason };

        if self.worker.app_name.trim().is_empty() {
            return Err(invalid("worker.app_name", "must not be empty".into()));
        }
        if !(self.thresholds.cpu_percent > 0.0) {
            return Err(invalid(
                "thresholds.cpu_percent",
                format!("must be positive, got {}", self.thresholds.cpu_percent),
            ));
        }
        if self.thresholds.ram_mb == 0 {
            return Err(invalid("thresholds.ram_mb", "must be positive".into()));
        }
        if !(1..=100).contains(&self.thresholds.cpu_cap_percent) {
            return Err(invalid(
                "thresholds.cpu_cap_percent",
                format!("must be in 1..=100, got {}", self.thresholds.cpu_cap_percent),
            ));
        }
        let ratio = self.thresholds.prewarn_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(invalid(
                "thresholds.prewarn_ratio",
                format!("must be between 0 and 1, got {ratio}"),
            ));
        }
        if self.watchdog.interval_secs == 0 {
            return Err(invalid("watchdog.interval_secs", "must be positive".into()));
        }
        if self.sessions.lock_file_name.is_empty() || self.sessions.lock_file_name.contains('/') {
            return Err(invalid(
                "sessions.lock_file_name",
                "must be a bare file name".into(),
            ));
        }
        if let Err(e) = regex::Regex::new(&self.sessions.kill_pattern) {
            return Err(invalid("sessions.kill_pattern", e.to_string()));
        }
        Ok(())
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment_constants() {
        let cfg = WatchdogConfig::default();
        assert_eq!(cfg.worker.app_name, "bpub-prod");
        assert_eq!(cfg.thresholds.cpu_percent, 80.0);
        assert_eq!(cfg.thresholds.ram_mb, 450);
        assert_eq!(cfg.thresholds.cpu_cap_percent, 50);
        assert_eq!(cfg.sessions.lock_file_name, "SingletonLock");
        assert_eq!(cfg.watchdog.interval(), Duration::from_secs(5));
        assert_eq!(cfg.watchdog.stop_grace(), Duration::from_secs(2));
        assert!(cfg.alert.endpoint.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let cfg = WatchdogConfig::from_toml(
            r#"
[thresholds]
cpu_percent = 90.0

[alert]
endpoint = "https://alerts.example.com/hook"
"#,
        )
        .unwrap();
        assert_eq!(cfg.thresholds.cpu_percent, 90.0);
        assert_eq!(cfg.thresholds.ram_mb, 450);
        assert_eq!(
            cfg.alert.endpoint.as_deref(),
            Some("https://alerts.example.com/hook")
        );
        assert_eq!(cfg.worker.app_name, "bpub-prod");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WatchdogConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.watchdog.interval_secs, 5);
    }

    #[test]
    fn test_load_malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog.toml");
        std::fs::write(&path, "[thresholds\ncpu_percent = ").unwrap();
        let err = WatchdogConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("watchdog.toml"));
    }

    #[test]
    fn test_validate_rejects_cap_out_of_range() {
        let mut cfg = WatchdogConfig::default();
        cfg.thresholds.cpu_cap_percent = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cpu_cap_percent"));
    }

    #[test]
    fn test_validate_rejects_bad_kill_pattern() {
        let mut cfg = WatchdogConfig::default();
        cfg.sessions.kill_pattern = "chrome.*(".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "sessions.kill_pattern",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut cfg = WatchdogConfig::default();
        cfg.watchdog.interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_lock_name_with_separator() {
        let mut cfg = WatchdogConfig::default();
        cfg.sessions.lock_file_name = "Default/SingletonLock".to_string();
        assert!(cfg.validate().is_err());
    }
}
