//! Supervisor configuration.
//!
//! Loaded from `~/.stagehand/config.yaml` (or `--config <path>`). Every
//! section is optional; missing keys fall back to the defaults below, which
//! reproduce the behavior of a stock two-renderer pool.
//!
//! ```yaml
//! tool_dir: /opt/tool
//! workers:
//!   parallel: 3
//! restart:
//!   delay: 5s
//!   max_attempts: 10      # omit for unbounded restarts
//!   backoff_factor: 2.0
//! cleanup:
//!   process_names: [chrome, GoogleChromePortable]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, StagehandError};
use crate::logging::home_dir;

/// How worker processes are attached to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Output is piped to the supervisor and classified line by line
    Attached,
    /// Process runs in its own terminal; only pid and exit status are visible
    Detached,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        if cfg!(windows) {
            Self::Detached
        } else {
            Self::Attached
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StagehandConfig {
    /// Directory holding the worker scripts; also the workers' cwd
    pub tool_dir: PathBuf,
    /// Interpreter used to run the scripts; empty runs the script directly
    pub interpreter: String,
    /// Attached (piped output) or detached (own terminal)
    pub execution_mode: ExecutionMode,
    /// Command prepended in detached mode to open a terminal, e.g. `[xterm, -e]`
    pub terminal_prefix: Vec<String>,
    /// Pool shape
    pub workers: WorkersConfig,
    /// Launch targets and arguments
    pub launch: LaunchTargets,
    /// Output classification
    pub health: HealthConfig,
    /// Restart policy
    pub restart: RestartConfig,
    /// Sibling process cleanup
    pub cleanup: CleanupConfig,
    /// Assorted delays
    pub timing: TimingConfig,
    /// Task queue limits
    pub scheduler: SchedulerConfig,
    /// Project discovery
    pub discovery: DiscoveryConfig,
}

impl Default for StagehandConfig {
    fn default() -> Self {
        Self {
            tool_dir: PathBuf::from("."),
            interpreter: default_interpreter(),
            execution_mode: ExecutionMode::default(),
            terminal_prefix: Vec::new(),
            workers: WorkersConfig::default(),
            launch: LaunchTargets::default(),
            health: HealthConfig::default(),
            restart: RestartConfig::default(),
            cleanup: CleanupConfig::default(),
            timing: TimingConfig::default(),
            scheduler: SchedulerConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

fn default_interpreter() -> String {
    if cfg!(windows) {
        "python".to_string()
    } else {
        "python3".to_string()
    }
}

/// Pool shape and admissible scaling range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkersConfig {
    /// Run the sequential document worker
    pub sequential: bool,
    /// Initial number of parallel render workers
    pub parallel: u32,
    /// Lower bound accepted by `scale`
    pub min_parallel: u32,
    /// Upper bound accepted by `scale`
    pub max_parallel: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            sequential: true,
            parallel: 2,
            min_parallel: 1,
            max_parallel: 10,
        }
    }
}

/// Script names and arguments for each worker kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LaunchTargets {
    /// Script for the sequential worker, relative to `tool_dir`
    pub sequential_script: String,
    /// Arguments for the sequential worker (the continuous-run flag)
    pub sequential_args: Vec<String>,
    /// Script for parallel workers; `{ordinal}` is replaced by the slot ordinal
    pub parallel_script: String,
    /// Arguments for parallel workers
    pub parallel_args: Vec<String>,
    /// Extra environment passed to every worker
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchTargets {
    fn default() -> Self {
        Self {
            sequential_script: "run_excel_api.py".to_string(),
            sequential_args: vec!["--loop".to_string()],
            parallel_script: "_run_chrome{ordinal}.py".to_string(),
            parallel_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Error signatures and the recoverable threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive recoverable errors that force a restart
    pub error_threshold: u32,
    /// Case-insensitive regexes for transient failures
    pub recoverable_patterns: Vec<String>,
    /// Case-insensitive regexes for unrecoverable failures (checked first)
    pub fatal_patterns: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            recoverable_patterns: vec![
                r"Chrome attempt \d+/\d+ failed".to_string(),
                r"✗ Chrome error".to_string(),
                r"✗ Không restart được Chrome".to_string(),
                r"The browser connection fails".to_string(),
                r"reCAPTCHA evaluation failed".to_string(),
                r"403.*error".to_string(),
            ],
            fatal_patterns: vec![
                r"Chrome attempt 3/3 failed".to_string(),
                r"✗ Không restart được Chrome".to_string(),
            ],
        }
    }
}

/// Restart sequencing, ceiling and backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RestartConfig {
    /// Pause between cleanup and relaunch
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Automatic restarts allowed in a row; `None` is unbounded
    pub max_attempts: Option<u32>,
    /// Multiplier applied to `delay` per consecutive automatic restart
    pub backoff_factor: f64,
    /// Upper bound for the backed-off delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Kill sibling processes before relaunching a parallel worker
    pub kill_siblings: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(300),
            kill_siblings: true,
        }
    }
}

/// Which sibling cleanup strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStrategy {
    /// Kill every process whose name matches `process_names`
    #[default]
    KillByName,
    /// Do nothing
    None,
}

/// Sibling process cleanup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    /// Strategy
    pub strategy: CleanupStrategy,
    /// Executable names killed system-wide
    pub process_names: Vec<String>,
    /// Timeout for each kill command
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause after a full kill so the OS releases the processes
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        let process_names = if cfg!(windows) {
            vec!["chrome.exe".to_string(), "GoogleChromePortable.exe".to_string()]
        } else {
            vec!["chrome".to_string()]
        };
        Self {
            strategy: CleanupStrategy::KillByName,
            process_names,
            timeout: Duration::from_secs(10),
            settle: Duration::from_secs(2),
        }
    }
}

/// Delays used by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// How long `terminate` waits before a forced kill
    #[serde(with = "humantime_serde")]
    pub grace_timeout: Duration,
    /// Pause between launching consecutive workers in `start_all`
    #[serde(with = "humantime_serde")]
    pub start_stagger: Duration,
    /// Poll interval while waiting for a process to exit after its output closed
    #[serde(with = "humantime_serde")]
    pub exit_poll: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            grace_timeout: Duration::from_secs(5),
            start_stagger: Duration::from_secs(2),
            exit_poll: Duration::from_millis(500),
        }
    }
}

/// Task queue limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Failed attempts after which a task is parked; `None` retries forever
    pub max_task_retries: Option<u32>,
}

/// Project discovery scan loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Directory whose subdirectories are project codes; `None` disables scanning
    pub projects_dir: Option<PathBuf>,
    /// Only pick up codes with this prefix (e.g. `AR47`)
    pub channel: Option<String>,
    /// Interval between scans
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            projects_dir: None,
            channel: None,
            scan_interval: Duration::from_secs(30),
        }
    }
}

/// Default config file path (`~/.stagehand/config.yaml`).
pub fn default_config_path() -> Result<PathBuf> {
    Ok(home_dir()?.join(".stagehand").join("config.yaml"))
}

impl StagehandConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the default path is used
    /// when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(StagehandError::config_not_found(p));
                }
                p.to_path_buf()
            }
            None => {
                let p = default_config_path()?;
                if !p.exists() {
                    debug!(path = %p.display(), "no config file, using defaults");
                    return Ok(Self::default());
                }
                p
            }
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| StagehandError::config_not_found_with_source(&path, e))?;
        Self::from_yaml(&content, &path)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| StagehandError::ConfigInvalid {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        let w = &self.workers;
        if w.min_parallel == 0 {
            return Err(StagehandError::validation("workers.min_parallel must be >= 1"));
        }
        if w.min_parallel > w.max_parallel {
            return Err(StagehandError::validation(format!(
                "workers.min_parallel ({}) exceeds workers.max_parallel ({})",
                w.min_parallel, w.max_parallel
            )));
        }
        if w.parallel < w.min_parallel || w.parallel > w.max_parallel {
            return Err(StagehandError::validation(format!(
                "workers.parallel must be between {} and {}, got {}",
                w.min_parallel, w.max_parallel, w.parallel
            )));
        }
        if self.health.error_threshold == 0 {
            return Err(StagehandError::validation("health.error_threshold must be >= 1"));
        }
        if self.restart.backoff_factor < 1.0 || !self.restart.backoff_factor.is_finite() {
            return Err(StagehandError::validation(format!(
                "restart.backoff_factor must be >= 1.0, got {}",
                self.restart.backoff_factor
            )));
        }
        if self.restart.max_attempts == Some(0) {
            return Err(StagehandError::validation(
                "restart.max_attempts must be >= 1 (omit it for unbounded restarts)",
            ));
        }
        if self.restart.max_delay < self.restart.delay {
            return Err(StagehandError::validation(
                "restart.max_delay must not be shorter than restart.delay",
            ));
        }
        if self.timing.exit_poll.is_zero() {
            return Err(StagehandError::validation("timing.exit_poll must be non-zero"));
        }
        Ok(())
    }
}

/// Serde support for Duration using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
