//! Configuration for conductor.
//!
//! Settings are read from `sessions/conductor.toml` under the project root and
//! layered as file → environment → CLI. The resolved [`Config`] is passed
//! explicitly into every operation; nothing reads the environment after
//! startup.
//!
//! # Configuration File Format
//!
//! ```toml
//! [lock]
//! timeout_ms = 1000
//! poll_interval_ms = 50
//! stale_timeout_ms = 30000
//!
//! [persistence]
//! legacy_mirrors = true
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! dir = "sessions/logs"
//!
//! [memory]
//! enabled = false
//! command = ["memory-bridge", "--ipc"]
//! store_timeout_ms = 2000
//! group_id = "conductor"
//! sanitize_secrets = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Unified coordination document, shared with the session runtime.
pub const STATE_FILENAME: &str = "sessions-state.json";
/// Legacy plan mirror.
pub const PLAN_FILENAME: &str = "execution_plan.json";
/// Legacy session index mirror.
pub const INDEX_FILENAME: &str = "session_index.json";
/// Config file name, looked up in `<project>/sessions/`.
pub const CONFIG_FILENAME: &str = "conductor.toml";

/// Lock tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long to wait for the lock before giving up
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay between acquisition attempts
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Age after which a lock is considered abandoned
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_stale_timeout_ms() -> u64 {
    30_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            stale_timeout_ms: default_stale_timeout_ms(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Also write `execution_plan.json` and `session_index.json`
    #[serde(default = "default_true")]
    pub legacy_mirrors: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            legacy_mirrors: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `CONDUCTOR_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Optional directory for a daily-rolled log file, relative to the project root
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// Episodic memory sink settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Program and arguments receiving the JSON payload on stdin
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "default_true")]
    pub sanitize_secrets: bool,
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: Vec::new(),
            store_timeout_ms: default_store_timeout_ms(),
            group_id: None,
            sanitize_secrets: true,
        }
    }
}

impl MemoryConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// On-disk representation of `conductor.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid conductor.toml")
    }

    /// Load configuration, or return defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Return human-readable warnings for questionable settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.lock.timeout_ms == 0 {
            warnings.push("lock.timeout_ms is 0; acquisition will fail on any contention".into());
        }
        if self.lock.poll_interval_ms == 0 {
            warnings.push("lock.poll_interval_ms is 0; waiting will busy-loop".into());
        }
        if self.lock.poll_interval_ms > self.lock.timeout_ms {
            warnings.push(format!(
                "lock.poll_interval_ms ({}) exceeds lock.timeout_ms ({}); only one retry will happen",
                self.lock.poll_interval_ms, self.lock.timeout_ms
            ));
        }
        if self.lock.stale_timeout_ms <= self.lock.timeout_ms {
            warnings.push(format!(
                "lock.stale_timeout_ms ({}) should be larger than lock.timeout_ms ({})",
                self.lock.stale_timeout_ms, self.lock.timeout_ms
            ));
        }
        if self.memory.enabled && self.memory.command.is_empty() {
            warnings.push("memory.enabled is true but memory.command is empty".into());
        }
        warnings
    }
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub project_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub tasks_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub tasks_dir: PathBuf,
    /// Config file consulted, whether or not it existed
    pub config_file: PathBuf,
    pub lock: LockConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    pub memory: MemoryConfig,
    /// Artificial pause before the save step, for exercising lock contention
    pub save_delay: Option<Duration>,
}

impl Config {
    /// Resolve configuration from the process environment and CLI overrides.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        Self::resolve_with(cli, |key| std::env::var(key).ok())
    }

    /// Resolve configuration using `env` as the environment lookup.
    pub fn resolve_with<F>(cli: &CliOverrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_path = |key: &str| env(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        let project_dir = match cli
            .project_dir
            .clone()
            .or_else(|| env_path("CONDUCTOR_PROJECT_DIR"))
            .or_else(|| env_path("CLAUDE_PROJECT_DIR"))
        {
            Some(dir) => dir,
            None => std::env::current_dir().context("Failed to get current directory")?,
        };
        let project_dir = absolutize(&project_dir)?;

        let config_file = cli
            .config_file
            .clone()
            .unwrap_or_else(|| project_dir.join("sessions").join(CONFIG_FILENAME));
        let toml = ConductorToml::load_or_default(&config_file)?;

        let state_dir = cli
            .state_dir
            .clone()
            .or_else(|| env_path("SESSIONS_STATE_DIR"))
            .unwrap_or_else(|| project_dir.join("sessions").join("state"));
        let tasks_dir = cli
            .tasks_dir
            .clone()
            .or_else(|| env_path("BACKLOG_TASKS_DIR"))
            .unwrap_or_else(|| project_dir.join("backlog").join("tasks"));

        let save_delay = env("CONDUCTOR_TEST_SLEEP_BEFORE_SAVE")
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);

        let mut logging = toml.logging;
        if let Some(level) = env("CONDUCTOR_LOG_LEVEL").filter(|v| !v.trim().is_empty()) {
            logging.level = level;
        }
        if let Some(level) = &cli.log_level {
            logging.level = level.clone();
        }
        if let Some(dir) = logging.dir.take() {
            logging.dir = Some(if dir.is_absolute() {
                dir
            } else {
                project_dir.join(dir)
            });
        }

        Ok(Self {
            state_dir: absolutize(&state_dir)?,
            tasks_dir: absolutize(&tasks_dir)?,
            project_dir,
            config_file,
            lock: toml.lock,
            persistence: toml.persistence,
            logging,
            memory: toml.memory,
            save_delay,
        })
    }

    /// Configuration rooted at `state_dir` and `tasks_dir` with default settings.
    pub fn for_dirs(state_dir: impl Into<PathBuf>, tasks_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let project_dir = state_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| state_dir.clone());
        Self {
            config_file: project_dir.join(CONFIG_FILENAME),
            project_dir,
            state_dir,
            tasks_dir: tasks_dir.into(),
            lock: LockConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
            memory: MemoryConfig::default(),
            save_delay: None,
        }
    }

    /// Path to the unified coordination document.
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILENAME)
    }

    pub fn legacy_plan_path(&self) -> PathBuf {
        self.state_dir.join(PLAN_FILENAME)
    }

    pub fn legacy_index_path(&self) -> PathBuf {
        self.state_dir.join(INDEX_FILENAME)
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("Failed to get current directory")?
            .join(path))
    }
}
