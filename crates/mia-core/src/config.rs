use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_SECS: u64 = 60;
pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_OPTIMIZATION_INTERVAL_SECS: u64 = 6 * 3600;
pub const DEFAULT_MIN_INTERACTIONS: usize = 20;
pub const DEFAULT_ISSUE_THRESHOLD: u32 = 5;
pub const DEFAULT_LOG_FILTER: &str = "mia_daemon=info,mia_scheduler=info";

/// Top-level config (mia.toml + MIA_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiaConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub self_optimization: SelfOptimizationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduler loop and executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two ticks of the scheduler loop.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Upper bound for a single action invocation; the action is aborted and
    /// the run recorded as failed once it expires.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    /// Disable a periodic task after this many failures in a row.
    /// Unset means periodic tasks are never disabled automatically.
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
    /// When set, the daemon registers a no-op `heartbeat` task with this interval.
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            action_timeout_secs: DEFAULT_ACTION_TIMEOUT_SECS,
            max_consecutive_failures: None,
            heartbeat_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfOptimizationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_optimization_interval_secs")]
    pub interval_secs: u64,
    /// Training is skipped while fewer interactions than this are available.
    #[serde(default = "default_min_interactions")]
    pub min_interactions: usize,
    /// An issue must be reported more often than this to adjust responses.
    #[serde(default = "default_issue_threshold")]
    pub issue_threshold: u32,
}

impl Default for SelfOptimizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: DEFAULT_OPTIMIZATION_INTERVAL_SECS,
            min_interactions: DEFAULT_MIN_INTERACTIONS,
            issue_threshold: DEFAULT_ISSUE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_action_timeout_secs() -> u64 {
    DEFAULT_ACTION_TIMEOUT_SECS
}
fn default_optimization_interval_secs() -> u64 {
    DEFAULT_OPTIMIZATION_INTERVAL_SECS
}
fn default_min_interactions() -> usize {
    DEFAULT_MIN_INTERACTIONS
}
fn default_issue_threshold() -> u32 {
    DEFAULT_ISSUE_THRESHOLD
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl MiaConfig {
    /// Load config from a TOML file with MIA_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.mia/mia.toml
    ///
    /// A missing file is not an error; every field has a default.
    /// Nested keys use a double underscore: `MIA_SCHEDULER__TICK_SECS=5`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("MIA_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: MiaConfig = figment
            .extract()
            .map_err(|e| crate::error::MiaError::Config(e.to_string()))?;

        if config.scheduler.tick_secs == 0 {
            return Err(crate::error::MiaError::Config(
                "scheduler.tick_secs must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mia/mia.toml", home)
}
