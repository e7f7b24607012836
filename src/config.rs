//! TOML configuration for the runwarden daemon and CLI.
//!
//! Every section carries `#[serde(default)]` so a partial file only overrides
//! what it names. Lookup order: explicit path, `RUNWARDEN_CONFIG`,
//! `./runwarden.toml`, compiled-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV_VAR: &str = "RUNWARDEN_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "runwarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration. An explicitly requested file must load; the
    /// implicit locations fall back to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{CONFIG_ENV_VAR} set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(DEFAULT_CONFIG_PATH);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub bind: String,
    /// SQLite database file.
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            db_path: "data/runwarden.db".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Poller and execution pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Whether `serve` starts the polling loop at all.
    pub enabled: bool,
    /// Seconds between due-schedule scans. A latency/store-load trade-off.
    pub poll_interval_secs: u64,
    /// Maximum constituent tests executing at once across all runs.
    pub max_concurrency: usize,
    /// Maximum schedules executing at once.
    pub max_active_schedules: usize,
    /// Hard timeout for one run attempt.
    pub run_timeout_secs: u64,
    /// Delay before a retry attempt starts.
    pub retry_backoff_ms: u64,
    /// Upper bound accepted for `execution_options.retries`.
    pub max_retries: u32,
    /// Overdue minutes that raise a schedule's effective priority by one.
    pub aging_minutes_per_level: i64,
    /// A claim or open run whose heartbeat is older than this is treated as
    /// abandoned by a dead process and recovered.
    pub claim_lease_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 30,
            max_concurrency: 4,
            max_active_schedules: 8,
            run_timeout_secs: 1800,
            retry_backoff_ms: 0,
            max_retries: 10,
            aging_minutes_per_level: 10,
            claim_lease_secs: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Healing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Minimum confidence for automatic application in auto-heal mode.
    pub confidence_floor: f64,
    /// Apply the top candidate without human acceptance.
    pub auto_heal: bool,
    /// Candidates returned per analysis.
    pub max_candidates: usize,
    /// Capacity of the out-of-band analysis queue fed by the worker.
    pub queue_capacity: usize,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.7,
            auto_heal: false,
            max_candidates: 5,
            queue_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// External test runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Command template. `{test}`, `{browser}`, `{mode}` and `{environment}`
    /// are substituted per constituent test.
    pub command: String,
    /// Working directory for the child process.
    pub working_dir: Option<PathBuf>,
    /// Suite to test-id expansion. Unlisted suites run as a single test.
    pub suites: Vec<SuiteConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "npx playwright test {test} --project={browser}".to_string(),
            working_dir: None,
            suites: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub id: String,
    pub tests: Vec<String>,
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directories watched for test file changes.
    pub paths: Vec<PathBuf>,
    pub recursive: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from("tests")],
            recursive: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
