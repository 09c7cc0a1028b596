//! Configuration surface: every recognized option with its default, plus the
//! environment overrides for credentials and enterprise deployments.

use crate::circuit_breaker::BreakerConfig;
use crate::queue::OverflowStrategy;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable carrying the upstream credential token.
pub const ENV_TOKEN: &str = "FORGE_TOKEN";
/// Environment variable overriding the API base URL (enterprise mode).
pub const ENV_BASE_URL: &str = "FORGE_API_URL";
/// Environment variable overriding the per-request timeout, in milliseconds.
pub const ENV_REQUEST_TIMEOUT_MS: &str = "FORGE_API_TIMEOUT_MS";

const DEFAULT_BASE_URL: &str = "https://api.forge.example";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_workers must be > 0")]
    NoWorkers,
    #[error("scaling range invalid: min_workers {min} > max_workers {max}")]
    ScalingRange { min: usize, max: usize },
    #[error("queue capacity must be > 0")]
    EmptyQueue,
    #[error("missing credential token (set {ENV_TOKEN})")]
    MissingToken,
}

/// Dynamic-scaling thresholds and cadence.
#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub cpu_high_percent: f32,
    pub cpu_low_percent: f32,
    pub mem_high_percent: f32,
    pub mem_low_percent: f32,
    pub check_interval: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            cpu_high_percent: 80.0,
            cpu_low_percent: 40.0,
            mem_high_percent: 85.0,
            mem_low_percent: 50.0,
            check_interval: Duration::from_secs(10),
        }
    }
}

/// Task queue sizing and overflow policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub overflow_strategy: OverflowStrategy,
    pub warning_threshold: usize,
    pub enable_persistence: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            overflow_strategy: OverflowStrategy::DropLowest,
            warning_threshold: 80,
            enable_persistence: true,
        }
    }
}

/// Task-level retry behavior (distinct from the request-level retry engine).
#[derive(Debug, Clone)]
pub struct TaskRetryConfig {
    pub max_retries: u32,
    pub enable_dead_letter_queue: bool,
    pub progressive_timeout: bool,
}

impl Default for TaskRetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, enable_dead_letter_queue: true, progressive_timeout: true }
    }
}

/// Preemptive request queuing for the API client.
#[derive(Debug, Clone)]
pub struct RateLimitQueueConfig {
    /// Remaining-budget level at or below which new requests queue.
    pub queue_threshold: u32,
    pub max_queue_size: usize,
    pub max_queue_wait: Duration,
    pub preemptive_wait: bool,
}

impl Default for RateLimitQueueConfig {
    fn default() -> Self {
        Self {
            queue_threshold: 100,
            max_queue_size: 50,
            max_queue_wait: Duration::from_secs(120),
            preemptive_wait: true,
        }
    }
}

/// Connection settings for one upstream forge service.
#[derive(Debug, Clone)]
pub struct ForgeApiConfig {
    pub service: String,
    pub base_url: String,
    pub token: String,
    pub request_timeout: Duration,
    pub queue: RateLimitQueueConfig,
    pub breaker: BreakerConfig,
}

impl ForgeApiConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            service: "forge".into(),
            base_url: DEFAULT_BASE_URL.into(),
            token: token.into(),
            request_timeout: Duration::from_secs(30),
            queue: RateLimitQueueConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }

    /// Build from the environment: `FORGE_TOKEN` (required),
    /// `FORGE_API_URL` and `FORGE_API_TIMEOUT_MS` (optional overrides).
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var(ENV_TOKEN).map_err(|_| ConfigError::MissingToken)?;
        let mut config = Self::new(token);
        if let Ok(base_url) = std::env::var(ENV_BASE_URL) {
            config = config.enterprise(base_url);
        }
        if let Some(ms) =
            std::env::var(ENV_REQUEST_TIMEOUT_MS).ok().and_then(|v| v.parse().ok())
        {
            config.request_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    /// Enterprise mode: same protocol against a different base URL, with
    /// stricter budgets (queueing starts earlier, smaller internal queue).
    pub fn enterprise(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self.queue.queue_threshold = 200;
        self.queue.max_queue_size = 25;
        self
    }
}

/// Top-level pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub work_dir: PathBuf,
    pub enable_dynamic_scaling: bool,
    pub enable_graceful_degradation: bool,
    pub enable_execution_history: bool,
    pub scaling: ScalingConfig,
    pub queue: QueueConfig,
    pub retry: TaskRetryConfig,
    /// Base wall-clock timeout per task, before the complexity multiplier.
    pub task_base_timeout: Duration,
    /// Resident-memory level above which the memory monitor trims logs.
    pub memory_threshold_bytes: u64,
    /// Cap on retained execution history, results, and overflow events.
    pub history_cap: usize,
}

impl PoolConfig {
    pub fn new(max_workers: usize, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_workers,
            work_dir: work_dir.into(),
            enable_dynamic_scaling: false,
            enable_graceful_degradation: false,
            enable_execution_history: false,
            scaling: ScalingConfig { max_workers, ..ScalingConfig::default() },
            queue: QueueConfig::default(),
            retry: TaskRetryConfig::default(),
            task_base_timeout: Duration::from_secs(600),
            memory_threshold_bytes: 1024 * 1024 * 1024,
            history_cap: 500,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.scaling.min_workers > self.scaling.max_workers {
            return Err(ConfigError::ScalingRange {
                min: self.scaling.min_workers,
                max: self.scaling.max_workers,
            });
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::EmptyQueue);
        }
        Ok(())
    }
}
