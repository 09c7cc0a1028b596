#![forbid(unsafe_code)]

//! # autoforge
//!
//! Core of an autonomous code-change executor: units of work (each a
//! code-change request bound to a repository and a branch name) are scored,
//! queued, and scheduled across a bounded pool of sandboxed workers, each of
//! which clones the repository, drives a delegated code-editing child
//! process, and pushes the committed result.
//!
//! Between the pool and the upstream forge sits a resilience layer:
//!
//! - **Circuit breakers** per service (closed → open → half-open) with a
//!   registry the degradation monitor reads.
//! - **Retry** with bounded exponential backoff, full jitter, and
//!   `Retry-After` honoring.
//! - **Rate limiting** driven by `x-ratelimit-*` response headers, with
//!   preemptive queuing before the budget runs dry.
//! - **Dead-letter capture** for tasks whose retries are exhausted.
//!
//! ## Quick start
//!
//! ```no_run
//! use autoforge::{
//!     ChangeRequest, ExecutorConfig, PoolConfig, TaskSubmission, Worker, WorkerConfig,
//!     WorkerPool,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let worker = Worker::new(WorkerConfig {
//!         work_dir: "/var/lib/autoforge".into(),
//!         repo_url: "https://forge.example/acme/widgets.git".into(),
//!         base_branch: "main".into(),
//!         token: std::env::var("FORGE_TOKEN")?,
//!         shallow_clone: true,
//!         executor: ExecutorConfig::default(),
//!     });
//!     let pool = WorkerPool::new(PoolConfig::new(4, "/var/lib/autoforge"), Arc::new(worker))?;
//!
//!     let results = pool
//!         .execute_tasks(vec![TaskSubmission {
//!             request: ChangeRequest {
//!                 number: 17,
//!                 title: "Fix flaky widget test".into(),
//!                 body: String::new(),
//!                 labels: vec!["priority:high".into(), "type:bugfix".into()],
//!             },
//!             branch_name: "autoforge/fix-17".into(),
//!         }])
//!         .await?;
//!
//!     for result in results {
//!         println!("#{} → success={}", result.issue_number, result.success);
//!     }
//!     Ok(())
//! }
//! ```

mod api;
mod backoff;
mod cache;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
mod config;
mod dead_letter;
mod error;
mod executor;
mod metrics;
mod pool;
mod queue;
mod rate_limit;
mod retry;
mod sleeper;
mod task;
mod worker;

// Re-exports
pub use api::transport::{
    ApiRequest, ApiResponse, HttpTransport, Method, Transport, TransportError,
};
pub use api::types::{
    Branch, BranchProtection, CheckRun, CheckRuns, CombinedStatus, Comment, CommitRef,
    Issue, Label, MergeResult, PullRequest, RateBucket, RateLimitInfo, Repo, StatusEntry,
};
pub use api::{ForgeClient, ForgeClientBuilder};
pub use backoff::Backoff;
pub use cache::{CacheType, ResponseCache};
pub use circuit_breaker::{BreakerConfig, BreakerHealth, CircuitBreaker, CircuitState};
pub use circuit_breaker_registry::BreakerRegistry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, ForgeApiConfig, PoolConfig, QueueConfig, RateLimitQueueConfig,
    ScalingConfig, TaskRetryConfig, ENV_BASE_URL, ENV_REQUEST_TIMEOUT_MS, ENV_TOKEN,
};
pub use dead_letter::{DeadLetterEntry, DeadLetterStats, DeadLetterStore};
pub use error::{ErrorKind, ForgeError, WorkerError, WorkerPhase};
pub use executor::{
    run_executor, sanitize_tool_input, ExecutorConfig, ExecutorEvent, ExecutorOutcome,
};
pub use metrics::{ApiMetrics, ApiMetricsSnapshot, PoolMetrics, PoolMetricsSnapshot};
pub use pool::{
    DegradationStatus, Disposition, HistoryRecord, PoolError, PoolStatus, TaskErrorInfo,
    TaskResult, TaskSubmission, WorkerPool,
};
pub use queue::{
    load_persisted, persist_queue, EnqueueOutcome, OverflowEvent, OverflowStrategy,
    TaskQueue,
};
pub use rate_limit::{RateLimitTracker, ResourceBudget, DEFAULT_RESOURCE};
pub use retry::{RetryPolicy, RetryPolicyBuilder, RetryableError, RETRY_AFTER_CAP};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use task::{
    AttemptRecord, Category, ChangeRequest, Complexity, Priority, Task, TaskMetadata,
    WorkerRetryState,
};
pub use worker::{TaskRunner, TaskSuccess, Worker, WorkerConfig, WorkspaceGuard};
