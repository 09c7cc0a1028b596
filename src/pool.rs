//! Worker pool / scheduler.
//!
//! The pool owns the queue and the active-worker set on a single control
//! loop. Workers run on their own tokio tasks and report through one
//! completion channel; the monitors (scaling, degradation, memory) send
//! their observations into the same channel. One receive per event; the
//! control loop never polls and never races N futures.

use crate::circuit_breaker::CircuitState;
use crate::circuit_breaker_registry::BreakerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::{PoolConfig, ScalingConfig};
use crate::dead_letter::DeadLetterStore;
use crate::error::WorkerError;
use crate::metrics::{PoolMetrics, PoolMetricsSnapshot};
use crate::queue::{self, EnqueueOutcome, TaskQueue};
use crate::task::{ChangeRequest, Task, WorkerRetryState};
use crate::worker::{TaskRunner, TaskSuccess};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

/// Consecutive task failures that flip the pool into degraded mode.
const DEGRADATION_FAILURE_THRESHOLD: u32 = 5;
/// Queue utilization above which a degraded pool refuses new work.
const DEGRADED_ADMISSION_LIMIT: f64 = 0.9;
/// Cadence of the degradation monitor.
const DEGRADATION_INTERVAL: Duration = Duration::from_secs(5);
/// Cadence of the memory monitor.
const MEMORY_INTERVAL: Duration = Duration::from_secs(30);
/// Minimum spacing between memory cleanups.
const CLEANUP_SPACING: Duration = Duration::from_secs(10);

/// A code-change request bound to a branch, as handed to the pool.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub request: ChangeRequest,
    pub branch_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskErrorInfo {
    pub code: String,
    pub message: String,
}

/// Terminal outcome of one task, as reported to the submitter.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub issue_number: u64,
    pub branch_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub no_changes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorInfo>,
    pub duration_ms: u64,
    /// Never ran: refused at admission or unprocessed at shutdown.
    pub dropped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Completed,
    Failed,
    Dropped,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub task_id: String,
    pub issue_number: u64,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub at_ms: u64,
}

/// Pool-wide view of upstream health, refreshed by the degradation monitor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DegradationStatus {
    pub is_degraded: bool,
    pub affected_services: Vec<String>,
    pub breakers: Vec<crate::circuit_breaker::BreakerHealth>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub metrics: PoolMetricsSnapshot,
    pub degradation: DegradationStatus,
    pub error_counts: HashMap<String, u64>,
    pub recovery_actions: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is shutting down")]
    ShuttingDown,
    #[error("a batch is already executing")]
    AlreadyRunning,
}

struct CompletionEvent {
    task: Task,
    state: WorkerRetryState,
    worker_id: u32,
    outcome: Result<TaskSuccess, WorkerError>,
    duration: Duration,
}

enum PoolEvent {
    Completed(CompletionEvent),
    SetWorkerLimit(usize),
    Degradation(DegradationStatus),
    Memory { rss_bytes: u64 },
}

pub struct WorkerPool {
    config: PoolConfig,
    runner: Arc<dyn TaskRunner>,
    registry: BreakerRegistry,
    dead_letter: Option<Arc<DeadLetterStore>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<PoolMetrics>,
    degradation: Mutex<DegradationStatus>,
    history: Mutex<Vec<HistoryRecord>>,
    recent_results: Mutex<Vec<TaskResult>>,
    error_counts: Mutex<HashMap<String, u64>>,
    consecutive_failures: Arc<AtomicU32>,
    shutdown_tx: watch::Sender<Option<Duration>>,
    batch_running: AtomicBool,
    drained: Notify,
    last_cleanup_ms: AtomicU64,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.config.max_workers)
            .field("work_dir", &self.config.work_dir)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dead_letter = config
            .retry
            .enable_dead_letter_queue
            .then(|| Arc::new(DeadLetterStore::new(&config.work_dir)));
        let metrics = Arc::new(PoolMetrics::new(clock.now_millis(), config.max_workers));
        let (shutdown_tx, _) = watch::channel(None);
        Ok(Self {
            config,
            runner,
            registry: BreakerRegistry::new(),
            dead_letter,
            clock,
            metrics,
            degradation: Mutex::new(DegradationStatus::default()),
            history: Mutex::new(Vec::new()),
            recent_results: Mutex::new(Vec::new()),
            error_counts: Mutex::new(HashMap::new()),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            shutdown_tx,
            batch_running: AtomicBool::new(false),
            drained: Notify::new(),
            last_cleanup_ms: AtomicU64::new(0),
        })
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Share a breaker registry with the API clients so the degradation
    /// monitor sees their circuits.
    pub fn with_registry(mut self, registry: BreakerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn dead_letter(&self) -> Option<Arc<DeadLetterStore>> {
        self.dead_letter.clone()
    }

    pub fn metrics_snapshot(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot(self.clock.now_millis())
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn recent_results(&self) -> Vec<TaskResult> {
        self.recent_results.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn status(&self) -> PoolStatus {
        let degradation =
            self.degradation.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let error_counts =
            self.error_counts.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let recovery_actions = recovery_actions(&degradation, &error_counts);
        PoolStatus {
            metrics: self.metrics.snapshot(self.clock.now_millis()),
            degradation,
            error_counts,
            recovery_actions,
        }
    }

    /// Whether a new submission would currently be admitted.
    ///
    /// Degraded mode does not halt intake, it only tightens it: admission
    /// continues while queue utilization stays under 90%.
    pub fn can_accept_tasks(&self) -> bool {
        if self.shutdown_tx.borrow().is_some() {
            return false;
        }
        let degraded =
            self.degradation.lock().unwrap_or_else(|p| p.into_inner()).is_degraded;
        if !degraded {
            return true;
        }
        let snapshot = self.metrics.snapshot(self.clock.now_millis());
        (snapshot.queued_tasks as f64 / self.config.queue.max_queue_size.max(1) as f64)
            < DEGRADED_ADMISSION_LIMIT
    }

    /// Signal shutdown and block until the running batch drains or `timeout`
    /// passes. New submissions are refused from this point on.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "pool shutting down");
        let notified = self.drained.notified();
        let _ = self.shutdown_tx.send(Some(timeout));
        if self.batch_running.load(Ordering::SeqCst) {
            let _ = tokio::time::timeout(timeout + Duration::from_secs(1), notified).await;
        }
    }

    /// Run a batch of submissions to completion (or shutdown).
    ///
    /// Tasks persisted by a previous graceful shutdown load first and, at
    /// equal score, run ahead of this batch's submissions.
    pub async fn execute_tasks(
        &self,
        submissions: Vec<TaskSubmission>,
    ) -> Result<Vec<TaskResult>, PoolError> {
        if self.shutdown_tx.borrow().is_some() {
            return Err(PoolError::ShuttingDown);
        }
        if self.batch_running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        let results = self.run_batch(submissions).await;
        self.batch_running.store(false, Ordering::SeqCst);
        self.drained.notify_waiters();
        results
    }

    async fn run_batch(
        &self,
        submissions: Vec<TaskSubmission>,
    ) -> Result<Vec<TaskResult>, PoolError> {
        let mut results: Vec<TaskResult> = Vec::new();
        let mut task_queue = TaskQueue::new(self.config.queue.clone());

        if self.config.queue.enable_persistence {
            match queue::load_persisted(&self.config.work_dir).await {
                Ok(tasks) => {
                    for task in tasks {
                        self.admit(&mut task_queue, task, &mut results);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load persisted queue");
                }
            }
        }

        for submission in submissions {
            let task = Task::enrich(
                submission.request,
                submission.branch_name,
                self.config.retry.max_retries,
                self.clock.now_millis(),
            );
            self.admit(&mut task_queue, task, &mut results);
        }

        // Zero tasks: return immediately, no worker started.
        if task_queue.is_empty() {
            return Ok(results);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<PoolEvent>();
        let monitors = self.spawn_monitors(tx.clone());

        let mut active: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut states: HashMap<String, WorkerRetryState> = HashMap::new();
        let mut preferred_group: Option<String> = None;
        let mut next_worker_id: u32 = 0;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !(task_queue.is_empty() && active.is_empty()) {
            if shutdown_rx.borrow().is_some() {
                break;
            }

            while active.len() < self.metrics.worker_limit() {
                let Some(task) = task_queue.pop_next(preferred_group.as_deref()) else {
                    break;
                };
                preferred_group = None;
                next_worker_id += 1;
                self.start_worker(task, &mut states, next_worker_id, &tx, &mut active);
            }
            preferred_group = None;
            self.metrics.set_active(active.len());
            self.metrics.set_queued(task_queue.len());

            if task_queue.is_empty() && active.is_empty() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(
                        event,
                        &mut task_queue,
                        &mut states,
                        &mut active,
                        &mut results,
                        &mut preferred_group,
                        &shutdown_rx,
                    )
                    .await;
                }
            }
        }

        let shutdown_timeout = *shutdown_rx.borrow();
        if let Some(timeout) = shutdown_timeout {
            self.drain_on_shutdown(timeout, &mut task_queue, &mut active, &mut rx, &mut results)
                .await;
        }

        for monitor in monitors {
            monitor.abort();
        }
        self.metrics.set_active(0);
        self.metrics.set_queued(0);
        self.remember_results(&results);
        Ok(results)
    }

    fn admit(
        &self,
        task_queue: &mut TaskQueue,
        task: Task,
        results: &mut Vec<TaskResult>,
    ) {
        let now = self.clock.now_millis();
        if !task_queue.can_accept() {
            tracing::warn!(task_id = %task.id, "queue paused, refusing task");
            results.push(dropped_result(&task, "queue-paused"));
            self.record_history(&task, Disposition::Dropped, Some("queue-paused"));
            return;
        }
        match task_queue.push(task, now) {
            EnqueueOutcome::Enqueued => {}
            EnqueueOutcome::EnqueuedEvicting(evicted) => {
                results.push(dropped_result(&evicted, "queue-overflow"));
                self.record_history(&evicted, Disposition::Dropped, Some("queue-overflow"));
            }
            EnqueueOutcome::Rejected(rejected) => {
                results.push(dropped_result(&rejected, "queue-overflow"));
                self.record_history(&rejected, Disposition::Dropped, Some("queue-overflow"));
            }
        }
    }

    fn start_worker(
        &self,
        task: Task,
        states: &mut HashMap<String, WorkerRetryState>,
        worker_id: u32,
        tx: &mpsc::UnboundedSender<PoolEvent>,
        active: &mut HashMap<String, JoinHandle<()>>,
    ) {
        let state = states.remove(&task.id).unwrap_or_else(|| {
            WorkerRetryState::new(&task, self.config.task_base_timeout, self.clock.now_millis())
        });
        let task_id = task.id.clone();
        let runner = self.runner.clone();
        let tx = tx.clone();

        tracing::debug!(
            worker_id,
            task_id = %task_id,
            score = task.priority_score,
            retry = task.retry_count,
            "dispatching task"
        );

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = runner.run(&task, &state, worker_id).await;
            let duration = started.elapsed();
            let _ = tx.send(PoolEvent::Completed(CompletionEvent {
                task,
                state,
                worker_id,
                outcome,
                duration,
            }));
        });
        active.insert(task_id, handle);
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_event(
        &self,
        event: PoolEvent,
        task_queue: &mut TaskQueue,
        states: &mut HashMap<String, WorkerRetryState>,
        active: &mut HashMap<String, JoinHandle<()>>,
        results: &mut Vec<TaskResult>,
        preferred_group: &mut Option<String>,
        shutdown_rx: &watch::Receiver<Option<Duration>>,
    ) {
        match event {
            PoolEvent::Completed(completion) => {
                active.remove(&completion.task.id);
                *preferred_group = completion.task.group_id.clone();
                self.handle_completion(completion, task_queue, states, results, shutdown_rx)
                    .await;
            }
            PoolEvent::SetWorkerLimit(limit) => {
                if limit != self.metrics.worker_limit() {
                    tracing::info!(
                        from = self.metrics.worker_limit(),
                        to = limit,
                        "worker limit rescaled"
                    );
                    self.metrics.set_worker_limit(limit);
                }
            }
            PoolEvent::Degradation(status) => {
                *self.degradation.lock().unwrap_or_else(|p| p.into_inner()) = status;
            }
            PoolEvent::Memory { rss_bytes } => {
                self.metrics.observe_memory(rss_bytes);
                if rss_bytes > self.config.memory_threshold_bytes {
                    self.maybe_cleanup(task_queue);
                }
            }
        }
    }

    async fn handle_completion(
        &self,
        completion: CompletionEvent,
        task_queue: &mut TaskQueue,
        states: &mut HashMap<String, WorkerRetryState>,
        results: &mut Vec<TaskResult>,
        shutdown_rx: &watch::Receiver<Option<Duration>>,
    ) {
        let CompletionEvent { mut task, mut state, worker_id, outcome, duration } = completion;
        let now = self.clock.now_millis();

        match outcome {
            Ok(success) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.metrics.record_completion(true, duration);
                tracing::info!(
                    worker_id,
                    task_id = %task.id,
                    commit = success.commit_sha.as_deref().unwrap_or("<none>"),
                    no_changes = success.no_changes,
                    duration_ms = duration.as_millis() as u64,
                    "task completed"
                );
                self.record_history(&task, Disposition::Completed, None);
                results.push(TaskResult {
                    task_id: task.id.clone(),
                    issue_number: task.request.number,
                    branch_name: task.branch_name.clone(),
                    success: true,
                    commit_sha: success.commit_sha,
                    no_changes: success.no_changes,
                    error: None,
                    duration_ms: duration.as_millis() as u64,
                    dropped: false,
                });
            }
            Err(error) => {
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                let code = error.code();
                self.count_error(&code);
                state.record_attempt(&code, duration, now);

                let shutting_down = shutdown_rx.borrow().is_some();
                if error.is_retryable() && task.retries_remaining() && !shutting_down {
                    task.retry_count += 1;
                    if self.config.retry.progressive_timeout {
                        let scaled_base = self
                            .config
                            .task_base_timeout
                            .mul_f64(task.metadata.complexity.timeout_multiplier());
                        state.grow_timeout(scaled_base);
                    }
                    tracing::warn!(
                        task_id = %task.id,
                        retry = task.retry_count,
                        of = task.max_retries,
                        error = %error,
                        "task failed, requeueing"
                    );
                    states.insert(task.id.clone(), state);
                    let task_id = task.id.clone();
                    match task_queue.push(task, now) {
                        EnqueueOutcome::Enqueued => return,
                        EnqueueOutcome::EnqueuedEvicting(evicted) => {
                            results.push(dropped_result(&evicted, "queue-overflow"));
                            self.record_history(
                                &evicted,
                                Disposition::Dropped,
                                Some("queue-overflow"),
                            );
                            return;
                        }
                        EnqueueOutcome::Rejected(rejected) => {
                            // Requeue refused: finalize as failed below.
                            state = states.remove(&task_id).unwrap_or_else(|| {
                                WorkerRetryState::new(
                                    &rejected,
                                    self.config.task_base_timeout,
                                    now,
                                )
                            });
                            task = rejected;
                        }
                    }
                }

                self.metrics.record_completion(false, duration);
                tracing::error!(
                    worker_id,
                    task_id = %task.id,
                    error = %error,
                    "task failed terminally"
                );
                self.record_history(&task, Disposition::Failed, Some(&code));
                if error.is_retryable() && !task.retries_remaining() {
                    if let Some(dead_letter) = &self.dead_letter {
                        if let Err(e) = dead_letter
                            .capture(&task, &code, &error.to_string(), &state.attempts)
                            .await
                        {
                            tracing::error!(error = %e, "dead-letter capture failed");
                        }
                    }
                }
                results.push(TaskResult {
                    task_id: task.id.clone(),
                    issue_number: task.request.number,
                    branch_name: task.branch_name.clone(),
                    success: false,
                    commit_sha: None,
                    no_changes: false,
                    error: Some(TaskErrorInfo { code, message: error.to_string() }),
                    duration_ms: duration.as_millis() as u64,
                    dropped: false,
                });
            }
        }
    }

    async fn drain_on_shutdown(
        &self,
        timeout: Duration,
        task_queue: &mut TaskQueue,
        active: &mut HashMap<String, JoinHandle<()>>,
        rx: &mut mpsc::UnboundedReceiver<PoolEvent>,
        results: &mut Vec<TaskResult>,
    ) {
        let deadline = Instant::now() + timeout;
        while !active.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(PoolEvent::Completed(completion))) => {
                    active.remove(&completion.task.id);
                    // No requeues during shutdown; terminal either way.
                    let mut scratch_states = HashMap::new();
                    self.handle_completion(
                        completion,
                        task_queue,
                        &mut scratch_states,
                        results,
                        &self.shutdown_tx.subscribe(),
                    )
                    .await;
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        if !active.is_empty() {
            tracing::warn!(
                abandoned = active.len(),
                "shutdown timeout reached with workers still running"
            );
        }

        let remaining = task_queue.drain_all();
        if !remaining.is_empty() {
            if self.config.queue.enable_persistence {
                if let Err(e) = queue::persist_queue(
                    &self.config.work_dir,
                    &remaining,
                    self.clock.now_millis(),
                )
                .await
                {
                    tracing::error!(error = %e, "failed to persist queue at shutdown");
                }
            }
            for task in remaining {
                self.record_history(&task, Disposition::Dropped, Some("shutdown"));
                results.push(dropped_result(&task, "shutdown"));
            }
        }
    }

    fn spawn_monitors(&self, tx: mpsc::UnboundedSender<PoolEvent>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.enable_dynamic_scaling {
            let scaling = self.config.scaling.clone();
            let stop = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(scaling_monitor(scaling, tx.clone(), stop)));
        }

        if self.config.enable_graceful_degradation {
            let registry = self.registry.clone();
            let failures = self.consecutive_failures.clone();
            let clock = self.clock.clone();
            let stop = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(degradation_monitor(
                registry,
                failures,
                clock,
                tx.clone(),
                stop,
            )));
        }

        let stop = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(memory_monitor(tx, stop)));
        handles
    }

    fn maybe_cleanup(&self, task_queue: &mut TaskQueue) {
        let now = self.clock.now_millis();
        let last = self.last_cleanup_ms.load(Ordering::SeqCst);
        if now.saturating_sub(last) < CLEANUP_SPACING.as_millis() as u64 {
            return;
        }
        self.last_cleanup_ms.store(now, Ordering::SeqCst);

        let cap = self.config.history_cap;
        task_queue.trim_overflow_events(cap);
        trim_to_cap(&mut self.history.lock().unwrap_or_else(|p| p.into_inner()), cap);
        trim_to_cap(
            &mut self.recent_results.lock().unwrap_or_else(|p| p.into_inner()),
            cap,
        );
        tracing::info!(cap, "memory pressure: trimmed retained logs");
    }

    fn record_history(&self, task: &Task, disposition: Disposition, code: Option<&str>) {
        if !self.config.enable_execution_history {
            return;
        }
        self.history.lock().unwrap_or_else(|p| p.into_inner()).push(HistoryRecord {
            task_id: task.id.clone(),
            issue_number: task.request.number,
            disposition,
            error_code: code.map(str::to_string),
            at_ms: self.clock.now_millis(),
        });
    }

    fn remember_results(&self, results: &[TaskResult]) {
        let mut recent = self.recent_results.lock().unwrap_or_else(|p| p.into_inner());
        recent.extend(results.iter().cloned());
        let cap = self.config.history_cap;
        trim_to_cap(&mut recent, cap);
    }

    fn count_error(&self, code: &str) {
        *self
            .error_counts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(code.to_string())
            .or_insert(0) += 1;
    }
}

fn trim_to_cap<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(0..excess);
    }
}

fn dropped_result(task: &Task, code: &str) -> TaskResult {
    TaskResult {
        task_id: task.id.clone(),
        issue_number: task.request.number,
        branch_name: task.branch_name.clone(),
        success: false,
        commit_sha: None,
        no_changes: false,
        error: Some(TaskErrorInfo {
            code: code.to_string(),
            message: match code {
                "queue-overflow" => "refused or evicted by the queue overflow policy".into(),
                "queue-paused" => "queue is paused at capacity".into(),
                _ => "unprocessed at shutdown".into(),
            },
        }),
        duration_ms: 0,
        dropped: true,
    }
}

/// Target worker count from CPU/memory pressure: floor under load, core
/// count when idle, linear interpolation on the tighter factor in between.
fn compute_worker_limit(
    cpu_percent: f32,
    mem_percent: f32,
    scaling: &ScalingConfig,
    cores: usize,
) -> usize {
    let floor = scaling.min_workers;
    let ceiling = scaling.max_workers.min(cores.max(1));

    if cpu_percent >= scaling.cpu_high_percent || mem_percent >= scaling.mem_high_percent {
        return floor;
    }
    if cpu_percent <= scaling.cpu_low_percent && mem_percent <= scaling.mem_low_percent {
        return ceiling.max(floor);
    }

    let cpu_pressure = (cpu_percent - scaling.cpu_low_percent)
        / (scaling.cpu_high_percent - scaling.cpu_low_percent).max(f32::EPSILON);
    let mem_pressure = (mem_percent - scaling.mem_low_percent)
        / (scaling.mem_high_percent - scaling.mem_low_percent).max(f32::EPSILON);
    let pressure = cpu_pressure.max(mem_pressure).clamp(0.0, 1.0);

    let span = ceiling.saturating_sub(floor) as f32;
    let target = ceiling as f32 - pressure * span;
    (target.round() as usize).clamp(floor, scaling.max_workers)
}

async fn scaling_monitor(
    scaling: ScalingConfig,
    tx: mpsc::UnboundedSender<PoolEvent>,
    mut stop: watch::Receiver<Option<Duration>>,
) {
    use sysinfo::System;

    let cores = num_cpus::get();
    let mut sys = System::new();
    let mut ticker = tokio::time::interval(scaling.check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                let cpu = sys.global_cpu_usage();
                let total = sys.total_memory().max(1);
                let mem = sys.used_memory() as f32 * 100.0 / total as f32;
                let target = compute_worker_limit(cpu, mem, &scaling, cores);
                tracing::debug!(cpu, mem, target, "scaling sample");
                if tx.send(PoolEvent::SetWorkerLimit(target)).is_err() {
                    break;
                }
            }
            _ = stop.changed() => break,
        }
    }
}

async fn degradation_monitor(
    registry: BreakerRegistry,
    consecutive_failures: Arc<AtomicU32>,
    clock: Arc<dyn Clock>,
    tx: mpsc::UnboundedSender<PoolEvent>,
    mut stop: watch::Receiver<Option<Duration>>,
) {
    let mut ticker = tokio::time::interval(DEGRADATION_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut previous = DegradationStatus::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let failures = consecutive_failures.load(Ordering::SeqCst);
                let status = evaluate_degradation(
                    &registry,
                    failures,
                    &previous,
                    clock.now_millis(),
                );
                if status.is_degraded != previous.is_degraded {
                    if status.is_degraded {
                        tracing::warn!(
                            services = ?status.affected_services,
                            consecutive_failures = failures,
                            "entering degraded mode"
                        );
                    } else {
                        tracing::info!("leaving degraded mode");
                    }
                }
                previous = status.clone();
                if tx.send(PoolEvent::Degradation(status)).is_err() {
                    break;
                }
            }
            _ = stop.changed() => break,
        }
    }
}

fn evaluate_degradation(
    registry: &BreakerRegistry,
    consecutive_failures: u32,
    previous: &DegradationStatus,
    now_ms: u64,
) -> DegradationStatus {
    let breakers = registry.snapshot();
    let affected_services: Vec<String> = breakers
        .iter()
        .filter(|b| b.state == CircuitState::Open)
        .map(|b| b.service.clone())
        .collect();
    let is_degraded = !affected_services.is_empty()
        || consecutive_failures >= DEGRADATION_FAILURE_THRESHOLD;
    let started_at_ms = if is_degraded {
        previous.started_at_ms.or(Some(now_ms))
    } else {
        None
    };
    DegradationStatus {
        is_degraded,
        affected_services,
        breakers,
        consecutive_failures,
        started_at_ms,
    }
}

async fn memory_monitor(
    tx: mpsc::UnboundedSender<PoolEvent>,
    mut stop: watch::Receiver<Option<Duration>>,
) {
    use sysinfo::{get_current_pid, ProcessesToUpdate, System};

    let mut sys = System::new();
    let pid = get_current_pid().ok();
    let mut ticker = tokio::time::interval(MEMORY_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(pid) = pid else { continue };
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                let Some(process) = sys.process(pid) else { continue };
                if tx.send(PoolEvent::Memory { rss_bytes: process.memory() }).is_err() {
                    break;
                }
            }
            _ = stop.changed() => break,
        }
    }
}

fn recovery_actions(
    degradation: &DegradationStatus,
    error_counts: &HashMap<String, u64>,
) -> Vec<String> {
    let mut actions = Vec::new();
    for service in &degradation.affected_services {
        actions.push(format!(
            "wait for the {service} circuit to close and verify upstream status"
        ));
    }
    if degradation.consecutive_failures >= DEGRADATION_FAILURE_THRESHOLD {
        actions.push("inspect recent task errors before submitting more work".to_string());
    }
    if error_counts.get("rate-limited").copied().unwrap_or(0) > 0 {
        actions.push("reduce submission rate until the rate-limit budget resets".to_string());
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::error::{ErrorKind, ForgeError, WorkerPhase};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Stub runner: scripted outcomes, records execution order.
    #[derive(Debug, Default)]
    struct StubRunner {
        order: StdMutex<Vec<u64>>,
        fail_numbers: Vec<u64>,
        delay: Option<Duration>,
    }

    impl StubRunner {
        fn order(&self) -> Vec<u64> {
            self.order.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for StubRunner {
        async fn run(
            &self,
            task: &Task,
            state: &WorkerRetryState,
            _worker_id: u32,
        ) -> Result<TaskSuccess, WorkerError> {
            self.order.lock().unwrap().push(task.request.number);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_numbers.contains(&task.request.number) {
                Err(WorkerError::new(
                    WorkerPhase::Execute,
                    state.branch_name.as_str(),
                    "/tmp/ws",
                    Duration::from_millis(1),
                    ForgeError::new(ErrorKind::Server, "upstream exploded"),
                ))
            } else {
                Ok(TaskSuccess {
                    commit_sha: Some(format!("sha-{}", task.request.number)),
                    duration: Duration::from_millis(1),
                    no_changes: false,
                })
            }
        }
    }

    fn submission(number: u64, labels: &[&str]) -> TaskSubmission {
        TaskSubmission {
            request: ChangeRequest {
                number,
                title: format!("task {number}"),
                body: String::new(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
            },
            branch_name: format!("autoforge/task-{number}"),
        }
    }

    fn pool_config(dir: &std::path::Path, max_workers: usize) -> PoolConfig {
        let mut config = PoolConfig::new(max_workers, dir);
        config.retry.enable_dead_letter_queue = false;
        config
    }

    #[tokio::test]
    async fn zero_tasks_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::default());
        let pool = WorkerPool::new(pool_config(dir.path(), 2), runner.clone()).unwrap();

        let results = pool.execute_tasks(vec![]).await.unwrap();
        assert!(results.is_empty());
        assert!(runner.order().is_empty());
    }

    #[tokio::test]
    async fn single_worker_runs_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::default());
        let pool = WorkerPool::new(pool_config(dir.path(), 1), runner.clone()).unwrap();

        let results = pool
            .execute_tasks(vec![
                submission(1, &["priority:low"]),
                submission(2, &["priority:high"]),
                submission(3, &["priority:critical"]),
            ])
            .await
            .unwrap();

        assert_eq!(runner.order(), vec![3, 2, 1]);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn category_boost_outranks_priority_tier() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::default());
        let pool = WorkerPool::new(pool_config(dir.path(), 1), runner.clone()).unwrap();

        pool.execute_tasks(vec![
            submission(1, &["priority:high", "type:docs"]),       // 65
            submission(2, &["priority:medium", "type:security"]), // 80
        ])
        .await
        .unwrap();

        assert_eq!(runner.order(), vec![2, 1]);
    }

    #[tokio::test]
    async fn failed_tasks_are_retried_then_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner =
            Arc::new(StubRunner { fail_numbers: vec![7], ..StubRunner::default() });
        let mut config = pool_config(dir.path(), 1);
        config.retry.max_retries = 2;
        let pool = WorkerPool::new(config, runner.clone()).unwrap();

        let results = pool.execute_tasks(vec![submission(7, &[])]).await.unwrap();

        // 1 initial + 2 retries.
        assert_eq!(runner.order(), vec![7, 7, 7]);
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_ref().unwrap().code, "server-error");
    }

    #[tokio::test]
    async fn exhausted_retries_reach_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let runner =
            Arc::new(StubRunner { fail_numbers: vec![9], ..StubRunner::default() });
        let mut config = PoolConfig::new(1, dir.path());
        config.retry.max_retries = 1;
        let pool = WorkerPool::new(config, runner.clone()).unwrap();

        pool.execute_tasks(vec![submission(9, &[])]).await.unwrap();

        let store = pool.dead_letter().unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        let entries = store.entries().await.unwrap();
        assert_eq!(entries[0].task.request.number, 9);
        assert_eq!(entries[0].attempts.len(), 2);
    }

    #[tokio::test]
    async fn overflow_reject_reports_dropped_task() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::default());
        let mut config = pool_config(dir.path(), 1);
        config.queue.max_queue_size = 2;
        config.queue.overflow_strategy = crate::queue::OverflowStrategy::Reject;
        let pool = WorkerPool::new(config, runner.clone()).unwrap();

        let results = pool
            .execute_tasks(vec![
                submission(1, &[]),
                submission(2, &[]),
                submission(3, &[]),
            ])
            .await
            .unwrap();

        let dropped: Vec<_> = results.iter().filter(|r| r.dropped).collect();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].issue_number, 3);
        assert_eq!(runner.order().len(), 2);
    }

    #[tokio::test]
    async fn consecutive_failures_reset_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner =
            Arc::new(StubRunner { fail_numbers: vec![1], ..StubRunner::default() });
        let mut config = pool_config(dir.path(), 1);
        config.retry.max_retries = 0;
        let pool = WorkerPool::new(config, runner.clone()).unwrap();

        pool.execute_tasks(vec![
            submission(1, &["priority:high"]),
            submission(2, &["priority:low"]),
        ])
        .await
        .unwrap();

        assert_eq!(pool.consecutive_failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_limit_floor_under_load() {
        let scaling = ScalingConfig { max_workers: 8, ..ScalingConfig::default() };
        assert_eq!(compute_worker_limit(90.0, 20.0, &scaling, 8), 1);
        assert_eq!(compute_worker_limit(20.0, 90.0, &scaling, 8), 1);
    }

    #[test]
    fn worker_limit_ceiling_when_idle() {
        let scaling = ScalingConfig { max_workers: 8, ..ScalingConfig::default() };
        assert_eq!(compute_worker_limit(10.0, 20.0, &scaling, 4), 4);
        assert_eq!(compute_worker_limit(10.0, 20.0, &scaling, 16), 8);
    }

    #[test]
    fn worker_limit_interpolates_on_tighter_factor() {
        let scaling =
            ScalingConfig { min_workers: 2, max_workers: 10, ..ScalingConfig::default() };
        // CPU halfway between low (40) and high (80); memory idle.
        let mid = compute_worker_limit(60.0, 20.0, &scaling, 10);
        assert_eq!(mid, 6);
        // Memory is tighter than CPU here.
        let tight = compute_worker_limit(45.0, 80.0, &scaling, 10);
        assert!(tight < mid);
    }

    #[test]
    fn worker_limit_clamps_to_range() {
        let scaling =
            ScalingConfig { min_workers: 2, max_workers: 6, ..ScalingConfig::default() };
        for cpu in [0.0_f32, 35.0, 50.0, 70.0, 95.0] {
            let limit = compute_worker_limit(cpu, 30.0, &scaling, 64);
            assert!((2..=6).contains(&limit), "cpu {cpu} gave {limit}");
        }
    }

    #[test]
    fn degradation_tracks_open_breakers() {
        let registry = BreakerRegistry::new();
        let breaker = registry.get_or_create("forge", BreakerConfig::default());
        let previous = DegradationStatus::default();

        let status = evaluate_degradation(&registry, 0, &previous, 100);
        assert!(!status.is_degraded);
        assert!(status.started_at_ms.is_none());

        for _ in 0..5 {
            breaker.record_failure();
        }
        let status = evaluate_degradation(&registry, 0, &previous, 200);
        assert!(status.is_degraded);
        assert_eq!(status.affected_services, vec!["forge".to_string()]);
        assert_eq!(status.started_at_ms, Some(200));

        // Degradation onset is sticky while degraded.
        let later = evaluate_degradation(&registry, 0, &status, 300);
        assert_eq!(later.started_at_ms, Some(200));
    }

    #[test]
    fn degradation_from_consecutive_failures_alone() {
        let registry = BreakerRegistry::new();
        let status =
            evaluate_degradation(&registry, 5, &DegradationStatus::default(), 10);
        assert!(status.is_degraded);
        assert!(status.affected_services.is_empty());
    }

    #[test]
    fn recovery_actions_name_causes() {
        let mut degradation = DegradationStatus::default();
        degradation.affected_services.push("forge".into());
        degradation.consecutive_failures = 6;
        let mut counts = HashMap::new();
        counts.insert("rate-limited".to_string(), 3u64);

        let actions = recovery_actions(&degradation, &counts);
        assert_eq!(actions.len(), 3);
        assert!(actions[0].contains("forge"));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_batches() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::default());
        let pool = WorkerPool::new(pool_config(dir.path(), 1), runner).unwrap();

        pool.shutdown(Duration::from_millis(10)).await;
        let err = pool.execute_tasks(vec![submission(1, &[])]).await.unwrap_err();
        assert_eq!(err, PoolError::ShuttingDown);
        assert!(!pool.can_accept_tasks());
    }
}
