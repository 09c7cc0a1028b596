//! Rate-limited, circuit-gated, retrying client for one forge service.
//!
//! Every operation runs the same pipeline: circuit gate → preemptive queue →
//! rate-limit acquire → transport → header fold-in → status mapping, with the
//! retry engine wrapped around the rate-limit/transport core. Reads consult
//! the response cache first; mutations eagerly invalidate the types they
//! affect.

pub mod transport;
pub mod types;

use crate::cache::{CacheType, ResponseCache};
use crate::circuit_breaker::{BreakerHealth, CircuitBreaker};
use crate::config::{ForgeApiConfig, RateLimitQueueConfig};
use crate::error::{ErrorKind, ForgeError};
use crate::metrics::{ApiMetrics, ApiMetricsSnapshot};
use crate::rate_limit::{RateLimitTracker, DEFAULT_RESOURCE};
use crate::retry::RetryPolicy;
use crate::sleeper::{Sleeper, TokioSleeper};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use self::transport::{
    ApiRequest, ApiResponse, HttpTransport, Method, Transport, TransportError,
};
use self::types::{
    Branch, BranchProtection, CheckRuns, CombinedStatus, Comment, CommitRef, Issue, Label,
    MergeResult, PullRequest, RateLimitInfo, Repo,
};

/// Poll cadence while a request waits in the preemptive queue.
const QUEUE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct ForgeClientBuilder {
    config: ForgeApiConfig,
    transport: Option<Arc<dyn Transport>>,
    sleeper: Arc<dyn Sleeper>,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimitTracker>>,
    cache: Option<Arc<ResponseCache>>,
    retry: Option<RetryPolicy>,
}

impl ForgeClientBuilder {
    pub fn new(config: ForgeApiConfig) -> Self {
        Self {
            config,
            transport: None,
            sleeper: Arc::new(TokioSleeper),
            breaker: None,
            limiter: None,
            cache: None,
            retry: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn limiter(mut self, limiter: Arc<RateLimitTracker>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<ForgeClient, ForgeError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(self.config.base_url.as_str(), self.config.token.as_str())
                    .map_err(
                    |e| {
                        ForgeError::new(ErrorKind::Network, "failed to build transport")
                            .with_source(e)
                    },
                )?,
            ),
        };
        let breaker = self.breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::new(
                self.config.service.clone(),
                self.config.breaker.clone(),
            ))
        });
        Ok(ForgeClient {
            queue: self.config.queue.clone(),
            request_timeout: self.config.request_timeout,
            config: self.config,
            transport,
            sleeper: self.sleeper,
            breaker,
            limiter: self.limiter.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            metrics: Arc::new(ApiMetrics::new()),
            queued_waiters: AtomicUsize::new(0),
        })
    }
}

/// One instance per (service, credentials).
pub struct ForgeClient {
    config: ForgeApiConfig,
    queue: RateLimitQueueConfig,
    request_timeout: std::time::Duration,
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimitTracker>,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
    metrics: Arc<ApiMetrics>,
    queued_waiters: AtomicUsize,
}

impl std::fmt::Debug for ForgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForgeClient")
            .field("service", &self.config.service)
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

impl ForgeClient {
    pub fn new(config: ForgeApiConfig) -> Result<Self, ForgeError> {
        ForgeClientBuilder::new(config).build()
    }

    pub fn builder(config: ForgeApiConfig) -> ForgeClientBuilder {
        ForgeClientBuilder::new(config)
    }

    pub fn service(&self) -> &str {
        &self.config.service
    }

    pub fn breaker_health(&self) -> BreakerHealth {
        self.breaker.health()
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn metrics(&self) -> ApiMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache(&self) -> Arc<ResponseCache> {
        self.cache.clone()
    }

    /// Fallback flavour: any failure yields the supplied default and a
    /// `degraded = true` marker instead of an error.
    pub async fn with_fallback<T, F, Fut>(&self, operation: F, fallback: T) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ForgeError>>,
    {
        match operation().await {
            Ok(value) => (value, false),
            Err(e) => {
                tracing::warn!(
                    service = %self.config.service,
                    error = %e,
                    "operation degraded to fallback"
                );
                (fallback, true)
            }
        }
    }

    // ---- typed read operations (cache-first) ----

    pub async fn get_repo(&self, owner: &str, repo: &str) -> Result<Repo, ForgeError> {
        let path = format!("/repos/{owner}/{repo}");
        let value = self
            .cached_get("get_repo", owner, repo, &path, CacheType::RepoInfo, "info")
            .await?;
        decode(value)
    }

    pub async fn list_branches(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<Branch>, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/branches");
        let value = self
            .cached_get("list_branches", owner, repo, &path, CacheType::BranchList, "all")
            .await?;
        decode(value)
    }

    pub async fn get_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Branch, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/branches/{branch}");
        let value = self
            .cached_get("get_branch", owner, repo, &path, CacheType::Branch, branch)
            .await?;
        decode(value)
    }

    pub async fn get_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<BranchProtection, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/branches/{branch}/protection");
        let value = self
            .cached_get(
                "get_branch_protection",
                owner,
                repo,
                &path,
                CacheType::BranchProtection,
                branch,
            )
            .await?;
        decode(value)
    }

    pub async fn list_issues(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<Issue>, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/issues?state={state}");
        let value = self
            .cached_get("list_issues", owner, repo, &path, CacheType::IssueList, state)
            .await?;
        decode(value)
    }

    pub async fn get_issue(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Issue, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/issues/{number}");
        let value = self
            .cached_get(
                "get_issue",
                owner,
                repo,
                &path,
                CacheType::Issue,
                &number.to_string(),
            )
            .await?;
        decode(value)
    }

    /// Live rate-limit inspection; never cached.
    pub async fn rate_limit_info(&self) -> Result<RateLimitInfo, ForgeError> {
        let request = ApiRequest::get("/rate_limit", self.request_timeout);
        let response = self.execute("rate_limit_info", None, request).await?;
        decode(response.body)
    }

    pub async fn combined_status(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<CombinedStatus, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/commits/{git_ref}/status");
        let request = ApiRequest::get(path, self.request_timeout);
        let response =
            self.execute("combined_status", Some((owner, repo)), request).await?;
        decode(response.body)
    }

    pub async fn check_runs(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<CheckRuns, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/commits/{git_ref}/check-runs");
        let request = ApiRequest::get(path, self.request_timeout);
        let response = self.execute("check_runs", Some((owner, repo)), request).await?;
        decode(response.body)
    }

    // ---- typed mutations (eager invalidation) ----

    /// Create `branch` from `from_sha`. Idempotent: if the branch already
    /// exists it is adopted and returned unchanged.
    pub async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        from_sha: &str,
    ) -> Result<Branch, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/git/refs");
        let request = ApiRequest {
            method: Method::Post,
            path,
            body: Some(json!({
                "ref": format!("refs/heads/{branch}"),
                "sha": from_sha,
            })),
            timeout: self.request_timeout,
        };
        match self.execute("create_branch", Some((owner, repo)), request).await {
            Ok(_) => {
                self.cache.invalidate_type(CacheType::BranchList, owner, repo);
                Ok(Branch {
                    name: branch.to_string(),
                    commit: CommitRef { sha: from_sha.to_string() },
                    protected: false,
                })
            }
            Err(e)
                if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::Validation) =>
            {
                // Reference already exists: adopt it.
                tracing::debug!(owner, repo, branch, "branch exists, adopting");
                let key = ResponseCache::key_for(CacheType::Branch, owner, repo, branch);
                self.cache.invalidate(&key);
                self.get_branch(owner, repo, branch).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<Comment, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/issues/{issue_number}/comments");
        let request = ApiRequest {
            method: Method::Post,
            path,
            body: Some(json!({ "body": body })),
            timeout: self.request_timeout,
        };
        let response = self.execute("create_comment", Some((owner, repo)), request).await?;
        let key =
            ResponseCache::key_for(CacheType::Issue, owner, repo, &issue_number.to_string());
        self.cache.invalidate(&key);
        decode(response.body)
    }

    pub async fn add_labels(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        labels: &[&str],
    ) -> Result<Vec<Label>, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/issues/{issue_number}/labels");
        let request = ApiRequest {
            method: Method::Post,
            path,
            body: Some(json!({ "labels": labels })),
            timeout: self.request_timeout,
        };
        let response = self.execute("add_labels", Some((owner, repo)), request).await?;
        self.cache.invalidate_type(CacheType::Issue, owner, repo);
        self.cache.invalidate_type(CacheType::IssueList, owner, repo);
        decode(response.body)
    }

    pub async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<PullRequest, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/pulls");
        let request = ApiRequest {
            method: Method::Post,
            path,
            body: Some(json!({
                "title": title,
                "head": head,
                "base": base,
                "body": body,
            })),
            timeout: self.request_timeout,
        };
        let response =
            self.execute("create_pull_request", Some((owner, repo)), request).await?;
        decode(response.body)
    }

    pub async fn merge_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        merge_method: &str,
    ) -> Result<MergeResult, ForgeError> {
        let path = format!("/repos/{owner}/{repo}/pulls/{number}/merge");
        let request = ApiRequest {
            method: Method::Put,
            path,
            body: Some(json!({ "merge_method": merge_method })),
            timeout: self.request_timeout,
        };
        let response =
            self.execute("merge_pull_request", Some((owner, repo)), request).await?;
        self.cache.invalidate_type(CacheType::BranchList, owner, repo);
        decode(response.body)
    }

    // ---- pipeline core ----

    async fn cached_get(
        &self,
        op: &str,
        owner: &str,
        repo: &str,
        path: &str,
        cache_type: CacheType,
        user_key: &str,
    ) -> Result<Value, ForgeError> {
        let key = ResponseCache::key_for(cache_type, owner, repo, user_key);
        if let Some(value) = self.cache.get(&key, cache_type) {
            tracing::debug!(op, key = %key, "cache hit");
            return Ok(value);
        }
        let request = ApiRequest::get(path, self.request_timeout);
        let response = self.execute(op, Some((owner, repo)), request).await?;
        self.cache.set(&key, cache_type, response.body.clone(), None);
        Ok(response.body)
    }

    /// Strict flavour: run one request through the full pipeline.
    pub async fn execute(
        &self,
        op: &str,
        repo: Option<(&str, &str)>,
        request: ApiRequest,
    ) -> Result<ApiResponse, ForgeError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let endpoint = request.path.clone();

        let result = self.execute_inner(op, &request).await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                if matches!(
                    e.kind(),
                    ErrorKind::Server | ErrorKind::Network | ErrorKind::Timeout
                ) {
                    self.breaker.record_failure();
                }
                if e.kind() == ErrorKind::RateLimited {
                    self.limiter.update_from_error(DEFAULT_RESOURCE, e.retry_after());
                }
                self.metrics.record_failure();
            }
        }

        result.map_err(|e| {
            let mut e = e
                .with_operation(op)
                .with_endpoint(endpoint)
                .with_correlation_id(correlation_id);
            if let Some((owner, repo)) = repo {
                e = e.with_repository(format!("{owner}/{repo}"));
            }
            e
        })
    }

    async fn execute_inner(
        &self,
        op: &str,
        request: &ApiRequest,
    ) -> Result<ApiResponse, ForgeError> {
        if !self.breaker.can_request() {
            return Err(ForgeError::new(
                ErrorKind::CircuitOpen,
                format!("{} is unavailable (circuit open)", self.config.service),
            ));
        }

        self.reserve_budget(DEFAULT_RESOURCE).await?;

        let metrics = self.metrics.clone();
        self.retry
            .execute_with(
                || self.attempt(request),
                |e: &ForgeError| e.is_retryable(),
                move |_attempt, _delay, err| {
                    metrics.record_retry();
                    if err.kind() == ErrorKind::RateLimited {
                        metrics.record_rate_limited();
                    }
                },
            )
            .await
            .map_err(|e| {
                tracing::debug!(op, error = %e, "request failed");
                e
            })
    }

    async fn attempt(&self, request: &ApiRequest) -> Result<ApiResponse, ForgeError> {
        let wait = self.limiter.acquire(DEFAULT_RESOURCE);
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate-limit wait");
            self.sleeper.sleep(wait).await;
        }

        let started = Instant::now();
        let outcome = self.transport.send(request.clone()).await;
        self.metrics.record_request(started.elapsed());

        let response = match outcome {
            Ok(response) => response,
            Err(TransportError::Timeout(limit)) => {
                return Err(ForgeError::new(
                    ErrorKind::Timeout,
                    format!("request exceeded {limit:?}"),
                ));
            }
            Err(TransportError::Network(message)) => {
                return Err(ForgeError::new(ErrorKind::Network, message));
            }
        };

        self.limiter.update_from_headers(&response.headers);

        if response.status < 400 {
            Ok(response)
        } else {
            Err(error_for_status(&response))
        }
    }

    /// Preemptive queuing: once the tracked budget drops to the threshold,
    /// new requests wait here (bounded queue, bounded wait) instead of
    /// burning the last of the budget.
    async fn reserve_budget(&self, resource: &str) -> Result<(), ForgeError> {
        if !self.queue.preemptive_wait {
            return Ok(());
        }
        if !self.should_queue(resource) {
            return Ok(());
        }

        let waiters = self.queued_waiters.fetch_add(1, Ordering::SeqCst);
        if waiters >= self.queue.max_queue_size {
            self.queued_waiters.fetch_sub(1, Ordering::SeqCst);
            return Err(ForgeError::new(
                ErrorKind::RateLimited,
                format!("request queue full ({} waiting)", waiters),
            )
            .non_retryable());
        }
        tracing::debug!(resource, waiting = waiters + 1, "request queued on low budget");

        let mut waited = std::time::Duration::ZERO;
        loop {
            if !self.should_queue(resource) {
                self.queued_waiters.fetch_sub(1, Ordering::SeqCst);
                return Ok(());
            }
            if waited >= self.queue.max_queue_wait {
                self.queued_waiters.fetch_sub(1, Ordering::SeqCst);
                self.metrics.record_rate_limited();
                return Err(ForgeError::new(
                    ErrorKind::RateLimited,
                    format!("queued request timed out after {waited:?}"),
                )
                .non_retryable());
            }
            self.sleeper.sleep(QUEUE_POLL_INTERVAL).await;
            waited += QUEUE_POLL_INTERVAL;
        }
    }

    fn should_queue(&self, resource: &str) -> bool {
        if self.limiter.is_limited(resource) {
            return true;
        }
        match self.limiter.remaining(resource) {
            Some(remaining) => remaining <= self.queue.queue_threshold,
            None => false,
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ForgeError> {
    serde_json::from_value(value).map_err(|e| {
        ForgeError::new(ErrorKind::Validation, "unexpected response shape").with_source(e)
    })
}

fn error_for_status(response: &ApiResponse) -> ForgeError {
    let message = response
        .body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("request failed")
        .to_string();
    let retry_after = response
        .header("retry-after")
        .and_then(|v| v.parse::<u64>().ok())
        .map(std::time::Duration::from_secs);
    let remaining_zero =
        response.header("x-ratelimit-remaining").map(|v| v.trim() == "0").unwrap_or(false);

    let kind = match response.status {
        401 => ErrorKind::Auth,
        403 if retry_after.is_some() || remaining_zero => ErrorKind::RateLimited,
        403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        422 => ErrorKind::Validation,
        429 => ErrorKind::RateLimited,
        status if status >= 500 => ErrorKind::Server,
        _ => ErrorKind::Validation,
    };

    let mut error = ForgeError::new(kind, message).with_status(response.status);
    if let Some(wait) = retry_after {
        error = error.with_retry_after(wait);
    }
    error
}
