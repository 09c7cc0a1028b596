//! Typed errors for upstream operations and worker execution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Classification of an upstream failure.
///
/// Drives retryability, dead-letter capture, and the per-kind counters the
/// pool exposes in its status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Credentials rejected (401).
    Auth,
    /// Authenticated but not allowed (403 without rate-limit headers).
    Permission,
    /// Resource absent (404); callers may convert to `None`.
    NotFound,
    /// 429 or budget exhausted; carries an optional server-driven wait.
    RateLimited,
    /// State clash (409/422), e.g. a non-fast-forward push.
    Conflict,
    /// Connection-level failure: unreachable host, reset, DNS.
    Network,
    /// Upstream 5xx.
    Server,
    /// Request or task exceeded its deadline.
    Timeout,
    /// The circuit for this service is open; the call was never issued.
    CircuitOpen,
    /// Input failed local validation before any request was made.
    Validation,
}

impl ErrorKind {
    /// Whether an error of this kind is worth retrying at the request layer.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Server | Self::Network | Self::Timeout)
    }

    /// Stable kebab-case code used in attempt histories and dead-letter lines.
    pub fn code(self) -> &'static str {
        match self {
            Self::Auth => "auth-failed",
            Self::Permission => "permission-denied",
            Self::NotFound => "not-found",
            Self::RateLimited => "rate-limited",
            Self::Conflict => "conflict",
            Self::Network => "network",
            Self::Server => "server-error",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit-open",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Structured error for forge API operations.
///
/// Each layer that touches the error adds context without discarding the
/// cause chain: the client stamps operation/endpoint/correlation id, the
/// worker wraps the whole thing in a [`WorkerError`] with phase context.
#[derive(Debug)]
pub struct ForgeError {
    kind: ErrorKind,
    message: String,
    operation: Option<String>,
    endpoint: Option<String>,
    repository: Option<String>,
    correlation_id: Option<String>,
    status: Option<u16>,
    retry_after: Option<Duration>,
    retryable_override: Option<bool>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ForgeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            operation: None,
            endpoint: None,
            repository: None,
            correlation_id: None,
            status: None,
            retry_after: None,
            retryable_override: None,
            source: None,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Tag the error as non-retryable regardless of kind.
    pub fn non_retryable(mut self) -> Self {
        self.retryable_override = Some(false);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn repository(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Server-requested minimum wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable_override.unwrap_or_else(|| self.kind.is_retryable())
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == ErrorKind::RateLimited
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }
}

impl fmt::Display for ForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(op) = &self.operation {
            write!(f, " (operation: {op}")?;
            if let Some(endpoint) = &self.endpoint {
                write!(f, ", endpoint: {endpoint}")?;
            }
            if let Some(repo) = &self.repository {
                write!(f, ", repository: {repo}")?;
            }
            if let Some(id) = &self.correlation_id {
                write!(f, ", correlation: {id}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ForgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Phase of worker execution in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerPhase {
    Workspace,
    Clone,
    Branch,
    Credentials,
    Execute,
    Commit,
    Push,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Workspace => "workspace",
            Self::Clone => "clone",
            Self::Branch => "branch",
            Self::Credentials => "credentials",
            Self::Execute => "execute",
            Self::Commit => "commit",
            Self::Push => "push",
        };
        f.write_str(name)
    }
}

/// A worker failure wrapped with execution context.
#[derive(Debug)]
pub struct WorkerError {
    pub phase: WorkerPhase,
    pub branch: String,
    pub workspace: PathBuf,
    pub elapsed: Duration,
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl WorkerError {
    pub fn new(
        phase: WorkerPhase,
        branch: impl Into<String>,
        workspace: impl Into<PathBuf>,
        elapsed: Duration,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            phase,
            branch: branch.into(),
            workspace: workspace.into(),
            elapsed,
            source: Box::new(source),
        }
    }

    /// Kind of the underlying failure, defaulting to a timeout/server split
    /// only when the cause is a [`ForgeError`].
    pub fn kind(&self) -> ErrorKind {
        self.source
            .downcast_ref::<ForgeError>()
            .map(|e| e.kind())
            .unwrap_or(ErrorKind::Validation)
    }

    /// Stable code for attempt histories; falls back to the phase name.
    pub fn code(&self) -> String {
        match self.source.downcast_ref::<ForgeError>() {
            Some(e) => e.kind().code().to_string(),
            None => format!("{}-failed", self.phase),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.source.downcast_ref::<ForgeError>().map(|e| e.is_retryable()).unwrap_or(true)
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker failed in {} phase (branch: {}, workspace: {}, elapsed: {:?}): {}",
            self.phase,
            self.branch,
            self.workspace.display(),
            self.elapsed,
            self.source
        )
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref() as &(dyn std::error::Error + 'static))
    }
}
