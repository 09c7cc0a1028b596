//! Task model: code-change requests, extracted metadata, priority scoring,
//! and the retry state a task carries across attempts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn base_weight(self) -> i64 {
        match self {
            Self::Critical => 100,
            Self::High => 75,
            Self::Medium => 50,
            Self::Low => 25,
        }
    }

    fn from_label(value: &str) -> Option<Self> {
        match value {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Security,
    Bugfix,
    Feature,
    Refactor,
    Docs,
    Test,
    Chore,
}

impl Category {
    pub fn adjustment(self) -> i64 {
        match self {
            Self::Security => 30,
            Self::Bugfix => 20,
            Self::Feature => 0,
            Self::Refactor => -5,
            Self::Docs => -10,
            Self::Test => -5,
            Self::Chore => -15,
        }
    }

    fn from_label(value: &str) -> Option<Self> {
        match value {
            "security" => Some(Self::Security),
            "bugfix" => Some(Self::Bugfix),
            "feature" => Some(Self::Feature),
            "refactor" => Some(Self::Refactor),
            "docs" => Some(Self::Docs),
            "test" => Some(Self::Test),
            "chore" => Some(Self::Chore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    pub fn adjustment(self) -> i64 {
        match self {
            Self::Simple => 5,
            Self::Moderate => 0,
            Self::Complex => -5,
        }
    }

    /// Multiplier applied to the base task timeout.
    pub fn timeout_multiplier(self) -> f64 {
        match self {
            Self::Simple => 0.5,
            Self::Moderate => 1.0,
            Self::Complex => 2.0,
        }
    }

    fn from_label(value: &str) -> Option<Self> {
        match value {
            "simple" => Some(Self::Simple),
            "moderate" => Some(Self::Moderate),
            "complex" => Some(Self::Complex),
            _ => None,
        }
    }
}

/// An issue-like code-change request as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Metadata extracted from a request's labels and body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub priority: Priority,
    pub category: Category,
    pub complexity: Complexity,
    #[serde(default)]
    pub affected_paths: Vec<String>,
    pub estimated_duration: Duration,
}

impl TaskMetadata {
    /// Extract metadata from `priority:…`/`type:…`/`complexity:…` labels and
    /// the "Affected Paths" body section. Unknown or missing labels fall back
    /// to medium/feature/moderate.
    pub fn extract(request: &ChangeRequest) -> Self {
        let mut priority = Priority::Medium;
        let mut category = Category::Feature;
        let mut complexity = Complexity::Moderate;

        for label in &request.labels {
            let label = label.trim().to_ascii_lowercase();
            if let Some(value) = label.strip_prefix("priority:") {
                if let Some(p) = Priority::from_label(value.trim()) {
                    priority = p;
                }
            } else if let Some(value) = label.strip_prefix("type:") {
                if let Some(c) = Category::from_label(value.trim()) {
                    category = c;
                }
            } else if let Some(value) = label.strip_prefix("complexity:") {
                if let Some(c) = Complexity::from_label(value.trim()) {
                    complexity = c;
                }
            }
        }

        let affected_paths = parse_affected_paths(&request.body);
        let estimated_duration = match complexity {
            Complexity::Simple => Duration::from_secs(5 * 60),
            Complexity::Moderate => Duration::from_secs(10 * 60),
            Complexity::Complex => Duration::from_secs(20 * 60),
        };

        Self { priority, category, complexity, affected_paths, estimated_duration }
    }

    /// Queue ordering key: priority base plus category and complexity
    /// adjustments.
    pub fn priority_score(&self) -> i64 {
        self.priority.base_weight() + self.category.adjustment() + self.complexity.adjustment()
    }

    /// Directory-prefix fingerprint for worker affinity: the most frequent
    /// two-segment prefix among the affected paths.
    pub fn group_id(&self) -> Option<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();

        for path in &self.affected_paths {
            let prefix = two_segment_prefix(path);
            if prefix.is_empty() {
                continue;
            }
            prefixes.push(prefix);
        }
        for prefix in &prefixes {
            let count = counts.entry(prefix.as_str()).or_insert(0);
            if *count == 0 {
                order.push(prefix.as_str());
            }
            *count += 1;
        }

        // Ties resolve to the first prefix encountered.
        let mut best: Option<(&str, usize)> = None;
        for prefix in order {
            let count = counts[prefix];
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((prefix, count));
            }
        }
        best.map(|(prefix, _)| format!("group:{prefix}"))
    }
}

fn two_segment_prefix(path: &str) -> String {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).take(2).collect::<Vec<_>>().join("/")
}

/// Pull inline-code path entries out of a body section titled
/// "Affected Paths". The section ends at the next heading.
fn parse_affected_paths(body: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut in_section = false;

    for line in body.lines() {
        let trimmed = line.trim();
        let is_heading = trimmed.starts_with('#');
        if is_heading {
            in_section = trimmed.trim_start_matches('#').trim().eq_ignore_ascii_case("affected paths");
            continue;
        }
        if !in_section {
            continue;
        }
        let mut rest = trimmed;
        while let Some(start) = rest.find('`') {
            let Some(len) = rest[start + 1..].find('`') else { break };
            let quoted = &rest[start + 1..start + 1 + len];
            if !quoted.is_empty() {
                paths.push(quoted.to_string());
            }
            rest = &rest[start + 1 + len + 1..];
        }
    }

    paths
}

/// One unit of work: a change request bound to a repository branch.
///
/// Identity is immutable after submission; only `retry_count` changes, and
/// only on the scheduler's control path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "issue")]
    pub request: ChangeRequest,
    pub branch_name: String,
    pub metadata: TaskMetadata,
    pub priority_score: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Epoch milliseconds at submission.
    pub queued_at: u64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    /// Enrich a submission into a schedulable task.
    pub fn enrich(
        request: ChangeRequest,
        branch_name: impl Into<String>,
        max_retries: u32,
        now_millis: u64,
    ) -> Self {
        let metadata = TaskMetadata::extract(&request);
        let priority_score = metadata.priority_score();
        let group_id = metadata.group_id();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            branch_name: branch_name.into(),
            metadata,
            priority_score,
            group_id,
            queued_at: now_millis,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// One recorded execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error_code: String,
    pub duration_ms: u64,
    /// Epoch milliseconds at which the attempt ended.
    pub timestamp: u64,
}

/// State that persists across retry attempts of the same task.
///
/// The branch name never changes across retries; the workspace is recreated
/// each attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRetryState {
    pub task_id: String,
    pub branch_name: String,
    pub first_attempt_at: u64,
    pub last_attempt_at: u64,
    pub attempts: Vec<AttemptRecord>,
    pub current_timeout: Duration,
}

impl WorkerRetryState {
    pub fn new(task: &Task, base_timeout: Duration, now_millis: u64) -> Self {
        let scaled = base_timeout.mul_f64(task.metadata.complexity.timeout_multiplier());
        Self {
            task_id: task.id.clone(),
            branch_name: task.branch_name.clone(),
            first_attempt_at: now_millis,
            last_attempt_at: now_millis,
            attempts: Vec::new(),
            current_timeout: scaled,
        }
    }

    pub fn record_attempt(&mut self, error_code: &str, duration: Duration, now_millis: u64) {
        self.last_attempt_at = now_millis;
        self.attempts.push(AttemptRecord {
            attempt: self.attempts.len() as u32 + 1,
            error_code: error_code.to_string(),
            duration_ms: duration.as_millis() as u64,
            timestamp: now_millis,
        });
    }

    /// Grow the timeout for the next attempt by ×1.5, capped at 4× the
    /// complexity-scaled base.
    pub fn grow_timeout(&mut self, scaled_base: Duration) {
        let grown = self.current_timeout.mul_f64(1.5);
        self.current_timeout = grown.min(scaled_base.saturating_mul(4));
    }
}
