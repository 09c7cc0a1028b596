//! Priority-ordered, size-bounded task queue with an overflow policy and a
//! shutdown/startup persistence round-trip.

use crate::config::QueueConfig;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

const PERSIST_DIR: &str = "queue-persist";

/// Policy selecting which task to refuse or evict when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowStrategy {
    /// Drop the incoming task.
    Reject,
    /// Evict the weakest queued task when the incoming one outranks it.
    DropLowest,
    /// Stop accepting; submitters retry or backpressure.
    Pause,
}

/// Result of offering a task to the queue.
#[derive(Debug)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Accepted after evicting the weakest queued task.
    EnqueuedEvicting(Task),
    /// Refused; the task is handed back.
    Rejected(Task),
}

/// Record of a refused or evicted task, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct OverflowEvent {
    pub task_id: String,
    pub priority_score: i64,
    pub strategy: OverflowStrategy,
    pub evicted: bool,
    pub at_ms: u64,
}

/// Owned by the scheduler; workers never touch it directly.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: Vec<Task>,
    config: QueueConfig,
    warned: bool,
    overflow_events: Vec<OverflowEvent>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self { tasks: Vec::new(), config, warned: false, overflow_events: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn utilization(&self) -> f64 {
        self.tasks.len() as f64 / self.config.max_queue_size.max(1) as f64
    }

    /// Whether a submission would currently be admitted.
    ///
    /// Only the pause strategy refuses up front; reject and drop-lowest
    /// resolve at push time.
    pub fn can_accept(&self) -> bool {
        self.config.overflow_strategy != OverflowStrategy::Pause
            || self.tasks.len() < self.config.max_queue_size
    }

    /// Offer a task, applying the overflow policy at capacity.
    pub fn push(&mut self, task: Task, now_ms: u64) -> EnqueueOutcome {
        if self.tasks.len() < self.config.max_queue_size {
            self.insert_sorted(task);
            self.check_warning();
            return EnqueueOutcome::Enqueued;
        }

        match self.config.overflow_strategy {
            OverflowStrategy::Reject | OverflowStrategy::Pause => {
                self.record_overflow(&task, false, now_ms);
                EnqueueOutcome::Rejected(task)
            }
            OverflowStrategy::DropLowest => {
                // Sorted descending, so the weakest task sits at the tail.
                let weakest_score = self.tasks.last().map(|t| t.priority_score);
                match weakest_score {
                    Some(score) if task.priority_score > score => {
                        if let Some(evicted) = self.tasks.pop() {
                            self.record_overflow(&evicted, true, now_ms);
                            self.insert_sorted(task);
                            EnqueueOutcome::EnqueuedEvicting(evicted)
                        } else {
                            self.insert_sorted(task);
                            EnqueueOutcome::Enqueued
                        }
                    }
                    _ => {
                        self.record_overflow(&task, false, now_ms);
                        EnqueueOutcome::Rejected(task)
                    }
                }
            }
        }
    }

    /// Take the next task: the first queued with a matching group id when a
    /// preference is given, otherwise the highest-priority task.
    pub fn pop_next(&mut self, preferred_group: Option<&str>) -> Option<Task> {
        if let Some(group) = preferred_group {
            if let Some(idx) =
                self.tasks.iter().position(|t| t.group_id.as_deref() == Some(group))
            {
                return Some(self.tasks.remove(idx));
            }
        }
        if self.tasks.is_empty() {
            None
        } else {
            Some(self.tasks.remove(0))
        }
    }

    /// Remove and return everything, in priority order.
    pub fn drain_all(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.tasks)
    }

    /// Tasks in queue order, for inspection.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn overflow_events(&self) -> &[OverflowEvent] {
        &self.overflow_events
    }

    /// Discard the oldest overflow events beyond `cap`.
    pub fn trim_overflow_events(&mut self, cap: usize) {
        if self.overflow_events.len() > cap {
            let excess = self.overflow_events.len() - cap;
            self.overflow_events.drain(0..excess);
        }
    }

    fn insert_sorted(&mut self, task: Task) {
        // Stable insertion point after every task of equal or higher score
        // preserves FIFO order within a score.
        let idx =
            self.tasks.partition_point(|t| t.priority_score >= task.priority_score);
        self.tasks.insert(idx, task);
    }

    fn check_warning(&mut self) {
        if self.tasks.len() >= self.config.warning_threshold {
            if !self.warned {
                self.warned = true;
                tracing::warn!(
                    queued = self.tasks.len(),
                    threshold = self.config.warning_threshold,
                    capacity = self.config.max_queue_size,
                    "task queue above warning threshold"
                );
            }
        } else {
            self.warned = false;
        }
    }

    fn record_overflow(&mut self, task: &Task, evicted: bool, now_ms: u64) {
        tracing::warn!(
            task_id = %task.id,
            score = task.priority_score,
            evicted,
            strategy = ?self.config.overflow_strategy,
            "queue overflow"
        );
        self.overflow_events.push(OverflowEvent {
            task_id: task.id.clone(),
            priority_score: task.priority_score,
            strategy: self.config.overflow_strategy,
            evicted,
            at_ms: now_ms,
        });
    }
}

/// Write the remaining tasks to `<work_dir>/queue-persist/queue-<millis>.json`.
pub async fn persist_queue(
    work_dir: &Path,
    tasks: &[Task],
    now_ms: u64,
) -> io::Result<PathBuf> {
    let dir = work_dir.join(PERSIST_DIR);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("queue-{now_ms}.json"));
    let contents = serde_json::to_vec_pretty(tasks)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(&path, contents).await?;
    tracing::info!(path = %path.display(), count = tasks.len(), "persisted queued tasks");
    Ok(path)
}

/// Load the most recent persisted queue file, unlinking it afterwards.
/// Returns an empty vector when nothing was persisted.
pub async fn load_persisted(work_dir: &Path) -> io::Result<Vec<Task>> {
    let dir = work_dir.join(PERSIST_DIR);
    let mut newest: Option<(u64, PathBuf)> = None;

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(millis) = name
            .strip_prefix("queue-")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|stamp| stamp.parse::<u64>().ok())
        else {
            continue;
        };
        if newest.as_ref().map(|(m, _)| millis > *m).unwrap_or(true) {
            newest = Some((millis, entry.path()));
        }
    }

    let Some((_, path)) = newest else { return Ok(Vec::new()) };
    let contents = tokio::fs::read(&path).await?;
    let tasks: Vec<Task> = serde_json::from_slice(&contents)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    tokio::fs::remove_file(&path).await?;
    tracing::info!(path = %path.display(), count = tasks.len(), "loaded persisted tasks");
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ChangeRequest;

    fn task_with_labels(number: u64, labels: &[&str], queued_at: u64) -> Task {
        Task::enrich(
            ChangeRequest {
                number,
                title: format!("task {number}"),
                body: String::new(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
            },
            format!("branch-{number}"),
            3,
            queued_at,
        )
    }

    fn queue_with(strategy: OverflowStrategy, capacity: usize) -> TaskQueue {
        TaskQueue::new(QueueConfig {
            max_queue_size: capacity,
            overflow_strategy: strategy,
            warning_threshold: capacity,
            enable_persistence: true,
        })
    }

    #[test]
    fn orders_by_score_descending() {
        let mut queue = queue_with(OverflowStrategy::Reject, 10);
        queue.push(task_with_labels(1, &["priority:low"], 0), 0);
        queue.push(task_with_labels(2, &["priority:critical"], 1), 1);
        queue.push(task_with_labels(3, &["priority:high"], 2), 2);

        let order: Vec<u64> = queue.iter().map(|t| t.request.number).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn fifo_within_equal_scores() {
        let mut queue = queue_with(OverflowStrategy::Reject, 10);
        for number in 1..=4 {
            queue.push(task_with_labels(number, &["priority:medium"], number), number);
        }
        let order: Vec<u64> = queue.iter().map(|t| t.request.number).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn reject_keeps_queue_unchanged() {
        let mut queue = queue_with(OverflowStrategy::Reject, 2);
        queue.push(task_with_labels(1, &["priority:low"], 0), 0);
        queue.push(task_with_labels(2, &["priority:medium"], 1), 1);

        let outcome = queue.push(task_with_labels(3, &["priority:critical"], 2), 2);
        assert!(matches!(outcome, EnqueueOutcome::Rejected(t) if t.request.number == 3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.overflow_events().len(), 1);
    }

    #[test]
    fn drop_lowest_evicts_only_when_outranked() {
        let mut queue = queue_with(OverflowStrategy::DropLowest, 2);
        queue.push(task_with_labels(1, &["priority:low"], 0), 0); // 25
        queue.push(task_with_labels(2, &["priority:medium"], 1), 1); // 50

        // 75 > 25: the weakest is evicted.
        let outcome = queue.push(task_with_labels(3, &["priority:high"], 2), 2);
        assert!(
            matches!(outcome, EnqueueOutcome::EnqueuedEvicting(t) if t.request.number == 1)
        );
        let order: Vec<i64> = queue.iter().map(|t| t.priority_score).collect();
        assert_eq!(order, vec![75, 50]);

        // 25 does not strictly exceed the new weakest (50): rejected.
        let outcome = queue.push(task_with_labels(4, &["priority:low"], 3), 3);
        assert!(matches!(outcome, EnqueueOutcome::Rejected(_)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drop_lowest_rejects_equal_score() {
        let mut queue = queue_with(OverflowStrategy::DropLowest, 1);
        queue.push(task_with_labels(1, &["priority:medium"], 0), 0);
        let outcome = queue.push(task_with_labels(2, &["priority:medium"], 1), 1);
        assert!(matches!(outcome, EnqueueOutcome::Rejected(_)));
    }

    #[test]
    fn pause_refuses_up_front() {
        let mut queue = queue_with(OverflowStrategy::Pause, 1);
        assert!(queue.can_accept());
        queue.push(task_with_labels(1, &[], 0), 0);
        assert!(!queue.can_accept());

        let outcome = queue.push(task_with_labels(2, &[], 1), 1);
        assert!(matches!(outcome, EnqueueOutcome::Rejected(_)));

        queue.pop_next(None);
        assert!(queue.can_accept());
    }

    #[test]
    fn pop_prefers_matching_group() {
        let mut queue = queue_with(OverflowStrategy::Reject, 10);
        let mut a = task_with_labels(1, &["priority:critical"], 0);
        a.group_id = Some("group:src/engine".into());
        let mut b = task_with_labels(2, &["priority:low"], 1);
        b.group_id = Some("group:docs/site".into());
        queue.push(a, 0);
        queue.push(b, 1);

        let picked = queue.pop_next(Some("group:docs/site")).unwrap();
        assert_eq!(picked.request.number, 2);

        // No match falls back to highest priority.
        let picked = queue.pop_next(Some("group:nope")).unwrap();
        assert_eq!(picked.request.number, 1);
    }

    #[test]
    fn trim_overflow_events_discards_oldest() {
        let mut queue = queue_with(OverflowStrategy::Reject, 1);
        queue.push(task_with_labels(1, &[], 0), 0);
        for number in 2..=6 {
            queue.push(task_with_labels(number, &[], number), number);
        }
        assert_eq!(queue.overflow_events().len(), 5);
        queue.trim_overflow_events(2);
        assert_eq!(queue.overflow_events().len(), 2);
        // The retained events are the most recent ones.
        assert_eq!(queue.overflow_events()[0].at_ms, 5);
    }

    #[tokio::test]
    async fn persistence_round_trip_preserves_tasks_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = vec![
            task_with_labels(1, &["priority:high"], 10),
            task_with_labels(2, &["priority:low"], 20),
        ];

        let path = persist_queue(dir.path(), &tasks, 1_000).await.unwrap();
        assert!(path.ends_with("queue-1000.json"));

        let loaded = load_persisted(dir.path()).await.unwrap();
        assert_eq!(loaded.len(), 2);
        let ids: Vec<&str> = loaded.iter().map(|t| t.id.as_str()).collect();
        assert!(ids.contains(&tasks[0].id.as_str()));
        assert!(ids.contains(&tasks[1].id.as_str()));
        assert!(!path.exists());

        // Nothing left to load.
        assert!(load_persisted(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_picks_most_recent_file() {
        let dir = tempfile::tempdir().unwrap();
        persist_queue(dir.path(), &[task_with_labels(1, &[], 0)], 1_000).await.unwrap();
        persist_queue(dir.path(), &[task_with_labels(2, &[], 0)], 2_000).await.unwrap();

        let loaded = load_persisted(dir.path()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].request.number, 2);
    }

    #[tokio::test]
    async fn load_from_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_persisted(dir.path()).await.unwrap().is_empty());
    }
}
