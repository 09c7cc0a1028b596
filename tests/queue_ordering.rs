//! Queue laws: descending-score order at every observation point, FIFO
//! within a score, and the drop-lowest retention guarantee.

use autoforge::{
    ChangeRequest, EnqueueOutcome, OverflowStrategy, QueueConfig, Task, TaskQueue,
};

fn task(number: u64, labels: &[&str], queued_at: u64) -> Task {
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

fn scores(queue: &TaskQueue) -> Vec<i64> {
    queue.iter().map(|t| t.priority_score).collect()
}

fn assert_sorted_descending(queue: &TaskQueue) {
    let observed = scores(queue);
    let mut sorted = observed.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(observed, sorted, "queue must stay sorted by score descending");
}

#[test]
fn queue_is_sorted_after_every_transition() {
    let mut queue = TaskQueue::new(QueueConfig::default());
    let labels: [&[&str]; 6] = [
        &["priority:medium"],
        &["priority:critical"],
        &["priority:low", "type:chore"],
        &["priority:high", "type:security"],
        &["priority:medium", "type:bugfix"],
        &["priority:low"],
    ];

    for (i, label_set) in labels.iter().enumerate() {
        queue.push(task(i as u64, label_set, i as u64), i as u64);
        assert_sorted_descending(&queue);
    }
    while queue.pop_next(None).is_some() {
        assert_sorted_descending(&queue);
    }
}

#[test]
fn ties_preserve_insertion_order() {
    let mut queue = TaskQueue::new(QueueConfig::default());
    for number in 0..5 {
        queue.push(task(number, &["priority:medium"], number), number);
    }
    // A higher-priority task cuts the line, the rest keep FIFO.
    queue.push(task(99, &["priority:critical"], 99), 99);

    let order: Vec<u64> = queue.iter().map(|t| t.request.number).collect();
    assert_eq!(order, vec![99, 0, 1, 2, 3, 4]);
}

#[test]
fn drop_lowest_retains_everything_stronger_than_the_rejected() {
    let mut queue = TaskQueue::new(QueueConfig {
        max_queue_size: 3,
        overflow_strategy: OverflowStrategy::DropLowest,
        warning_threshold: 3,
        enable_persistence: false,
    });

    queue.push(task(1, &["priority:low"], 1), 1); // 25
    queue.push(task(2, &["priority:medium"], 2), 2); // 50
    queue.push(task(3, &["priority:high"], 3), 3); // 75

    // 100 evicts the 25.
    let outcome = queue.push(task(4, &["priority:critical"], 4), 4);
    let evicted = match outcome {
        EnqueueOutcome::EnqueuedEvicting(evicted) => evicted,
        other => panic!("expected eviction, got {other:?}"),
    };
    assert_eq!(evicted.priority_score, 25);

    // Size bound holds and every retained score strictly exceeds the
    // rejected one.
    assert_eq!(queue.len(), 3);
    assert!(scores(&queue).iter().all(|s| *s > evicted.priority_score));
    assert_eq!(scores(&queue), vec![100, 75, 50]);

    // A task weaker than the current minimum is refused outright.
    let outcome = queue.push(task(5, &["priority:low"], 5), 5);
    assert!(matches!(outcome, EnqueueOutcome::Rejected(_)));
    assert_eq!(queue.len(), 3);
}

#[test]
fn group_affinity_does_not_break_priority_for_other_groups() {
    let mut queue = TaskQueue::new(QueueConfig::default());
    let body_a = "## Affected Paths\n- `crates/core/lib.rs`\n";
    let body_b = "## Affected Paths\n- `web/app/main.ts`\n";

    let with_body = |number: u64, labels: &[&str], body: &str| {
        Task::enrich(
            ChangeRequest {
                number,
                title: format!("task {number}"),
                body: body.into(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
            },
            format!("branch-{number}"),
            3,
            number,
        )
    };

    queue.push(with_body(1, &["priority:critical"], body_a), 1);
    queue.push(with_body(2, &["priority:high"], body_b), 2);
    queue.push(with_body(3, &["priority:low"], body_a), 3);

    // Affinity for group A pulls the weaker same-group task.
    let picked = queue.pop_next(Some("group:crates/core")).unwrap();
    assert_eq!(picked.request.number, 1);
    let picked = queue.pop_next(Some("group:crates/core")).unwrap();
    assert_eq!(picked.request.number, 3);

    // With the group drained, the strongest remaining task is next.
    let picked = queue.pop_next(Some("group:crates/core")).unwrap();
    assert_eq!(picked.request.number, 2);
    assert!(queue.pop_next(None).is_none());
}
