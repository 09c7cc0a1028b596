//! Graceful-shutdown persistence: queued tasks survive a shutdown, reload on
//! the next startup, and run ahead of newly submitted tasks of equal score.

mod common;

use autoforge::{load_persisted, PoolConfig, WorkerPool};
use common::{submission, RecordingRunner};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn shutdown_persists_queue_and_restart_runs_it_first() {
    let dir = tempfile::tempdir().unwrap();

    // First life: 2 slow workers, 12 tasks, shutdown after the first two
    // have started.
    {
        let runner = Arc::new(RecordingRunner {
            delay: Some(Duration::from_secs(30)),
            ..RecordingRunner::default()
        });
        let pool = Arc::new(
            WorkerPool::new(PoolConfig::new(2, dir.path()), runner.clone()).unwrap(),
        );

        let submissions = (1..=12).map(|n| submission(n, &[], "")).collect();
        let pool_clone = pool.clone();
        let batch =
            tokio::spawn(async move { pool_clone.execute_tasks(submissions).await });

        // Let the first two tasks start.
        while runner.order().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown(Duration::from_millis(100)).await;

        let results = batch.await.unwrap().unwrap();
        let dropped: Vec<u64> =
            results.iter().filter(|r| r.dropped).map(|r| r.issue_number).collect();
        assert_eq!(dropped.len(), 10, "ten queued tasks were unprocessed");

        // The persisted file holds exactly the dropped set.
        let persisted = load_persisted(dir.path()).await.unwrap();
        assert_eq!(persisted.len(), 10);
        let mut persisted_numbers: Vec<u64> =
            persisted.iter().map(|t| t.request.number).collect();
        persisted_numbers.sort_unstable();
        let mut expected = dropped.clone();
        expected.sort_unstable();
        assert_eq!(persisted_numbers, expected);

        // load_persisted consumed the file; put it back for the second life.
        autoforge::persist_queue(dir.path(), &persisted, 9_999).await.unwrap();
    }

    // Second life: same work dir, fast single worker, two fresh tasks of
    // equal score. The persisted prefix runs first.
    {
        let runner = Arc::new(RecordingRunner::default());
        let pool =
            WorkerPool::new(PoolConfig::new(1, dir.path()), runner.clone()).unwrap();

        let results = pool
            .execute_tasks(vec![submission(101, &[], ""), submission(102, &[], "")])
            .await
            .unwrap();
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.success));

        let order = runner.order();
        assert_eq!(order.len(), 12);
        let fresh_positions: Vec<usize> = order
            .iter()
            .enumerate()
            .filter(|(_, n)| **n >= 101)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(fresh_positions, vec![10, 11], "persisted tasks ran first");
    }

    // Nothing left behind.
    assert!(load_persisted(dir.path()).await.unwrap().is_empty());
}

#[tokio::test]
async fn disabled_persistence_drops_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner {
        delay: Some(Duration::from_secs(30)),
        ..RecordingRunner::default()
    });
    let mut config = PoolConfig::new(1, dir.path());
    config.queue.enable_persistence = false;
    let pool = Arc::new(WorkerPool::new(config, runner.clone()).unwrap());

    let pool_clone = pool.clone();
    let batch = tokio::spawn(async move {
        pool_clone
            .execute_tasks(vec![submission(1, &[], ""), submission(2, &[], "")])
            .await
    });
    while runner.order().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pool.shutdown(Duration::from_millis(50)).await;

    let results = batch.await.unwrap().unwrap();
    assert!(results.iter().any(|r| r.dropped));
    assert!(load_persisted(dir.path()).await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_waits_for_fast_workers_to_finish() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner {
        delay: Some(Duration::from_millis(30)),
        ..RecordingRunner::default()
    });
    let pool =
        Arc::new(WorkerPool::new(PoolConfig::new(1, dir.path()), runner.clone()).unwrap());

    let pool_clone = pool.clone();
    let batch =
        tokio::spawn(
            async move { pool_clone.execute_tasks(vec![submission(1, &[], "")]).await },
        );
    while runner.order().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pool.shutdown(Duration::from_secs(5)).await;

    let results = batch.await.unwrap().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success, "active worker had time to finish");
}
