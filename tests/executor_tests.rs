//! Executor behavior: execution records, the running set, bounded
//! history, failure capture, and output truncation.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cronmesh::executor::{Executor, Job};
use cronmesh::store::{ExecStore, MemoryExecStore};
use test_harness::{assert_eventually, CountingJob, FailingJob, SlowJob};

fn executor(store: Arc<dyn ExecStore>) -> Executor {
    Executor::new(
        store,
        "node-a",
        "_exe",
        5,
        1000,
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn successful_run_is_recorded() {
    let store: Arc<dyn ExecStore> = Arc::new(MemoryExecStore::new());
    let executor = executor(store.clone());
    let (job, _) = CountingJob::new("t1");
    executor.register(job);

    executor.execute_task("t1").await;

    let history = executor.history("t1", 0, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    let execution = &history[0];
    assert!(execution.success);
    assert_eq!(execution.result.as_deref(), Some("ok"));
    assert_eq!(execution.node, "node-a");
    assert!(execution.finished_at.unwrap() >= execution.started_at);

    // Finished executions leave the running set.
    assert!(executor.running().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_run_captures_the_error() {
    let store: Arc<dyn ExecStore> = Arc::new(MemoryExecStore::new());
    let executor = executor(store);
    executor.register(FailingJob::new("t1"));

    executor.execute_task("t1").await;

    let history = executor.history("t1", 0, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].result.as_deref(), Some("Error: boom"));
}

#[tokio::test]
async fn unregistered_job_records_an_error() {
    let store: Arc<dyn ExecStore> = Arc::new(MemoryExecStore::new());
    let executor = executor(store);

    executor.execute_task("ghost").await;

    let history = executor.history("ghost", 0, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(
        history[0].result.as_deref(),
        Some("Error: task ghost not exist")
    );
}

#[tokio::test]
async fn history_is_bounded() {
    let store: Arc<dyn ExecStore> = Arc::new(MemoryExecStore::new());
    let executor = executor(store.clone());
    let (job, runs) = CountingJob::new("t1");
    executor.register(job);

    for _ in 0..12 {
        executor.execute_task("t1").await;
    }
    assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 12);

    let ids = store.lrange("_exe_hist_t1", 0, -1).await.unwrap();
    assert_eq!(ids.len(), 5);

    let history = executor.history("t1", 0, 0).await.unwrap();
    assert_eq!(history.len(), 5);

    // Paging past the bound comes back empty.
    let tail = executor.history("t1", 5, 5).await.unwrap();
    assert!(tail.is_empty());
}

#[tokio::test]
async fn running_set_tracks_in_flight_executions() {
    let store: Arc<dyn ExecStore> = Arc::new(MemoryExecStore::new());
    let executor = Arc::new(Executor::new(
        store,
        "node-a",
        "_exe",
        5,
        1000,
        CancellationToken::new(),
    ));
    executor.register(SlowJob::new("slow", Duration::from_millis(800)));

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let consumer = executor.clone();
    tokio::spawn(async move {
        consumer.consume(rx).await;
    });

    tx.send("slow".to_string()).await.unwrap();
    tx.send("slow".to_string()).await.unwrap();

    let probe = executor.clone();
    assert_eventually(
        || {
            let executor = probe.clone();
            async move { executor.running().await.unwrap().len() == 2 }
        },
        Duration::from_secs(2),
        "in-flight executions missing from running set",
    )
    .await;

    let probe = executor.clone();
    assert_eventually(
        || {
            let executor = probe.clone();
            async move { executor.running().await.unwrap().is_empty() }
        },
        Duration::from_secs(3),
        "running set not drained after completion",
    )
    .await;
}

#[tokio::test]
async fn close_waits_for_in_flight_runs() {
    let store: Arc<dyn ExecStore> = Arc::new(MemoryExecStore::new());
    let executor = Arc::new(Executor::new(
        store,
        "node-a",
        "_exe",
        5,
        1000,
        CancellationToken::new(),
    ));
    let (job, runs) = CountingJob::new("t1");
    executor.register(SlowJob::new("slow", Duration::from_millis(400)));
    executor.register(job);

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let consumer = executor.clone();
    let handle = tokio::spawn(async move {
        consumer.consume(rx).await;
    });

    tx.send("slow".to_string()).await.unwrap();
    tx.send("t1".to_string()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Dropping the sender ends the consumer; close drains the workers.
    drop(tx);
    handle.await.unwrap();
    executor.close().await;

    assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(executor.running().await.unwrap().is_empty());
    let history = executor.history("slow", 0, 0).await.unwrap();
    assert!(history[0].success);
}

struct ChattyJob;

#[async_trait]
impl Job for ChattyJob {
    fn name(&self) -> &str {
        "chatty"
    }

    async fn run(&self, _ctx: CancellationToken) -> anyhow::Result<String> {
        Ok("x".repeat(5000))
    }
}

#[tokio::test]
async fn long_output_is_truncated() {
    let store: Arc<dyn ExecStore> = Arc::new(MemoryExecStore::new());
    let executor = executor(store);
    executor.register(Arc::new(ChattyJob));

    executor.execute_task("chatty").await;

    let history = executor.history("chatty", 0, 0).await.unwrap();
    assert_eq!(history[0].result.as_ref().unwrap().len(), 1000);
    assert!(history[0].success);
}
