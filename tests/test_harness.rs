//! Test harness for in-process agent tests.
//!
//! Nodes run against shared in-memory stores (one timeline and one
//! execution store stand in for the shared redis), each with its own
//! registry, scheduler loop, and executor consumer.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cronmesh::agent::Agent;
use cronmesh::config::Conf;
use cronmesh::executor::Job;
use cronmesh::gossip::{BroadcastQueue, Gossip};
use cronmesh::registry::{EntryRegistry, KvStore, MemoryKv};
use cronmesh::store::{ExecStore, MemoryExecStore, MemoryTimeline, Timeline};

/// Shared backing stores, standing in for the external redis.
#[derive(Clone)]
pub struct SharedStores {
    pub timeline: Arc<dyn Timeline>,
    pub exec_store: Arc<dyn ExecStore>,
    pub kv: Arc<dyn KvStore>,
}

impl SharedStores {
    pub fn new() -> Self {
        Self {
            timeline: Arc::new(MemoryTimeline::new()),
            exec_store: Arc::new(MemoryExecStore::new()),
            kv: Arc::new(MemoryKv::new()),
        }
    }
}

pub fn test_conf(node_name: &str) -> Conf {
    let mut conf = Conf::default();
    conf.gossip.node_name = node_name.to_string();
    conf
}

/// One in-process node: an agent plus its running scheduler and executor
/// loops. Dropping the node aborts the loops.
pub struct TestNode {
    pub agent: Arc<Agent>,
    pub registry: EntryRegistry,
    pub cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TestNode {
    pub fn start(node_name: &str, stores: &SharedStores) -> Self {
        Self::start_with_gossip(node_name, stores, None, None)
    }

    pub fn start_with_gossip(
        node_name: &str,
        stores: &SharedStores,
        registry: Option<EntryRegistry>,
        gossip: Option<Gossip>,
    ) -> Self {
        let conf = test_conf(node_name);
        let cancel = CancellationToken::new();

        let registry = registry.unwrap_or_else(|| {
            let cluster_size = Arc::new(AtomicUsize::new(1));
            let broadcasts = Arc::new(BroadcastQueue::new(cluster_size, 4));
            EntryRegistry::new(stores.kv.clone(), broadcasts)
        });

        let (agent, rx) = Agent::from_parts(
            conf,
            cancel.clone(),
            stores.timeline.clone(),
            stores.exec_store.clone(),
            registry.clone(),
            gossip,
        );

        let mut handles = Vec::new();
        let cron = agent.cron().clone();
        handles.push(tokio::spawn(async move {
            cron.run(rx.action_rx).await;
        }));
        let executor = agent.executor().clone();
        handles.push(tokio::spawn(async move {
            executor.consume(rx.execution_rx).await;
        }));

        Self {
            agent,
            registry,
            cancel,
            handles,
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// A job that counts its runs and returns a fixed output.
pub struct CountingJob {
    name: String,
    runs: Arc<AtomicUsize>,
}

impl CountingJob {
    pub fn new(name: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                name: name.to_string(),
                runs: runs.clone(),
            }),
            runs,
        )
    }
}

#[async_trait]
impl Job for CountingJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: CancellationToken) -> anyhow::Result<String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok("ok".to_string())
    }
}

/// A job that always fails.
pub struct FailingJob {
    name: String,
}

impl FailingJob {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl Job for FailingJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: CancellationToken) -> anyhow::Result<String> {
        anyhow::bail!("boom")
    }
}

/// A job that sleeps for a fixed duration before succeeding.
pub struct SlowJob {
    name: String,
    delay: Duration,
}

impl SlowJob {
    pub fn new(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
        })
    }
}

#[async_trait]
impl Job for SlowJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: CancellationToken) -> anyhow::Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok("done".to_string())
    }
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
