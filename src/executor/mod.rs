//! Local job execution: a registry of named job strategies, a consumer
//! that fans dispatched names out to worker tasks, and durable execution
//! records with bounded per-job history.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::Result;
use crate::store::ExecStore;

/// Execution records age out of the store after this many seconds; ids
/// that outlive their record are filtered out during reads.
const EXECUTION_TTL_SECS: u64 = 48 * 60 * 60;

/// A runnable job strategy. Dispatch is exactly-once per firing;
/// side-effect idempotency is the job's own responsibility.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: CancellationToken) -> anyhow::Result<String>;
}

/// Record of one job invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub name: String,
    /// Milliseconds since epoch.
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub success: bool,
}

impl Execution {
    fn new(name: &str, node: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            started_at: Utc::now().timestamp_millis(),
            finished_at: None,
            node: node.to_string(),
            result: None,
            success: false,
        }
    }

    fn finish_with(&mut self, outcome: anyhow::Result<String>) {
        self.finished_at = Some(Utc::now().timestamp_millis());
        match outcome {
            Ok(output) => {
                self.result = Some(output);
                self.success = true;
            }
            Err(e) => {
                self.result = Some(format!("Error: {e}"));
                self.success = false;
            }
        }
    }
}

pub struct Executor {
    node: String,
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
    store: Arc<dyn ExecStore>,

    key_execution: String,
    key_history: String,
    key_running: String,

    max_history: i64,
    max_output: usize,

    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        store: Arc<dyn ExecStore>,
        node: impl Into<String>,
        key_executor: &str,
        max_history: i64,
        max_output: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node: node.into(),
            jobs: RwLock::new(HashMap::new()),
            store,
            key_execution: key_executor.to_string(),
            key_history: format!("{key_executor}_hist"),
            key_running: format!("{key_executor}_running"),
            max_history,
            max_output,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    pub fn register(&self, job: Arc<dyn Job>) {
        let mut jobs = self.jobs.write().unwrap();
        jobs.insert(job.name().to_string(), job);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.read().unwrap().contains_key(name)
    }

    pub fn jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn max_history(&self) -> i64 {
        self.max_history
    }

    /// Consume dispatched job names, spawning one worker task per firing
    /// so a slow job never blocks the scheduler or later dispatches.
    pub async fn consume(self: Arc<Self>, mut receiver: mpsc::Receiver<String>) {
        loop {
            tokio::select! {
                name = receiver.recv() => match name {
                    Some(name) => {
                        let executor = self.clone();
                        self.tracker.spawn(async move {
                            executor.execute_task(&name).await;
                        });
                    }
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        tracing::info!("executor consumer stopped");
    }

    /// Wait for every in-flight execution to finish. Jobs observe
    /// cancellation through their context token; none are force-killed.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("executor drained");
    }

    pub async fn execute_task(&self, name: &str) {
        let mut execution = Execution::new(name, &self.node);
        let id = execution.id.to_string();

        match serde_json::to_string(&execution) {
            Ok(record) => {
                if let Err(e) = self
                    .store
                    .begin_execution(
                        &self.execution_key(&id),
                        &record,
                        EXECUTION_TTL_SECS,
                        &self.key_running,
                        &id,
                        &self.history_key(name),
                        self.max_history,
                    )
                    .await
                {
                    tracing::error!(name = %name, id = %id, error = %e, "begin record failed");
                }
            }
            Err(e) => tracing::error!(id = %id, error = %e, "execution encode failed"),
        }

        let job = self.jobs.read().unwrap().get(name).cloned();
        let outcome = match job {
            None => Err(anyhow::anyhow!("task {name} not exist")),
            Some(job) => job
                .run(self.cancel.child_token())
                .await
                .map(|output| truncate_output(output, self.max_output)),
        };

        execution.finish_with(outcome);

        match serde_json::to_string(&execution) {
            Ok(record) => {
                if let Err(e) = self
                    .store
                    .finish_execution(
                        &self.execution_key(&id),
                        &record,
                        EXECUTION_TTL_SECS,
                        &self.key_running,
                        &id,
                    )
                    .await
                {
                    tracing::error!(name = %name, id = %id, error = %e, "finish record failed");
                }
            }
            Err(e) => tracing::error!(id = %id, error = %e, "execution encode failed"),
        }

        tracing::info!(
            name = %name,
            id = %id,
            success = execution.success,
            "execution finished"
        );
    }

    /// Executions currently in flight anywhere in the cluster.
    pub async fn running(&self) -> Result<Vec<Execution>> {
        let ids = self.store.smembers(&self.key_running).await?;
        self.fetch_executions(&ids).await
    }

    /// A page of the job's bounded history, most recent first.
    pub async fn history(&self, name: &str, offset: i64, size: i64) -> Result<Vec<Execution>> {
        let size = if size <= 0 { self.max_history } else { size };
        let ids = self
            .store
            .lrange(&self.history_key(name), offset, offset + size - 1)
            .await?;
        self.fetch_executions(&ids).await
    }

    async fn fetch_executions(&self, ids: &[String]) -> Result<Vec<Execution>> {
        let keys: Vec<String> = ids.iter().map(|id| self.execution_key(id)).collect();
        let values = self.store.mget(&keys).await?;

        let mut executions = Vec::with_capacity(values.len());
        for (id, value) in ids.iter().zip(values) {
            let Some(value) = value else {
                // The record aged out; its id lingers until trimmed.
                continue;
            };
            match serde_json::from_str(&value) {
                Ok(execution) => executions.push(execution),
                Err(e) => tracing::warn!(id = %id, error = %e, "skipping undecodable execution"),
            }
        }
        Ok(executions)
    }

    fn execution_key(&self, id: &str) -> String {
        format!("{}_{}", self.key_execution, id)
    }

    fn history_key(&self, name: &str) -> String {
        format!("{}_{}", self.key_history, name)
    }
}

fn truncate_output(mut output: String, max: usize) -> String {
    if max > 0 && output.len() > max {
        let mut end = max;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        output.truncate(end);
    }
    output
}

/// A job that runs a shell command and captures its output. Non-zero exit
/// is reported as failure, with stderr as the message.
pub struct ShellJob {
    name: String,
    command: String,
}

impl ShellJob {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
impl Job for ShellJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: CancellationToken) -> anyhow::Result<String> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.is_empty() {
                anyhow::bail!("exit code: {:?}", output.status.code())
            } else {
                anyhow::bail!("{}", stderr.trim_end())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_output("hello".to_string(), 3), "hel");
        assert_eq!(truncate_output("héllo".to_string(), 2), "h");
        assert_eq!(truncate_output("ok".to_string(), 10), "ok");
        assert_eq!(truncate_output("ok".to_string(), 0), "ok");
    }

    #[test]
    fn finish_with_captures_outcomes() {
        let mut execution = Execution::new("t1", "node-a");
        execution.finish_with(Ok("done".to_string()));
        assert!(execution.success);
        assert_eq!(execution.result.as_deref(), Some("done"));
        assert!(execution.finished_at.unwrap() >= execution.started_at);

        let mut execution = Execution::new("t1", "node-a");
        execution.finish_with(Err(anyhow::anyhow!("boom")));
        assert!(!execution.success);
        assert_eq!(execution.result.as_deref(), Some("Error: boom"));
    }
}
