//! The agent ties the pieces together on one node: scheduler, executor,
//! gossip membership, and the admin HTTP server.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admin;
use crate::config::{Conf, GossipNetwork};
use crate::cron::Cron;
use crate::error::{CronError, Result};
use crate::executor::{Execution, Executor, Job};
use crate::gossip::{BroadcastQueue, Gossip, GossipConfig, Member, MemberState};
use crate::registry::{Action, EntryRegistry, KvStore, RedisKv};
use crate::store::{ExecStore, RedisExecStore, RedisTimeline, Timeline};

const EXECUTION_BUFFER: usize = 1024;

/// One row of the schedule listing.
#[derive(Debug, Clone, Serialize)]
pub struct EntryRecord {
    pub name: String,
    pub spec: String,
    /// Next fire time, milliseconds since epoch.
    pub next: i64,
    pub displayed: bool,
}

/// One page of a job's execution history.
#[derive(Debug, Serialize)]
pub struct HistoryPage {
    pub executions: Vec<Execution>,
    pub total: i64,
}

/// Receivers feeding the agent's background loops; pass them back into
/// [`Agent::run`].
pub struct AgentRx {
    pub action_rx: mpsc::Receiver<Action>,
    pub execution_rx: mpsc::Receiver<String>,
}

pub struct Agent {
    conf: Conf,
    cron: Cron,
    executor: Arc<Executor>,
    gossip: Option<Gossip>,
    execution_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Agent {
    /// Construct a fully wired agent against redis and a live gossip
    /// member. Failures here are fatal startup errors.
    pub async fn new(conf: Conf, cancel: CancellationToken) -> Result<(Arc<Self>, AgentRx)> {
        let client = redis::Client::open(conf.base.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;

        let timeline: Arc<dyn Timeline> = Arc::new(RedisTimeline::new(
            conn.clone(),
            conf.custom.key_timeline.clone(),
        ));
        let exec_store: Arc<dyn ExecStore> = Arc::new(RedisExecStore::new(conn.clone()));
        let kv: Arc<dyn KvStore> = Arc::new(RedisKv::new(conn, conf.custom.key_entry.clone()));

        // The registry must exist before the gossip layer so the delegate
        // hooks are live from the first exchange.
        let cluster_size = Arc::new(AtomicUsize::new(1));
        let broadcasts = Arc::new(BroadcastQueue::new(cluster_size.clone(), 4));
        let registry = EntryRegistry::new(kv, broadcasts);

        let gossip_config = gossip_config(&conf)?;
        let gossip = Gossip::new(gossip_config, Arc::new(registry.clone()), cluster_size).await?;

        Ok(Self::from_parts(
            conf,
            cancel,
            timeline,
            exec_store,
            registry,
            Some(gossip),
        ))
    }

    /// Assemble an agent from pre-built collaborators. Used by `new` and
    /// by tests running against in-memory stores without a gossip member.
    pub fn from_parts(
        conf: Conf,
        cancel: CancellationToken,
        timeline: Arc<dyn Timeline>,
        exec_store: Arc<dyn ExecStore>,
        registry: EntryRegistry,
        gossip: Option<Gossip>,
    ) -> (Arc<Self>, AgentRx) {
        let (execution_tx, execution_rx) = mpsc::channel(EXECUTION_BUFFER);
        let (cron, action_rx) = Cron::new(
            registry,
            timeline,
            execution_tx.clone(),
            cancel.child_token(),
        );
        let executor = Arc::new(Executor::new(
            exec_store,
            conf.gossip.node_name.clone(),
            &conf.custom.key_executor,
            conf.custom.max_history_num,
            conf.custom.max_output_length,
            cancel.child_token(),
        ));

        let agent = Arc::new(Self {
            conf,
            cron,
            executor,
            gossip,
            execution_tx,
            cancel,
        });
        (
            agent,
            AgentRx {
                action_rx,
                execution_rx,
            },
        )
    }

    pub fn cron(&self) -> &Cron {
        &self.cron
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Join the gossip cluster through the given seed addresses.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        match &self.gossip {
            Some(gossip) => gossip.join(seeds).await,
            None => Ok(0),
        }
    }

    /// Run all node subsystems: the scheduler loop, the executor consumer,
    /// and the admin HTTP server. Returns after a graceful shutdown.
    pub async fn run(self: Arc<Self>, rx: AgentRx) -> Result<()> {
        if let Err(e) = self.cron.restore().await {
            tracing::error!(error = %e, "restore failed");
        }

        let cron = self.cron.clone();
        tokio::spawn(async move {
            cron.run(rx.action_rx).await;
        });

        let executor = self.executor.clone();
        tokio::spawn(async move {
            executor.consume(rx.execution_rx).await;
        });

        let addr = self.conf.base.http_socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "admin http server listening");

        let app = admin::router(self.clone());
        let shutdown = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        self.close().await;
        Ok(())
    }

    async fn close(&self) {
        self.executor.close().await;
        if let Some(gossip) = &self.gossip {
            gossip.shutdown().await;
        }
        tracing::info!("agent shutdown complete");
    }

    pub fn register_job(&self, job: Arc<dyn Job>) -> Result<()> {
        if job.name().is_empty() {
            return Err(CronError::JobNameEmpty);
        }
        self.executor.register(job);
        Ok(())
    }

    pub async fn add(&self, spec: &str, name: &str) -> Result<()> {
        self.validate(name)?;
        self.cron.add(spec, name).await
    }

    pub async fn active(&self, name: &str) -> Result<()> {
        self.validate(name)?;
        self.cron.activate(name).await
    }

    pub async fn pause(&self, name: &str) -> Result<()> {
        self.validate(name)?;
        self.cron.pause(name).await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.validate(name)?;
        self.cron.remove(name).await
    }

    /// Dispatch one ad-hoc run, bypassing the timeline entirely.
    pub async fn execute_once(&self, name: &str) -> Result<()> {
        self.validate(name)?;
        self.execution_tx
            .send(name.to_string())
            .await
            .map_err(|_| CronError::Internal("executor stopped".to_string()))
    }

    pub async fn schedule(&self) -> Result<Vec<EntryRecord>> {
        let events = self.cron.events().await?;
        Ok(events
            .into_iter()
            .map(|event| {
                let spec = self
                    .cron
                    .registry()
                    .get(&event.name)
                    .map(|entry| entry.spec)
                    .unwrap_or_default();
                EntryRecord {
                    name: event.name,
                    spec,
                    next: event.time.timestamp_millis(),
                    displayed: event.displayed,
                }
            })
            .collect())
    }

    pub async fn running(&self) -> Result<Vec<Execution>> {
        self.executor.running().await
    }

    pub async fn history(&self, name: &str, offset: i64, size: i64) -> Result<HistoryPage> {
        if name.is_empty() {
            return Err(CronError::JobNameEmpty);
        }
        let executions = self.executor.history(name, offset, size).await?;
        Ok(HistoryPage {
            executions,
            total: self.executor.max_history(),
        })
    }

    pub fn jobs(&self) -> Vec<String> {
        self.executor.jobs()
    }

    /// Cluster membership snapshot. Without a gossip member (tests,
    /// single-process setups) the node reports only itself.
    pub fn members(&self) -> Vec<Member> {
        match &self.gossip {
            Some(gossip) => gossip.members(),
            None => vec![Member {
                name: self.conf.gossip.node_name.clone(),
                addr: SocketAddr::from(([127, 0, 0, 1], self.conf.gossip.bind_port)),
                state: MemberState::Alive,
            }],
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CronError::JobNameEmpty);
        }
        if !self.executor.contains(name) {
            return Err(CronError::JobNotSupported);
        }
        Ok(())
    }
}

fn gossip_config(conf: &Conf) -> Result<GossipConfig> {
    let bind: SocketAddr = format!("{}:{}", conf.gossip.bind_addr, conf.gossip.bind_port)
        .parse()
        .map_err(|_| {
            CronError::Gossip(format!("invalid bind address: {}", conf.gossip.bind_addr))
        })?;

    let name = conf.gossip.node_name.clone();
    let mut config = match conf.gossip.network {
        GossipNetwork::Lan => GossipConfig::lan(name, bind),
        GossipNetwork::Wan => GossipConfig::wan(name, bind),
        GossipNetwork::Local => GossipConfig::local(name, bind),
    };

    if !conf.gossip.advertise_addr.is_empty() {
        let advertise = conf.gossip.advertise_addr.parse().map_err(|_| {
            CronError::Gossip(format!(
                "invalid advertise address: {}",
                conf.gossip.advertise_addr
            ))
        })?;
        config = config.with_advertise_addr(advertise);
    }
    Ok(config)
}
