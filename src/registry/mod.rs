//! Cluster-replicated registry of job definitions.
//!
//! The in-memory map is the gossip delegate: actions disseminate through
//! the broadcast queue with best-effort reliability, and the periodic
//! anti-entropy push/pull reconciles any loss. Every mutation is also
//! persisted to a key-value backup so a node can rejoin with nothing but
//! the names found on the shared timeline.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::cron::Schedule;
use crate::error::Result;
use crate::gossip::{BroadcastQueue, Delegate};

/// A job definition, replicated cluster-wide.
///
/// `deleted` is a tombstone: it is monotonic, drives convergence of
/// removals, and entries are never physically dropped from the map while
/// the process lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub spec: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(skip)]
    pub schedule: Option<Schedule>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Entry {
    pub fn new(name: impl Into<String>, spec: impl Into<String>) -> crate::error::Result<Self> {
        let spec = spec.into();
        let schedule = Schedule::parse(&spec)?;
        Ok(Self {
            name: name.into(),
            spec,
            deleted: false,
            schedule: Some(schedule),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Add,
    Remove,
}

/// A gossiped mutation of the entry map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub entry: Entry,
}

impl Action {
    pub fn add(entry: Entry) -> Self {
        Self {
            kind: ActionKind::Add,
            entry,
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Remove,
            entry: Entry {
                name: name.into(),
                spec: String::new(),
                deleted: true,
                schedule: None,
            },
        }
    }
}

/// Durable backup for entries, keyed `<prefix>_<name>`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn write(&self, name: &str, value: &[u8]) -> Result<()>;
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, name: &str) -> Result<()>;
}

pub struct RedisKv {
    prefix: String,
    conn: AsyncMutex<MultiplexedConnection>,
}

impl RedisKv {
    pub fn new(conn: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            conn: AsyncMutex::new(conn),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn write(&self, name: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.set::<_, _, ()>(self.key(name), value).await?;
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.lock().await;
        Ok(conn.get(self.key(name)).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.del::<_, ()>(self.key(name)).await?;
        Ok(())
    }
}

/// In-memory backup store for tests and single-process setups.
#[derive(Default)]
pub struct MemoryKv {
    values: std::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn write(&self, name: &str, value: &[u8]) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().unwrap().get(name).cloned())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.values.lock().unwrap().remove(name);
        Ok(())
    }
}

struct RegistryInner {
    local: RwLock<HashMap<String, Entry>>,
    store: Arc<dyn KvStore>,
    broadcasts: Arc<BroadcastQueue>,
}

/// Handle to the replicated entry map. Cheap to clone; all clones share
/// one map behind a single reader-writer lock.
#[derive(Clone)]
pub struct EntryRegistry {
    inner: Arc<RegistryInner>,
}

impl EntryRegistry {
    pub fn new(store: Arc<dyn KvStore>, broadcasts: Arc<BroadcastQueue>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                local: RwLock::new(HashMap::new()),
                store,
                broadcasts,
            }),
        }
    }

    /// Insert or update an entry, parsing its schedule when missing.
    /// A tombstoned name stays tombstoned: re-adding it is ignored.
    pub fn add(&self, mut entry: Entry) {
        let mut local = self.inner.local.write().unwrap();
        if let Some(existing) = local.get(&entry.name) {
            if existing.deleted {
                tracing::debug!(name = %entry.name, "ignoring add for tombstoned entry");
                return;
            }
        }

        if entry.schedule.is_none() {
            match Schedule::parse(&entry.spec) {
                Ok(schedule) => entry.schedule = Some(schedule),
                Err(e) => {
                    tracing::warn!(name = %entry.name, error = %e, "entry spec does not parse")
                }
            }
        }
        local.insert(entry.name.clone(), entry);
    }

    /// Tombstone an entry. Unknown names are ignored.
    pub fn remove(&self, name: &str) {
        let mut local = self.inner.local.write().unwrap();
        if let Some(entry) = local.get_mut(name) {
            entry.deleted = true;
        }
    }

    pub fn get(&self, name: &str) -> Option<Entry> {
        self.inner.local.read().unwrap().get(name).cloned()
    }

    /// All entries, tombstones included, sorted by name.
    pub fn entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self.inner.local.read().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Enqueue an action for gossip dissemination.
    pub fn broadcast(&self, action: &Action) {
        match serde_json::to_vec(action) {
            Ok(buf) => self.inner.broadcasts.queue(buf),
            Err(e) => tracing::error!(error = %e, "action encode failed"),
        }
    }

    /// Persist an action to the backup store: add writes the entry, remove
    /// deletes its key.
    pub async fn backup(&self, action: &Action) -> Result<()> {
        match action.kind {
            ActionKind::Add => {
                let buf = serde_json::to_vec(&action.entry)?;
                self.inner.store.write(&action.entry.name, &buf).await
            }
            ActionKind::Remove => self.inner.store.delete(&action.entry.name).await,
        }
    }

    /// Rehydrate entries from the backup store. Missing or undecodable
    /// values are skipped; store failures propagate.
    pub async fn restore(&self, names: &[String]) -> Result<()> {
        let mut restored = 0;
        for name in names {
            let Some(buf) = self.inner.store.read(name).await? else {
                tracing::warn!(name = %name, "no backup for timeline entry");
                continue;
            };
            match serde_json::from_slice::<Entry>(&buf) {
                Ok(entry) => {
                    self.add(entry);
                    restored += 1;
                }
                Err(e) => tracing::warn!(name = %name, error = %e, "skipping undecodable backup"),
            }
        }
        tracing::debug!(restored, "registry restored from backup");
        Ok(())
    }
}

impl Delegate for EntryRegistry {
    fn local_state(&self, _join: bool) -> Vec<u8> {
        let local = self.inner.local.read().unwrap();
        serde_json::to_vec(&*local).unwrap_or_default()
    }

    /// Merge rule: insert unknown entries; a remote tombstone wins over a
    /// live local entry; otherwise local state is kept. Commutative and
    /// idempotent, so push/pull converges regardless of exchange order.
    fn merge_remote_state(&self, buf: &[u8], _join: bool) {
        if buf.is_empty() {
            return;
        }
        let remotes: HashMap<String, Entry> = match serde_json::from_slice(buf) {
            Ok(remotes) => remotes,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable remote state");
                return;
            }
        };

        for (name, remote) in remotes {
            match self.get(&name) {
                None => {
                    tracing::debug!(name = %name, "entry added by push/pull");
                    self.add(remote);
                }
                Some(local) if !local.deleted && remote.deleted => {
                    tracing::debug!(name = %name, "entry tombstoned by push/pull");
                    self.remove(&name);
                }
                Some(_) => {}
            }
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.inner.broadcasts.drain(overhead, limit)
    }

    fn notify_msg(&self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let action: Action = match serde_json::from_slice(buf) {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable action");
                return;
            }
        };

        match action.kind {
            ActionKind::Add => {
                tracing::debug!(name = %action.entry.name, "entry added by gossip");
                self.add(action.entry);
            }
            ActionKind::Remove => {
                tracing::debug!(name = %action.entry.name, "entry removed by gossip");
                self.remove(&action.entry.name);
            }
        }
    }
}
