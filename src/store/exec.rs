//! Key/set/list storage for execution records, plus the two composite
//! operations that must be atomic per execution id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::Result;

#[async_trait]
pub trait ExecStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;
    async fn del(&self, key: &str) -> Result<()>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn lpush(&self, key: &str, member: &str) -> Result<()>;
    async fn rpop(&self, key: &str) -> Result<Option<String>>;
    async fn llen(&self, key: &str) -> Result<i64>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    /// Record a newly started execution: write the record with its TTL, add
    /// the id to the running set, and rotate it into the bounded history
    /// list. Atomic with respect to `finish_execution` on the same id.
    #[allow(clippy::too_many_arguments)]
    async fn begin_execution(
        &self,
        exe_key: &str,
        record: &str,
        ttl_secs: u64,
        running_key: &str,
        id: &str,
        history_key: &str,
        max_history: i64,
    ) -> Result<()>;

    /// Record a finished execution: rewrite the record and drop the id from
    /// the running set.
    async fn finish_execution(
        &self,
        exe_key: &str,
        record: &str,
        ttl_secs: u64,
        running_key: &str,
        id: &str,
    ) -> Result<()>;
}

// KEYS[1] = execution key, KEYS[2] = running set, KEYS[3] = history list
// ARGV[1] = ttl, ARGV[2] = record, ARGV[3] = id, ARGV[4] = max history
const BEGIN_SCRIPT: &str = r#"
redis.call("SETEX", KEYS[1], ARGV[1], ARGV[2])
redis.call("SADD", KEYS[2], ARGV[3])
redis.call("LTRIM", KEYS[3], 0, ARGV[4] - 2)
redis.call("LPUSH", KEYS[3], ARGV[3])
return 1
"#;

// KEYS[1] = execution key, KEYS[2] = running set
// ARGV[1] = ttl, ARGV[2] = record, ARGV[3] = id
const FINISH_SCRIPT: &str = r#"
redis.call("SETEX", KEYS[1], ARGV[1], ARGV[2])
redis.call("SREM", KEYS[2], ARGV[3])
return 1
"#;

pub struct RedisExecStore {
    conn: AsyncMutex<MultiplexedConnection>,
    begin: redis::Script,
    finish: redis::Script,
}

impl RedisExecStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn: AsyncMutex::new(conn),
            begin: redis::Script::new(BEGIN_SCRIPT),
            finish: redis::Script::new(FINISH_SCRIPT),
        }
    }
}

#[async_trait]
impl ExecStore for RedisExecStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        Ok(conn.get(key).await?)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.lock().await;
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut *conn)
            .await?;
        Ok(values)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        Ok(conn.smembers(key).await?)
    }

    async fn lpush(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.lpush::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        Ok(conn.rpop(key, None).await?)
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        Ok(conn.llen(key).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        Ok(conn.lrange(key, start as isize, stop as isize).await?)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.ltrim::<_, ()>(key, start as isize, stop as isize)
            .await?;
        Ok(())
    }

    async fn begin_execution(
        &self,
        exe_key: &str,
        record: &str,
        ttl_secs: u64,
        running_key: &str,
        id: &str,
        history_key: &str,
        max_history: i64,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: i64 = self
            .begin
            .key(exe_key)
            .key(running_key)
            .key(history_key)
            .arg(ttl_secs)
            .arg(record)
            .arg(id)
            .arg(max_history)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn finish_execution(
        &self,
        exe_key: &str,
        record: &str,
        ttl_secs: u64,
        running_key: &str,
        id: &str,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: i64 = self
            .finish
            .key(exe_key)
            .key(running_key)
            .arg(ttl_secs)
            .arg(record)
            .arg(id)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    kv: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl MemoryInner {
    fn get_live(&self, key: &str) -> Option<String> {
        match self.kv.get(key) {
            Some((value, expiry)) => {
                if expiry.map(|at| Instant::now() >= at).unwrap_or(false) {
                    None
                } else {
                    Some(value.clone())
                }
            }
            None => None,
        }
    }

    fn set_ex(&mut self, key: &str, value: &str, ttl_secs: u64) {
        let expiry = Instant::now() + Duration::from_secs(ttl_secs);
        self.kv
            .insert(key.to_string(), (value.to_string(), Some(expiry)));
    }

    fn ltrim(&mut self, key: &str, start: i64, stop: i64) {
        if let Some(list) = self.lists.get_mut(key) {
            match normalize_range(list.len(), start, stop) {
                Some((lo, hi)) => {
                    list.truncate(hi + 1);
                    for _ in 0..lo {
                        list.pop_front();
                    }
                }
                None => list.clear(),
            }
        }
    }
}

/// Redis-style index normalization: negative indices count from the end,
/// and an empty range yields `None`.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let lo = if start < 0 { (len + start).max(0) } else { start };
    let hi = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if lo > hi || lo >= len || hi < 0 {
        return None;
    }
    Some((lo as usize, hi as usize))
}

/// In-memory execution store with redis-compatible semantics. A single
/// mutex over the whole state doubles as the atomicity guarantee for the
/// composite operations.
#[derive(Default)]
pub struct MemoryExecStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryExecStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecStore for MemoryExecStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.inner.lock().unwrap().set_ex(key, value, ttl_secs);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().get_live(key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let inner = self.inner.lock().unwrap();
        Ok(keys.iter().map(|key| inner.get_live(key)).collect())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.lock().unwrap().kv.remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.inner.lock().unwrap().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lpush(&self, key: &str, member: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(member.to_string());
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .lists
            .get_mut(key)
            .and_then(|list| list.pop_back()))
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .lists
            .get(key)
            .map(|list| list.len() as i64)
            .unwrap_or(0))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match normalize_range(list.len(), start, stop) {
            Some((lo, hi)) => list.iter().skip(lo).take(hi - lo + 1).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.inner.lock().unwrap().ltrim(key, start, stop);
        Ok(())
    }

    async fn begin_execution(
        &self,
        exe_key: &str,
        record: &str,
        ttl_secs: u64,
        running_key: &str,
        id: &str,
        history_key: &str,
        max_history: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.set_ex(exe_key, record, ttl_secs);
        inner
            .sets
            .entry(running_key.to_string())
            .or_default()
            .insert(id.to_string());
        inner.ltrim(history_key, 0, max_history - 2);
        inner
            .lists
            .entry(history_key.to_string())
            .or_default()
            .push_front(id.to_string());
        Ok(())
    }

    async fn finish_execution(
        &self,
        exe_key: &str,
        record: &str,
        ttl_secs: u64,
        running_key: &str,
        id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.set_ex(exe_key, record, ttl_secs);
        if let Some(set) = inner.sets.get_mut(running_key) {
            set.remove(id);
        }
        Ok(())
    }
}
