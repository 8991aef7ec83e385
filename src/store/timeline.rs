//! The shared timeline: an ordered set of scheduled firings.
//!
//! Each job has at most one element, keyed by name and scored by a signed
//! unix second: positive when the event is displayed (eligible to fire),
//! negative when paused. Zero is reserved and never stored, so a single
//! range query over positive scores yields the firing candidates.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{CronError, Result};

/// One scheduled firing on the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub time: DateTime<Utc>,
    pub displayed: bool,
}

impl Event {
    /// Times are second precision; sub-second components are dropped.
    pub fn new(name: impl Into<String>, time: DateTime<Utc>, displayed: bool) -> Self {
        Self {
            name: name.into(),
            time: truncate(time),
            displayed,
        }
    }

    pub(crate) fn score(&self) -> i64 {
        encode_score(self.time, self.displayed)
    }
}

fn truncate(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}

fn encode_score(time: DateTime<Utc>, displayed: bool) -> i64 {
    let ts = time.timestamp();
    if displayed {
        ts
    } else {
        -ts
    }
}

fn decode_score(name: &str, score: i64) -> Event {
    let (ts, displayed) = if score > 0 { (score, true) } else { (-score, false) };
    Event {
        name: name.to_string(),
        time: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
        displayed,
    }
}

#[async_trait]
pub trait Timeline: Send + Sync {
    /// Upsert the event for its name.
    async fn add(&self, event: Event) -> Result<()>;
    /// Delete the event for `name`.
    async fn remove(&self, name: &str) -> Result<()>;
    /// Mark the event paused. No-op when already paused.
    async fn hide(&self, name: &str) -> Result<()>;
    /// Mark the event displayed. No-op when already displayed.
    async fn display(&self, name: &str) -> Result<()>;
    /// Compare-and-swap advancement: rewrite the event's time to `to` only
    /// if its stored score still matches `event`. Returns whether this
    /// caller won the swap.
    async fn try_modify(&self, event: &Event, to: DateTime<Utc>) -> Result<bool>;
    async fn find(&self, name: &str) -> Result<Option<Event>>;
    /// The next displayed event, if any. Paused events are never returned.
    async fn find_earliest(&self) -> Result<Option<Event>>;
    /// All displayed events with `time <= until`, ascending.
    async fn fetch_history(&self, until: DateTime<Utc>) -> Result<Vec<Event>>;
    /// Every event, displayed or paused, ascending by score.
    async fn events(&self) -> Result<Vec<Event>>;
}

// KEYS[1] = timeline key
// ARGV[1] = member, ARGV[2] = expected score, ARGV[3] = new score
const TRY_MODIFY_SCRIPT: &str = r#"
if redis.call("ZSCORE", KEYS[1], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call("ZADD", KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

pub struct RedisTimeline {
    key: String,
    conn: AsyncMutex<MultiplexedConnection>,
    script: redis::Script,
}

impl RedisTimeline {
    pub fn new(conn: MultiplexedConnection, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            conn: AsyncMutex::new(conn),
            script: redis::Script::new(TRY_MODIFY_SCRIPT),
        }
    }
}

#[async_trait]
impl Timeline for RedisTimeline {
    async fn add(&self, event: Event) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.zadd::<_, _, _, ()>(&self.key, &event.name, event.score())
            .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.zrem::<_, _, ()>(&self.key, name).await?;
        Ok(())
    }

    async fn hide(&self, name: &str) -> Result<()> {
        match self.find(name).await? {
            None => Err(CronError::EventNotFound(name.to_string())),
            Some(event) if !event.displayed => Ok(()),
            Some(mut event) => {
                event.displayed = false;
                self.add(event).await
            }
        }
    }

    async fn display(&self, name: &str) -> Result<()> {
        match self.find(name).await? {
            None => Err(CronError::EventNotFound(name.to_string())),
            Some(event) if event.displayed => Ok(()),
            Some(mut event) => {
                event.displayed = true;
                self.add(event).await
            }
        }
    }

    async fn try_modify(&self, event: &Event, to: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let modified: i64 = self
            .script
            .key(&self.key)
            .arg(&event.name)
            .arg(event.score())
            .arg(encode_score(truncate(to), event.displayed))
            .invoke_async(&mut *conn)
            .await?;
        Ok(modified == 1)
    }

    async fn find(&self, name: &str) -> Result<Option<Event>> {
        let mut conn = self.conn.lock().await;
        let score: Option<i64> = conn.zscore(&self.key, name).await?;
        Ok(score.map(|s| decode_score(name, s)))
    }

    async fn find_earliest(&self) -> Result<Option<Event>> {
        let mut conn = self.conn.lock().await;
        let res: Vec<(String, i64)> = conn
            .zrangebyscore_limit_withscores(&self.key, "(0", "+inf", 0, 1)
            .await?;
        Ok(res
            .first()
            .map(|(name, score)| decode_score(name, *score)))
    }

    async fn fetch_history(&self, until: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut conn = self.conn.lock().await;
        let res: Vec<(String, i64)> = conn
            .zrangebyscore_withscores(&self.key, "(0", until.timestamp())
            .await?;
        Ok(res
            .iter()
            .map(|(name, score)| decode_score(name, *score))
            .collect())
    }

    async fn events(&self) -> Result<Vec<Event>> {
        let mut conn = self.conn.lock().await;
        let res: Vec<(String, i64)> = conn
            .zrangebyscore_withscores(&self.key, "-inf", "+inf")
            .await?;
        Ok(res
            .iter()
            .map(|(name, score)| decode_score(name, *score))
            .collect())
    }
}

/// In-memory timeline with the same semantics, used by tests and
/// single-process setups. The whole map sits behind one mutex, which also
/// makes `try_modify` atomic.
#[derive(Default)]
pub struct MemoryTimeline {
    scores: Mutex<HashMap<String, i64>>,
}

impl MemoryTimeline {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Timeline for MemoryTimeline {
    async fn add(&self, event: Event) -> Result<()> {
        let mut scores = self.scores.lock().unwrap();
        scores.insert(event.name.clone(), event.score());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut scores = self.scores.lock().unwrap();
        scores.remove(name);
        Ok(())
    }

    async fn hide(&self, name: &str) -> Result<()> {
        let mut scores = self.scores.lock().unwrap();
        match scores.get(name) {
            None => Err(CronError::EventNotFound(name.to_string())),
            Some(score) => {
                let flipped = -score.abs();
                scores.insert(name.to_string(), flipped);
                Ok(())
            }
        }
    }

    async fn display(&self, name: &str) -> Result<()> {
        let mut scores = self.scores.lock().unwrap();
        match scores.get(name) {
            None => Err(CronError::EventNotFound(name.to_string())),
            Some(score) => {
                let flipped = score.abs();
                scores.insert(name.to_string(), flipped);
                Ok(())
            }
        }
    }

    async fn try_modify(&self, event: &Event, to: DateTime<Utc>) -> Result<bool> {
        let mut scores = self.scores.lock().unwrap();
        if scores.get(&event.name) != Some(&event.score()) {
            return Ok(false);
        }
        scores.insert(
            event.name.clone(),
            encode_score(truncate(to), event.displayed),
        );
        Ok(true)
    }

    async fn find(&self, name: &str) -> Result<Option<Event>> {
        let scores = self.scores.lock().unwrap();
        Ok(scores.get(name).map(|score| decode_score(name, *score)))
    }

    async fn find_earliest(&self) -> Result<Option<Event>> {
        let scores = self.scores.lock().unwrap();
        Ok(scores
            .iter()
            .filter(|(_, score)| **score > 0)
            .min_by_key(|(_, score)| **score)
            .map(|(name, score)| decode_score(name, *score)))
    }

    async fn fetch_history(&self, until: DateTime<Utc>) -> Result<Vec<Event>> {
        let scores = self.scores.lock().unwrap();
        let mut res: Vec<(String, i64)> = scores
            .iter()
            .filter(|(_, score)| **score > 0 && **score <= until.timestamp())
            .map(|(name, score)| (name.clone(), *score))
            .collect();
        res.sort_by_key(|(_, score)| *score);
        Ok(res
            .iter()
            .map(|(name, score)| decode_score(name, *score))
            .collect())
    }

    async fn events(&self) -> Result<Vec<Event>> {
        let scores = self.scores.lock().unwrap();
        let mut res: Vec<(String, i64)> = scores
            .iter()
            .map(|(name, score)| (name.clone(), *score))
            .collect();
        res.sort_by_key(|(_, score)| *score);
        Ok(res
            .iter()
            .map(|(name, score)| decode_score(name, *score))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    #[test]
    fn score_encodes_visibility_in_sign() {
        assert_eq!(encode_score(at(100), true), 100);
        assert_eq!(encode_score(at(100), false), -100);

        let event = decode_score("t1", -100);
        assert_eq!(event.time, at(100));
        assert!(!event.displayed);
        let event = decode_score("t1", 100);
        assert!(event.displayed);
    }

    #[tokio::test]
    async fn one_entry_per_name() {
        let timeline = MemoryTimeline::new();
        timeline.add(Event::new("t1", at(100), true)).await.unwrap();
        timeline.add(Event::new("t1", at(200), false)).await.unwrap();

        let events = timeline.events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time, at(200));
        assert!(!events[0].displayed);
    }

    #[tokio::test]
    async fn hide_and_display_are_idempotent() {
        let timeline = MemoryTimeline::new();
        timeline.add(Event::new("t1", at(100), true)).await.unwrap();

        timeline.hide("t1").await.unwrap();
        timeline.hide("t1").await.unwrap();
        let event = timeline.find("t1").await.unwrap().unwrap();
        assert!(!event.displayed);
        assert_eq!(event.time, at(100));

        timeline.display("t1").await.unwrap();
        timeline.display("t1").await.unwrap();
        let event = timeline.find("t1").await.unwrap().unwrap();
        assert!(event.displayed);
        assert_eq!(event.time, at(100));
    }

    #[tokio::test]
    async fn hide_unknown_event_fails() {
        let timeline = MemoryTimeline::new();
        assert!(matches!(
            timeline.hide("missing").await,
            Err(CronError::EventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn try_modify_wins_once() {
        let timeline = MemoryTimeline::new();
        let event = Event::new("t1", at(100), true);
        timeline.add(event.clone()).await.unwrap();

        assert!(timeline.try_modify(&event, at(200)).await.unwrap());
        let advanced = timeline.find("t1").await.unwrap().unwrap();
        assert_eq!(advanced.time, at(200));
        assert!(advanced.displayed);

        // Same expected state again: someone else already advanced it.
        assert!(!timeline.try_modify(&event, at(300)).await.unwrap());
        assert_eq!(
            timeline.find("t1").await.unwrap().unwrap().time,
            at(200)
        );
    }

    #[tokio::test]
    async fn try_modify_preserves_visibility_sign() {
        let timeline = MemoryTimeline::new();
        let event = Event::new("t1", at(100), false);
        timeline.add(event.clone()).await.unwrap();

        assert!(timeline.try_modify(&event, at(200)).await.unwrap());
        let advanced = timeline.find("t1").await.unwrap().unwrap();
        assert!(!advanced.displayed);
        assert_eq!(advanced.time, at(200));
    }

    #[tokio::test]
    async fn find_earliest_skips_paused() {
        let timeline = MemoryTimeline::new();
        timeline.add(Event::new("paused", at(50), false)).await.unwrap();
        timeline.add(Event::new("later", at(300), true)).await.unwrap();
        timeline.add(Event::new("sooner", at(200), true)).await.unwrap();

        let earliest = timeline.find_earliest().await.unwrap().unwrap();
        assert_eq!(earliest.name, "sooner");
        assert!(earliest.displayed);
    }

    #[tokio::test]
    async fn find_earliest_empty_when_all_paused() {
        let timeline = MemoryTimeline::new();
        timeline.add(Event::new("t1", at(50), false)).await.unwrap();
        assert!(timeline.find_earliest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_history_excludes_paused_and_future() {
        let timeline = MemoryTimeline::new();
        timeline.add(Event::new("due", at(100), true)).await.unwrap();
        timeline.add(Event::new("paused", at(100), false)).await.unwrap();
        timeline.add(Event::new("future", at(500), true)).await.unwrap();

        let expired = timeline.fetch_history(at(200)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "due");
    }

    #[tokio::test]
    async fn events_returns_everything() {
        let timeline = MemoryTimeline::new();
        timeline.add(Event::new("a", at(100), true)).await.unwrap();
        timeline.add(Event::new("b", at(200), false)).await.unwrap();

        let events = timeline.events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.name == "b" && !e.displayed));
    }
}
