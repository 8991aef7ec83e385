//! The per-node scheduler loop: a single task that sleeps until the
//! earliest displayed event, advances expired events with a
//! compare-and-swap on the shared timeline, and dispatches each firing it
//! wins to the local executor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::registry::{Action, ActionKind, Entry, EntryRegistry};
use crate::store::{Event, Timeline};

/// Poll interval when the timeline holds no displayed event. Bounds the
/// latency between a remote add arriving via gossip and this node
/// observing it, even if the local action channel stays quiet.
const EMPTY_TIMELINE_POLL: Duration = Duration::from_secs(5);

const ACTION_BUFFER: usize = 64;

/// Handle to the scheduler. Cheap to clone; `run` consumes the receiver
/// returned by [`Cron::new`] and must be spawned exactly once.
#[derive(Clone)]
pub struct Cron {
    registry: EntryRegistry,
    timeline: Arc<dyn Timeline>,
    action_tx: mpsc::Sender<Action>,
    execution_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Cron {
    pub fn new(
        registry: EntryRegistry,
        timeline: Arc<dyn Timeline>,
        execution_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Action>) {
        let (action_tx, action_rx) = mpsc::channel(ACTION_BUFFER);
        let cron = Self {
            registry,
            timeline,
            action_tx,
            execution_tx,
            cancel,
        };
        (cron, action_rx)
    }

    /// Rehydrate the registry for every name present on the timeline, so
    /// the in-memory entries match the persisted schedule after a restart.
    pub async fn restore(&self) -> Result<()> {
        let events = self.timeline.events().await?;
        let names: Vec<String> = events.into_iter().map(|e| e.name).collect();
        self.registry.restore(&names).await?;
        tracing::debug!(count = names.len(), "restored events from timeline");
        Ok(())
    }

    /// Register a job schedule. The new event starts paused; call
    /// [`Cron::activate`] to begin firing.
    pub async fn add(&self, spec: &str, name: &str) -> Result<()> {
        let entry = Entry::new(name, spec)?;
        let action = Action::add(entry);

        self.registry.backup(&action).await?;
        self.timeline
            .add(Event::new(name, Utc::now(), false))
            .await?;
        self.send_action(action).await
    }

    /// Drop the job's timeline event and tombstone its entry cluster-wide.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.timeline.remove(name).await?;
        let action = Action::remove(name);
        self.registry.backup(&action).await?;
        self.send_action(action).await
    }

    /// Visibility lives on the shared timeline, so pause and activate need
    /// no broadcast: peers observe the flip on their next timeline read.
    pub async fn pause(&self, name: &str) -> Result<()> {
        self.timeline.hide(name).await
    }

    pub async fn activate(&self, name: &str) -> Result<()> {
        self.timeline.display(name).await
    }

    pub async fn events(&self) -> Result<Vec<Event>> {
        self.timeline.events().await
    }

    pub fn registry(&self) -> &EntryRegistry {
        &self.registry
    }

    async fn send_action(&self, action: Action) -> Result<()> {
        self.action_tx
            .send(action)
            .await
            .map_err(|_| CronError::Internal("scheduler loop stopped".to_string()))
    }

    /// The scheduler loop. Every iteration re-reads the timeline and
    /// resets the timer, so transient store failures self-heal once the
    /// store recovers.
    pub async fn run(&self, mut action_rx: mpsc::Receiver<Action>) {
        loop {
            let sleep_for = match self.timeline.find_earliest().await {
                Ok(Some(event)) => (event.time - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO),
                Ok(None) => EMPTY_TIMELINE_POLL,
                Err(e) => {
                    tracing::error!(error = %e, "timeline read failed");
                    EMPTY_TIMELINE_POLL
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    let now = Utc::now();
                    if let Err(e) = self.do_expired(now).await {
                        tracing::error!(error = %e, "expiry scan failed");
                    }
                }
                action = action_rx.recv() => match action {
                    Some(action) => self.apply(action),
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        tracing::info!("scheduler loop stopped");
    }

    /// Apply a locally initiated action to the registry and hand it to the
    /// gossip layer. Channel arrival order is also broadcast order.
    fn apply(&self, action: Action) {
        match action.kind {
            ActionKind::Add => {
                tracing::debug!(name = %action.entry.name, spec = %action.entry.spec, "add");
                self.registry.add(action.entry.clone());
            }
            ActionKind::Remove => {
                tracing::debug!(name = %action.entry.name, "remove");
                self.registry.remove(&action.entry.name);
            }
        }
        self.registry.broadcast(&action);
    }

    /// Advance every displayed event with `time <= now`. Whoever wins the
    /// CAS for an event dispatches it; losing the race is the normal
    /// cluster hand-off, not an error.
    async fn do_expired(&self, now: DateTime<Utc>) -> Result<()> {
        let expired = self.timeline.fetch_history(now).await?;

        for event in expired {
            let Some(entry) = self.registry.get(&event.name) else {
                continue;
            };
            if entry.deleted {
                continue;
            }
            let Some(schedule) = entry.schedule.as_ref() else {
                tracing::warn!(name = %event.name, "entry has no parseable schedule");
                continue;
            };

            let Some(mut next) = schedule.next(event.time) else {
                tracing::warn!(name = %event.name, "schedule has no upcoming fire");
                continue;
            };
            // Long-expired entry (e.g. the node slept): realign to now
            // instead of burst-firing the backlog.
            if now > next {
                match schedule.next(now) {
                    Some(realigned) => next = realigned,
                    None => continue,
                }
            }

            match self.timeline.try_modify(&event, next).await {
                Ok(true) => {
                    if self.execution_tx.try_send(event.name.clone()).is_err() {
                        tracing::warn!(name = %event.name, "executor backlogged, dropping dispatch");
                    } else {
                        tracing::info!(name = %event.name, next = %next, "dispatched");
                    }
                }
                Ok(false) => {
                    tracing::debug!(name = %event.name, "another node won the dispatch");
                }
                Err(e) => {
                    tracing::error!(name = %event.name, error = %e, "advance failed");
                }
            }
        }
        Ok(())
    }
}
