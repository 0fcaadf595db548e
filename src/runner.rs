//! Level-grouped concurrent execution.
//!
//! [`LevelRunner`] is the primitive underneath motion, detector
//! triggering, write-out and exposure reconciliation. Participants carry
//! an integer level; for one position the runner launches every
//! participant of the lowest remaining level concurrently, waits for the
//! whole group to settle within a timeout, then proceeds to the next
//! level in ascending order.
//!
//! The final level of a run may be left in flight (`block = false`).
//! The runner records the position the detached group belongs to, and
//! [`LevelRunner::await_outstanding`] hands it back once the group has
//! settled. Exactly one detached group may be outstanding at a time,
//! which is what keeps the engine's write pipeline at depth one.
//!
//! # Failure policy
//!
//! A failing task never leaves its siblings running unobserved: the
//! runner joins every task of the level before the first failure
//! propagates. A level that misses its timeout has all remaining tasks
//! cancelled and joined before the run fails.

use crate::device::DEFAULT_LEVEL;
use crate::error::{ScanError, ScanResult};
use crate::events::{EventRegistry, ScanEvent};
use crate::position::Position;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A participant in a level-grouped run.
#[async_trait]
pub trait LevelParticipant: Send + Sync {
    /// Participant name, used in error reports and logs.
    fn name(&self) -> &str;

    /// Execution level. Lower levels run first; equal levels run
    /// concurrently.
    fn level(&self) -> u32 {
        DEFAULT_LEVEL
    }

    /// Longest this participant's `act` may take. The level waits for
    /// the maximum over its participants, falling back to the runner
    /// default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether this participant needs to act at `position` at all. A
    /// declining participant is not spawned.
    fn participates(&self, _position: &Position) -> bool {
        true
    }

    /// Act on the position. Runs on its own task, concurrently with the
    /// rest of the level.
    async fn act(&self, position: &Position) -> anyhow::Result<()>;

    /// Best-effort cancellation of an in-flight `act`.
    async fn cancel(&self) {}
}

struct Pending {
    position: Position,
    handle: JoinHandle<ScanResult<()>>,
}

/// Runs participants grouped by level: concurrent within a level,
/// sequential in ascending level order.
pub struct LevelRunner<P: LevelParticipant + 'static> {
    participants: Vec<Arc<P>>,
    default_timeout: Duration,
    cache_groups: bool,
    groups: Mutex<Option<Vec<(u32, Vec<Arc<P>>)>>>,
    pending: tokio::sync::Mutex<Option<Pending>>,
    events: Option<Arc<EventRegistry>>,
}

impl<P: LevelParticipant + 'static> LevelRunner<P> {
    /// A runner over `participants` with the given default level timeout.
    pub fn new(participants: Vec<Arc<P>>, default_timeout: Duration) -> Self {
        Self {
            participants,
            default_timeout,
            cache_groups: true,
            groups: Mutex::new(None),
            pending: tokio::sync::Mutex::new(None),
            events: None,
        }
    }

    /// Attach the lifecycle registry for level-start/level-end events.
    pub fn with_events(mut self, events: Arc<EventRegistry>) -> Self {
        self.events = Some(events);
        self
    }

    /// Disable the per-run level-group cache, regrouping on every call.
    pub fn with_caching_disabled(mut self) -> Self {
        self.cache_groups = false;
        self
    }

    /// Whether the runner has no participants at all.
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// The participants, in registration order.
    pub fn participants(&self) -> &[Arc<P>] {
        &self.participants
    }

    fn grouped(&self) -> Vec<(u32, Vec<Arc<P>>)> {
        if self.cache_groups {
            if let Some(groups) = self.groups.lock().as_ref() {
                return groups.clone();
            }
        }
        let mut map: BTreeMap<u32, Vec<Arc<P>>> = BTreeMap::new();
        for p in &self.participants {
            map.entry(p.level()).or_default().push(p.clone());
        }
        let groups: Vec<(u32, Vec<Arc<P>>)> = map.into_iter().collect();
        if self.cache_groups {
            *self.groups.lock() = Some(groups.clone());
        }
        groups
    }

    fn level_timeout(&self, members: &[Arc<P>]) -> Duration {
        members
            .iter()
            .filter_map(|p| p.timeout())
            .max()
            .unwrap_or(self.default_timeout)
    }

    /// Run every participating member for `position`.
    ///
    /// With `block = true` the call returns once every level has
    /// settled. With `block = false` the final level is left running and
    /// must be collected with [`LevelRunner::await_outstanding`] before
    /// the next non-blocking run.
    pub async fn run(&self, position: &Position, block: bool) -> ScanResult<()> {
        if !block && self.pending.lock().await.is_some() {
            return Err(ScanError::PipelineBusy);
        }

        let levels: Vec<(u32, Vec<Arc<P>>)> = self
            .grouped()
            .into_iter()
            .map(|(level, members)| {
                let acting: Vec<Arc<P>> = members
                    .into_iter()
                    .filter(|p| p.participates(position))
                    .collect();
                (level, acting)
            })
            .filter(|(_, members)| !members.is_empty())
            .collect();

        let count = levels.len();
        for (index, (level, members)) in levels.into_iter().enumerate() {
            let timeout = self.level_timeout(&members);
            if let Some(events) = &self.events {
                events.dispatch(&ScanEvent::LevelStart { level });
            }
            debug!(level, participants = members.len(), "running level");

            let tasks: Vec<(Arc<P>, JoinHandle<anyhow::Result<()>>)> = members
                .iter()
                .map(|p| {
                    let participant = p.clone();
                    let position = position.clone();
                    let handle =
                        tokio::spawn(async move { participant.act(&position).await });
                    (p.clone(), handle)
                })
                .collect();

            let last = index + 1 == count;
            if block || !last {
                settle_level(level, tasks, timeout, self.events.clone()).await?;
            } else {
                let events = self.events.clone();
                let watcher =
                    tokio::spawn(settle_level(level, tasks, timeout, events));
                *self.pending.lock().await = Some(Pending {
                    position: position.clone(),
                    handle: watcher,
                });
            }
        }
        Ok(())
    }

    /// Wait for an outstanding non-blocking run, returning the position
    /// it was for, or `None` when nothing is in flight.
    pub async fn await_outstanding(&self) -> ScanResult<Option<Position>> {
        let pending = self.pending.lock().await.take();
        let Some(pending) = pending else {
            return Ok(None);
        };
        match pending.handle.await {
            Ok(Ok(())) => Ok(Some(pending.position)),
            Ok(Err(e)) => Err(e),
            Err(join) if join.is_cancelled() => Err(ScanError::Aborted),
            Err(_) => Err(ScanError::TaskFailed {
                name: "level watcher".into(),
            }),
        }
    }

    /// Best-effort cancellation of all outstanding work. Never fails.
    pub async fn abort(&self) {
        for p in &self.participants {
            p.cancel().await;
        }
        if let Some(pending) = self.pending.lock().await.take() {
            pending.handle.abort();
        }
    }

    /// Clear cached level groupings and any stored result, making the
    /// runner reusable for a new run.
    pub async fn reset(&self) {
        *self.groups.lock() = None;
        if let Some(pending) = self.pending.lock().await.take() {
            pending.handle.abort();
        }
    }

    /// Release resources at the end of a run. Cancels any leftover
    /// in-flight group quietly.
    pub async fn close(&self) {
        if let Some(pending) = self.pending.lock().await.take() {
            warn!(position = %pending.position, "closing with a write still in flight");
            pending.handle.abort();
            let _ = pending.handle.await;
        }
    }
}

/// Join every task of one level, bounded by `limit`.
///
/// Runs either inline (blocking levels) or on a watcher task (the
/// detached final level), so it owns everything it touches.
async fn settle_level<P: LevelParticipant + 'static>(
    level: u32,
    tasks: Vec<(Arc<P>, JoinHandle<anyhow::Result<()>>)>,
    limit: Duration,
    events: Option<Arc<EventRegistry>>,
) -> ScanResult<()> {
    let deadline = Instant::now() + limit;
    let mut tasks = tasks;
    let mut first_error: Option<ScanError> = None;

    let mut joined = 0;
    while joined < tasks.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = {
            let (_, handle) = &mut tasks[joined];
            tokio::time::timeout(remaining, handle).await
        };
        match result {
            Err(_) => {
                // Deadline passed: cancel whatever is still running and
                // join it before reporting, so nothing is left behind.
                for (_, handle) in &tasks[joined..] {
                    handle.abort();
                }
                for (participant, _) in &tasks {
                    participant.cancel().await;
                }
                for (_, handle) in &mut tasks[joined..] {
                    let _ = handle.await;
                }
                warn!(level, ?limit, "level timed out");
                return Err(ScanError::LevelTimeout { level, timeout: limit });
            }
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                let name = tasks[joined].0.name();
                warn!(level, participant = name, error = %e, "participant failed");
                if first_error.is_none() {
                    first_error = Some(ScanError::participant(name, &e));
                }
            }
            Ok(Err(_join)) => {
                let name = tasks[joined].0.name().to_string();
                if first_error.is_none() {
                    first_error = Some(ScanError::TaskFailed { name });
                }
            }
        }
        joined += 1;
    }

    if let Some(error) = first_error {
        return Err(error);
    }
    if let Some(events) = &events {
        events.dispatch(&ScanEvent::LevelEnd { level });
    }
    Ok(())
}
