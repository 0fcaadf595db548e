//! Detector triggering and write-out.
//!
//! Two LevelRunner specializations over the same detector set:
//!
//! - [`DeviceRunner`] triggers acquisition at a point and blocks until
//!   every detector has its frame.
//! - [`DeviceWriter`] persists the acquired frames. Its final level is
//!   left running so the engine can start the next point's motion while
//!   the current point reads out; the engine collects the result with
//!   [`DeviceWriter::await_outstanding`] before starting another write,
//!   keeping the pipeline at depth one.

use crate::device::Detector;
use crate::error::ScanResult;
use crate::events::EventRegistry;
use crate::position::Position;
use crate::runner::{LevelParticipant, LevelRunner};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Default wait for a level of triggers or writes to settle.
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

struct Trigger {
    detector: Arc<dyn Detector>,
}

#[async_trait]
impl LevelParticipant for Trigger {
    fn name(&self) -> &str {
        self.detector.name()
    }

    fn level(&self) -> u32 {
        self.detector.level()
    }

    fn timeout(&self) -> Option<Duration> {
        self.detector.timeout()
    }

    async fn act(&self, position: &Position) -> anyhow::Result<()> {
        self.detector.run(position).await
    }

    async fn cancel(&self) {
        self.detector.abort().await;
    }
}

struct Readout {
    detector: Arc<dyn Detector>,
}

#[async_trait]
impl LevelParticipant for Readout {
    fn name(&self) -> &str {
        self.detector.name()
    }

    fn level(&self) -> u32 {
        self.detector.level()
    }

    fn timeout(&self) -> Option<Duration> {
        self.detector.timeout()
    }

    async fn act(&self, position: &Position) -> anyhow::Result<()> {
        let wrote = self.detector.write(position).await?;
        if !wrote {
            trace!(detector = self.detector.name(), "nothing to write");
        }
        Ok(())
    }

    async fn cancel(&self) {
        self.detector.abort().await;
    }
}

/// Triggers detector acquisition, grouped by level.
pub struct DeviceRunner {
    runner: LevelRunner<Trigger>,
}

impl DeviceRunner {
    /// A runner triggering `detectors`.
    pub fn new(detectors: &[Arc<dyn Detector>], events: Arc<EventRegistry>) -> Self {
        let participants = detectors
            .iter()
            .map(|detector| {
                Arc::new(Trigger {
                    detector: detector.clone(),
                })
            })
            .collect();
        Self {
            runner: LevelRunner::new(participants, DEFAULT_DEVICE_TIMEOUT).with_events(events),
        }
    }

    /// Trigger every detector for `position`, blocking until all frames
    /// are ready.
    pub async fn run(&self, position: &Position) -> ScanResult<()> {
        self.runner.run(position, true).await
    }

    /// Forward cancellation to every detector.
    pub async fn abort(&self) {
        self.runner.abort().await;
    }

    /// Clear cached state for a new run.
    pub async fn reset(&self) {
        self.runner.reset().await;
    }

    /// Release resources at the end of a run.
    pub async fn close(&self) {
        self.runner.close().await;
    }
}

/// Persists detector frames, overlapping the readout of one point with
/// the motion of the next.
pub struct DeviceWriter {
    runner: LevelRunner<Readout>,
}

impl DeviceWriter {
    /// A writer persisting `detectors`.
    pub fn new(detectors: &[Arc<dyn Detector>], events: Arc<EventRegistry>) -> Self {
        let participants = detectors
            .iter()
            .map(|detector| {
                Arc::new(Readout {
                    detector: detector.clone(),
                })
            })
            .collect();
        Self {
            runner: LevelRunner::new(participants, DEFAULT_DEVICE_TIMEOUT).with_events(events),
        }
    }

    /// A writer with no detectors: every write is a no-op and
    /// `await_outstanding` always returns promptly with `None`.
    pub fn empty() -> Self {
        Self {
            runner: LevelRunner::new(Vec::new(), DEFAULT_DEVICE_TIMEOUT),
        }
    }

    /// Start writing `position`'s frames without blocking on the final
    /// level. [`DeviceWriter::await_outstanding`] must collect the
    /// result before the next write starts.
    pub async fn write(&self, position: &Position) -> ScanResult<()> {
        self.runner.run(position, false).await
    }

    /// Wait for the previous point's write, returning the position it
    /// was for, or `None` when nothing is outstanding.
    pub async fn await_outstanding(&self) -> ScanResult<Option<Position>> {
        self.runner.await_outstanding().await
    }

    /// Forward cancellation to every detector and the in-flight write.
    pub async fn abort(&self) {
        self.runner.abort().await;
    }

    /// Clear cached state for a new run.
    pub async fn reset(&self) {
        self.runner.reset().await;
    }

    /// Release resources at the end of a run.
    pub async fn close(&self) {
        self.runner.close().await;
    }
}
