//! Exposure time reconciliation.
//!
//! Before each move the engine asks the [`ExposureTimeManager`] to bring
//! detector exposure times in line with the point's demand. Most points
//! demand the same time as the last one, so most calls return without
//! touching any hardware; when a detector does differ by more than the
//! tolerance, its model is cloned, updated and re-applied through the
//! usual level-grouped concurrent run. Reconfiguration is normally fast,
//! but some detector pipelines stop and restart on a time change, hence
//! the shared timeout machinery.

use crate::device::Detector;
use crate::error::ScanResult;
use crate::events::EventRegistry;
use crate::position::Position;
use crate::runner::{LevelParticipant, LevelRunner};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Exposure times closer than this to the demand are left alone.
pub const EXPOSURE_TOLERANCE: f64 = 1e-4;

/// Default wait for a level of reconfigurations to settle.
pub const DEFAULT_EXPOSURE_TIMEOUT: Duration = Duration::from_secs(60);

struct ExposureUpdate {
    detector: Arc<dyn Detector>,
}

impl ExposureUpdate {
    fn differs(&self, demand: f64) -> bool {
        match self.detector.model() {
            Some(model) => (model.exposure_time - demand).abs() >= EXPOSURE_TOLERANCE,
            None => false,
        }
    }
}

#[async_trait]
impl LevelParticipant for ExposureUpdate {
    fn name(&self) -> &str {
        self.detector.name()
    }

    fn level(&self) -> u32 {
        self.detector.level()
    }

    fn timeout(&self) -> Option<Duration> {
        self.detector.timeout()
    }

    fn participates(&self, position: &Position) -> bool {
        match position.exposure_time() {
            Some(demand) if demand > 0.0 => self.differs(demand),
            _ => false,
        }
    }

    async fn act(&self, position: &Position) -> anyhow::Result<()> {
        let demand = position
            .exposure_time()
            .ok_or_else(|| anyhow::anyhow!("position carries no exposure time"))?;
        let mut model = self
            .detector
            .model()
            .ok_or_else(|| anyhow::anyhow!("detector carries no model"))?;
        debug!(
            detector = self.detector.name(),
            from = model.exposure_time,
            to = demand,
            "changing exposure time"
        );
        model.exposure_time = demand;
        self.detector.configure(model).await
    }

    async fn cancel(&self) {
        self.detector.abort().await;
    }
}

/// Reconfigures detectors whose exposure time drifted from the demand.
pub struct ExposureTimeManager {
    runner: LevelRunner<ExposureUpdate>,
}

impl ExposureTimeManager {
    /// A manager over the detectors in `detectors` that carry a model.
    pub fn new(detectors: &[Arc<dyn Detector>], events: Arc<EventRegistry>) -> Self {
        Self::for_levels(detectors, None, events)
    }

    /// Like [`ExposureTimeManager::new`], restricted to detectors on the
    /// given levels.
    pub fn for_levels(
        detectors: &[Arc<dyn Detector>],
        levels: Option<&[u32]>,
        events: Arc<EventRegistry>,
    ) -> Self {
        let participants = detectors
            .iter()
            .filter(|d| d.model().is_some())
            .filter(|d| levels.map_or(true, |ls| ls.contains(&d.level())))
            .map(|detector| {
                Arc::new(ExposureUpdate {
                    detector: detector.clone(),
                })
            })
            .collect();
        Self {
            runner: LevelRunner::new(participants, DEFAULT_EXPOSURE_TIMEOUT).with_events(events),
        }
    }

    /// Bring detectors in line with the exposure time demanded at
    /// `position`. A no-op when the point demands no positive time, no
    /// detectors are managed, or every managed detector is already
    /// within tolerance.
    pub async fn set_exposure_time(&self, position: &Position) -> ScanResult<()> {
        let Some(demand) = position.exposure_time() else {
            return Ok(());
        };
        if demand <= 0.0 || self.runner.is_empty() {
            return Ok(());
        }
        if !self
            .runner
            .participants()
            .iter()
            .any(|p| p.differs(demand))
        {
            return Ok(());
        }
        self.runner.run(position, true).await
    }

    /// Clear cached state for a new run.
    pub async fn reset(&self) {
        self.runner.reset().await;
    }
}
