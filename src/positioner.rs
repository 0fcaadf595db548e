//! Level-ordered motion.
//!
//! The [`Positioner`] moves several axes to a scan point, level by
//! level, returning once every blocking move has settled. An axis whose
//! current value is already within its declared tolerance of the demand
//! is not re-issued to the hardware; the held value stands as achieved,
//! avoiding a redundant settling delay.

use crate::device::Movable;
use crate::error::{ScanError, ScanResult};
use crate::events::EventRegistry;
use crate::position::Position;
use crate::runner::{LevelParticipant, LevelRunner};
use async_trait::async_trait;
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default wait for a level of moves to settle. Axes needing longer
/// declare their own timeout.
pub const DEFAULT_MOVE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

struct AxisMove {
    axis: Arc<dyn Movable>,
}

#[async_trait]
impl LevelParticipant for AxisMove {
    fn name(&self) -> &str {
        self.axis.name()
    }

    fn level(&self) -> u32 {
        self.axis.level()
    }

    fn timeout(&self) -> Option<Duration> {
        self.axis.timeout()
    }

    fn participates(&self, position: &Position) -> bool {
        position.contains(self.axis.name())
    }

    async fn act(&self, position: &Position) -> anyhow::Result<()> {
        let name = self.axis.name();
        let demand = position
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("position does not name axis '{name}'"))?;

        if let (Some(tolerance), Some(target)) = (self.axis.tolerance(), demand.as_f64()) {
            if let Some(current) = self.axis.position().await?.as_f64() {
                if (current - target).abs() < tolerance {
                    debug!(axis = name, current, target, "within tolerance, move skipped");
                    return Ok(());
                }
            }
        }

        let achieved = self.axis.set_position(demand.clone(), position).await?;
        debug!(axis = name, demand = %demand, achieved = %achieved, "moved");
        Ok(())
    }

    async fn cancel(&self) {
        self.axis.abort().await;
    }
}

/// Moves movable axes to each scan point, grouped by level.
pub struct Positioner {
    runner: LevelRunner<AxisMove>,
}

impl Positioner {
    /// A positioner over `axes`.
    ///
    /// Level grouping is recomputed per call rather than cached: which
    /// axes take part depends on the axis names of each position.
    pub fn new(axes: Vec<Arc<dyn Movable>>, events: Arc<EventRegistry>) -> Self {
        let participants = axes.into_iter().map(|axis| Arc::new(AxisMove { axis })).collect();
        Self {
            runner: LevelRunner::new(participants, DEFAULT_MOVE_TIMEOUT)
                .with_events(events)
                .with_caching_disabled(),
        }
    }

    /// Move every axis named by `position`, blocking until all levels
    /// have settled.
    pub async fn move_to(&self, position: &Position) -> ScanResult<()> {
        self.runner.run(position, true).await
    }

    /// Read back the current value of every configured axis.
    pub async fn current_position(&self) -> ScanResult<Position> {
        let reads = self.runner.participants().iter().map(|participant| {
            let axis = participant.axis.clone();
            async move {
                let value = axis.position().await.map_err(|e| ScanError::Participant {
                    name: axis.name().to_string(),
                    message: format!("cannot read value: {e:#}"),
                })?;
                Ok::<_, ScanError>((axis.name().to_string(), value))
            }
        });
        let mut current = Position::new();
        for (name, value) in future::try_join_all(reads).await? {
            current = current.with(name, value);
        }
        Ok(current)
    }

    /// Forward cancellation to every axis.
    pub async fn abort(&self) {
        self.runner.abort().await;
    }

    /// Clear cached state for a new run.
    pub async fn reset(&self) {
        self.runner.reset().await;
    }

    /// Release axis resources at the end of a run.
    pub async fn close(&self) {
        self.runner.close().await;
        for participant in self.runner.participants() {
            if let Err(e) = participant.axis.close().await {
                warn!(axis = participant.axis.name(), error = %e, "axis close failed");
            }
        }
    }
}
