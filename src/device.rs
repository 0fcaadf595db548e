//! Device traits and shared device state.
//!
//! The engine talks to hardware through two capability traits, in the
//! same style as capability traits for instruments elsewhere in this
//! family of crates:
//!
//! - [`Detector`]: a triggerable device that acquires a frame at each
//!   point and optionally persists it.
//! - [`Movable`]: a positionable axis with a numeric tolerance.
//!
//! Both declare a *level*, a small integer priority tag. Participants
//! sharing a level act concurrently; levels run in ascending order.
//! All trait methods take `&self`; implementations are expected to use
//! interior mutability since the same device may be driven by the
//! trigger and write pipelines concurrently.

use crate::position::{AxisValue, Position};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default level for participants that do not declare one.
pub const DEFAULT_LEVEL: u32 = 5;

/// Lifecycle state shared by detectors and the acquisition engine.
///
/// The engine is the single source of truth for which control operations
/// are currently legal; detectors reuse the same vocabulary so the
/// engine can decide which of them to pause or resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Being configured, not yet ready to run
    Configuring,
    /// Configured and ready to run
    Armed,
    /// A scan is in progress
    Running,
    /// Transitioning towards a paused state
    Seeking,
    /// Paused at a point boundary, can resume
    Paused,
    /// An abort has been requested and is cascading
    Aborting,
    /// Aborted; reset or reconfigure before running again
    Aborted,
    /// An unrecovered error occurred
    Fault,
}

impl DeviceState {
    /// Whether a scan is in progress (running, seeking or paused).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DeviceState::Running | DeviceState::Seeking | DeviceState::Paused
        )
    }

    /// Whether this is a rest state from which no scan loop is executing.
    pub fn is_rest(self) -> bool {
        matches!(
            self,
            DeviceState::Armed | DeviceState::Aborted | DeviceState::Fault
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Configuration model for a detector.
///
/// Carried by detectors that support reconfiguration; the exposure
/// manager clones it, updates the exposure time and hands it back to
/// [`Detector::configure`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorModel {
    /// Detector name, matching [`Detector::name`]
    pub name: String,
    /// Exposure time per frame, in seconds
    pub exposure_time: f64,
    /// Optional per-operation timeout, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Open-ended detector-specific parameters
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl DetectorModel {
    /// A model with the given name and exposure time and no extras.
    pub fn new(name: impl Into<String>, exposure_time: f64) -> Self {
        Self {
            name: name.into(),
            exposure_time,
            timeout_seconds: None,
            parameters: serde_json::Map::new(),
        }
    }
}

/// A detector participating in the scan.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Unique detector name.
    fn name(&self) -> &str;

    /// Execution level, ascending order across the point.
    fn level(&self) -> u32 {
        DEFAULT_LEVEL
    }

    /// Maximum duration a single trigger or write may take. The level
    /// timeout is the maximum over the level's participants, falling
    /// back to a runner-wide default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Current lifecycle state.
    fn state(&self) -> DeviceState;

    /// The detector's configuration model, if it supports reconfiguration.
    fn model(&self) -> Option<DetectorModel> {
        None
    }

    /// Apply a new configuration model.
    async fn configure(&self, model: DetectorModel) -> Result<()>;

    /// Trigger acquisition for this point. Blocks until the frame is
    /// ready; must return promptly after [`Detector::abort`].
    async fn run(&self, position: &Position) -> Result<()>;

    /// Persist the most recently acquired frame. Returns whether
    /// anything was written.
    async fn write(&self, position: &Position) -> Result<bool>;

    /// Best-effort cancellation of any outstanding trigger or write.
    async fn abort(&self);

    /// Access the pausable surface, if this detector supports
    /// pause/resume/seek.
    fn as_pausable(&self) -> Option<&dyn PausableDetector> {
        None
    }

    /// Axis names this detector drives itself (a hardware-timed subscan
    /// device). `None` for ordinary detectors.
    fn claimed_axes(&self) -> Option<Vec<String>> {
        None
    }
}

/// Optional pause/resume/seek surface for detectors that can hold an
/// acquisition mid-run.
#[async_trait]
pub trait PausableDetector: Detector {
    /// Hold the current acquisition.
    async fn pause(&self) -> Result<()>;

    /// Continue a held acquisition.
    async fn resume(&self) -> Result<()>;

    /// Reposition the detector's internal progress to `step`.
    async fn seek(&self, step: usize) -> Result<()>;
}

/// A movable axis participating in the scan.
#[async_trait]
pub trait Movable: Send + Sync {
    /// Unique axis name, matched against trajectory axis names.
    fn name(&self) -> &str;

    /// Execution level, ascending order across the point.
    fn level(&self) -> u32 {
        DEFAULT_LEVEL
    }

    /// Maximum duration a single move may take.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Numeric tolerance. A demand within this distance of the current
    /// value is not re-issued to the hardware.
    fn tolerance(&self) -> Option<f64> {
        None
    }

    /// Read the current value.
    async fn position(&self) -> Result<AxisValue>;

    /// Move to `value`, blocking until settled. `context` is the full
    /// scan point the move belongs to. Returns the achieved value.
    async fn set_position(&self, value: AxisValue, context: &Position) -> Result<AxisValue>;

    /// Best-effort cancellation of an outstanding move.
    async fn abort(&self);

    /// Release axis-specific resources at the end of a run.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
