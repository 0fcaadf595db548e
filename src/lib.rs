//! Level-ordered acquisition sequencing engine.
//!
//! This library drives automated experiments over a precomputed
//! multi-dimensional trajectory: at each point it moves a set of axes
//! into position, triggers a set of detectors, and overlaps each point's
//! readout with the next point's motion, while an operator can pause,
//! resume, seek or abort the run from any other task.
//!
//! # Architecture
//!
//! - [`runner::LevelRunner`]: the generic primitive that runs
//!   participants grouped by priority level, concurrently within a
//!   level, sequentially across levels.
//! - [`positioner::Positioner`], [`device_runner::DeviceRunner`],
//!   [`device_runner::DeviceWriter`], [`exposure::ExposureTimeManager`]:
//!   its specializations for motion, triggering, write-out and exposure
//!   reconciliation.
//! - [`engine::AcquisitionEngine`]: the scan loop, state machine and
//!   control surface.
//! - [`moderator::SubscanModerator`]: splits a nested trajectory between
//!   the software scan loop and hardware-timed subscan devices.
//!
//! Trajectory generation, result-file formats and hardware wire
//! protocols are external collaborators behind the traits in
//! [`trajectory`], [`storage`] and [`device`].

pub mod device;
pub mod device_runner;
pub mod engine;
pub mod error;
pub mod events;
pub mod exposure;
pub mod model;
pub mod moderator;
pub mod position;
pub mod positioner;
pub mod runner;
pub mod storage;
pub mod trajectory;

pub use device::{Detector, DetectorModel, DeviceState, Movable, PausableDetector, DEFAULT_LEVEL};
pub use device_runner::{DeviceRunner, DeviceWriter};
pub use engine::{AcquisitionEngine, CompletionLatch, RunHandle, ScanStatus};
pub use error::{ScanError, ScanResult};
pub use events::{EventRegistry, ScanEvent, ScanEventKind, ScanListener};
pub use exposure::ExposureTimeManager;
pub use model::ScanModel;
pub use moderator::{SubscanModerator, TrajectoryPartition};
pub use position::{AxisValue, Position};
pub use positioner::Positioner;
pub use runner::{LevelParticipant, LevelRunner};
pub use storage::{NullFileStore, ScanFileStore};
pub use trajectory::{CompoundDescription, PositionIter, TrajectoryModel, TrajectorySource};
