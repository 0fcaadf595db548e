//! The scan model handed to `configure`.

use crate::device::{Detector, Movable};
use crate::events::ScanListener;
use crate::trajectory::{CompoundDescription, TrajectorySource};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything the engine needs to arm a scan: the trajectory to follow,
/// the detectors to trigger and read out, the axes to drive, and the
/// optional structural description used to split nested scans between
/// software and hardware.
#[derive(Clone)]
pub struct ScanModel {
    /// The positions the engine will drive, one per point.
    pub trajectory: Arc<dyn TrajectorySource>,
    /// Detectors triggered and written out at each point.
    pub detectors: Vec<Arc<dyn Detector>>,
    /// Axes available to the positioner.
    pub movables: Vec<Arc<dyn Movable>>,
    /// Structural description of the nested trajectory, when a subscan
    /// device may claim part of it.
    pub description: Option<CompoundDescription>,
    /// Destination for the persistence collaborator, if any.
    pub file_path: Option<PathBuf>,
    /// Listeners registered for this scan.
    pub listeners: Vec<Arc<dyn ScanListener>>,
}

impl ScanModel {
    /// A model over `trajectory` with no devices attached yet.
    pub fn new(trajectory: Arc<dyn TrajectorySource>) -> Self {
        Self {
            trajectory,
            detectors: Vec::new(),
            movables: Vec::new(),
            description: None,
            file_path: None,
            listeners: Vec::new(),
        }
    }

    /// Add a detector.
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Add a movable axis.
    pub fn with_movable(mut self, movable: Arc<dyn Movable>) -> Self {
        self.movables.push(movable);
        self
    }

    /// Attach the structural trajectory description.
    pub fn with_description(mut self, description: CompoundDescription) -> Self {
        self.description = Some(description);
        self
    }

    /// Set the persistence destination.
    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Register a lifecycle listener for this scan.
    pub fn with_listener(mut self, listener: Arc<dyn ScanListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}
