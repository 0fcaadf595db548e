//! Trajectory boundary contracts.
//!
//! Point generation (grid/spiral/compound math, exclusion regions,
//! mutators) lives outside this crate. The engine only needs a
//! restartable, finite, lazily produced sequence of [`Position`] records
//! plus a structural description of nested trajectories for the subscan
//! moderator.

use crate::error::{ScanError, ScanResult};
use crate::position::Position;
use serde::{Deserialize, Serialize};

/// A restartable iterator over trajectory positions.
///
/// Iteration is fallible: a generator may discover late that an
/// exclusion region has consumed every remaining point, which surfaces
/// here as an explicit [`ScanError::Trajectory`] rather than a silent
/// exhaustion.
pub type PositionIter = Box<dyn Iterator<Item = ScanResult<Position>> + Send>;

/// A finite, lazily produced sequence of scan positions.
///
/// Independent iterators may be created at any time; seek and replay
/// rely on this, since sources are not assumed randomly addressable.
pub trait TrajectorySource: Send + Sync {
    /// Precomputed number of points.
    fn size(&self) -> usize;

    /// Points per dimension, outermost first.
    fn shape(&self) -> Vec<usize>;

    /// Number of dimensions.
    fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Names of the axes driven by this trajectory.
    fn axis_names(&self) -> Vec<String>;

    /// Create a fresh iterator from the first point.
    fn positions(&self) -> PositionIter;
}

/// Structural description of one model in a nested trajectory.
///
/// Only the shape matters here: which axes the model drives and how many
/// points it contributes. The arithmetic that turns a model into actual
/// positions belongs to the external generator service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryModel {
    /// Model name, for diagnostics
    pub name: String,
    /// Axes driven by this model
    pub axes: Vec<String>,
    /// Number of points the model contributes
    pub point_count: usize,
}

impl TrajectoryModel {
    /// A model driving `axes` with `point_count` points.
    pub fn new(name: impl Into<String>, axes: Vec<String>, point_count: usize) -> Self {
        Self {
            name: name.into(),
            axes,
            point_count,
        }
    }

    /// The single-point static placeholder used when a moderated
    /// partition would otherwise be empty.
    pub fn placeholder() -> Self {
        Self::new("static", Vec::new(), 1)
    }
}

/// Description of a nested trajectory, outermost model first, together
/// with the regions, mutators and duration that apply to the whole scan.
///
/// Regions and mutators are opaque here; they are carried through
/// moderation untouched so the external generator can re-apply them to
/// each partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct CompoundDescription {
    /// Nested models, outermost first
    pub models: Vec<TrajectoryModel>,
    /// Exclusion regions, opaque to this crate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<serde_json::Value>,
    /// Point mutators, opaque to this crate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutators: Vec<serde_json::Value>,
    /// Per-point duration in seconds, if fixed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl CompoundDescription {
    /// A description with the given models and nothing else.
    pub fn new(models: Vec<TrajectoryModel>) -> Self {
        Self {
            models,
            ..Self::default()
        }
    }

    /// Copy of this description with `models` swapped in, keeping
    /// regions, mutators and duration.
    pub fn with_models(&self, models: Vec<TrajectoryModel>) -> Self {
        Self {
            models,
            regions: self.regions.clone(),
            mutators: self.mutators.clone(),
            duration: self.duration,
        }
    }

    /// Total point count, the product over the nested models.
    pub fn point_count(&self) -> usize {
        self.models.iter().map(|m| m.point_count).product()
    }

    /// Every axis named by the nested models, outermost first,
    /// duplicates removed.
    pub fn axis_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for model in &self.models {
            for axis in &model.axes {
                if !names.contains(axis) {
                    names.push(axis.clone());
                }
            }
        }
        names
    }

    /// Validate the description for moderation.
    pub fn validate(&self) -> ScanResult<()> {
        if self.models.is_empty() {
            return Err(ScanError::Configuration(
                "no models are provided in the compound description".into(),
            ));
        }
        Ok(())
    }
}
