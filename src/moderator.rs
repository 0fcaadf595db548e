//! Splitting nested trajectories between software and hardware.
//!
//! A subscan device (for example a hardware-timed inner scan controller)
//! claims a set of axes it will drive itself. The [`SubscanModerator`]
//! walks a nested trajectory description from the innermost model
//! outward: models whose axes are all claimed belong to the inner,
//! hardware-driven partition; the first model with an unclaimed axis,
//! and everything outside it, stays with the software-driven outer scan.
//! Either side that ends up empty is replaced with a single-point static
//! placeholder so the other side still executes the right number of
//! times. Regions, mutators and duration of the source description are
//! preserved in both partitions.

use crate::device::Detector;
use crate::error::ScanResult;
use crate::trajectory::{CompoundDescription, TrajectoryModel};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// The outer/inner split of a nested trajectory description.
#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryPartition {
    /// Software-driven part, driven by the engine's scan loop
    pub outer: CompoundDescription,
    /// Hardware-driven part, handed to the subscan device
    pub inner: CompoundDescription,
}

/// Partitions a nested trajectory against the axes claimed by subscan
/// devices.
#[derive(Debug)]
pub struct SubscanModerator {
    claimed_axes: BTreeSet<String>,
    partition: Option<TrajectoryPartition>,
    original: CompoundDescription,
}

impl SubscanModerator {
    /// Moderate `description` against the axes claimed by `detectors`.
    ///
    /// With no subscan device among the detectors there is nothing to
    /// split: the whole description is outer and
    /// [`SubscanModerator::partition`] returns `None`.
    pub fn moderate(
        description: CompoundDescription,
        detectors: &[Arc<dyn Detector>],
    ) -> ScanResult<Self> {
        description.validate()?;

        let claimed_axes: BTreeSet<String> = detectors
            .iter()
            .filter_map(|d| d.claimed_axes())
            .flatten()
            .collect();

        if claimed_axes.is_empty() {
            return Ok(Self {
                claimed_axes,
                partition: None,
                original: description,
            });
        }

        let mut outer: Vec<TrajectoryModel> = Vec::new();
        let mut inner: Vec<TrajectoryModel> = Vec::new();
        let mut reached_outer = false;
        for model in description.models.iter().rev() {
            if !reached_outer && model.axes.iter().all(|a| claimed_axes.contains(a)) {
                inner.insert(0, model.clone());
                continue;
            }
            // Once one unclaimed model is seen, everything outside it is
            // outer too, claimed or not.
            reached_outer = true;
            outer.insert(0, model.clone());
        }

        if inner.is_empty() {
            inner.push(TrajectoryModel::placeholder());
        }
        if outer.is_empty() {
            outer.push(TrajectoryModel::placeholder());
        }

        debug!(
            outer = outer.len(),
            inner = inner.len(),
            claimed = claimed_axes.len(),
            "moderated nested trajectory"
        );

        let partition = TrajectoryPartition {
            outer: description.with_models(outer),
            inner: description.with_models(inner),
        };
        Ok(Self {
            claimed_axes,
            partition: Some(partition),
            original: description,
        })
    }

    /// The outer/inner partition, `None` when no device claimed axes.
    pub fn partition(&self) -> Option<&TrajectoryPartition> {
        self.partition.as_ref()
    }

    /// The software-driven description: the outer partition, or the
    /// whole source description when nothing was claimed.
    pub fn outer(&self) -> &CompoundDescription {
        self.partition
            .as_ref()
            .map_or(&self.original, |p| &p.outer)
    }

    /// The hardware-driven description, if any part was claimed.
    pub fn inner(&self) -> Option<&CompoundDescription> {
        self.partition.as_ref().map(|p| &p.inner)
    }

    /// Points the subscan device contributes per outer point: the inner
    /// partition's point count, or 1 when there is no inner partition.
    pub fn inner_point_count(&self) -> usize {
        self.inner().map_or(1, CompoundDescription::point_count)
    }

    /// Whether any detector claimed axes for itself.
    pub fn has_subscan(&self) -> bool {
        self.partition.is_some()
    }

    /// The union of axes claimed by the subscan devices.
    pub fn claimed_axes(&self) -> &BTreeSet<String> {
        &self.claimed_axes
    }
}
