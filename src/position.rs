//! Scan positions and axis values.
//!
//! A [`Position`] is one point of a scan trajectory: an ordered mapping
//! from axis name to demanded value, together with the zero-based step
//! index, an optional exposure time, the scan rank, and the per-dimension
//! axis-name groupings. Positions are produced by a trajectory source and
//! flow through the pipeline unchanged, except that the engine stamps the
//! step index once before the point is processed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A demanded or achieved value for one axis.
///
/// Most axes are numeric, but discrete axes (filter wheels, selector
/// slides) are addressed by name, so text values are allowed too.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AxisValue {
    /// Floating point value, the common case
    Float(f64),
    /// Integer value (e.g. a discrete slot index)
    Int(i64),
    /// Named value for discrete axes
    Text(String),
}

impl AxisValue {
    /// Numeric view of the value, `None` for text values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AxisValue::Float(v) => Some(*v),
            AxisValue::Int(v) => Some(*v as f64),
            AxisValue::Text(_) => None,
        }
    }
}

impl From<f64> for AxisValue {
    fn from(value: f64) -> Self {
        AxisValue::Float(value)
    }
}

impl From<i64> for AxisValue {
    fn from(value: i64) -> Self {
        AxisValue::Int(value)
    }
}

impl From<&str> for AxisValue {
    fn from(value: &str) -> Self {
        AxisValue::Text(value.to_string())
    }
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisValue::Float(v) => write!(f, "{v}"),
            AxisValue::Int(v) => write!(f, "{v}"),
            AxisValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// One immutable point of the scan trajectory.
///
/// Axis order is insertion order and is preserved through serialization,
/// merging, and iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    values: Vec<(String, AxisValue)>,
    step_index: Option<usize>,
    exposure_time: Option<f64>,
    dimension_names: Vec<Vec<String>>,
}

impl Position {
    /// An empty position, filled in with the `with_*` builders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one axis value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AxisValue>) -> Self {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.values.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.values.push((name, value));
        }
        self
    }

    /// Set the exposure time demanded at this point, in seconds.
    pub fn with_exposure_time(mut self, seconds: f64) -> Self {
        self.exposure_time = Some(seconds);
        self
    }

    /// Set the per-dimension axis-name groupings, outermost dimension first.
    pub fn with_dimension_names(mut self, names: Vec<Vec<String>>) -> Self {
        self.dimension_names = names;
        self
    }

    /// The demanded value for `axis`, if this point names it.
    pub fn get(&self, axis: &str) -> Option<&AxisValue> {
        self.values.iter().find(|(n, _)| n == axis).map(|(_, v)| v)
    }

    /// Whether this point names `axis` at all.
    pub fn contains(&self, axis: &str) -> bool {
        self.get(axis).is_some()
    }

    /// Axis names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    /// Iterate over `(axis, value)` pairs in order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &AxisValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of axes named by this point.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the point names no axes (a static placeholder point).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Zero-based step index within the run, 0 until stamped.
    pub fn step_index(&self) -> usize {
        self.step_index.unwrap_or(0)
    }

    /// Stamp the step index. The engine does this exactly once per point,
    /// before the point enters the pipeline.
    pub fn set_step_index(&mut self, index: usize) {
        self.step_index = Some(index);
    }

    /// Exposure time demanded at this point, if any.
    pub fn exposure_time(&self) -> Option<f64> {
        self.exposure_time
    }

    /// Scan rank, i.e. the number of trajectory dimensions.
    pub fn scan_rank(&self) -> usize {
        self.dimension_names.len().max(1)
    }

    /// Per-dimension axis-name groupings, outermost first.
    pub fn dimension_names(&self) -> &[Vec<String>] {
        &self.dimension_names
    }

    /// Compound this point under an outer parent position. Parent axes
    /// come first; on a name clash the inner value wins.
    pub fn compound(&self, parent: &Position) -> Position {
        let mut merged = parent.clone();
        merged.step_index = self.step_index;
        merged.exposure_time = self.exposure_time.or(parent.exposure_time);
        merged.dimension_names = self.dimension_names.clone();
        for (name, value) in &self.values {
            merged = merged.with(name.clone(), value.clone());
        }
        merged
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        if let Some(step) = self.step_index {
            write!(f, " [step {step}]")?;
        }
        Ok(())
    }
}
