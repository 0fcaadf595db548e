//! Error types for the sequencing engine.
//!
//! `ScanError` consolidates the failure modes of a scan: configuration
//! problems caught while arming, runtime failures of participants, level
//! timeouts, control-protocol violations, and trajectory faults. The enum
//! is `Clone` so a failure captured by the scan task can be replayed to
//! every thread joined on the completion latch.

use crate::device::DeviceState;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot {action}: engine state was {state}")]
    IllegalState { action: &'static str, state: DeviceState },

    #[error("Could not obtain the control lock to run the device")]
    ControlLockTimeout,

    #[error("Level {level} did not settle within {timeout:?}")]
    LevelTimeout { level: u32, timeout: Duration },

    #[error("Participant '{name}' failed: {message}")]
    Participant { name: String, message: String },

    #[error("Task for participant '{name}' was cancelled or panicked")]
    TaskFailed { name: String },

    #[error("A non-blocking run is still outstanding; await it before starting another")]
    PipelineBusy,

    #[error("Seek step {step} is out of range 0..={total}")]
    SeekOutOfRange { step: usize, total: usize },

    #[error("Trajectory error: {0}")]
    Trajectory(String),

    #[error("Persistence error: {0}")]
    Storage(String),

    #[error("Scan aborted")]
    Aborted,
}

impl ScanError {
    /// Wrap a device-level failure, keeping the participant name for the report.
    pub fn participant(name: &str, source: &anyhow::Error) -> Self {
        ScanError::Participant {
            name: name.to_string(),
            message: format!("{source:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::Participant {
            name: "mandelbrot".into(),
            message: "detector timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "Participant 'mandelbrot' failed: detector timed out"
        );
    }

    #[test]
    fn test_errors_clone_for_latch_replay() {
        let err = ScanError::SeekOutOfRange { step: 9, total: 4 };
        assert_eq!(err.clone(), err);
    }
}
