//! Error types for the imager.
//!
//! `ImagerError` is the single error enum returned by the public API. The
//! variants map one to one onto how the coordinator reacts:
//!
//! - **`IllegalTransition`**: the request is rejected and recorded, nothing else changes.
//! - **`InvalidJob`**: the job is rejected before any hardware is touched.
//! - **`HardwareFault`**: the running job ends in `Stop` with the fault attached.
//! - **`StaleCompletion`**: a late callback for a cancelled or superseded operation; dropped.
//! - **`Busy`**: the request needs an idle imager.

use crate::core::ImagerState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the imager error type.
pub type Result<T> = std::result::Result<T, ImagerError>;

/// A transition that is not in the current state's successor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal transition from '{from}' to '{to}'")]
pub struct IllegalTransition {
    pub from: ImagerState,
    pub to: ImagerState,
}

/// Physical devices the coordinator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Pump,
    Camera,
    Segmenter,
    Light,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Pump => "pump",
            Device::Camera => "camera",
            Device::Segmenter => "segmenter",
            Device::Light => "light",
        })
    }
}

/// Failure reported by a hardware adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{device} fault: {reason}")]
pub struct HardwareFault {
    pub device: Device,
    pub reason: String,
}

impl HardwareFault {
    pub fn new(device: Device, reason: impl Into<String>) -> Self {
        Self {
            device,
            reason: reason.into(),
        }
    }
}

/// One problem with an acquisition job's parameters.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobViolation {
    #[error("volume must be positive (got {volume} mL)")]
    NonPositiveVolume { volume: f64 },

    #[error("flow rate must be positive (got {flow_rate} mL/min)")]
    NonPositiveFlowRate { flow_rate: f64 },

    #[error("{field} must be a finite number")]
    NotFinite { field: String },

    #[error("at least one frame must be requested")]
    NoFrames,

    #[error("volume {volume} mL is below one pump step")]
    BelowOneStep { volume: f64 },
}

#[derive(Debug, Error)]
pub enum ImagerError {
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("Invalid acquisition job: {}", join_violations(.violations))]
    InvalidJob { violations: Vec<JobViolation> },

    #[error(transparent)]
    HardwareFault(#[from] HardwareFault),

    #[error("Discarded stale completion for operation {operation}")]
    StaleCompletion { operation: u64 },

    #[error("Imager is busy in state '{state}'")]
    Busy { state: ImagerState },

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Imager controller is no longer running")]
    ControllerClosed,
}

fn join_violations(violations: &[JobViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_names_both_states() {
        let err = IllegalTransition {
            from: ImagerState::Stop,
            to: ImagerState::Capture,
        };
        assert_eq!(err.to_string(), "Illegal transition from 'stop' to 'capture'");
    }

    #[test]
    fn invalid_job_lists_every_violation() {
        let err = ImagerError::InvalidJob {
            violations: vec![
                JobViolation::NonPositiveVolume { volume: 0.0 },
                JobViolation::NoFrames,
            ],
        };
        let message = err.to_string();
        assert!(message.contains("volume must be positive"));
        assert!(message.contains("at least one frame"));
    }

    #[test]
    fn hardware_fault_converts_into_imager_error() {
        let err: ImagerError = HardwareFault::new(Device::Camera, "camera busy").into();
        assert_eq!(err.to_string(), "camera fault: camera busy");
    }
}
