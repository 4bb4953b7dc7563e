//! Hardware capability traits.
//!
//! Long-running operations (pumping, capturing, segmenting) are started with a
//! [`Completion`] handle and report back asynchronously by consuming it. Each
//! handle carries the operation id it was issued for, so the coordinator can
//! tell a late callback from a cancelled operation apart from a current one.
//!
//! Adapters must not call back into the coordinator directly; they only send
//! on the completion channel.

pub mod mock;
mod stepper;

pub use stepper::{Camera, CameraCapture, CoilHold, StepDirection, StepperMotor, SteppedPump};
pub(crate) use stepper::TaskSlot;

use crate::error::{Device, HardwareFault};
use crate::job::PumpMove;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Monotonically increasing id of a hardware operation.
pub type OperationId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Success,
    Failure(String),
}

/// Sent by an adapter when an operation ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub operation: OperationId,
    pub device: Device,
    pub outcome: CompletionOutcome,
}

/// One-shot completion handle for a started operation.
///
/// Consuming methods guarantee an operation reports at most once.
#[derive(Debug)]
pub struct Completion {
    operation: OperationId,
    device: Device,
    tx: mpsc::UnboundedSender<CompletionEvent>,
}

impl Completion {
    pub fn new(
        operation: OperationId,
        device: Device,
        tx: mpsc::UnboundedSender<CompletionEvent>,
    ) -> Self {
        Self {
            operation,
            device,
            tx,
        }
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn succeed(self) {
        self.send(CompletionOutcome::Success);
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.send(CompletionOutcome::Failure(reason.into()));
    }

    fn send(self, outcome: CompletionOutcome) {
        let event = CompletionEvent {
            operation: self.operation,
            device: self.device,
            outcome,
        };
        // Receiver gone means the coordinator shut down; nothing left to tell
        if self.tx.send(event).is_err() {
            debug!(
                operation = self.operation,
                device = %self.device,
                "Completion dropped, coordinator is gone"
            );
        }
    }
}

/// What to capture next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub output_path: PathBuf,
    /// 1-based index of the frame within its job
    pub frame_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationRequest {
    pub input_dir: PathBuf,
}

/// Moves a calibrated volume of sample.
pub trait PumpController: Send + Sync {
    /// Begin `planned`. Completion is reported through `done` after the move
    /// and its settle time.
    fn start(&self, planned: PumpMove, done: Completion) -> Result<(), HardwareFault>;

    /// Abort operation `operation` if it is still running. Idempotent; a
    /// cancelled operation never reports.
    fn cancel(&self, operation: OperationId);

    /// De-energize the motor coils.
    fn release(&self) -> Result<(), HardwareFault>;
}

/// Captures a single still frame to disk.
pub trait CaptureController: Send + Sync {
    fn start(&self, request: CaptureRequest, done: Completion) -> Result<(), HardwareFault>;

    fn cancel(&self, operation: OperationId);
}

/// Post-capture object segmentation.
pub trait SegmentationController: Send + Sync {
    fn start(&self, request: SegmentationRequest, done: Completion) -> Result<(), HardwareFault>;

    fn cancel(&self, operation: OperationId);
}

/// A simple on/off (optionally dimmable) output line such as the illumination LED.
pub trait ActuatorPort: Send + Sync {
    fn on(&self) -> Result<(), HardwareFault>;

    fn off(&self) -> Result<(), HardwareFault>;

    /// Set output level in `0.0..=1.0`.
    fn set_level(&self, level: f32) -> Result<(), HardwareFault> {
        if level > 0.0 {
            self.on()
        } else {
            self.off()
        }
    }
}

/// The set of devices the coordinator drives.
#[derive(Clone)]
pub struct Hardware {
    pub pump: Arc<dyn PumpController>,
    pub camera: Arc<dyn CaptureController>,
    pub segmenter: Option<Arc<dyn SegmentationController>>,
    pub light: Option<Arc<dyn ActuatorPort>>,
}

impl Hardware {
    pub fn new(pump: Arc<dyn PumpController>, camera: Arc<dyn CaptureController>) -> Self {
        Self {
            pump,
            camera,
            segmenter: None,
            light: None,
        }
    }

    pub fn with_segmenter(mut self, segmenter: Arc<dyn SegmentationController>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    pub fn with_light(mut self, light: Arc<dyn ActuatorPort>) -> Self {
        self.light = Some(light);
        self
    }
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware")
            .field("segmenter", &self.segmenter.is_some())
            .field("light", &self.light.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_reports_exactly_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let done = Completion::new(7, Device::Pump, tx);

        done.fail("stalled");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.operation, 7);
        assert_eq!(event.device, Device::Pump);
        assert_eq!(event.outcome, CompletionOutcome::Failure("stalled".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn completion_after_shutdown_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        Completion::new(1, Device::Camera, tx).succeed();
    }
}
