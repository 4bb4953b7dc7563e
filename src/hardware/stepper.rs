//! Adapters from low-level devices (stepper motor, still camera) to the
//! completion-based controller traits.

use super::{CaptureController, CaptureRequest, Completion, OperationId, PumpController};
use crate::error::{Device, HardwareFault};
use crate::job::{PumpDirection, PumpMove};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepDirection {
    Forward,
    Backward,
}

impl From<PumpDirection> for StepDirection {
    fn from(direction: PumpDirection) -> Self {
        match direction {
            PumpDirection::Forward => StepDirection::Forward,
            PumpDirection::Backward => StepDirection::Backward,
        }
    }
}

/// A stepper motor driver: one step at a time, plus coil release.
pub trait StepperMotor: Send + Sync {
    fn one_step(&self, direction: StepDirection) -> Result<(), HardwareFault>;

    fn release(&self) -> Result<(), HardwareFault>;
}

/// Keeps the motor coils energized while alive and releases them on drop.
///
/// Dropping happens on normal completion, on error and when the stepping task
/// is aborted, so coils are never left powered after a move ends.
pub struct CoilHold<M: StepperMotor + ?Sized> {
    motor: Arc<M>,
}

impl<M: StepperMotor + ?Sized> CoilHold<M> {
    pub fn new(motor: Arc<M>) -> Self {
        Self { motor }
    }
}

impl<M: StepperMotor + ?Sized> Drop for CoilHold<M> {
    fn drop(&mut self) {
        if let Err(fault) = self.motor.release() {
            warn!(%fault, "Failed to release stepper coils");
        }
    }
}

/// At most one running operation per adapter.
#[derive(Default)]
pub(crate) struct TaskSlot {
    running: Mutex<Option<(OperationId, JoinHandle<()>)>>,
}

impl TaskSlot {
    pub(crate) fn spawn<F>(
        &self,
        device: Device,
        operation: OperationId,
        task: F,
    ) -> Result<(), HardwareFault>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| HardwareFault::new(device, "no async runtime available"))?;

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((current, handle)) = running.as_ref() {
            if !handle.is_finished() {
                return Err(HardwareFault::new(
                    device,
                    format!("{device} busy with operation {current}"),
                ));
            }
        }

        *running = Some((operation, runtime.spawn(task)));
        Ok(())
    }

    pub(crate) fn cancel(&self, operation: OperationId) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(running.as_ref(), Some((current, _)) if *current == operation) {
            if let Some((_, handle)) = running.take() {
                handle.abort();
                debug!(operation, "Aborted running operation");
            }
        }
    }
}

/// Drives a [`StepperMotor`] through a [`PumpMove`].
///
/// Steps are issued from a tokio task with `step_delay` between them. After
/// the last step the coils are released, then the adapter waits `settle`
/// before reporting success.
pub struct SteppedPump<M: StepperMotor + 'static> {
    motor: Arc<M>,
    slot: TaskSlot,
}

impl<M: StepperMotor + 'static> SteppedPump<M> {
    pub fn new(motor: Arc<M>) -> Self {
        Self {
            motor,
            slot: TaskSlot::default(),
        }
    }
}

impl<M: StepperMotor + 'static> PumpController for SteppedPump<M> {
    fn start(&self, planned: PumpMove, done: Completion) -> Result<(), HardwareFault> {
        let motor = Arc::clone(&self.motor);
        let operation = done.operation();

        self.slot.spawn(Device::Pump, operation, async move {
            let direction = StepDirection::from(planned.direction);
            debug!(
                operation,
                steps = planned.steps,
                delay = ?planned.step_delay,
                ?direction,
                "Pumping"
            );

            let hold = CoilHold::new(Arc::clone(&motor));
            for _ in 0..planned.steps {
                if let Err(fault) = motor.one_step(direction) {
                    drop(hold);
                    done.fail(fault.reason);
                    return;
                }
                if planned.step_delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(planned.step_delay).await;
                }
            }
            drop(hold);

            tokio::time::sleep(planned.settle).await;
            done.succeed();
        })
    }

    fn cancel(&self, operation: OperationId) {
        self.slot.cancel(operation);
    }

    fn release(&self) -> Result<(), HardwareFault> {
        self.motor.release()
    }
}

/// A still camera that can write one frame to a file.
#[async_trait]
pub trait Camera: Send + Sync {
    async fn capture_file(&self, path: &Path) -> Result<(), HardwareFault>;
}

/// Runs [`Camera::capture_file`] as a cancellable background operation.
pub struct CameraCapture<C: Camera + 'static> {
    camera: Arc<C>,
    slot: TaskSlot,
}

impl<C: Camera + 'static> CameraCapture<C> {
    pub fn new(camera: Arc<C>) -> Self {
        Self {
            camera,
            slot: TaskSlot::default(),
        }
    }
}

impl<C: Camera + 'static> CaptureController for CameraCapture<C> {
    fn start(&self, request: CaptureRequest, done: Completion) -> Result<(), HardwareFault> {
        let camera = Arc::clone(&self.camera);
        let operation = done.operation();

        self.slot.spawn(Device::Camera, operation, async move {
            debug!(
                operation,
                frame = request.frame_index,
                path = %request.output_path.display(),
                "Capturing frame"
            );
            match camera.capture_file(&request.output_path).await {
                Ok(()) => done.succeed(),
                Err(fault) => done.fail(fault.reason),
            }
        })
    }

    fn cancel(&self, operation: OperationId) {
        self.slot.cancel(operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCamera, MockStepper};
    use crate::hardware::CompletionOutcome;
    use crate::job::PumpCalibration;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn small_move(volume: f64, settle: Duration) -> PumpMove {
        let mut planned = PumpCalibration::default().plan(PumpDirection::Forward, volume, 50.0);
        planned.settle = settle;
        planned
    }

    /// 1 mL at 1 mL/min: 507 steps roughly 113 ms apart
    fn slow_move() -> PumpMove {
        PumpCalibration::default().plan(PumpDirection::Forward, 1.0, 1.0)
    }

    #[tokio::test(start_paused = true)]
    async fn steps_then_releases_then_reports() {
        let motor = Arc::new(MockStepper::new());
        let pump = SteppedPump::new(Arc::clone(&motor));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // 0.02 mL -> 10 steps
        pump.start(
            small_move(0.02, Duration::from_millis(100)),
            Completion::new(1, Device::Pump, tx),
        )
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, 1);
        assert_eq!(event.outcome, CompletionOutcome::Success);
        assert_eq!(motor.steps_taken(), 10);
        assert_eq!(motor.releases(), 1);
        assert!(!motor.is_energized());
    }

    #[tokio::test(start_paused = true)]
    async fn backward_moves_count_negative() {
        let motor = Arc::new(MockStepper::new());
        let pump = SteppedPump::new(Arc::clone(&motor));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut planned = small_move(0.02, Duration::ZERO);
        planned.direction = PumpDirection::Backward;
        pump.start(planned, Completion::new(1, Device::Pump, tx))
            .unwrap();
        rx.recv().await.unwrap();

        assert_eq!(motor.position(), -10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_coils_without_reporting() {
        let motor = Arc::new(MockStepper::new());
        let pump = SteppedPump::new(Arc::clone(&motor));
        let (tx, mut rx) = mpsc::unbounded_channel();

        pump.start(slow_move(), Completion::new(3, Device::Pump, tx))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        pump.cancel(3);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(motor.steps_taken() < 10);
        assert!(!motor.is_energized());
        assert_eq!(motor.releases(), 1);
        // The aborted task dropped its sender without reporting
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn second_move_while_busy_is_refused() {
        let motor = Arc::new(MockStepper::new());
        let pump = SteppedPump::new(Arc::clone(&motor));
        let (tx, _rx) = mpsc::unbounded_channel();

        pump.start(slow_move(), Completion::new(1, Device::Pump, tx.clone()))
            .unwrap();
        let fault = pump
            .start(slow_move(), Completion::new(2, Device::Pump, tx))
            .unwrap_err();

        assert_eq!(fault.device, Device::Pump);
        assert!(fault.reason.contains("busy"));
    }

    #[tokio::test(start_paused = true)]
    async fn motor_fault_is_reported_and_coils_released() {
        let motor = Arc::new(MockStepper::new().fail_after(3));
        let pump = SteppedPump::new(Arc::clone(&motor));
        let (tx, mut rx) = mpsc::unbounded_channel();

        pump.start(
            small_move(0.02, Duration::ZERO),
            Completion::new(9, Device::Pump, tx),
        )
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.outcome, CompletionOutcome::Failure(_)));
        assert_eq!(motor.steps_taken(), 3);
        assert!(!motor.is_energized());
    }

    #[tokio::test(start_paused = true)]
    async fn camera_capture_reports_path_written() {
        let camera = Arc::new(MockCamera::new(Duration::from_millis(200)));
        let capture = CameraCapture::new(Arc::clone(&camera));
        let (tx, mut rx) = mpsc::unbounded_channel();

        capture
            .start(
                CaptureRequest {
                    output_path: PathBuf::from("/tmp/frame.jpg"),
                    frame_index: 1,
                },
                Completion::new(4, Device::Camera, tx),
            )
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.outcome, CompletionOutcome::Success);
        assert_eq!(camera.captured(), vec![PathBuf::from("/tmp/frame.jpg")]);
    }

    #[test]
    fn no_runtime_is_a_fault() {
        let pump = SteppedPump::new(Arc::new(MockStepper::new()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let fault = pump
            .start(
                small_move(0.02, Duration::ZERO),
                Completion::new(1, Device::Pump, tx),
            )
            .unwrap_err();
        assert!(fault.reason.contains("runtime"));
    }
}
