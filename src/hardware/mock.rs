//! Mock Hardware Implementations
//!
//! Simulated devices for running the imager without a PlanktoScope attached.
//!
//! # Available Mocks
//!
//! - `MockStepper` - stepper motor that counts steps and coil releases
//! - `MockCamera` - still camera with configurable readout time
//! - `MockSegmenter` - segmenter that finishes after a fixed delay
//! - `MockLight` - on/off actuator recording every level it was set to
//! - `ScriptedDevice` - controller whose completions are driven by the test

use super::{
    ActuatorPort, Camera, CaptureController, CaptureRequest, Completion, OperationId,
    PumpController, SegmentationController, SegmentationRequest, StepDirection, StepperMotor,
    TaskSlot,
};
use crate::error::{Device, HardwareFault};
use crate::job::PumpMove;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockStepper - Simulated Stepper Motor
// =============================================================================

/// Stepper motor that only keeps counters.
#[derive(Debug)]
pub struct MockStepper {
    position: AtomicI64,
    steps: AtomicU64,
    releases: AtomicU64,
    energized: AtomicBool,
    fail_after: u64,
}

impl MockStepper {
    pub fn new() -> Self {
        Self {
            position: AtomicI64::new(0),
            steps: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            energized: AtomicBool::new(false),
            fail_after: u64::MAX,
        }
    }

    /// Refuse every step after the first `steps`.
    pub fn fail_after(mut self, steps: u64) -> Self {
        self.fail_after = steps;
        self
    }

    pub fn steps_taken(&self) -> u64 {
        self.steps.load(Ordering::SeqCst)
    }

    /// Net displacement in steps; backward steps count negative.
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn is_energized(&self) -> bool {
        self.energized.load(Ordering::SeqCst)
    }
}

impl Default for MockStepper {
    fn default() -> Self {
        Self::new()
    }
}

impl StepperMotor for MockStepper {
    fn one_step(&self, direction: StepDirection) -> Result<(), HardwareFault> {
        if self.steps.load(Ordering::SeqCst) >= self.fail_after {
            return Err(HardwareFault::new(Device::Pump, "motor stalled"));
        }
        self.energized.store(true, Ordering::SeqCst);
        self.steps.fetch_add(1, Ordering::SeqCst);
        let delta = match direction {
            StepDirection::Forward => 1,
            StepDirection::Backward => -1,
        };
        self.position.fetch_add(delta, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<(), HardwareFault> {
        self.energized.store(false, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockCamera - Simulated Still Camera
// =============================================================================

/// Camera that takes `readout` per frame and remembers where it wrote.
#[derive(Debug)]
pub struct MockCamera {
    readout: Duration,
    captured: Mutex<Vec<PathBuf>>,
    failure: Mutex<Option<String>>,
    write_files: bool,
}

impl MockCamera {
    pub fn new(readout: Duration) -> Self {
        Self {
            readout,
            captured: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            write_files: false,
        }
    }

    /// Also create an (empty) file at each capture path.
    pub fn writing_files(mut self) -> Self {
        self.write_files = true;
        self
    }

    /// Make every following capture fail with `reason`, or succeed again with `None`.
    pub fn set_failure(&self, reason: Option<&str>) {
        *lock(&self.failure) = reason.map(str::to_string);
    }

    pub fn captured(&self) -> Vec<PathBuf> {
        lock(&self.captured).clone()
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn capture_file(&self, path: &Path) -> Result<(), HardwareFault> {
        sleep(self.readout).await;

        if let Some(reason) = lock(&self.failure).clone() {
            return Err(HardwareFault::new(Device::Camera, reason));
        }

        if self.write_files {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| HardwareFault::new(Device::Camera, e.to_string()))?;
            }
            tokio::fs::write(path, b"")
                .await
                .map_err(|e| HardwareFault::new(Device::Camera, e.to_string()))?;
        }

        lock(&self.captured).push(path.to_path_buf());
        Ok(())
    }
}

// =============================================================================
// MockSegmenter - Simulated Segmentation
// =============================================================================

/// Segmenter that reports success after a fixed delay.
#[derive(Default)]
pub struct MockSegmenter {
    duration: Duration,
    runs: Mutex<Vec<PathBuf>>,
    slot: TaskSlot,
}

impl MockSegmenter {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> Vec<PathBuf> {
        lock(&self.runs).clone()
    }
}

impl SegmentationController for MockSegmenter {
    fn start(&self, request: SegmentationRequest, done: Completion) -> Result<(), HardwareFault> {
        let duration = self.duration;
        lock(&self.runs).push(request.input_dir);
        self.slot
            .spawn(Device::Segmenter, done.operation(), async move {
                sleep(duration).await;
                done.succeed();
            })
    }

    fn cancel(&self, operation: OperationId) {
        self.slot.cancel(operation);
    }
}

// =============================================================================
// MockLight - Simulated Illumination
// =============================================================================

#[derive(Debug, Default)]
pub struct MockLight {
    levels: Mutex<Vec<f32>>,
}

impl MockLight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        lock(&self.levels).last().is_some_and(|level| *level > 0.0)
    }

    /// Every level set so far, oldest first.
    pub fn levels(&self) -> Vec<f32> {
        lock(&self.levels).clone()
    }
}

impl ActuatorPort for MockLight {
    fn on(&self) -> Result<(), HardwareFault> {
        self.set_level(1.0)
    }

    fn off(&self) -> Result<(), HardwareFault> {
        self.set_level(0.0)
    }

    fn set_level(&self, level: f32) -> Result<(), HardwareFault> {
        lock(&self.levels).push(level.clamp(0.0, 1.0));
        Ok(())
    }
}

// =============================================================================
// ScriptedDevice - Test-driven Controller
// =============================================================================

/// How a [`ScriptedDevice`] reacts to `start`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Script {
    /// Keep the completion until the test takes it with
    /// [`ScriptedDevice::take_pending`]
    #[default]
    Manual,
    /// Report success immediately
    Succeed,
    /// Report failure immediately
    Fail(String),
    /// Refuse to start at all
    RejectStart(String),
}

/// Controller that records every request and lets the caller decide when and
/// how each operation completes.
#[derive(Debug)]
pub struct ScriptedDevice<R> {
    device: Device,
    script: Mutex<Script>,
    requests: Mutex<Vec<R>>,
    pending: Mutex<Vec<Completion>>,
    cancelled: Mutex<Vec<OperationId>>,
    releases: AtomicU64,
}

impl<R: Clone> ScriptedDevice<R> {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            script: Mutex::new(Script::default()),
            requests: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            releases: AtomicU64::new(0),
        }
    }

    pub fn with_script(self, script: Script) -> Self {
        self.set_script(script);
        self
    }

    pub fn set_script(&self, script: Script) {
        *lock(&self.script) = script;
    }

    pub fn requests(&self) -> Vec<R> {
        lock(&self.requests).clone()
    }

    /// Completions of operations started under [`Script::Manual`].
    pub fn take_pending(&self) -> Vec<Completion> {
        std::mem::take(&mut *lock(&self.pending))
    }

    pub fn cancelled(&self) -> Vec<OperationId> {
        lock(&self.cancelled).clone()
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    fn begin(&self, request: R, done: Completion) -> Result<(), HardwareFault> {
        let script = lock(&self.script).clone();
        if let Script::RejectStart(reason) = script {
            return Err(HardwareFault::new(self.device, reason));
        }

        lock(&self.requests).push(request);
        match script {
            Script::Manual => lock(&self.pending).push(done),
            Script::Succeed => done.succeed(),
            Script::Fail(reason) => done.fail(reason),
            Script::RejectStart(_) => {}
        }
        Ok(())
    }

    fn abandon(&self, operation: OperationId) {
        lock(&self.cancelled).push(operation);
        lock(&self.pending).retain(|done| done.operation() != operation);
    }
}

impl PumpController for ScriptedDevice<PumpMove> {
    fn start(&self, planned: PumpMove, done: Completion) -> Result<(), HardwareFault> {
        self.begin(planned, done)
    }

    fn cancel(&self, operation: OperationId) {
        self.abandon(operation);
    }

    fn release(&self) -> Result<(), HardwareFault> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl CaptureController for ScriptedDevice<CaptureRequest> {
    fn start(&self, request: CaptureRequest, done: Completion) -> Result<(), HardwareFault> {
        self.begin(request, done)
    }

    fn cancel(&self, operation: OperationId) {
        self.abandon(operation);
    }
}

impl SegmentationController for ScriptedDevice<SegmentationRequest> {
    fn start(&self, request: SegmentationRequest, done: Completion) -> Result<(), HardwareFault> {
        self.begin(request, done)
    }

    fn cancel(&self, operation: OperationId) {
        self.abandon(operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::CompletionOutcome;
    use tokio::sync::mpsc;

    #[test]
    fn light_tracks_last_level() {
        let light = MockLight::new();
        light.on().unwrap();
        assert!(light.is_on());
        light.off().unwrap();
        assert!(!light.is_on());
        assert_eq!(light.levels(), vec![1.0, 0.0]);
    }

    #[test]
    fn scripted_device_holds_manual_completions() {
        let camera: ScriptedDevice<CaptureRequest> = ScriptedDevice::new(Device::Camera);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = CaptureRequest {
            output_path: PathBuf::from("a.jpg"),
            frame_index: 1,
        };

        camera
            .start(request.clone(), Completion::new(1, Device::Camera, tx))
            .unwrap();
        assert!(rx.try_recv().is_err());

        for done in camera.take_pending() {
            done.succeed();
        }
        assert_eq!(rx.try_recv().unwrap().outcome, CompletionOutcome::Success);
        assert_eq!(camera.requests(), vec![request]);
    }

    #[test]
    fn scripted_cancel_drops_pending() {
        let camera: ScriptedDevice<CaptureRequest> = ScriptedDevice::new(Device::Camera);
        let (tx, _rx) = mpsc::unbounded_channel();
        camera
            .start(
                CaptureRequest {
                    output_path: PathBuf::from("a.jpg"),
                    frame_index: 1,
                },
                Completion::new(5, Device::Camera, tx),
            )
            .unwrap();

        camera.cancel(5);

        assert!(camera.take_pending().is_empty());
        assert_eq!(camera.cancelled(), vec![5]);
    }

    #[test]
    fn rejected_start_is_not_recorded() {
        let camera: ScriptedDevice<CaptureRequest> = ScriptedDevice::new(Device::Camera)
            .with_script(Script::RejectStart("camera busy".into()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let fault = camera
            .start(
                CaptureRequest {
                    output_path: PathBuf::from("a.jpg"),
                    frame_index: 1,
                },
                Completion::new(1, Device::Camera, tx),
            )
            .unwrap_err();

        assert_eq!(fault, HardwareFault::new(Device::Camera, "camera busy"));
        assert!(camera.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn segmenter_succeeds_after_its_run_time() {
        let segmenter = MockSegmenter::new(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();

        segmenter
            .start(
                SegmentationRequest {
                    input_dir: PathBuf::from("/data/img/run"),
                },
                Completion::new(7, Device::Segmenter, tx),
            )
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, 7);
        assert_eq!(event.outcome, CompletionOutcome::Success);
        assert_eq!(segmenter.runs(), vec![PathBuf::from("/data/img/run")]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_segmentation_never_completes() {
        let segmenter = MockSegmenter::new(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();

        segmenter
            .start(
                SegmentationRequest {
                    input_dir: PathBuf::from("/data/img/run"),
                },
                Completion::new(8, Device::Segmenter, tx),
            )
            .unwrap();
        segmenter.cancel(8);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(segmenter.runs().len(), 1);
    }
}
