//! The acquisition coordination loop.
//!
//! The coordinator owns the state machine, the active job and the id of the
//! single hardware operation in flight. It is synchronous: hardware runs
//! elsewhere and reports back through [`CompletionEvent`]s, which the owner
//! feeds to [`Coordinator::handle_completion`].

use super::record::{RunArchive, RunOutcome, RunRecord};
use crate::channel::{StatusReport, StatusSink};
use crate::core::{ImagerState, ImagerStateMachine, Profile, TransitionHistory, Trigger};
use crate::error::{Device, HardwareFault, ImagerError, Result};
use crate::hardware::{
    CaptureRequest, Completion, CompletionEvent, CompletionOutcome, Hardware, OperationId,
    SegmentationRequest,
};
use crate::job::{ensure_valid, AcquisitionJob, PumpCalibration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything the coordinator needs from configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorSettings {
    pub profile: Profile,
    pub calibration: PumpCalibration,
    /// Jobs without an output directory write under `<root>/<date>/<job id>`
    pub output_root: PathBuf,
    pub archive_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            calibration: PumpCalibration::default(),
            output_root: PathBuf::from("data/img"),
            archive_capacity: 32,
        }
    }
}

/// Point-in-time view of the imager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImagerSnapshot {
    pub state: ImagerState,
    pub profile: Profile,
    pub job_id: Option<Uuid>,
    pub frames_captured: u32,
    pub target_frames: Option<u32>,
    pub fault: Option<String>,
    pub in_flight: Option<OperationId>,
    pub stale_completions: u64,
    pub archived_runs: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct InFlight {
    operation: OperationId,
    device: Device,
}

#[derive(Debug)]
struct ActiveJob {
    job: AcquisitionJob,
    started_at: DateTime<Utc>,
    /// History index of the event that started this job
    history_mark: usize,
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    machine: ImagerStateMachine,
    hardware: Hardware,
    status: Option<Arc<dyn StatusSink>>,
    completions: mpsc::UnboundedSender<CompletionEvent>,
    next_operation: OperationId,
    in_flight: Option<InFlight>,
    active: Option<ActiveJob>,
    metadata: Map<String, Value>,
    last_frames: u32,
    last_fault: Option<String>,
    stale_completions: u64,
    archive: RunArchive,
}

impl Coordinator {
    /// Create a coordinator in `Stop`.
    ///
    /// The returned receiver yields the completions of every operation the
    /// coordinator starts; hand each one back to [`Self::handle_completion`].
    pub fn new(
        settings: CoordinatorSettings,
        hardware: Hardware,
        status: Option<Arc<dyn StatusSink>>,
    ) -> (Self, mpsc::UnboundedReceiver<CompletionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            machine: ImagerStateMachine::new(settings.profile),
            archive: RunArchive::new(settings.archive_capacity),
            settings,
            hardware,
            status,
            completions: tx,
            next_operation: 1,
            in_flight: None,
            active: None,
            metadata: Map::new(),
            last_frames: 0,
            last_fault: None,
            stale_completions: 0,
        };
        (coordinator, rx)
    }

    pub fn state(&self) -> ImagerState {
        self.machine.current()
    }

    pub fn profile(&self) -> Profile {
        self.machine.profile()
    }

    pub fn history(&self) -> &TransitionHistory<ImagerState> {
        self.machine.history()
    }

    pub fn archive(&self) -> &RunArchive {
        &self.archive
    }

    pub fn current_job(&self) -> Option<&AcquisitionJob> {
        self.active.as_ref().map(|active| &active.job)
    }

    /// Frames of the active job, or of the last finished one when idle.
    pub fn frames_captured(&self) -> u32 {
        self.current_job()
            .map_or(self.last_frames, |job| job.frames_captured)
    }

    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }

    pub fn stale_completions(&self) -> u64 {
        self.stale_completions
    }

    pub fn in_flight(&self) -> Option<OperationId> {
        self.in_flight.map(|f| f.operation)
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            state: self.state(),
            frames_captured: self.frames_captured(),
            fault: self.last_fault.clone(),
        }
    }

    pub fn snapshot(&self) -> ImagerSnapshot {
        ImagerSnapshot {
            state: self.state(),
            profile: self.profile(),
            job_id: self.current_job().map(|job| job.id),
            frames_captured: self.frames_captured(),
            target_frames: self.current_job().map(|job| job.target_frames),
            fault: self.last_fault.clone(),
            in_flight: self.in_flight(),
            stale_completions: self.stale_completions,
            archived_runs: self.archive.len(),
        }
    }

    /// Accept `job` and issue its first pump move.
    ///
    /// The job is validated before anything else; a busy imager answers with
    /// `IllegalTransition`. If the hardware refuses to start, the imager is
    /// back in `Stop` with the fault attached when this returns.
    pub fn start(&mut self, job: AcquisitionJob) -> Result<()> {
        ensure_valid(&job, &self.settings.calibration)?;

        let mark = self.machine.history().len();
        self.machine.transition(ImagerState::Imaging, Trigger::StartCommand)?;

        let job = self.prepare(job);
        info!(
            job = %job.id,
            volume = job.volume,
            flow_rate = job.flow_rate,
            frames = job.target_frames,
            output = %job.output_dir.display(),
            "Starting acquisition"
        );
        self.active = Some(ActiveJob {
            job,
            started_at: Utc::now(),
            history_mark: mark,
        });
        self.last_fault = None;
        self.last_frames = 0;
        self.publish();

        if let Err(fault) = self.light_on() {
            self.fault(fault.clone());
            return Err(fault.into());
        }

        self.machine.transition(ImagerState::Waiting, Trigger::StartCommand)?;
        self.publish();

        if let Err(fault) = self.issue_pump() {
            self.fault(fault.clone());
            return Err(fault.into());
        }
        Ok(())
    }

    /// Interrupt the active job. Does nothing when already stopped.
    pub fn stop(&mut self) -> Result<()> {
        if self.machine.is_idle() {
            debug!("Stop requested while already stopped");
            return Ok(());
        }

        self.cancel_in_flight();
        self.machine.transition(ImagerState::Stop, Trigger::StopCommand)?;
        self.wind_down();
        self.archive_job(RunOutcome::Interrupted);
        info!(frames = self.last_frames, "Acquisition interrupted");
        self.publish();
        Ok(())
    }

    /// Replace the metadata copied into subsequent jobs.
    pub fn update_config(&mut self, metadata: Map<String, Value>) -> Result<()> {
        if !self.machine.is_idle() {
            warn!(state = %self.state(), "Refusing configuration update while busy");
            return Err(ImagerError::Busy {
                state: self.state(),
            });
        }
        info!(keys = metadata.len(), "Configuration updated");
        self.metadata = metadata;
        Ok(())
    }

    /// Apply one hardware completion.
    ///
    /// Completions for anything but the operation in flight are dropped and
    /// reported as `StaleCompletion`. Hardware failures are handled here by
    /// stopping the job; they do not surface as errors.
    pub fn handle_completion(&mut self, event: CompletionEvent) -> Result<()> {
        let expected = InFlight {
            operation: event.operation,
            device: event.device,
        };
        if self.in_flight != Some(expected) {
            return Err(self.stale(event.operation));
        }
        self.in_flight = None;

        if let CompletionOutcome::Failure(reason) = event.outcome {
            self.fault(HardwareFault::new(event.device, reason));
            return Ok(());
        }

        let step = match (self.state(), event.device) {
            (ImagerState::Waiting, Device::Pump) => self.on_pump_done(),
            (ImagerState::Capture, Device::Camera) => self.on_capture_done(),
            (ImagerState::Segmentation, Device::Segmenter) => {
                self.finish(Trigger::SegmentationCompleted)
            }
            _ => return Err(self.stale(event.operation)),
        };

        match step {
            Ok(()) => Ok(()),
            Err(ImagerError::HardwareFault(fault)) => {
                self.fault(fault);
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Force the imager to `Stop` because of a hardware problem.
    ///
    /// The fault stays visible in the status until the next job starts.
    pub fn fault(&mut self, fault: HardwareFault) {
        error!(state = %self.state(), %fault, "Hardware fault, stopping acquisition");
        self.cancel_in_flight();
        self.last_fault = Some(fault.reason.clone());

        if !self.machine.is_idle() {
            if let Err(e) = self
                .machine
                .transition(ImagerState::Stop, Trigger::HardwareFault)
            {
                error!(error = %e, "Could not return to stop");
            }
        }
        self.wind_down();
        self.archive_job(RunOutcome::Faulted {
            reason: fault.to_string(),
        });
        self.publish();
    }

    fn on_pump_done(&mut self) -> Result<()> {
        self.machine
            .transition(ImagerState::Capture, Trigger::PumpCompleted)?;
        self.publish();
        self.issue_capture()?;
        Ok(())
    }

    fn on_capture_done(&mut self) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Err(HardwareFault::new(Device::Camera, "no active job").into());
        };
        let frames = active.job.record_frame();
        let target = active.job.target_frames;
        let segment = active.job.segmentation;
        info!(frame = frames, target, "Image captured");

        if frames < target {
            self.machine
                .transition(ImagerState::Waiting, Trigger::CaptureCompleted)?;
            self.publish();
            self.issue_pump()?;
            return Ok(());
        }

        if segment && self.profile() == Profile::Segmentation && self.hardware.segmenter.is_some() {
            self.machine
                .transition(ImagerState::Segmentation, Trigger::CaptureCompleted)?;
            self.publish();
            self.issue_segmentation()?;
            return Ok(());
        }

        self.finish(Trigger::CaptureCompleted)
    }

    fn finish(&mut self, trigger: Trigger) -> Result<()> {
        self.machine.transition(ImagerState::Stop, trigger)?;
        self.wind_down();
        self.archive_job(RunOutcome::Completed);
        info!(frames = self.last_frames, "Acquisition done");
        self.publish();
        Ok(())
    }

    fn prepare(&self, mut job: AcquisitionJob) -> AcquisitionJob {
        job.frames_captured = 0;
        for (key, value) in &self.metadata {
            job.metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if job.output_dir.as_os_str().is_empty() {
            job.output_dir = self
                .settings
                .output_root
                .join(Utc::now().format("%Y-%m-%d").to_string())
                .join(job.id.to_string());
        }
        if job.segmentation && self.profile() != Profile::Segmentation {
            warn!(job = %job.id, "Segmentation requested but the baseline profile is active");
        }
        job
    }

    fn issue_pump(&mut self) -> std::result::Result<(), HardwareFault> {
        let planned = self
            .current_job()
            .map(|job| job.pump_move(&self.settings.calibration))
            .ok_or_else(|| HardwareFault::new(Device::Pump, "no active job"))?;
        let done = self.begin(Device::Pump);
        debug!(
            operation = done.operation(),
            steps = planned.steps,
            expected = ?planned.expected_duration(&self.settings.calibration),
            "Issuing pump move"
        );
        let started = self.hardware.pump.start(planned, done);
        if started.is_err() {
            self.in_flight = None;
        }
        started
    }

    fn issue_capture(&mut self) -> std::result::Result<(), HardwareFault> {
        let request = self
            .current_job()
            .map(|job| CaptureRequest {
                output_path: job.next_frame_path(),
                frame_index: job.frames_captured + 1,
            })
            .ok_or_else(|| HardwareFault::new(Device::Camera, "no active job"))?;
        let done = self.begin(Device::Camera);
        debug!(
            operation = done.operation(),
            path = %request.output_path.display(),
            "Issuing capture"
        );
        let started = self.hardware.camera.start(request, done);
        if started.is_err() {
            self.in_flight = None;
        }
        started
    }

    fn issue_segmentation(&mut self) -> std::result::Result<(), HardwareFault> {
        let segmenter = self
            .hardware
            .segmenter
            .clone()
            .ok_or_else(|| HardwareFault::new(Device::Segmenter, "no segmenter configured"))?;
        let request = self
            .current_job()
            .map(|job| SegmentationRequest {
                input_dir: job.output_dir.clone(),
            })
            .ok_or_else(|| HardwareFault::new(Device::Segmenter, "no active job"))?;
        let done = self.begin(Device::Segmenter);
        let started = segmenter.start(request, done);
        if started.is_err() {
            self.in_flight = None;
        }
        started
    }

    /// Allocate the next operation id and mark it in flight.
    fn begin(&mut self, device: Device) -> Completion {
        let operation = self.next_operation;
        self.next_operation += 1;
        self.in_flight = Some(InFlight { operation, device });
        Completion::new(operation, device, self.completions.clone())
    }

    fn cancel_in_flight(&mut self) {
        let Some(InFlight { operation, device }) = self.in_flight.take() else {
            return;
        };
        debug!(operation, %device, "Cancelling operation");
        match device {
            Device::Pump => self.hardware.pump.cancel(operation),
            Device::Camera => self.hardware.camera.cancel(operation),
            Device::Segmenter => {
                if let Some(segmenter) = &self.hardware.segmenter {
                    segmenter.cancel(operation);
                }
            }
            Device::Light => {}
        }
    }

    fn stale(&mut self, operation: OperationId) -> ImagerError {
        self.stale_completions += 1;
        debug!(operation, in_flight = ?self.in_flight(), "Discarding stale completion");
        ImagerError::StaleCompletion { operation }
    }

    fn light_on(&self) -> std::result::Result<(), HardwareFault> {
        match &self.hardware.light {
            Some(light) => light.on(),
            None => Ok(()),
        }
    }

    /// Release everything that may still be powered.
    fn wind_down(&mut self) {
        if let Err(fault) = self.hardware.pump.release() {
            warn!(%fault, "Failed to release pump");
        }
        if let Some(light) = &self.hardware.light {
            if let Err(fault) = light.off() {
                warn!(%fault, "Failed to switch light off");
            }
        }
    }

    fn archive_job(&mut self, outcome: RunOutcome) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.last_frames = active.job.frames_captured;
        let record = RunRecord {
            transitions: self.machine.history().since(active.history_mark).to_vec(),
            job: active.job,
            profile: self.profile(),
            started_at: active.started_at,
            finished_at: Utc::now(),
            outcome,
        };
        self.archive.push(record);
    }

    fn publish(&self) {
        if let Some(status) = &self.status {
            status.publish(&self.status_report());
        }
    }
}
