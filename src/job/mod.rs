//! Acquisition jobs: what to image, and how much sample to move per frame.

mod pump_plan;
mod validation;

pub use pump_plan::{
    PumpCalibration, PumpMove, DEFAULT_MAX_FLOW_RATE, DEFAULT_STEPS_PER_ML, DEFAULT_STEP_OVERHEAD,
};
pub use validation::{ensure_valid, validate};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Which way the pump pushes the sample.
///
/// `Forward` moves sample through the flow cell towards the waste side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PumpDirection {
    #[default]
    Forward,
    Backward,
}

/// A stop-flow acquisition: pump `volume`, let it settle, grab a frame,
/// repeated `target_frames` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionJob {
    pub id: Uuid,
    /// Volume pumped before each frame (mL)
    pub volume: f64,
    /// mL/min
    pub flow_rate: f64,
    pub target_frames: u32,
    #[serde(default)]
    pub direction: PumpDirection,
    /// Wait after pumping so the sample stops moving before capture
    #[serde(default, with = "humantime_serde")]
    pub stabilization: Duration,
    #[serde(default)]
    pub output_dir: PathBuf,
    /// Run the segmenter once all frames are in
    #[serde(default)]
    pub segmentation: bool,
    /// Free-form sample description carried through to run records
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub frames_captured: u32,
}

impl AcquisitionJob {
    pub fn new(volume: f64, flow_rate: f64, target_frames: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            volume,
            flow_rate,
            target_frames,
            direction: PumpDirection::default(),
            stabilization: Duration::ZERO,
            output_dir: PathBuf::new(),
            segmentation: false,
            metadata: serde_json::Map::new(),
            frames_captured: 0,
        }
    }

    pub fn with_direction(mut self, direction: PumpDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_stabilization(mut self, stabilization: Duration) -> Self {
        self.stabilization = stabilization;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_segmentation(mut self, enabled: bool) -> Self {
        self.segmentation = enabled;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.frames_captured >= self.target_frames
    }

    pub fn remaining(&self) -> u32 {
        self.target_frames.saturating_sub(self.frames_captured)
    }

    /// Count one more captured frame. Returns the new total.
    pub fn record_frame(&mut self) -> u32 {
        self.frames_captured = self.frames_captured.saturating_add(1);
        self.frames_captured
    }

    /// Where the next frame should be written, named after the capture time.
    pub fn frame_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.output_dir
            .join(format!("{}.jpg", at.format("%Y-%m-%d_%H-%M-%S-%6f")))
    }

    pub fn next_frame_path(&self) -> PathBuf {
        self.frame_path(Utc::now())
    }

    /// The per-frame pump move, with stabilization folded in as settle time.
    pub fn pump_move(&self, calibration: &PumpCalibration) -> PumpMove {
        let mut planned = calibration.plan(self.direction, self.volume, self.flow_rate);
        planned.settle = self.stabilization;
        planned
    }
}
