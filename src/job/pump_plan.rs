//! Volume/flow-rate to stepper motion conversion.

use crate::job::PumpDirection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Steps per millilitre for the standard PlanktoScope peristaltic pump.
pub const DEFAULT_STEPS_PER_ML: f64 = 507.0;

/// Fastest flow rate the pump is driven at, in mL/min.
pub const DEFAULT_MAX_FLOW_RATE: f64 = 50.0;

/// Time one step takes on the driver regardless of the requested delay.
pub const DEFAULT_STEP_OVERHEAD: Duration = Duration::from_millis(5);

/// Pump calibration constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpCalibration {
    /// Steps needed to move one millilitre
    pub steps_per_ml: f64,
    /// Flow rates above this are clamped (mL/min)
    pub max_flow_rate: f64,
    /// Fixed mechanical time per step, subtracted from the inter-step delay
    #[serde(with = "humantime_serde")]
    pub step_overhead: Duration,
}

impl Default for PumpCalibration {
    fn default() -> Self {
        Self {
            steps_per_ml: DEFAULT_STEPS_PER_ML,
            max_flow_rate: DEFAULT_MAX_FLOW_RATE,
            step_overhead: DEFAULT_STEP_OVERHEAD,
        }
    }
}

/// One pump motion, fully resolved to stepper terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpMove {
    pub direction: PumpDirection,
    /// Volume moved (mL)
    pub volume: f64,
    /// Flow rate actually used, after clamping (mL/min)
    pub flow_rate: f64,
    pub steps: u64,
    #[serde(with = "humantime_serde")]
    pub step_delay: Duration,
    /// Pause after the last step before the move counts as done
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl PumpMove {
    /// Expected wall time of the stepping part of the move.
    pub fn expected_duration(&self, calibration: &PumpCalibration) -> Duration {
        let steps = u32::try_from(self.steps).unwrap_or(u32::MAX);
        (self.step_delay + calibration.step_overhead).saturating_mul(steps)
    }
}

impl PumpCalibration {
    /// Number of steps needed for `volume` mL.
    pub fn steps_for(&self, volume: f64) -> u64 {
        (volume * self.steps_per_ml).round().max(0.0) as u64
    }

    /// Resolve a volume at a flow rate into a step count and inter-step delay.
    ///
    /// `steps = round(volume * steps_per_ml)` and
    /// `delay = (volume * 60 / flow_rate) / steps - step_overhead`, floored at
    /// zero. Inputs are expected to have been validated.
    pub fn plan(&self, direction: PumpDirection, volume: f64, flow_rate: f64) -> PumpMove {
        let mut flow_rate = flow_rate;
        if flow_rate > self.max_flow_rate {
            warn!(
                requested = flow_rate,
                max = self.max_flow_rate,
                "Pump speed has been clamped to the maximum safe speed"
            );
            flow_rate = self.max_flow_rate;
        }

        let steps = self.steps_for(volume);
        let step_delay = if steps == 0 {
            Duration::ZERO
        } else {
            let total_secs = volume * 60.0 / flow_rate;
            let delay = total_secs / steps as f64 - self.step_overhead.as_secs_f64();
            Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(Duration::ZERO)
        };

        PumpMove {
            direction,
            volume,
            flow_rate,
            steps,
            step_delay,
            settle: Duration::ZERO,
        }
    }
}
