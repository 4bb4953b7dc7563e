//! Validation of acquisition jobs.
//!
//! Uses Stillwater's `Validation` so that every problem with a job is reported
//! at once instead of stopping at the first one.

use crate::error::{ImagerError, JobViolation};
use crate::job::{AcquisitionJob, PumpCalibration};
use stillwater::validation::Validation;
use stillwater::NonEmptyVec;

type Check = Validation<(), NonEmptyVec<JobViolation>>;

fn check(ok: bool, violation: impl FnOnce() -> JobViolation) -> Check {
    if ok {
        Validation::success(())
    } else {
        Validation::fail(violation())
    }
}

/// Check a job against the pump calibration, accumulating ALL violations.
pub fn validate(job: &AcquisitionJob, calibration: &PumpCalibration) -> Check {
    let mut checks: Vec<Check> = Vec::new();

    let volume_finite = job.volume.is_finite();
    checks.push(check(volume_finite, || JobViolation::NotFinite {
        field: "volume".to_string(),
    }));
    checks.push(check(!volume_finite || job.volume > 0.0, || {
        JobViolation::NonPositiveVolume { volume: job.volume }
    }));

    let flow_finite = job.flow_rate.is_finite();
    checks.push(check(flow_finite, || JobViolation::NotFinite {
        field: "flow_rate".to_string(),
    }));
    checks.push(check(!flow_finite || job.flow_rate > 0.0, || {
        JobViolation::NonPositiveFlowRate {
            flow_rate: job.flow_rate,
        }
    }));

    checks.push(check(job.target_frames > 0, || JobViolation::NoFrames));

    // Only meaningful once the volume itself is sane
    if volume_finite && job.volume > 0.0 {
        checks.push(check(calibration.steps_for(job.volume) > 0, || {
            JobViolation::BelowOneStep { volume: job.volume }
        }));
    }

    Validation::all_vec(checks).map(|_| ())
}

/// [`validate`], folded into the crate's error type.
pub fn ensure_valid(
    job: &AcquisitionJob,
    calibration: &PumpCalibration,
) -> Result<(), ImagerError> {
    match validate(job, calibration) {
        Validation::Success(_) => Ok(()),
        Validation::Failure(errors) => Err(ImagerError::InvalidJob {
            violations: errors.iter().cloned().collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(volume: f64, flow_rate: f64, frames: u32) -> AcquisitionJob {
        AcquisitionJob::new(volume, flow_rate, frames)
    }

    #[test]
    fn valid_job_passes() {
        let result = validate(&job(10.0, 2.0, 5), &PumpCalibration::default());
        assert!(result.is_success());
    }

    #[test]
    fn accumulates_all_violations() {
        let result = validate(&job(0.0, -1.0, 0), &PumpCalibration::default());

        match result {
            Validation::Failure(errors) => {
                assert_eq!(errors.len(), 3);
                assert!(errors
                    .iter()
                    .any(|e| matches!(e, JobViolation::NonPositiveVolume { .. })));
                assert!(errors
                    .iter()
                    .any(|e| matches!(e, JobViolation::NonPositiveFlowRate { .. })));
                assert!(errors.iter().any(|e| matches!(e, JobViolation::NoFrames)));
            }
            Validation::Success(_) => panic!("Expected failures, got success"),
        }
    }

    #[test]
    fn nan_is_reported_as_not_finite() {
        let err = ensure_valid(&job(f64::NAN, 2.0, 1), &PumpCalibration::default()).unwrap_err();

        match err {
            ImagerError::InvalidJob { violations } => {
                assert_eq!(
                    violations,
                    vec![JobViolation::NotFinite {
                        field: "volume".to_string()
                    }]
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn sub_step_volume_is_rejected() {
        let err = ensure_valid(&job(0.0001, 2.0, 1), &PumpCalibration::default()).unwrap_err();
        assert!(matches!(
            err,
            ImagerError::InvalidJob { ref violations }
                if violations == &[JobViolation::BelowOneStep { volume: 0.0001 }]
        ));
    }
}
