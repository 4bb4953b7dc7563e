//! Archive of finished acquisition runs.
//!
//! Kept in memory only; a run is archived when the imager returns to `Stop`.

use crate::core::{ImagerState, Profile, TransitionEvent};
use crate::job::AcquisitionJob;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every requested frame was captured
    Completed,
    /// Stopped on request
    Interrupted,
    Faulted { reason: String },
}

/// Snapshot of a finished job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub job: AcquisitionJob,

    pub profile: Profile,

    /// When the job was accepted
    pub started_at: DateTime<Utc>,

    /// When the imager got back to `Stop`
    pub finished_at: DateTime<Utc>,

    pub outcome: RunOutcome,

    /// Transition attempts made while the job was active
    pub transitions: Vec<TransitionEvent<ImagerState>>,
}

impl RunRecord {
    pub fn frames_captured(&self) -> u32 {
        self.job.frames_captured
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// States visited, in order, starting with the state the run began in.
    pub fn path(&self) -> Vec<ImagerState> {
        let mut path = Vec::new();
        for event in self.transitions.iter().filter(|e| e.is_applied()) {
            if path.is_empty() {
                path.push(event.from);
            }
            path.push(event.to);
        }
        path
    }
}

/// Bounded archive, oldest records evicted first.
#[derive(Clone, Debug)]
pub struct RunArchive {
    capacity: usize,
    records: VecDeque<RunRecord>,
}

impl RunArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, record: RunRecord) {
        if self.capacity == 0 {
            return;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn latest(&self) -> Option<&RunRecord> {
        self.records.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RunRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TransitionOutcome, Trigger};
    use ImagerState::*;

    fn event(
        from: ImagerState,
        to: ImagerState,
        outcome: TransitionOutcome,
    ) -> TransitionEvent<ImagerState> {
        TransitionEvent {
            from,
            to,
            timestamp: Utc::now(),
            trigger: Trigger::Request,
            outcome,
        }
    }

    fn record(outcome: RunOutcome) -> RunRecord {
        let now = Utc::now();
        RunRecord {
            job: AcquisitionJob::new(1.0, 2.0, 1),
            profile: Profile::Baseline,
            started_at: now,
            finished_at: now,
            outcome,
            transitions: vec![
                event(Stop, Imaging, TransitionOutcome::Applied),
                event(Imaging, Capture, TransitionOutcome::Rejected),
                event(Imaging, Stop, TransitionOutcome::Applied),
            ],
        }
    }

    #[test]
    fn path_skips_rejected_attempts() {
        assert_eq!(record(RunOutcome::Interrupted).path(), vec![Stop, Imaging, Stop]);
    }

    #[test]
    fn archive_evicts_oldest() {
        let mut archive = RunArchive::new(2);
        archive.push(record(RunOutcome::Completed));
        archive.push(record(RunOutcome::Interrupted));
        archive.push(record(RunOutcome::Faulted {
            reason: "camera busy".into(),
        }));

        assert_eq!(archive.len(), 2);
        let outcomes: Vec<_> = archive.iter().map(|r| r.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                RunOutcome::Interrupted,
                RunOutcome::Faulted {
                    reason: "camera busy".into()
                }
            ]
        );
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut archive = RunArchive::new(0);
        archive.push(record(RunOutcome::Completed));
        assert!(archive.is_empty());
        assert!(archive.latest().is_none());
    }

    #[test]
    fn record_round_trips_through_json() {
        let original = record(RunOutcome::Faulted {
            reason: "pump fault: stalled".into(),
        });

        let json = serde_json::to_string(&original).unwrap();
        let restored: RunRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, original);
    }
}
