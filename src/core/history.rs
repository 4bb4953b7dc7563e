//! Transition history tracking.
//!
//! Every transition attempt, applied or rejected, becomes one
//! [`TransitionEvent`]. The history only ever grows; events are never
//! edited after they are recorded.

use super::state::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What caused a transition attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Direct call to `request_transition`.
    Request,
    StartCommand,
    StopCommand,
    PumpCompleted,
    CaptureCompleted,
    SegmentationCompleted,
    HardwareFault,
}

/// Whether the attempt changed the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied,
    Rejected,
}

/// Record of a single transition attempt.
///
/// # Example
///
/// ```rust
/// use planktoscope_imager::core::{ImagerState, TransitionEvent, TransitionOutcome, Trigger};
/// use chrono::Utc;
///
/// let event = TransitionEvent {
///     from: ImagerState::Stop,
///     to: ImagerState::Imaging,
///     timestamp: Utc::now(),
///     trigger: Trigger::StartCommand,
///     outcome: TransitionOutcome::Applied,
/// };
/// assert!(event.is_applied());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct TransitionEvent<S: State> {
    /// The state the machine was in
    pub from: S,
    /// The state that was requested
    pub to: S,
    /// When the attempt happened
    pub timestamp: DateTime<Utc>,
    /// What asked for it
    pub trigger: Trigger,
    /// Whether it was applied
    pub outcome: TransitionOutcome,
}

impl<S: State> TransitionEvent<S> {
    pub fn is_applied(&self) -> bool {
        self.outcome == TransitionOutcome::Applied
    }
}

/// Ordered, append-only log of transition attempts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct TransitionHistory<S: State> {
    events: Vec<TransitionEvent<S>>,
}

impl<S: State> Default for TransitionHistory<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: State> TransitionHistory<S> {
    /// Create a new empty history.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Append an event.
    pub fn record(&mut self, event: TransitionEvent<S>) {
        self.events.push(event);
    }

    /// Get the path of states actually visited.
    ///
    /// Rejected attempts are skipped: the path starts at the `from` state of
    /// the first applied event, followed by the `to` state of every applied
    /// event.
    pub fn get_path(&self) -> Vec<&S> {
        let mut path = Vec::new();
        for event in self.applied() {
            if path.is_empty() {
                path.push(&event.from);
            }
            path.push(&event.to);
        }
        path
    }

    /// Applied events, in order.
    pub fn applied(&self) -> impl Iterator<Item = &TransitionEvent<S>> {
        self.events.iter().filter(|e| e.is_applied())
    }

    /// Rejected events, in order.
    pub fn rejected(&self) -> impl Iterator<Item = &TransitionEvent<S>> {
        self.events.iter().filter(|e| !e.is_applied())
    }

    /// Time between the first and last recorded attempt.
    ///
    /// Returns `None` if nothing has been recorded.
    pub fn duration(&self) -> Option<Duration> {
        if let (Some(first), Some(last)) = (self.events.first(), self.events.last()) {
            let duration = last.timestamp.signed_duration_since(first.timestamp);
            duration.to_std().ok()
        } else {
            None
        }
    }

    /// All events, in order.
    pub fn events(&self) -> &[TransitionEvent<S>] {
        &self.events
    }

    /// Events recorded at or after position `index`.
    pub fn since(&self, index: usize) -> &[TransitionEvent<S>] {
        self.events.get(index..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ImagerState;

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

    #[test]
    fn new_history_is_empty() {
        let history: TransitionHistory<ImagerState> = TransitionHistory::new();
        assert!(history.is_empty());
        assert!(history.get_path().is_empty());
        assert!(history.duration().is_none());
    }

    #[test]
    fn get_path_skips_rejected_attempts() {
        use ImagerState::*;
        let mut history = TransitionHistory::new();

        history.record(event(Stop, Capture, TransitionOutcome::Rejected));
        history.record(event(Stop, Imaging, TransitionOutcome::Applied));
        history.record(event(Imaging, Capture, TransitionOutcome::Rejected));
        history.record(event(Imaging, Waiting, TransitionOutcome::Applied));

        assert_eq!(history.len(), 4);
        assert_eq!(history.get_path(), vec![&Stop, &Imaging, &Waiting]);
        assert_eq!(history.rejected().count(), 2);
    }

    #[test]
    fn since_returns_tail() {
        use ImagerState::*;
        let mut history = TransitionHistory::new();
        history.record(event(Stop, Imaging, TransitionOutcome::Applied));
        history.record(event(Imaging, Stop, TransitionOutcome::Applied));

        assert_eq!(history.since(1).len(), 1);
        assert_eq!(history.since(1)[0].to, Stop);
        assert!(history.since(5).is_empty());
    }

    #[test]
    fn duration_calculates_elapsed_time() {
        use ImagerState::*;
        let mut history = TransitionHistory::new();
        let start = Utc::now();

        history.record(TransitionEvent {
            timestamp: start,
            ..event(Stop, Imaging, TransitionOutcome::Applied)
        });
        history.record(TransitionEvent {
            timestamp: start + chrono::Duration::milliseconds(250),
            ..event(Imaging, Waiting, TransitionOutcome::Applied)
        });

        assert_eq!(history.duration(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn history_serializes_correctly() {
        let mut history = TransitionHistory::new();
        history.record(event(
            ImagerState::Stop,
            ImagerState::Imaging,
            TransitionOutcome::Applied,
        ));

        let json = serde_json::to_string(&history).unwrap();
        assert!(json.contains("\"trigger\":\"request\""));
        let deserialized: TransitionHistory<ImagerState> = serde_json::from_str(&json).unwrap();
        assert_eq!(history.events(), deserialized.events());
    }
}
