//! The imager's finite-state machine.

use super::history::{TransitionEvent, TransitionHistory, TransitionOutcome, Trigger};
use super::state::{allowed_successors, ImagerState, Profile, State};
use crate::error::IllegalTransition;
use chrono::Utc;
use tracing::{error, info};

/// Finite-state controller guarding the imager's hardware.
///
/// The machine is not thread-safe by itself; it is meant to be owned by a
/// single task (see [`crate::acquisition::ImagerActor`]).
#[derive(Clone, Debug)]
pub struct ImagerStateMachine {
    profile: Profile,
    current: ImagerState,
    history: TransitionHistory<ImagerState>,
}

impl ImagerStateMachine {
    /// Create a machine in [`ImagerState::Stop`].
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            current: ImagerState::Stop,
            history: TransitionHistory::new(),
        }
    }

    /// Get current state (pure)
    pub fn current(&self) -> ImagerState {
        self.current
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Legal successors of the current state (pure)
    pub fn allowed_successors(&self) -> &'static [ImagerState] {
        allowed_successors(self.profile, self.current)
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_idle()
    }

    /// Get transition history (pure)
    pub fn history(&self) -> &TransitionHistory<ImagerState> {
        &self.history
    }

    /// Move to `target` if the table allows it.
    pub fn request_transition(&mut self, target: ImagerState) -> Result<(), IllegalTransition> {
        self.transition(target, Trigger::Request)
    }

    /// Move to `target` if the table allows it, recording `trigger`.
    ///
    /// The attempt is recorded whether or not it succeeds. On failure the
    /// current state is left untouched.
    pub fn transition(
        &mut self,
        target: ImagerState,
        trigger: Trigger,
    ) -> Result<(), IllegalTransition> {
        let from = self.current;
        let allowed = self.profile.allows(from, target);

        self.history.record(TransitionEvent {
            from,
            to: target,
            timestamp: Utc::now(),
            trigger,
            outcome: if allowed {
                TransitionOutcome::Applied
            } else {
                TransitionOutcome::Rejected
            },
        });

        if !allowed {
            error!(from = %from, to = %target, ?trigger, "Switching state not possible");
            return Err(IllegalTransition { from, to: target });
        }

        info!(from = %from, to = %target, ?trigger, "Switched to new state");
        self.current = target;
        Ok(())
    }
}

impl Default for ImagerStateMachine {
    fn default() -> Self {
        Self::new(Profile::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ImagerState::*;

    #[test]
    fn starts_in_stop() {
        let machine = ImagerStateMachine::default();
        assert_eq!(machine.current(), Stop);
        assert!(machine.is_idle());
        assert!(machine.history().is_empty());
    }

    #[test]
    fn legal_transition_updates_state_and_records() {
        let mut machine = ImagerStateMachine::new(Profile::Baseline);

        machine.request_transition(Imaging).unwrap();

        assert_eq!(machine.current(), Imaging);
        let events = machine.history().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from, Stop);
        assert_eq!(events[0].to, Imaging);
        assert_eq!(events[0].trigger, Trigger::Request);
        assert!(events[0].is_applied());
    }

    #[test]
    fn illegal_transition_is_rejected_and_recorded() {
        let mut machine = ImagerStateMachine::new(Profile::Baseline);

        let err = machine.request_transition(Capture).unwrap_err();

        assert_eq!(err, IllegalTransition { from: Stop, to: Capture });
        assert_eq!(machine.current(), Stop);
        assert_eq!(machine.history().rejected().count(), 1);
        assert!(machine.history().get_path().is_empty());
    }

    #[test]
    fn second_start_is_refused_while_busy() {
        let mut machine = ImagerStateMachine::new(Profile::Baseline);
        machine.request_transition(Imaging).unwrap();
        machine.request_transition(Waiting).unwrap();

        assert!(machine.transition(Imaging, Trigger::StartCommand).is_err());
        assert_eq!(machine.current(), Waiting);
    }

    #[test]
    fn baseline_cannot_enter_segmentation() {
        let mut machine = ImagerStateMachine::new(Profile::Baseline);
        for target in [Imaging, Waiting, Capture] {
            machine.request_transition(target).unwrap();
        }

        assert!(machine.request_transition(Segmentation).is_err());
        assert_eq!(machine.current(), Capture);
    }

    #[test]
    fn segmentation_profile_path() {
        let mut machine = ImagerStateMachine::new(Profile::Segmentation);
        for target in [Imaging, Waiting, Capture, Segmentation, Stop] {
            machine.request_transition(target).unwrap();
        }

        assert_eq!(
            machine.history().get_path(),
            vec![&Stop, &Imaging, &Waiting, &Capture, &Segmentation, &Stop]
        );
    }
}
