//! Core state machine types and logic.
//!
//! This module contains the pure part of the imager:
//! - State definitions and the per-profile transition table
//! - The append-only transition history
//! - The state machine that applies or rejects transitions
//!
//! Nothing in here touches hardware.

mod history;
mod machine;
mod state;

pub use history::{TransitionEvent, TransitionHistory, TransitionOutcome, Trigger};
pub use machine::ImagerStateMachine;
pub use state::{allowed_successors, ImagerState, Profile, State};
