//! PlanktoScope imager: a stop-flow acquisition state machine
//!
//! The imager turns a "start acquisition" request into a bounded sequence of
//! (pump a volume slice, capture one frame) cycles. Every step is gated by an
//! explicit transition table, and every exit releases the pump coils and
//! switches the light off.
//!
//! The crate follows a "pure core, imperative shell" split. The state machine
//! in [`core`] is plain data plus a transition table. Hardware lives behind
//! the traits in [`hardware`] and reports back asynchronously. The
//! [`acquisition`] layer ties the two together and serializes all access
//! through a single actor task.
//!
//! # Core Concepts
//!
//! - **ImagerState**: `Stop`, `Imaging`, `Waiting`, `Capture`, `Segmentation`
//! - **Profile**: which transition table is active (with or without `Segmentation`)
//! - **AcquisitionJob**: volume per frame, flow rate, frame count
//! - **Completion**: one-shot callback handle given to each hardware operation
//! - **History**: every transition attempt, applied or rejected
//!
//! # Example
//!
//! ```rust
//! use planktoscope_imager::core::{ImagerState, ImagerStateMachine, Profile};
//!
//! let mut machine = ImagerStateMachine::new(Profile::Baseline);
//! machine.request_transition(ImagerState::Imaging).unwrap();
//!
//! // Capture is only reachable from Waiting
//! assert!(machine.request_transition(ImagerState::Capture).is_err());
//! assert_eq!(machine.current(), ImagerState::Imaging);
//! assert_eq!(machine.history().rejected().count(), 1);
//! ```

pub mod acquisition;
pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod hardware;
pub mod job;
pub mod logging;

// Re-export commonly used types
pub use acquisition::{Coordinator, CoordinatorSettings, ImagerHandle, ImagerSnapshot};
pub use config::ImagerConfig;
pub use core::{ImagerState, ImagerStateMachine, Profile, State};
pub use error::{ImagerError, Result};
pub use job::{AcquisitionJob, PumpDirection};
