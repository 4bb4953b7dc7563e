//! Imager states and the static transition table.
//!
//! States are plain values. Which successors a state allows depends only on
//! the active [`Profile`], so legality of a transition is a pure lookup.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Trait for state machine states.
///
/// All methods are pure. States describe the current position of a
/// controller and are recorded verbatim in its transition history.
///
/// # Required Traits
///
/// - `Clone`: states are copied into every history event
/// - `PartialEq`: transition legality compares states
/// - `Debug`: states show up in diagnostics
/// - `Serialize` + `Deserialize`: states are published and archived
pub trait State:
    Clone + PartialEq + Debug + Serialize + for<'de> Deserialize<'de> + Send + Sync
{
    /// Get the state's name for display/logging.
    fn name(&self) -> &str;

    /// Check if this is the idle state, where no hardware is driven.
    ///
    /// Default implementation returns `false`.
    fn is_idle(&self) -> bool {
        false
    }
}

/// Position of the imager in a stop-flow acquisition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagerState {
    /// Idle. No job, no hardware driven.
    Stop,
    /// A job was accepted and the instrument is getting ready.
    Imaging,
    /// Waiting for the pump to finish moving the next volume slice.
    Waiting,
    /// Capturing one frame.
    Capture,
    /// Handing the finished acquisition to the segmentation pipeline.
    Segmentation,
}

impl ImagerState {
    /// Every variant, in declaration order.
    pub const ALL: [ImagerState; 5] = [
        ImagerState::Stop,
        ImagerState::Imaging,
        ImagerState::Waiting,
        ImagerState::Capture,
        ImagerState::Segmentation,
    ];
}

impl State for ImagerState {
    fn name(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Imaging => "imaging",
            Self::Waiting => "waiting",
            Self::Capture => "capture",
            Self::Segmentation => "segmentation",
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

impl fmt::Display for ImagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which transition table the imager runs with.
///
/// `Baseline` never reaches [`ImagerState::Segmentation`]. `Segmentation`
/// adds it as an optional successor of `Capture` whose only way out is `Stop`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Baseline,
    Segmentation,
}

impl Profile {
    /// States reachable under this profile.
    pub fn states(self) -> &'static [ImagerState] {
        use ImagerState::*;

        match self {
            Profile::Baseline => &[Stop, Imaging, Waiting, Capture],
            Profile::Segmentation => &[Stop, Imaging, Waiting, Capture, Segmentation],
        }
    }

    /// Whether `from -> to` is in this profile's table.
    pub fn allows(self, from: ImagerState, to: ImagerState) -> bool {
        allowed_successors(self, from).contains(&to)
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(Profile::Baseline),
            "segmentation" => Ok(Profile::Segmentation),
            other => Err(format!(
                "unknown profile '{other}', expected 'baseline' or 'segmentation'"
            )),
        }
    }
}

/// Legal successors of `state` under `profile`.
pub fn allowed_successors(profile: Profile, state: ImagerState) -> &'static [ImagerState] {
    use ImagerState::*;

    match (profile, state) {
        (_, Stop) => &[Imaging],
        (_, Imaging) => &[Waiting, Stop],
        (_, Waiting) => &[Stop, Capture],
        (Profile::Baseline, Capture) => &[Stop, Waiting],
        (Profile::Segmentation, Capture) => &[Stop, Waiting, Segmentation],
        (Profile::Segmentation, Segmentation) => &[Stop],
        (Profile::Baseline, Segmentation) => &[],
    }
}
