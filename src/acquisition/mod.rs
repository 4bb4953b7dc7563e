//! Acquisition: the coordination loop and the actor that runs it.

mod actor;
mod coordinator;
mod record;

pub use actor::{spawn, ImagerActor, ImagerHandle, ImagerRequest};
pub use coordinator::{Coordinator, CoordinatorSettings, ImagerSnapshot};
pub use record::{RunArchive, RunOutcome, RunRecord};
