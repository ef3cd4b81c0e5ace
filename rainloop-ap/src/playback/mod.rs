//! Crossfade playback: units, scheduler, engine

pub mod diagnostics;
pub mod engine;
pub mod scheduler;
pub mod unit;
pub mod visibility;

pub use diagnostics::{Diagnostics, FailureRecord};
pub use engine::{EngineReport, MixerEngine, MixerState};
pub use scheduler::{CrossfadeWindow, PlayOutcome, SchedulerPhase};
pub use unit::{UnitSnapshot, UnitState};
pub use visibility::HostVisibility;
