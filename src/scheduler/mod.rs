//! Cooperative frame scheduling.
//!
//! Provides the host frame clock, the adaptive heavy-step registry and the
//! budgeted stage runner shared by every pipeline stage.

mod clock;
mod heavy;
mod stage;

pub use clock::{FrameClock, FrameWaiter};
pub use heavy::{ChunkType, HeavyLayerRegistry, HeavyLayerSet, StageKind};
pub use stage::{CooperativeStage, StageBudget};
