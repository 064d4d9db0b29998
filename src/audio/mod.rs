//! Audio output side of the engine.
//!
//! Output packets, the jitter buffer that paces them to the host, and the
//! resampling of per-character control curves.

pub mod curve;
mod jitter;
mod packet;

pub use jitter::JitterBuffer;
pub use packet::{OutputPacket, PacketKind};
