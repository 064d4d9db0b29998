//! Frame-budgeted streaming text-to-speech.
//!
//! Every neural stage runs as a cooperative task that spends at most a
//! slice of each host frame on graph work, learning which steps overshoot
//! and yielding before them next time. Audio is vocoded in causal chunks
//! and handed to a jitter buffer as soon as each chunk is ready.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod model;
pub mod scheduler;
pub mod tensor;
pub mod tts;

pub use audio::{JitterBuffer, OutputPacket, PacketKind};
pub use config::EngineConfig;
pub use engine::{Session, SynthRequest, TextNormalizer};
pub use error::{EngineError, Result};
pub use graph::{GraphExecutor, GraphLoader, GraphRole, SyntheticLoader};
pub use model::{Language, ModuleCatalog, Segment, SynthInput};
pub use scheduler::FrameClock;
