//! Request orchestration.
//!
//! The [`Session`] owns loaded modules and accepted requests, prepares input
//! text and drives a request through phonemizer, encoder, decoder and vocoder
//! on the host's frame clock.

mod loaded;
mod pipeline;
mod session;
mod text;

pub use session::{Session, SynthRequest};
pub use text::{IdentityNormalizer, TextNormalizer, TextPiece, TextProcessor, validate_phonemes};
