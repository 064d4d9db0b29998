//! Neural synthesis stages.
//!
//! Encoder, decoder (preprocess plus causal chunks), chunked vocoder and the
//! batched phonemizer, each driven through a cooperative stage.

mod decoder;
mod encoder;
mod phonemizer;
mod rest_layout;
mod vocoder;

pub use decoder::{ChunkPlan, DecoderStage, DecoderState, chunk_schedule};
pub use encoder::{EncoderInput, EncoderOutput, EncoderStage};
pub use phonemizer::{EarlyStopGraph, PhonemizerStage};
pub use rest_layout::{ResblockConv, RestLayout};
pub use vocoder::{VocoderStage, VocoderState};
