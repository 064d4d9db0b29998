//! Compute graph abstraction.
//!
//! Every neural stage runs behind [`GraphExecutor`], an incremental executor
//! that performs one unit of work per [`GraphExecutor::step`] call. This keeps
//! the engine independent of any specific inference runtime and lets tests
//! and the demo binary plug in deterministic graphs.

mod synthetic;

use crate::error::{EngineError, Result};
use crate::model::{LanguagePackDescriptor, SpeakerModuleDescriptor};
use crate::tensor::Tensor;

pub use synthetic::{LAST_CHUNK_TRIM, SyntheticLoader, SyntheticVocoder};

/// Graphs a speaker module provides, one executor each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphRole {
    Encoder,
    DecoderPreprocess,
    DecoderChunk,
    VocoderFirst,
    VocoderMiddle,
    VocoderLast,
}

impl GraphRole {
    /// All speaker graphs, in preload order (vocoder first, as the largest).
    pub const SPEAKER: [GraphRole; 6] = [
        GraphRole::VocoderFirst,
        GraphRole::VocoderMiddle,
        GraphRole::VocoderLast,
        GraphRole::Encoder,
        GraphRole::DecoderPreprocess,
        GraphRole::DecoderChunk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GraphRole::Encoder => "encoder",
            GraphRole::DecoderPreprocess => "decoder_preprocessor",
            GraphRole::DecoderChunk => "decoder_chunked",
            GraphRole::VocoderFirst => "vocoder_first_chunk",
            GraphRole::VocoderMiddle => "vocoder_middle_chunk",
            GraphRole::VocoderLast => "vocoder_last_chunk",
        }
    }
}

impl std::fmt::Display for GraphRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental executor over one compiled graph.
pub trait GraphExecutor: Send {
    /// Human readable graph name for logs and errors.
    fn name(&self) -> &str;

    /// Bind inputs and rewind to the first unit of work.
    ///
    /// # Errors
    /// Returns an error if the inputs do not fit the graph.
    fn start(&mut self, inputs: Vec<Tensor>) -> Result<()>;

    /// Run one unit of work.
    ///
    /// # Returns
    /// `true` while more work remains, `false` once the graph is exhausted.
    fn step(&mut self) -> Result<bool>;

    /// Number of outputs available after exhaustion.
    fn output_count(&self) -> usize;

    /// Fetch output `index` after exhaustion.
    ///
    /// # Errors
    /// Returns an error if the graph has not finished or the index is out of range.
    fn output(&self, index: usize) -> Result<Tensor>;

    /// Run the whole graph in one go and return every output.
    fn execute(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        self.start(inputs)?;
        while self.step()? {}
        (0..self.output_count()).map(|i| self.output(i)).collect()
    }
}

/// Creates executors when modules are preloaded.
pub trait GraphLoader: Send + Sync {
    /// Load one of a speaker module's graphs.
    fn load_speaker_graph(&self, module: &SpeakerModuleDescriptor, role: GraphRole) -> Result<Box<dyn GraphExecutor>>;

    /// Load the raw next-symbol phonemizer graph of a language pack.
    ///
    /// The graph takes `(source [B,S], target [B,L], active [B])` and returns
    /// the target extended by one column. Early stopping bookkeeping is added
    /// by the engine.
    fn load_phonemizer(&self, pack: &LanguagePackDescriptor) -> Result<Box<dyn GraphExecutor>>;
}

/// Error helper for executors asked for outputs before they finish.
pub(crate) fn not_ready(name: &str) -> EngineError {
    EngineError::graph(name, "outputs requested before the graph finished")
}

/// Error helper for bad output indices.
pub(crate) fn no_output(name: &str, index: usize, count: usize) -> EngineError {
    EngineError::graph(name, format!("output {} out of range ({} outputs)", index, count))
}
