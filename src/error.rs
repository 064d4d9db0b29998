//! Error types for the synthesis engine.

use std::path::PathBuf;

/// Errors raised by the engine, its stages and the module catalog.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Input validation failed; the request never reached any graph.
    #[error("input validation failed: {}", .errors.join("; "))]
    Validation { errors: Vec<String>, warnings: Vec<String> },

    /// No module with this name is registered or loaded.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// The actor is not part of any registered module.
    #[error("unknown actor: {0}")]
    UnknownActor(String),

    /// A request or operation referenced a module that was never preloaded.
    #[error("module not loaded: {0}")]
    NotLoaded(String),

    /// Another request is already running.
    #[error("engine busy: request {0} is still running")]
    Busy(String),

    /// The request id does not belong to an accepted request.
    #[error("unknown request: {0}")]
    UnknownRequest(String),

    /// Graph evaluation failed. Fatal for the request.
    #[error("graph '{graph}' failed: {message}")]
    Graph { graph: String, message: String },

    /// A tensor had an unexpected rank, dtype or length.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Required resources are missing (no languages, no graphs).
    #[error("resource unavailable: {0}")]
    Resource(String),

    /// A module descriptor could not be parsed.
    #[error("bad descriptor {path}: {message}")]
    Descriptor { path: PathBuf, message: String },

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The frame clock was dropped while a stage was waiting on it.
    #[error("frame clock closed")]
    ClockClosed,

    /// A text pattern failed to compile.
    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a graph execution error.
    pub fn graph(graph: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Graph { graph: graph.into(), message: message.into() }
    }

    /// Create a shape mismatch error.
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// Create a resource error.
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }
}
