//! Error types shared across the engine.

use serde::{Deserialize, Serialize};

/// Engine-wide error type.
///
/// Parse and typing failures carry the fully qualified node name so the
/// control API can point the user at the offending operator.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum WeirError {
    /// Parse or type inference failure
    #[error("syntax error in '{node}': {message}")]
    Syntax { node: String, message: String },

    /// Status transition not allowed in the current layer state
    #[error("invalid command: {message}")]
    InvalidCommand { message: String },

    /// A parent lives in a layer that is not compiled yet
    #[error("node '{node}' depends on '{parent}' which is not compiled")]
    MissingDependency { node: String, parent: String },

    /// The compile loop exceeded its retry bound
    #[error("dependency loop while compiling layer '{layer}'")]
    DependencyLoop { layer: String },

    /// Ring buffer has no room for the message right now (backpressure)
    #[error("ring buffer full")]
    NoSpace,

    /// Message can never fit the ring buffer
    #[error("message of {words} words exceeds ring capacity of {capacity}")]
    TooBig { words: usize, capacity: usize },

    /// Layer is not running
    #[error("layer '{layer}' is not running")]
    NotRunning { layer: String },

    /// Layer is already running
    #[error("layer '{layer}' is already running")]
    AlreadyRunning { layer: String },

    /// Unknown layer, node or field
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Ring buffer corruption, aborted child, unrecoverable state
    #[error("fatal: {message}")]
    Fatal { message: String },

    /// I/O failure, stringified so the error stays serializable
    #[error("i/o error: {message}")]
    Io { message: String },
}

impl WeirError {
    pub fn syntax(node: impl Into<String>, message: impl Into<String>) -> Self {
        WeirError::Syntax {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        WeirError::NotFound { what: what.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        WeirError::InvalidCommand {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        WeirError::Fatal {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for WeirError {
    fn from(e: std::io::Error) -> Self {
        WeirError::Io {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WeirError>;
