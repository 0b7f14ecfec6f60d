/*!
Common error types for the register tree.
*/

use thiserror::Error;

use crate::transport::TransportError;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, RegError>;

/// Error type for all register tree operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegError {
    /// Invalid model parameters or an invalid variable bit span
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed literal text
    #[error("Parse error: {0}")]
    Parse(String),

    /// A value that does not fit the model it is encoded with
    #[error("Value {value} out of range for {model}")]
    Overflow { value: String, model: String },

    /// Transport error raised outside of a device pass
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Transport error promoted by a check pass
    #[error("Memory error in {name} at {address:#x} (size {size}): {error}")]
    Memory {
        name: String,
        address: u64,
        size: usize,
        error: TransportError,
    },

    /// Read back data differs from what was written
    #[error("Verify error in {name} at {address:#x} (size {size}):\n{msg}")]
    Verify {
        name: String,
        address: u64,
        size: usize,
        msg: String,
    },

    /// Structural tree misuse
    #[error("Node error: {0}")]
    Node(String),

    /// Variable access not allowed by its mode or configuration
    #[error("Variable error: {0}")]
    Variable(String),
}

impl RegError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a new node error
    pub fn node(msg: impl Into<String>) -> Self {
        Self::Node(msg.into())
    }

    /// Create a new variable error
    pub fn variable(msg: impl Into<String>) -> Self {
        Self::Variable(msg.into())
    }

    /// Create a new overflow error
    pub fn overflow(value: impl ToString, model: impl Into<String>) -> Self {
        Self::Overflow {
            value: value.to_string(),
            model: model.into(),
        }
    }

    /// Transport error carried by this error, if any
    pub fn transport_error(&self) -> Option<TransportError> {
        match self {
            Self::Transport(e) => Some(*e),
            Self::Memory { error, .. } => Some(*error),
            Self::Verify { .. } => Some(TransportError::Verify),
            _ => None,
        }
    }
}
