//! Error types for model construction, observation and message passing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmpError {
    /// Malformed input to a constructor or to `observe`.
    #[error("Invalid {context}: {message}")]
    Validation { context: String, message: String },
    /// Plate or dimension shapes that cannot be reconciled by broadcasting.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    Shape {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Node {0} not found in model")]
    UnknownNode(String),
    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl VmpError {
    pub(crate) fn validation(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            context: context.into(),
            message: message.into(),
        }
    }

    pub(crate) fn shape(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        Self::Shape {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// True for errors that signal a model-construction bug rather than bad data.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Shape { .. })
    }
}

impl From<serde_json::Error> for VmpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for VmpError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VmpError>;
