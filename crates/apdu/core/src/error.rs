//! Core error type for APDU operations
//!
//! Transport, response and framing errors are gathered here so that the
//! reader and transaction layers can bubble them up with `?`.

use crate::response::error::{ResponseError, StatusError};
use crate::transport::TransportError;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Response parsing error
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// Status error
    #[error(transparent)]
    Status(#[from] StatusError),

    /// Invalid command length
    #[error("Invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// Invalid command data
    #[error("Invalid command data: {0}")]
    InvalidCommandData(&'static str),

    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },

    /// Generic dynamic error with string message
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a new error with a dynamic message
    pub fn message<S: Into<String>>(message: S) -> Self {
        Self::Message(message.into())
    }

    /// Strip any context wrappers and return the innermost error
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Extension trait for Result with APDU Errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn context<S: Into<String>>(self, context: S) -> Result<T, Error> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_root() {
        let result: Result<(), TransportError> = Err(TransportError::Timeout);
        let err = result.context("reading record").unwrap_err();

        assert_eq!(err.to_string(), "reading record: Operation timed out");
        assert!(matches!(err.root(), Error::Transport(TransportError::Timeout)));
    }
}
