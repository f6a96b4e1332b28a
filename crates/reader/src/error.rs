//! Error types for reader operations

use calypso_apdu_core::TransportError;
use calypso_apdu_core::response::error::ResponseError;

/// Errors raised by readers, plugins and the smart card context
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// The reader cannot run the requested low-level protocol
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),

    /// The channel is closed, was lost, or the exchange failed
    #[error("Channel error on reader {reader}: {message}")]
    Channel {
        /// Reader name
        reader: String,
        /// What went wrong
        message: String,
    },

    /// No response within the configured transmit window
    #[error("Timeout on reader {0}")]
    Timeout(String),

    /// No card inserted
    #[error("No card present in reader {0}")]
    NoCard(String),

    /// Malformed card response
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// Unknown reader name
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// Unknown plugin name
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    /// A plugin with the same name is already registered
    #[error("Plugin already registered: {0}")]
    PluginAlreadyRegistered(String),

    /// No registered plugin with this name
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// PC/SC error
    #[cfg(feature = "pcsc")]
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),
}

impl ReaderError {
    /// Create a channel error for the given reader
    pub fn channel(reader: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel {
            reader: reader.into(),
            message: message.into(),
        }
    }

    /// Map a backend transport error onto the reader taxonomy
    pub fn from_transport(reader: &str, error: TransportError) -> Self {
        match error {
            TransportError::Timeout => Self::Timeout(reader.to_string()),
            other => Self::channel(reader, other.to_string()),
        }
    }

    /// Transport-level errors can be retried after re-polling the reader
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Channel { .. } | Self::Timeout(_) | Self::NoCard(_) | Self::Response(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport() {
        let err = ReaderError::from_transport("stub1", TransportError::Timeout);
        assert!(matches!(err, ReaderError::Timeout(ref r) if r == "stub1"));

        let err = ReaderError::from_transport("stub1", TransportError::Connection);
        assert_eq!(
            err.to_string(),
            "Channel error on reader stub1: Failed to connect to device"
        );
        assert!(err.is_transport());
        assert!(!ReaderError::UnknownPlugin("x".into()).is_transport());
    }
}
