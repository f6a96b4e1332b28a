//! Error types specific to card transport

use thiserror::Error;

/// Transport error type
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection error
    #[error("Failed to connect to device")]
    Connection,

    /// The logical channel with the card is closed or was lost
    #[error("Channel error: {0}")]
    Channel(String),

    /// Transmission error
    #[error("Failed to transmit data")]
    Transmission,

    /// Device error
    #[error("Device error")]
    Device,

    /// Buffer too small
    #[error("Buffer too small")]
    BufferTooSmall,

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Cancelled operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Other error with message
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a channel error
    pub fn channel<S: Into<String>>(message: S) -> Self {
        Self::Channel(message.into())
    }

    /// Create a general other error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }

    /// Whether the error means the physical link is gone
    pub const fn is_link_lost(&self) -> bool {
        matches!(self, Self::Connection | Self::Channel(_) | Self::Timeout)
    }
}
