//! Configuration options for readers

use std::time::Duration;

/// Default time to wait for a card response
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration options for a [`Reader`](crate::Reader)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Maximum time to wait for the response to one command
    pub transmit_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            transmit_timeout: DEFAULT_TRANSMIT_TIMEOUT,
        }
    }
}

impl ReaderConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transmit timeout
    pub const fn with_transmit_timeout(mut self, timeout: Duration) -> Self {
        self.transmit_timeout = timeout;
        self
    }
}
