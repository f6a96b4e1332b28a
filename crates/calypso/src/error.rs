use calypso_apdu_core::StatusWord;
use calypso_reader::ReaderError;
use thiserror::Error;

use crate::transaction::SessionState;

/// Result type for Calypso operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Calypso operations
#[derive(Debug, Error)]
pub enum Error {
    /// Reader errors
    #[error(transparent)]
    Reader(#[from] ReaderError),

    /// Card selection errors
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// SAM and security context errors
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Secure session errors
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Command construction errors
    #[error(transparent)]
    Command(#[from] CommandError),

    /// APDU errors
    #[error(transparent)]
    Apdu(#[from] calypso_apdu_core::Error),
}

impl Error {
    /// Whether the caller may retry the failed operation
    ///
    /// Transport, selection and session-opening failures are retryable. A
    /// security violation or an integrity failure is not: the transaction has
    /// to be discarded and its writes treated as unconfirmed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Reader(e) => e.is_transport(),
            Self::Selection(e) => e.is_retryable(),
            Self::Security(e) => matches!(e, SecurityError::Reader(_)),
            Self::Transaction(e) => e.is_retryable(),
            Self::Command(_) | Self::Apdu(_) => false,
        }
    }
}

/// Errors raised while building command descriptors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// SFI or record number outside the addressable range
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Payload empty or too long
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Errors raised by the card selection service
#[derive(Debug, Error)]
pub enum SelectionError {
    /// No card inserted
    #[error("No card present in reader {0}")]
    NoCard(String),

    /// A card answered but no selection case matched it
    #[error("Card in reader {0} matched no selection case")]
    SelectionMismatch(String),

    /// Selector could not be built
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// Reader error during selection
    #[error(transparent)]
    Reader(#[from] ReaderError),

    /// Selection response could not be parsed
    #[error("Invalid selection response: {0}")]
    Response(String),
}

impl SelectionError {
    /// Selection can be retried after re-polling the reader
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::NoCard(_) | Self::SelectionMismatch(_) => true,
            Self::Reader(e) => e.is_transport(),
            Self::InvalidSelector(_) | Self::Response(_) => false,
        }
    }
}

/// Errors raised while setting up or using the SAM
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Unrecognized SAM revision token
    #[error("Invalid SAM revision: {0}")]
    InvalidRevision(String),

    /// Unrecognized session access level token
    #[error("Invalid session access level: {0}")]
    InvalidAccessLevel(String),

    /// No SAM matched the requested revision and serial number
    #[error("SAM authentication failed: {0}")]
    SamAuthentication(String),

    /// The SAM refused a command
    #[error("SAM command {command} failed with status {status}")]
    SamCommand {
        /// Command name
        command: &'static str,
        /// Status word returned by the SAM
        status: StatusWord,
    },

    /// The SAM answered with unexpected data
    #[error("Invalid SAM response to {0}")]
    InvalidResponse(&'static str),

    /// Reader error while talking to the SAM
    #[error(transparent)]
    Reader(#[from] ReaderError),
}

/// Errors raised by the transaction state machine
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Operation not allowed in the current state
    #[error("Operation {operation} not allowed in state {state}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// State at the time of the call
        state: SessionState,
    },

    /// A session was opened before a security context was established
    #[error("No security context established before opening the session")]
    SecurityContextMissing,

    /// The card or SAM refused to open the session
    #[error("Session opening failed: {0}")]
    SessionOpen(String),

    /// Corrupted, replayed or unauthorized cryptographic material
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Session signature mismatch; writes of the session are unconfirmed
    #[error("Session integrity check failed: {0}")]
    Integrity(String),

    /// The session was closed with an abort
    #[error("Session aborted (acknowledged by card: {acknowledged})")]
    SessionAborted {
        /// Whether the card answered the abort with success
        acknowledged: bool,
    },

    /// A card command returned an error status
    #[error("{command} failed with status {status} ({})", .status.description())]
    CommandFailed {
        /// Command name
        command: String,
        /// Status word returned by the card
        status: StatusWord,
    },

    /// The session modification buffer cannot hold the next command
    #[error("Session buffer overflow: {required} bytes needed, {available} available")]
    SessionBufferOverflow {
        /// Bytes the command needs
        required: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Command construction error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Reader error while talking to the card
    #[error(transparent)]
    Reader(#[from] ReaderError),

    /// SAM error
    #[error(transparent)]
    Sam(#[from] SecurityError),
}

impl TransactionError {
    /// Whether the caller may retry the failed operation
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::SessionOpen(_) => true,
            Self::Reader(e) => e.is_transport(),
            _ => false,
        }
    }

    /// Whether the error means the card state must be treated as unconfirmed
    pub const fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::SecurityViolation(_) | Self::Integrity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let err: Error = TransactionError::SessionOpen("card refused".into()).into();
        assert!(err.is_retryable());

        let err: Error = TransactionError::Integrity("bad signature".into()).into();
        assert!(!err.is_retryable());

        let err: Error = TransactionError::SecurityViolation("kvc".into()).into();
        assert!(!err.is_retryable());

        let err: Error = SelectionError::NoCard("stub1".into()).into();
        assert!(err.is_retryable());

        let err: Error = ReaderError::Timeout("stub1".into()).into();
        assert!(err.is_retryable());

        let err: Error = CommandError::InvalidAddress("SFI 31".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_command_failed_display() {
        let err = TransactionError::CommandFailed {
            command: "READ RECORD".into(),
            status: StatusWord::new(0x6A, 0x83),
        };
        assert_eq!(
            err.to_string(),
            "READ RECORD failed with status 6A83 (Record not found)"
        );
    }
}
