//! Core traits and types for APDU (Application Protocol Data Unit) operations
//!
//! This crate provides the foundational types and traits for exchanging
//! ISO/IEC 7816-4 APDUs with Calypso cards and SAMs.
//!
//! ## Overview
//!
//! - Creating and parsing APDU commands and responses
//! - Interpreting status words
//! - Communicating with secure elements through a [`CardTransport`]
//!
//! Higher layers (readers, selection, secure sessions) are built on these types
//! and never touch raw byte framing themselves.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod error;
pub mod response;
pub mod transport;

pub use command::{ApduCommand, Command, ExpectedLength};
pub use error::{Error, ResultExt};
pub use response::status::StatusWord;
pub use response::{ApduResponse, Response};
pub use transport::{CardTransport, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{Bytes, BytesMut, Error, ResultExt};

    pub use crate::Command;
    pub use crate::command::{ApduCommand, ExpectedLength};

    pub use crate::Response;
    pub use crate::response::ApduResponse;
    pub use crate::response::error::{ResponseError, StatusError};
    pub use crate::response::status::{StatusWord, common as status};
    pub use crate::response::utils;

    pub use crate::transport::{CardTransport, TransportError};
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_reexports() {
        let cmd = Command::new(0x00, 0xA4, 0x04, 0x00);
        assert_eq!(cmd.class(), 0x00);
        assert_eq!(cmd.instruction(), 0xA4);
        assert_eq!(cmd.p1(), 0x04);
        assert_eq!(cmd.p2(), 0x00);

        let data = Bytes::from_static(&[0x01, 0x02, 0x03]);
        let resp = Response::success(Some(data.clone()));
        assert!(resp.is_success());
        assert_eq!(resp.payload(), &Some(data));
        assert_eq!(resp.status(), StatusWord::new(0x90, 0x00));
    }
}
