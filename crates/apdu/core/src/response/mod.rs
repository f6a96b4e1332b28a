//! APDU response definitions and traits
//!
//! This module provides types and traits for working with APDU responses
//! according to ISO/IEC 7816-4.

pub mod error;
pub mod status;
pub mod utils;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use error::{ResponseError, StatusError};
use status::StatusWord;

/// Trait for APDU responses
pub trait ApduResponse: Sized {
    /// Get the response payload data
    fn payload(&self) -> &Option<Bytes>;

    /// Get the status word
    fn status(&self) -> StatusWord;

    /// Check if the response indicates success
    fn is_success(&self) -> bool {
        self.status().is_success()
    }
}

/// Basic APDU response structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response payload data
    payload: Option<Bytes>,
    /// Status word
    status: StatusWord,
}

impl Response {
    /// Create a new response with payload and status
    pub fn new(payload: Option<Bytes>, status: impl Into<StatusWord>) -> Self {
        Self {
            payload,
            status: status.into(),
        }
    }

    /// Create a success response
    pub const fn success(payload: Option<Bytes>) -> Self {
        Self {
            payload,
            status: StatusWord::new(0x90, 0x00),
        }
    }

    /// Create an error response from a status word
    pub fn error(status: impl Into<StatusWord>) -> Self {
        Self {
            payload: None,
            status: status.into(),
        }
    }

    /// Parse response from raw bytes (including status word)
    pub fn from_bytes(data: &[u8]) -> Result<Self, ResponseError> {
        let (status, payload) = utils::extract_status_and_payload(data)?;

        trace!(
            sw = %status,
            payload_len = payload.len(),
            "Parsed APDU response"
        );

        let payload = (!payload.is_empty()).then(|| Bytes::copy_from_slice(payload));
        Ok(Self { payload, status })
    }

    /// Payload bytes, empty when the card returned none
    pub fn data(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Convert to a bytes result
    pub fn into_bytes_result(self) -> Result<Option<Bytes>, StatusError> {
        if self.status.is_success() {
            Ok(self.payload)
        } else {
            Err(StatusError::from(self.status))
        }
    }

    /// Fail with a [`StatusError`] unless the status word is `9000`
    pub fn check_success(&self) -> Result<&Self, StatusError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(StatusError::from(self.status))
        }
    }
}

impl ApduResponse for Response {
    fn payload(&self) -> &Option<Bytes> {
        &self.payload
    }

    fn status(&self) -> StatusWord {
        self.status
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = ResponseError;

    fn try_from(data: &[u8]) -> Result<Self, ResponseError> {
        Self::from_bytes(data)
    }
}

impl TryFrom<Bytes> for Response {
    type Error = ResponseError;

    fn try_from(data: Bytes) -> Result<Self, ResponseError> {
        Self::from_bytes(&data)
    }
}

impl From<Response> for Bytes {
    fn from(response: Response) -> Self {
        let mut buf = BytesMut::with_capacity(response.payload.as_ref().map_or(0, |p| p.len()) + 2);
        if let Some(payload) = response.payload {
            buf.put_slice(&payload);
        }
        buf.put_u8(response.status.sw1);
        buf.put_u8(response.status.sw2);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_from_bytes() {
        let resp = Response::from_bytes(&[0x01, 0x02, 0x03, 0x90, 0x00]).unwrap();
        assert_eq!(resp.data(), &[0x01, 0x02, 0x03]);
        assert!(resp.is_success());

        let resp = Response::from_bytes(&[0x90, 0x00]).unwrap();
        assert!(resp.payload().is_none());
        assert!(resp.data().is_empty());

        assert!(Response::from_bytes(&[0x01]).is_err());
    }

    #[test]
    fn test_response_into_result() {
        let success = Response::success(Some(Bytes::from_static(&[0x01])));
        assert_eq!(
            success.into_bytes_result().unwrap(),
            Some(Bytes::from_static(&[0x01]))
        );

        let error = Response::error((0x6A, 0x83));
        let err = error.into_bytes_result().unwrap_err();
        assert_eq!(err.status.to_u16(), 0x6A83);
    }

    #[test]
    fn test_response_to_bytes() {
        let resp = Response::new(Some(Bytes::from_static(&[0xAB])), (0x62, 0x83));
        let bytes: Bytes = resp.into();
        assert_eq!(bytes.as_ref(), &[0xAB, 0x62, 0x83]);
    }
}
