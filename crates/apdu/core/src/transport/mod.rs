//! Transport traits for APDU communication with cards
//!
//! A transport moves raw APDU bytes. It knows nothing about command structure,
//! secure sessions or Calypso specifics.

pub mod error;

use std::fmt;

use bytes::Bytes;
pub use error::TransportError;
use tracing::{debug, trace};

use crate::command::ApduCommand;
use crate::response::Response;

/// Trait for basic card transports
pub trait CardTransport: Send + fmt::Debug {
    /// Send raw APDU bytes to card and return response bytes
    ///
    /// Implementations override [`CardTransport::do_transmit_raw`]; this wrapper
    /// only adds tracing around it.
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        trace!(command = ?hex::encode(command), "Transmitting raw command");
        let result = self.do_transmit_raw(command);
        match &result {
            Ok(response) => {
                trace!(response = ?hex::encode(response), "Received raw response");
            }
            Err(e) => {
                debug!(error = ?e, "Transport error during transmission");
            }
        }
        result
    }

    /// Internal implementation of transmit_raw
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;

    /// Check if the transport is connected to a physical card
    fn is_connected(&self) -> bool;

    /// Reset the transport connection
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Serialize a command, transmit it and parse the response
    fn transmit_command<C: ApduCommand + ?Sized>(
        &mut self,
        command: &C,
    ) -> Result<Response, crate::Error>
    where
        Self: Sized,
    {
        let raw = self.transmit_raw(&command.to_bytes())?;
        Ok(Response::from_bytes(&raw)?)
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
#[allow(missing_docs, unreachable_pub)]
pub struct MockTransport {
    pub responses: Vec<Bytes>,
    pub commands: Vec<Bytes>,
    pub connected: bool,
}

#[cfg(test)]
impl MockTransport {
    pub(crate) fn new(responses: Vec<Bytes>) -> Self {
        Self {
            responses,
            commands: Vec::new(),
            connected: true,
        }
    }
}

#[cfg(test)]
impl CardTransport for MockTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        if !self.connected {
            return Err(TransportError::Connection);
        }

        self.commands.push(Bytes::copy_from_slice(command));

        if self.responses.is_empty() {
            return Err(TransportError::Transmission);
        }
        Ok(self.responses.remove(0))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        self.commands.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;
    use hex_literal::hex;

    #[test]
    fn test_transmit_command() {
        let mut transport = MockTransport::new(vec![Bytes::from_static(&hex!("0102 9000"))]);
        let cmd = Command::new_with_le(0x00, 0xB2, 0x01, 0x0C, 0x00);

        let resp = transport.transmit_command(&cmd).unwrap();
        assert_eq!(resp.data(), &hex!("0102"));
        assert_eq!(transport.commands[0].as_ref(), &hex!("00B2010C00"));
    }

    #[test]
    fn test_disconnected_transport() {
        let mut transport = MockTransport::new(vec![]);
        transport.connected = false;
        let err = transport.transmit_raw(&hex!("00A4040000")).unwrap_err();
        assert!(matches!(err, TransportError::Connection));
        assert!(err.is_link_lost());
    }
}
