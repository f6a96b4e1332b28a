//! Virtual secure elements for stub readers

use std::fmt;

use bytes::Bytes;
use calypso_apdu_core::TransportError;

use crate::protocol::ReaderProtocol;

/// A secure element that can be inserted into a stub reader
pub trait StubSmartCard: Send + fmt::Debug {
    /// Answer to reset
    fn atr(&self) -> Bytes;

    /// Protocol the card speaks
    fn protocol(&self) -> ReaderProtocol;

    /// Process one command and return the response including the status word
    fn process_apdu(&mut self, apdu: &[u8]) -> Result<Bytes, TransportError>;

    /// Called when the physical channel is closed
    fn reset(&mut self) {}
}

/// A card answering from a fixed table of command prefixes
///
/// Unknown commands get `6D00`.
#[derive(Debug, Clone)]
pub struct ApduTableCard {
    atr: Bytes,
    protocol: ReaderProtocol,
    table: Vec<(Bytes, Bytes)>,
}

impl ApduTableCard {
    /// Create a card with an empty table
    pub fn new(atr: &[u8], protocol: ReaderProtocol) -> Self {
        Self {
            atr: Bytes::copy_from_slice(atr),
            protocol,
            table: Vec::new(),
        }
    }

    /// Answer `response` to every command starting with `command_prefix`
    ///
    /// Earlier entries take precedence.
    pub fn with_response(mut self, command_prefix: &[u8], response: &[u8]) -> Self {
        self.table.push((
            Bytes::copy_from_slice(command_prefix),
            Bytes::copy_from_slice(response),
        ));
        self
    }
}

impl StubSmartCard for ApduTableCard {
    fn atr(&self) -> Bytes {
        self.atr.clone()
    }

    fn protocol(&self) -> ReaderProtocol {
        self.protocol
    }

    fn process_apdu(&mut self, apdu: &[u8]) -> Result<Bytes, TransportError> {
        Ok(self
            .table
            .iter()
            .find(|(prefix, _)| apdu.starts_with(prefix))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| Bytes::from_static(&[0x6D, 0x00])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_table_lookup() {
        let mut card = ApduTableCard::new(&hex!("3B00"), ReaderProtocol::Iso14443_4)
            .with_response(&hex!("00A4040005A000000291"), &hex!("6F009000"))
            .with_response(&hex!("00A4"), &hex!("6A82"));

        assert_eq!(
            card.process_apdu(&hex!("00A4040005A00000029100")).unwrap().as_ref(),
            &hex!("6F009000")
        );
        assert_eq!(
            card.process_apdu(&hex!("00A4040005A00000040400")).unwrap().as_ref(),
            &hex!("6A82")
        );
        assert_eq!(card.process_apdu(&hex!("00B2010C00")).unwrap().as_ref(), &hex!("6D00"));
    }
}
