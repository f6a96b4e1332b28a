//! Stub reader backend

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use calypso_apdu_core::{CardTransport, TransportError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::card::StubSmartCard;
use crate::error::ReaderError;
use crate::protocol::{IsoProtocol, ReaderProtocol};
use crate::reader::{ContactConfigurator, ReaderSpi};

/// Configuration of a stub reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubReaderConfig {
    /// Whether the reader is contactless
    pub contactless: bool,
    /// Whether the reader exposes a [`ContactConfigurator`]
    pub contact_configuration: bool,
    /// Protocols the reader can run
    pub protocols: Vec<ReaderProtocol>,
}

impl Default for StubReaderConfig {
    fn default() -> Self {
        Self {
            contactless: false,
            contact_configuration: false,
            protocols: ReaderProtocol::ALL.to_vec(),
        }
    }
}

impl StubReaderConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether the reader is contactless
    pub fn with_contactless(mut self, contactless: bool) -> Self {
        self.contactless = contactless;
        self
    }

    /// Set whether the reader exposes contact configuration
    pub fn with_contact_configuration(mut self, enabled: bool) -> Self {
        self.contact_configuration = enabled;
        self
    }

    /// Restrict the protocols the reader can run
    pub fn with_protocols(mut self, protocols: &[ReaderProtocol]) -> Self {
        self.protocols = protocols.to_vec();
        self
    }
}

/// Fault injected into the exchanges of a stub reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFault {
    /// The card stops answering
    Timeout,
    /// The link to the card drops
    Disconnect,
}

#[derive(Debug)]
struct StubSlot {
    card: Option<Box<dyn StubSmartCard>>,
    channel_open: bool,
    contactless: bool,
    iso_protocol: Option<IsoProtocol>,
    unresponsive: bool,
    // (remaining successful exchanges, fault to raise next)
    pending_fault: Option<(usize, StubFault)>,
    timeout: Duration,
    exchanges: Vec<(Bytes, Bytes)>,
}

/// Test-side control of a stub reader
///
/// Clones share the same slot as the reader they were created with.
#[derive(Debug, Clone)]
pub struct StubReaderHandle {
    name: String,
    slot: Arc<Mutex<StubSlot>>,
}

impl StubReaderHandle {
    /// Reader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a card, replacing any card already present
    pub fn insert_card(&self, card: impl StubSmartCard + 'static) {
        let mut slot = self.slot.lock();
        slot.card = Some(Box::new(card));
        slot.channel_open = false;
        debug!(reader = %self.name, "Card inserted");
    }

    /// Remove the inserted card
    pub fn remove_card(&self) -> Option<Box<dyn StubSmartCard>> {
        let mut slot = self.slot.lock();
        slot.channel_open = false;
        debug!(reader = %self.name, "Card removed");
        slot.card.take()
    }

    /// Whether a card is inserted
    pub fn has_card(&self) -> bool {
        self.slot.lock().card.is_some()
    }

    /// Make every exchange time out until reset
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.slot.lock().unresponsive = unresponsive;
    }

    /// Let `successful` exchanges through, then fail the next one with `fault`
    ///
    /// The fault fires once.
    pub fn inject_fault_after(&self, successful: usize, fault: StubFault) {
        self.slot.lock().pending_fault = Some((successful, fault));
    }

    /// Whether the physical channel is open
    pub fn is_channel_open(&self) -> bool {
        self.slot.lock().channel_open
    }

    /// Contactless mode as last configured
    pub fn is_contactless(&self) -> bool {
        self.slot.lock().contactless
    }

    /// ISO protocol as last configured, if ever
    pub fn iso_protocol(&self) -> Option<IsoProtocol> {
        self.slot.lock().iso_protocol
    }

    /// Transmit timeout as last configured
    pub fn transmit_timeout(&self) -> Duration {
        self.slot.lock().timeout
    }

    /// Every successful command/response pair, in order
    pub fn exchanges(&self) -> Vec<(Bytes, Bytes)> {
        self.slot.lock().exchanges.clone()
    }

    /// Forget the recorded exchanges
    pub fn clear_exchanges(&self) {
        self.slot.lock().exchanges.clear();
    }
}

/// Reader backend driving a virtual card
pub struct StubReaderSpi {
    name: String,
    protocols: Vec<ReaderProtocol>,
    contact_configuration: bool,
    slot: Arc<Mutex<StubSlot>>,
}

impl fmt::Debug for StubReaderSpi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubReaderSpi")
            .field("name", &self.name)
            .field("protocols", &self.protocols)
            .finish_non_exhaustive()
    }
}

impl StubReaderSpi {
    /// Create an empty stub reader and its control handle
    pub fn new(name: &str, config: StubReaderConfig) -> (Self, StubReaderHandle) {
        let slot = Arc::new(Mutex::new(StubSlot {
            card: None,
            channel_open: false,
            contactless: config.contactless,
            iso_protocol: None,
            unresponsive: false,
            pending_fault: None,
            timeout: Duration::ZERO,
            exchanges: Vec::new(),
        }));
        let spi = Self {
            name: name.to_string(),
            protocols: config.protocols,
            contact_configuration: config.contact_configuration,
            slot: Arc::clone(&slot),
        };
        let handle = StubReaderHandle {
            name: name.to_string(),
            slot,
        };
        (spi, handle)
    }
}

impl CardTransport for StubReaderSpi {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        let mut slot = self.slot.lock();
        if !slot.channel_open {
            return Err(TransportError::channel("physical channel not open"));
        }
        if slot.unresponsive {
            trace!(reader = %self.name, timeout = ?slot.timeout, "No response");
            return Err(TransportError::Timeout);
        }

        if let Some((remaining, fault)) = slot.pending_fault {
            if remaining == 0 {
                slot.pending_fault = None;
                return Err(match fault {
                    StubFault::Timeout => TransportError::Timeout,
                    StubFault::Disconnect => TransportError::Connection,
                });
            }
            slot.pending_fault = Some((remaining - 1, fault));
        }

        let response = match slot.card.as_mut() {
            Some(card) => card.process_apdu(command)?,
            None => return Err(TransportError::Connection),
        };
        slot.exchanges
            .push((Bytes::copy_from_slice(command), response.clone()));
        Ok(response)
    }

    fn is_connected(&self) -> bool {
        let slot = self.slot.lock();
        slot.card.is_some() && slot.channel_open
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.close_physical_channel()?;
        self.open_physical_channel()
    }
}

impl ReaderSpi for StubReaderSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_contactless(&self) -> bool {
        self.slot.lock().contactless
    }

    fn is_protocol_supported(&self, protocol: ReaderProtocol) -> bool {
        self.protocols.contains(&protocol)
    }

    fn is_card_present(&mut self) -> Result<bool, ReaderError> {
        Ok(self.slot.lock().card.is_some())
    }

    fn open_physical_channel(&mut self) -> Result<(), TransportError> {
        let mut slot = self.slot.lock();
        if slot.card.is_none() {
            return Err(TransportError::Connection);
        }
        slot.channel_open = true;
        Ok(())
    }

    fn close_physical_channel(&mut self) -> Result<(), TransportError> {
        let mut slot = self.slot.lock();
        if slot.channel_open {
            if let Some(card) = slot.card.as_mut() {
                card.reset();
            }
        }
        slot.channel_open = false;
        Ok(())
    }

    fn atr(&self) -> Option<Bytes> {
        self.slot.lock().card.as_ref().map(|card| card.atr())
    }

    fn card_protocol(&self) -> Option<ReaderProtocol> {
        self.slot.lock().card.as_ref().map(|card| card.protocol())
    }

    fn set_transmit_timeout(&mut self, timeout: Duration) {
        self.slot.lock().timeout = timeout;
    }

    fn contact_configurator(&mut self) -> Option<&mut dyn ContactConfigurator> {
        if self.contact_configuration {
            Some(self)
        } else {
            None
        }
    }
}

impl ContactConfigurator for StubReaderSpi {
    fn set_contactless(&mut self, contactless: bool) {
        self.slot.lock().contactless = contactless;
    }

    fn set_iso_protocol(&mut self, protocol: IsoProtocol) {
        self.slot.lock().iso_protocol = Some(protocol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::ApduTableCard;
    use hex_literal::hex;

    #[test]
    fn test_fault_fires_once() {
        let (mut spi, handle) = StubReaderSpi::new("stub1", StubReaderConfig::default());
        handle.insert_card(
            ApduTableCard::new(&hex!("3B00"), ReaderProtocol::Iso7816_3_T1)
                .with_response(&hex!("00"), &hex!("9000")),
        );
        spi.open_physical_channel().unwrap();
        handle.inject_fault_after(1, StubFault::Disconnect);

        assert!(spi.transmit_raw(&hex!("00B2010C00")).is_ok());
        assert!(matches!(
            spi.transmit_raw(&hex!("00B2010C00")),
            Err(TransportError::Connection)
        ));
        assert!(spi.transmit_raw(&hex!("00B2010C00")).is_ok());
        assert_eq!(handle.exchanges().len(), 2);
    }

    #[test]
    fn test_no_card() {
        let (mut spi, handle) = StubReaderSpi::new("stub1", StubReaderConfig::default());
        assert!(!spi.is_card_present().unwrap());
        assert!(spi.open_physical_channel().is_err());
        assert!(spi.atr().is_none());
        assert!(!handle.has_card());
    }
}
