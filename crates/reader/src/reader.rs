//! Reader abstraction
//!
//! A [`Reader`] wraps a backend ([`ReaderSpi`]) supplied by a plugin and adds
//! the logical channel state, protocol bookkeeping and error mapping that the
//! selection and transaction layers rely on.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use calypso_apdu_core::{ApduCommand, CardTransport, Response, TransportError};
use derive_more::Display;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ReaderConfig;
use crate::error::ReaderError;
use crate::protocol::{CardProtocol, IsoProtocol, ReaderProtocol};

/// A reader shared between the components that talk through it
///
/// The mutex serializes command/response pairs: at most one command is in
/// flight per reader.
pub type SharedReader = Arc<Mutex<Reader>>;

/// Logical channel state of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ChannelState {
    /// Commands may be exchanged
    #[display("OPEN")]
    Open,
    /// The channel must be reopened before any exchange
    #[display("CLOSED")]
    Closed,
}

/// Contact/contactless configuration capability of a reader backend
pub trait ContactConfigurator {
    /// Switch the reader between contact and contactless operation
    fn set_contactless(&mut self, contactless: bool);

    /// Select the ISO transmission protocol
    fn set_iso_protocol(&mut self, protocol: IsoProtocol);
}

/// Backend contract a plugin implements for each of its readers
///
/// Raw exchanges go through the [`CardTransport`] supertrait.
pub trait ReaderSpi: CardTransport {
    /// Reader name, unique within its plugin
    fn name(&self) -> &str;

    /// Whether the reader talks to cards without contact
    fn is_contactless(&self) -> bool;

    /// Whether the backend can run the given protocol
    fn is_protocol_supported(&self, protocol: ReaderProtocol) -> bool;

    /// Enable detection of the given protocol
    fn activate_protocol(&mut self, _protocol: ReaderProtocol) -> Result<(), ReaderError> {
        Ok(())
    }

    /// Disable detection of the given protocol
    fn deactivate_protocol(&mut self, _protocol: ReaderProtocol) {}

    /// Whether a card is inserted
    fn is_card_present(&mut self) -> Result<bool, ReaderError>;

    /// Power and connect the inserted card
    fn open_physical_channel(&mut self) -> Result<(), TransportError>;

    /// Disconnect the card
    fn close_physical_channel(&mut self) -> Result<(), TransportError>;

    /// Answer to reset of the inserted card
    fn atr(&self) -> Option<Bytes>;

    /// Protocol spoken by the inserted card
    fn card_protocol(&self) -> Option<ReaderProtocol>;

    /// Set the maximum time to wait for one response
    fn set_transmit_timeout(&mut self, timeout: Duration);

    /// Contact configuration capability, if the backend has one
    fn contact_configurator(&mut self) -> Option<&mut dyn ContactConfigurator> {
        None
    }
}

/// A named channel to a secure element
pub struct Reader {
    spi: Box<dyn ReaderSpi>,
    config: ReaderConfig,
    channel: ChannelState,
    activated: HashMap<ReaderProtocol, String>,
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("name", &self.spi.name())
            .field("channel", &self.channel)
            .field("activated", &self.activated)
            .field("config", &self.config)
            .finish()
    }
}

impl Reader {
    /// Wrap a backend with the default configuration
    pub fn new(spi: Box<dyn ReaderSpi>) -> Self {
        Self::with_config(spi, ReaderConfig::default())
    }

    /// Wrap a backend with a custom configuration
    pub fn with_config(mut spi: Box<dyn ReaderSpi>, config: ReaderConfig) -> Self {
        spi.set_transmit_timeout(config.transmit_timeout);
        Self {
            spi,
            config,
            channel: ChannelState::Closed,
            activated: HashMap::new(),
        }
    }

    /// Move the reader behind a mutex so it can be shared
    pub fn into_shared(self) -> SharedReader {
        Arc::new(Mutex::new(self))
    }

    /// Reader name
    pub fn name(&self) -> &str {
        self.spi.name()
    }

    /// Whether the reader talks to cards without contact
    pub fn is_contactless(&self) -> bool {
        self.spi.is_contactless()
    }

    /// Current logical channel state
    pub const fn channel_state(&self) -> ChannelState {
        self.channel
    }

    /// Current configuration
    pub const fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Change the transmit timeout
    pub fn set_transmit_timeout(&mut self, timeout: Duration) {
        self.config.transmit_timeout = timeout;
        self.spi.set_transmit_timeout(timeout);
    }

    /// Activate a protocol by name and tag it with a logical card protocol name
    ///
    /// Unknown names and protocols the backend cannot run are rejected with
    /// [`ReaderError::UnsupportedProtocol`]. The channel is marked open.
    pub fn activate_protocol(
        &mut self,
        reader_protocol: &str,
        card_protocol: &str,
    ) -> Result<(), ReaderError> {
        let protocol: ReaderProtocol = reader_protocol.parse()?;
        self.activate(protocol, card_protocol)
    }

    /// Activate a typed protocol and tag it with a logical card protocol name
    pub fn activate(
        &mut self,
        protocol: ReaderProtocol,
        card_protocol: &str,
    ) -> Result<(), ReaderError> {
        if !self.spi.is_protocol_supported(protocol) {
            return Err(ReaderError::UnsupportedProtocol(format!(
                "{protocol} on reader {}",
                self.name()
            )));
        }
        self.spi.activate_protocol(protocol)?;
        self.activated.insert(protocol, card_protocol.to_string());
        self.channel = ChannelState::Open;
        debug!(reader = self.name(), %protocol, card_protocol, "Protocol activated");
        Ok(())
    }

    /// Stop detecting a protocol
    pub fn deactivate_protocol(&mut self, reader_protocol: &str) -> Result<(), ReaderError> {
        let protocol: ReaderProtocol = reader_protocol.parse()?;
        if self.activated.remove(&protocol).is_some() {
            self.spi.deactivate_protocol(protocol);
            debug!(reader = self.name(), %protocol, "Protocol deactivated");
        }
        Ok(())
    }

    /// Logical name the given protocol was activated with
    pub fn activated_protocol(&self, protocol: ReaderProtocol) -> Option<&str> {
        self.activated.get(&protocol).map(String::as_str)
    }

    /// Configure the reader for a card protocol and activate the matching reader protocol
    ///
    /// The contact/contactless switch is only applied when the backend exposes
    /// a [`ContactConfigurator`].
    pub fn setup_for(&mut self, card_protocol: CardProtocol) -> Result<(), ReaderError> {
        if let Some(configurator) = self.spi.contact_configurator() {
            configurator.set_contactless(card_protocol.is_contactless());
            configurator.set_iso_protocol(card_protocol.iso_protocol());
        }
        self.activate(card_protocol.reader_protocol(), &card_protocol.to_string())
    }

    /// Contact configuration capability of the backend
    pub fn contact_configurator(&mut self) -> Option<&mut dyn ContactConfigurator> {
        self.spi.contact_configurator()
    }

    /// Whether a card is inserted
    pub fn is_card_present(&mut self) -> Result<bool, ReaderError> {
        self.spi.is_card_present()
    }

    /// Answer to reset of the inserted card
    pub fn atr(&self) -> Option<Bytes> {
        self.spi.atr()
    }

    /// Logical protocol name of the inserted card
    ///
    /// Returns `None` when no card is inserted or its protocol was not activated.
    pub fn current_card_protocol(&self) -> Option<&str> {
        self.spi
            .card_protocol()
            .and_then(|protocol| self.activated_protocol(protocol))
    }

    /// Whether any protocol has been activated on this reader
    pub fn has_activated_protocols(&self) -> bool {
        !self.activated.is_empty()
    }

    /// (Re)open the channel to the inserted card
    pub fn open_channel(&mut self) -> Result<(), ReaderError> {
        self.spi
            .open_physical_channel()
            .map_err(|e| ReaderError::from_transport(self.spi.name(), e))?;
        if self.channel == ChannelState::Closed {
            debug!(reader = self.name(), "Channel opened");
        }
        self.channel = ChannelState::Open;
        Ok(())
    }

    /// Exchange one command/response pair
    ///
    /// A closed channel fails with [`ReaderError::Channel`]. A timeout or a lost
    /// link leaves the channel closed; it has to be reopened explicitly.
    pub fn transmit(&mut self, apdu: &[u8]) -> Result<Bytes, ReaderError> {
        if self.channel == ChannelState::Closed {
            return Err(ReaderError::channel(self.name(), "channel is closed"));
        }

        match self.spi.transmit_raw(apdu) {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.is_link_lost() {
                    warn!(reader = self.name(), error = %e, "Link lost, closing channel");
                    self.force_close();
                }
                Err(ReaderError::from_transport(self.spi.name(), e))
            }
        }
    }

    /// Serialize a command, exchange it and parse the response
    pub fn transmit_command<C: ApduCommand + ?Sized>(
        &mut self,
        command: &C,
    ) -> Result<Response, ReaderError> {
        let raw = self.transmit(&command.to_bytes())?;
        Ok(Response::from_bytes(&raw)?)
    }

    /// Close the physical channel
    ///
    /// Releasing an already closed channel is a no-op.
    pub fn release_channel(&mut self) {
        if self.channel == ChannelState::Closed {
            return;
        }
        if let Err(e) = self.spi.close_physical_channel() {
            warn!(reader = self.name(), error = %e, "Failed to close physical channel");
        }
        self.channel = ChannelState::Closed;
        debug!(reader = self.name(), "Channel released");
    }

    fn force_close(&mut self) {
        if let Err(e) = self.spi.close_physical_channel() {
            warn!(
                reader = self.name(),
                error = %e,
                "Failed to close physical channel after link loss"
            );
        }
        self.channel = ChannelState::Closed;
    }
}
