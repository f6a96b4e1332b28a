//! PC/SC plugin
//!
//! Adapts PC/SC readers to the [`ReaderSpi`] contract. Only compiled with the
//! `pcsc` feature.

use std::ffi::CString;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use calypso_apdu_core::{CardTransport, TransportError};
use pcsc::{Attribute, Card, Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, warn};

use crate::config::ReaderConfig;
use crate::error::ReaderError;
use crate::plugin::{PCSC_PLUGIN_NAME, Plugin, PluginFactory};
use crate::protocol::{IsoProtocol, ReaderProtocol};
use crate::reader::{ContactConfigurator, Reader, ReaderSpi, SharedReader};

/// Factory of the PC/SC plugin
#[derive(Debug, Clone, Default)]
pub struct PcscPluginFactory {
    reader_config: ReaderConfig,
}

impl PcscPluginFactory {
    /// Create a factory with default reader configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration applied to every reader of the plugin
    pub const fn with_reader_config(mut self, config: ReaderConfig) -> Self {
        self.reader_config = config;
        self
    }
}

impl PluginFactory for PcscPluginFactory {
    fn plugin_name(&self) -> &str {
        PCSC_PLUGIN_NAME
    }

    fn create_plugin(&self) -> Result<Box<dyn Plugin>, ReaderError> {
        let context = Context::establish(Scope::User)?;
        let readers = context
            .list_readers_owned()?
            .into_iter()
            .map(|name| {
                let display_name = name.to_string_lossy().into_owned();
                let spi = PcscReaderSpi::new(context.clone(), name, display_name.clone());
                let reader = Reader::with_config(Box::new(spi), self.reader_config);
                (display_name, reader.into_shared())
            })
            .collect::<Vec<_>>();

        debug!(count = readers.len(), "PC/SC readers discovered");
        Ok(Box::new(PcscPlugin { readers }))
    }
}

/// Plugin exposing the PC/SC readers present at creation time
#[derive(Debug)]
pub struct PcscPlugin {
    readers: Vec<(String, SharedReader)>,
}

impl Plugin for PcscPlugin {
    fn name(&self) -> &str {
        PCSC_PLUGIN_NAME
    }

    fn reader_names(&self) -> Vec<String> {
        self.readers.iter().map(|(name, _)| name.clone()).collect()
    }

    fn reader(&self, name: &str) -> Option<SharedReader> {
        self.readers
            .iter()
            .find(|(reader_name, _)| reader_name == name)
            .map(|(_, reader)| reader.clone())
    }
}

/// Reader backend over one PC/SC reader
pub struct PcscReaderSpi {
    context: Context,
    reader: CString,
    name: String,
    card: Option<Card>,
    contactless: bool,
    iso_protocol: Option<IsoProtocol>,
    timeout: Duration,
}

impl fmt::Debug for PcscReaderSpi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscReaderSpi")
            .field("name", &self.name)
            .field("has_card", &self.card.is_some())
            .field("contactless", &self.contactless)
            .field("iso_protocol", &self.iso_protocol)
            .finish()
    }
}

impl PcscReaderSpi {
    fn new(context: Context, reader: CString, name: String) -> Self {
        Self {
            context,
            reader,
            name,
            card: None,
            contactless: false,
            iso_protocol: None,
            timeout: Duration::ZERO,
        }
    }

    fn preferred_protocols(&self) -> Protocols {
        match self.iso_protocol {
            Some(IsoProtocol::T0) => Protocols::T0,
            Some(IsoProtocol::T1) => Protocols::T1,
            None => Protocols::ANY,
        }
    }
}

fn transport_error(error: pcsc::Error) -> TransportError {
    match error {
        pcsc::Error::Timeout => TransportError::Timeout,
        pcsc::Error::RemovedCard | pcsc::Error::ResetCard | pcsc::Error::NoSmartcard => {
            TransportError::Connection
        }
        pcsc::Error::Cancelled => TransportError::Cancelled,
        pcsc::Error::InsufficientBuffer => TransportError::BufferTooSmall,
        other => TransportError::other(other.to_string()),
    }
}

impl CardTransport for PcscReaderSpi {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        let card = self
            .card
            .as_mut()
            .ok_or_else(|| TransportError::channel("no card connected"))?;

        let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        match card.transmit(command, &mut buffer) {
            Ok(response) => Ok(Bytes::copy_from_slice(response)),
            Err(e) => {
                if matches!(e, pcsc::Error::RemovedCard | pcsc::Error::ResetCard) {
                    self.card = None;
                }
                Err(transport_error(e))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.card.is_some()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        if let Some(card) = self.card.take() {
            let _ = card.disconnect(Disposition::ResetCard);
        }
        self.open_physical_channel()
    }
}

impl ReaderSpi for PcscReaderSpi {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_contactless(&self) -> bool {
        self.contactless
    }

    fn is_protocol_supported(&self, protocol: ReaderProtocol) -> bool {
        !matches!(protocol, ReaderProtocol::InnovatronBPrime)
    }

    fn is_card_present(&mut self) -> Result<bool, ReaderError> {
        let mut states = [ReaderState::new(self.reader.as_c_str(), State::UNAWARE)];
        self.context
            .get_status_change(Duration::ZERO, &mut states)?;
        Ok(states[0].event_state().contains(State::PRESENT))
    }

    fn open_physical_channel(&mut self) -> Result<(), TransportError> {
        if self.card.is_some() {
            return Ok(());
        }
        let card = self
            .context
            .connect(&self.reader, ShareMode::Shared, self.preferred_protocols())
            .map_err(transport_error)?;
        self.card = Some(card);
        Ok(())
    }

    fn close_physical_channel(&mut self) -> Result<(), TransportError> {
        if let Some(card) = self.card.take() {
            if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
                warn!(reader = %self.name, error = %e, "Disconnect failed");
                return Err(transport_error(e));
            }
        }
        Ok(())
    }

    fn atr(&self) -> Option<Bytes> {
        self.card
            .as_ref()
            .and_then(|card| card.get_attribute_owned(Attribute::AtrString).ok())
            .map(Bytes::from)
    }

    fn card_protocol(&self) -> Option<ReaderProtocol> {
        let status = self.card.as_ref()?.status2_owned().ok()?;
        match status.protocol2()? {
            pcsc::Protocol::T0 => Some(ReaderProtocol::Iso7816_3_T0),
            pcsc::Protocol::T1 if self.contactless => Some(ReaderProtocol::Iso14443_4),
            pcsc::Protocol::T1 => Some(ReaderProtocol::Iso7816_3_T1),
            _ => None,
        }
    }

    fn set_transmit_timeout(&mut self, timeout: Duration) {
        // PC/SC applies its own driver timeout; kept for diagnostics
        self.timeout = timeout;
    }

    fn contact_configurator(&mut self) -> Option<&mut dyn ContactConfigurator> {
        Some(self)
    }
}

impl ContactConfigurator for PcscReaderSpi {
    fn set_contactless(&mut self, contactless: bool) {
        self.contactless = contactless;
    }

    fn set_iso_protocol(&mut self, protocol: IsoProtocol) {
        self.iso_protocol = Some(protocol);
    }
}
