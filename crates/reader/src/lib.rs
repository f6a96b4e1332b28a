//! Reader abstraction for Calypso transactions
//!
//! This crate provides the channel to a secure element that the selection and
//! transaction layers talk through:
//!
//! - [`Reader`]: protocol activation, channel state and single command/response
//!   exchanges over a plugin-supplied [`ReaderSpi`]
//! - [`SmartCardContext`]: an explicitly owned registry of plugins
//! - [`stub`]: virtual readers for tests and demonstrations
//! - `PcscPluginFactory` (`pcsc` feature): real PC/SC readers
//!
//! # Examples
//!
//! ```
//! use calypso_reader::stub::{ApduTableCard, StubPluginFactory, StubReaderConfig};
//! use calypso_reader::{ReaderProtocol, SmartCardContext};
//!
//! let mut factory = StubPluginFactory::new("stub");
//! let handle = factory.plug_reader("stub1", StubReaderConfig::default());
//! handle.insert_card(
//!     ApduTableCard::new(&[0x3B, 0x00], ReaderProtocol::Iso7816_3_T1)
//!         .with_response(&[0x00, 0xB2], &[0x01, 0x90, 0x00]),
//! );
//!
//! let mut context = SmartCardContext::new();
//! context.register_plugin(&factory)?;
//!
//! let reader = context.reader("stub1")?;
//! let mut reader = reader.lock();
//! reader.activate_protocol("ISO_7816_3_T1", "ISO_7816_3_T1")?;
//! reader.open_channel()?;
//! let response = reader.transmit(&[0x00, 0xB2, 0x01, 0x0C, 0x00])?;
//! assert_eq!(response.as_ref(), &[0x01, 0x90, 0x00]);
//! # Ok::<(), calypso_reader::ReaderError>(())
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod error;
mod plugin;
mod protocol;
mod reader;
pub mod stub;

#[cfg(feature = "pcsc")]
mod pcsc_plugin;

pub use config::{DEFAULT_TRANSMIT_TIMEOUT, ReaderConfig};
pub use context::{SmartCardContext, plugin_factory};
pub use error::ReaderError;
pub use plugin::{PCSC_PLUGIN_NAME, Plugin, PluginFactory, STUB_PLUGIN_NAME};
pub use protocol::{CardProtocol, IsoProtocol, ReaderProtocol};
pub use reader::{ChannelState, ContactConfigurator, Reader, ReaderSpi, SharedReader};

#[cfg(feature = "pcsc")]
pub use pcsc_plugin::{PcscPlugin, PcscPluginFactory, PcscReaderSpi};
