//! Stub plugin
//!
//! Virtual readers holding virtual secure elements. Each reader is created
//! together with a [`StubReaderHandle`] used to insert and remove cards or
//! inject faults while the reader is in use.

mod card;
mod reader;

pub use card::{ApduTableCard, StubSmartCard};
pub use reader::{StubFault, StubReaderConfig, StubReaderHandle, StubReaderSpi};

use std::fmt;

use parking_lot::Mutex;

use crate::config::ReaderConfig;
use crate::error::ReaderError;
use crate::plugin::{Plugin, PluginFactory};
use crate::reader::{Reader, ReaderSpi, SharedReader};

/// Factory of stub plugins
///
/// Readers are plugged into the factory before registration. The backends are
/// handed over to the plugin when it is created, so a factory builds its
/// plugin once.
pub struct StubPluginFactory {
    name: String,
    reader_config: ReaderConfig,
    readers: Mutex<Vec<StubReaderSpi>>,
}

impl fmt::Debug for StubPluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubPluginFactory")
            .field("name", &self.name)
            .field("readers", &self.readers.lock().len())
            .finish()
    }
}

impl StubPluginFactory {
    /// Create a factory without readers
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reader_config: ReaderConfig::default(),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Configuration applied to every reader of the plugin
    pub fn with_reader_config(mut self, config: ReaderConfig) -> Self {
        self.reader_config = config;
        self
    }

    /// Add a reader and return its control handle
    pub fn plug_reader(&mut self, name: &str, config: StubReaderConfig) -> StubReaderHandle {
        let (spi, handle) = StubReaderSpi::new(name, config);
        self.readers.get_mut().push(spi);
        handle
    }
}

impl PluginFactory for StubPluginFactory {
    fn plugin_name(&self) -> &str {
        &self.name
    }

    fn create_plugin(&self) -> Result<Box<dyn Plugin>, ReaderError> {
        let readers = self
            .readers
            .lock()
            .drain(..)
            .map(|spi| {
                let name = spi.name().to_string();
                let reader = Reader::with_config(Box::new(spi), self.reader_config);
                (name, reader.into_shared())
            })
            .collect();

        Ok(Box::new(StubPlugin {
            name: self.name.clone(),
            readers,
        }))
    }
}

/// Plugin exposing stub readers
#[derive(Debug)]
pub struct StubPlugin {
    name: String,
    readers: Vec<(String, SharedReader)>,
}

impl Plugin for StubPlugin {
    fn name(&self) -> &str {
        &self.name
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
