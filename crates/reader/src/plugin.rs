//! Plugin contracts
//!
//! A plugin owns a set of readers of one backend kind. Plugins are created by
//! factories and registered into a [`SmartCardContext`](crate::SmartCardContext).

use std::fmt;

use crate::error::ReaderError;
use crate::reader::SharedReader;

/// Name of the stub plugin
pub const STUB_PLUGIN_NAME: &str = "stub";

/// Name of the PC/SC plugin
pub const PCSC_PLUGIN_NAME: &str = "pcsc";

/// A directory of readers provided by one backend
pub trait Plugin: Send + fmt::Debug {
    /// Plugin name, unique within a context
    fn name(&self) -> &str;

    /// Names of the readers currently exposed
    fn reader_names(&self) -> Vec<String>;

    /// Look a reader up by name
    fn reader(&self, name: &str) -> Option<SharedReader>;

    /// Release every reader channel before the plugin is dropped
    fn release(&mut self) {
        for name in self.reader_names() {
            if let Some(reader) = self.reader(&name) {
                reader.lock().release_channel();
            }
        }
    }
}

/// Builds a plugin instance
pub trait PluginFactory: fmt::Debug {
    /// Name of the plugin this factory builds
    fn plugin_name(&self) -> &str;

    /// Build the plugin
    fn create_plugin(&self) -> Result<Box<dyn Plugin>, ReaderError>;
}
