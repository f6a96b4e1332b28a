//! Smart card context
//!
//! The context is the registry of plugins. It is constructed explicitly,
//! passed to whatever needs reader access, and releases every registered
//! reader on [`SmartCardContext::shutdown`] or drop.

use tracing::{debug, info};

use crate::error::ReaderError;
use crate::plugin::{PCSC_PLUGIN_NAME, Plugin, PluginFactory, STUB_PLUGIN_NAME};
use crate::reader::SharedReader;
use crate::stub::StubPluginFactory;

/// Resolve a plugin name to its factory
///
/// `"stub"` yields an empty [`StubPluginFactory`]; `"pcsc"` yields the PC/SC
/// factory when the `pcsc` feature is enabled. Any other name is rejected with
/// [`ReaderError::UnknownPlugin`].
pub fn plugin_factory(name: &str) -> Result<Box<dyn PluginFactory>, ReaderError> {
    match name {
        STUB_PLUGIN_NAME => Ok(Box::new(StubPluginFactory::new(STUB_PLUGIN_NAME))),
        #[cfg(feature = "pcsc")]
        PCSC_PLUGIN_NAME => Ok(Box::new(crate::pcsc_plugin::PcscPluginFactory::new())),
        #[cfg(not(feature = "pcsc"))]
        PCSC_PLUGIN_NAME => Err(ReaderError::UnknownPlugin(format!(
            "{name} (built without the pcsc feature)"
        ))),
        other => Err(ReaderError::UnknownPlugin(other.to_string())),
    }
}

/// Registry of plugins and their readers
#[derive(Debug, Default)]
pub struct SmartCardContext {
    plugins: Vec<Box<dyn Plugin>>,
}

impl SmartCardContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a plugin from its factory and register it
    ///
    /// Returns the registered plugin name.
    pub fn register_plugin(&mut self, factory: &dyn PluginFactory) -> Result<String, ReaderError> {
        let name = factory.plugin_name().to_string();
        if self.plugin(&name).is_some() {
            return Err(ReaderError::PluginAlreadyRegistered(name));
        }

        let plugin = factory.create_plugin()?;
        info!(plugin = %name, readers = ?plugin.reader_names(), "Plugin registered");
        self.plugins.push(plugin);
        Ok(name)
    }

    /// Release a plugin's readers and remove it
    pub fn unregister_plugin(&mut self, name: &str) -> Result<(), ReaderError> {
        let index = self
            .plugins
            .iter()
            .position(|plugin| plugin.name() == name)
            .ok_or_else(|| ReaderError::PluginNotFound(name.to_string()))?;

        let mut plugin = self.plugins.remove(index);
        plugin.release();
        debug!(plugin = name, "Plugin unregistered");
        Ok(())
    }

    /// Look a registered plugin up by name
    pub fn plugin(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins
            .iter()
            .find(|plugin| plugin.name() == name)
            .map(|plugin| plugin.as_ref())
    }

    /// Names of the registered plugins, in registration order
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Names of every reader of every registered plugin
    pub fn reader_names(&self) -> Vec<String> {
        self.plugins.iter().flat_map(|p| p.reader_names()).collect()
    }

    /// Look a reader up by name across all plugins
    pub fn reader(&self, name: &str) -> Result<SharedReader, ReaderError> {
        self.plugins
            .iter()
            .find_map(|plugin| plugin.reader(name))
            .ok_or_else(|| ReaderError::ReaderNotFound(name.to_string()))
    }

    /// Release and drop every registered plugin
    pub fn shutdown(&mut self) {
        for mut plugin in self.plugins.drain(..) {
            plugin.release();
            debug!(plugin = plugin.name(), "Plugin released");
        }
    }
}

impl Drop for SmartCardContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelState;
    use crate::protocol::ReaderProtocol;
    use crate::stub::{ApduTableCard, StubReaderConfig};
    use hex_literal::hex;

    fn provisioned_factory() -> StubPluginFactory {
        let mut factory = StubPluginFactory::new(STUB_PLUGIN_NAME);
        let handle = factory.plug_reader("stub1", StubReaderConfig::default());
        handle.insert_card(ApduTableCard::new(&hex!("3B00"), ReaderProtocol::Iso7816_3_T1));
        factory.plug_reader("stub2", StubReaderConfig::default());
        factory
    }

    #[test]
    fn test_plugin_factory_resolution() {
        assert_eq!(plugin_factory("stub").unwrap().plugin_name(), "stub");
        assert!(matches!(
            plugin_factory("acme"),
            Err(ReaderError::UnknownPlugin(ref name)) if name == "acme"
        ));
    }

    #[test]
    fn test_register_and_lookup() {
        let mut context = SmartCardContext::new();
        let name = context.register_plugin(&provisioned_factory()).unwrap();
        assert_eq!(name, "stub");
        assert_eq!(context.plugin_names(), vec!["stub".to_string()]);
        assert_eq!(context.reader_names(), vec!["stub1".to_string(), "stub2".to_string()]);

        assert!(context.reader("stub1").is_ok());
        assert!(matches!(
            context.reader("nope"),
            Err(ReaderError::ReaderNotFound(_))
        ));

        let err = context.register_plugin(&provisioned_factory()).unwrap_err();
        assert!(matches!(err, ReaderError::PluginAlreadyRegistered(_)));
    }

    #[test]
    fn test_unregister_releases_readers() {
        let mut context = SmartCardContext::new();
        context.register_plugin(&provisioned_factory()).unwrap();

        let reader = context.reader("stub1").unwrap();
        reader
            .lock()
            .activate_protocol("ISO_7816_3_T1", "ISO_7816_3_T1")
            .unwrap();
        assert_eq!(reader.lock().channel_state(), ChannelState::Open);

        context.unregister_plugin("stub").unwrap();
        assert_eq!(reader.lock().channel_state(), ChannelState::Closed);
        assert!(context.reader_names().is_empty());
        assert!(matches!(
            context.unregister_plugin("stub"),
            Err(ReaderError::PluginNotFound(_))
        ));
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut context = SmartCardContext::new();
        context.register_plugin(&provisioned_factory()).unwrap();
        let reader = context.reader("stub1").unwrap();
        reader.lock().open_channel().unwrap();

        drop(context);
        assert_eq!(reader.lock().channel_state(), ChannelState::Closed);
    }
}
