mod channel;
mod plugins;

pub use channel::{parse_package_versions, ChannelRegistry, RegistryError, DEFAULT_CATALOG_URL};
pub use plugins::parse_plugin_catalog;
