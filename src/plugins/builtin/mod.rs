//! Built-in plugin kinds.

mod counter;
mod echo;

pub use counter::CounterPlugin;
pub use echo::EchoPlugin;

use super::base::{ArcPlugin, PluginFactories};
use std::sync::Arc;

/// Register every built-in kind in `table`.
pub fn register_builtins(table: &mut PluginFactories) {
    table.register(EchoPlugin::KIND, |_| Ok(Arc::new(EchoPlugin) as ArcPlugin));
    table.register(CounterPlugin::KIND, |config| {
        Ok(Arc::new(CounterPlugin::from_config(config)?) as ArcPlugin)
    });
}
