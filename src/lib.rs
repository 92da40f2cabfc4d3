//! Plugbus Library
//!
//! A message-bus plugin runtime: plugins talk only through typed messages
//! dispatched by a bus, which also tracks their parent/child hierarchy,
//! routes the intent request/response protocol, dispatches batches and can
//! fuse two running buses into one.
//!
//! ## Main Components
//!
//! - [`config`] - Bus settings and XDG directories
//! - [`messaging`] - Message model, subscriptions, bus, batches, transports
//! - [`intent`] - Intent router and the built-in intent tables
//! - [`plugins`] - Plugin trait, factories, registry, resources, readiness
//! - [`fusion`] - Merging a source bus into a target bus
//!
//! ## Quick Start
//!
//! ```ignore
//! use plugbus::{MessageBus, PluginSpec, FusionConfig};
//!
//! let source = MessageBus::new();
//! source.create_plugin(PluginSpec::new("counter")).await?;
//!
//! let target = MessageBus::new();
//! let result = source.fuse_with(&target, FusionConfig::default()).await;
//! assert_eq!(result.plugins_moved, 1);
//! ```

pub mod config;
pub mod fusion;
pub mod intent;
pub mod messaging;
pub mod plugins;

// Re-export commonly used types
pub use config::{BusSettings, SettingsError, XdgDirs};
pub use fusion::{FusionConfig, FusionCoordinator, FusionError, FusionRecord, FusionResult};
pub use intent::{IntentCall, IntentError, IntentHandler, IntentRouter, SendIntentOptions};
pub use messaging::{
    handler_fn, BatchError, BatchResult, BusBuilder, BusError, BusSink, BusStats, Category,
    ChannelTransport, Message, MessageBus, MessageHandler, Route, Subscription, Transport,
    TransportError,
};
pub use plugins::{
    Plugin, PluginContext, PluginError, PluginFactories, PluginRecord, PluginRegistry,
    PluginSpec, ReadinessError,
};
