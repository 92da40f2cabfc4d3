//! Plugin system.
//!
//! This module provides:
//! - [`Plugin`] capability trait and [`PluginContext`]
//! - [`PluginFactories`] table keyed by type string, with built-in kinds
//! - [`PluginRegistry`] for identity, hierarchy and lifecycle state
//! - [`ResourceLedger`] and [`ReadinessBoard`]

mod base;
mod builtin;
mod readiness;
mod registry;
mod resources;

pub use base::{ArcPlugin, Plugin, PluginContext, PluginFactories, PluginFactory, PluginSpec};
pub(crate) use base::PluginInbox;
pub use builtin::{register_builtins, CounterPlugin, EchoPlugin};
pub use readiness::{ReadinessBoard, ReadinessError};
pub use registry::{
    IntegrityIssue, PluginError, PluginRecord, PluginRegistry, PluginStatus, PluginTreeNode,
    RegistryLimits,
};
pub use resources::{ResourceLedger, ResourceUsage};
