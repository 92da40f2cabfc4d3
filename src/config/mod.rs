//! Configuration management.

mod settings;
mod xdg;

pub use settings::{BusSettings, SettingsError};
pub use xdg::XdgDirs;
