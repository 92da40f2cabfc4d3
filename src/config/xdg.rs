//! XDG Base Directory support.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "plugbus";

/// XDG directory paths for plugbus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdgDirs {
    /// Config directory (~/.config/plugbus or XDG_CONFIG_HOME/plugbus)
    pub config: PathBuf,
}

impl XdgDirs {
    /// Get XDG directories, respecting environment variables.
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::resolve(&home, |key| std::env::var(key).ok())
    }

    /// Resolve directories against `home` with a custom variable lookup.
    pub fn resolve(home: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let dir = |var: &str, fallback: &str| {
            lookup(var)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(fallback))
                .join(APP_DIR)
        };

        Self {
            config: dir("XDG_CONFIG_HOME", ".config"),
        }
    }

    /// Default settings file location.
    pub fn settings_file(&self) -> PathBuf {
        self.config.join("settings.json")
    }
}

impl Default for XdgDirs {
    fn default() -> Self {
        Self::new()
    }
}
