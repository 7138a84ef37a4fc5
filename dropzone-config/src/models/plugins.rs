use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_library_dir() -> PathBuf {
    PathBuf::from("plugins")
}

/// Where plugins live and which extra modules to load by name.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Registry library directory; holds copied modules and `plugins.json`.
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,
    /// Modules used in place, keyed by the name uploads refer to.
    pub modules: BTreeMap<String, PathBuf>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            library_dir: default_library_dir(),
            modules: BTreeMap::new(),
        }
    }
}

impl PluginsConfig {
    /// Case-insensitive, matching the registry.
    pub fn declares(&self, name: &str) -> bool {
        self.modules.keys().any(|key| key.eq_ignore_ascii_case(name))
    }
}
