use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::warn;

use super::{DistroPlugin, PluginDescriptor};

/// Distro id → driver. Populated once at startup, read-only afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn DistroPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver. A duplicate id is rejected and the existing driver kept.
    pub fn register(&mut self, id: &str, plugin: Arc<dyn DistroPlugin>) -> Result<()> {
        if id.is_empty() {
            bail!("plugin id must not be empty");
        }
        if self.plugins.contains_key(id) {
            bail!("plugin '{}' is already registered", id);
        }
        self.plugins.insert(id.to_string(), plugin);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DistroPlugin>> {
        self.plugins.get(id).cloned()
    }

    /// Descriptors of every driver, in id order. Drivers whose `describe`
    /// fails are logged and left out.
    pub fn list(&self) -> Vec<PluginDescriptor> {
        self.plugins
            .iter()
            .filter_map(|(id, plugin)| match plugin.describe() {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    warn!(plugin = %id, error = %e, "skipping plugin whose describe() failed");
                    None
                }
            })
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
