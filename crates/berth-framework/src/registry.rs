//! Plugin factory registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FrameworkError, FrameworkResult};
use crate::handle::Handle;
use crate::plugin::Plugin;

/// Builds one plugin instance from its configured args and the handle.
pub type PluginFactory =
    Arc<dyn Fn(&serde_json::Value, &Handle) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync>;

/// Factories keyed by plugin name. A framework instantiates from here
/// exactly the plugins its profile enables.
#[derive(Default, Clone)]
pub struct Registry {
    factories: HashMap<String, PluginFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> FrameworkResult<()>
    where
        F: Fn(&serde_json::Value, &Handle) -> anyhow::Result<Arc<dyn Plugin>>
            + Send
            + Sync
            + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(FrameworkError::AlreadyRegistered(name.to_string()));
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Fold another registry in; duplicate names are an error.
    pub fn merge(&mut self, other: Registry) -> FrameworkResult<()> {
        for (name, factory) in other.factories {
            if self.factories.contains_key(&name) {
                return Err(FrameworkError::AlreadyRegistered(name));
            }
            self.factories.insert(name, factory);
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub(crate) fn factory(&self, name: &str) -> Option<&PluginFactory> {
        self.factories.get(name)
    }
}
