//! Per-cycle shared state.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// A value stored in the cycle state.
///
/// `clone_data` must produce an independent deep copy: the nominated-task
/// what-if filter pass clones the whole state and mutates its copy, and
/// those mutations must not reach the original.
pub trait StateData: Send + Sync {
    fn clone_data(&self) -> Arc<dyn StateData>;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Key→opaque value bag shared by all extension points of one cycle.
///
/// Written during the serial PreFilter/PreScore phases and read during
/// the parallel Filter/Score phases; the map itself is lock-protected so
/// concurrent reads are always safe. Plugins that must adjust their entry
/// after PreFilter (the preemption what-if path) guard the entry's
/// interior with its own lock.
#[derive(Default)]
pub struct CycleState {
    storage: RwLock<HashMap<String, Arc<dyn StateData>>>,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, key: &str, value: Arc<dyn StateData>) {
        self.storage.write().insert(key.to_string(), value);
    }

    /// Typed read. `None` when the key is absent or holds another type.
    pub fn read<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.storage.read().get(key).cloned()?;
        value.as_any_arc().downcast::<T>().ok()
    }

    pub fn delete(&self, key: &str) {
        self.storage.write().remove(key);
    }

    /// Independent deep copy of every entry.
    pub fn clone_state(&self) -> CycleState {
        let copied = self
            .storage
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone_data()))
            .collect();
        CycleState {
            storage: RwLock::new(copied),
        }
    }
}
