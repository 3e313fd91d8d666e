//! The default bind plugin.

use std::sync::Arc;

use tracing::debug;

use berth_core::Task;
use berth_framework::{
    BindPlugin, CancelToken, CycleState, Handle, Plugin, Status,
};

pub const NAME: &str = "DefaultBinder";

/// Binds a task through the handle's binding sink. Runs last so that
/// specialized bind plugins can claim the task first by not skipping.
pub struct DefaultBinder {
    handle: Handle,
}

pub fn factory(_args: &serde_json::Value, handle: &Handle) -> anyhow::Result<Arc<dyn Plugin>> {
    Ok(Arc::new(DefaultBinder {
        handle: handle.clone(),
    }))
}

impl Plugin for DefaultBinder {
    fn name(&self) -> &str {
        NAME
    }

    fn bind(&self) -> Option<&dyn BindPlugin> {
        Some(self)
    }
}

impl BindPlugin for DefaultBinder {
    fn bind(&self, _ctx: &CancelToken, _state: &CycleState, task: &Task, node: &str) -> Status {
        debug!(task = %task.uid, node, "binding");
        match self.handle.binder.bind(task, node) {
            Ok(()) => Status::success(),
            Err(source) => Status::error(source.to_string()),
        }
    }
}
