//! Queue ordering by task priority.

use std::sync::Arc;

use berth_framework::{Handle, Plugin, QueueSortPlugin, QueuedTaskInfo};

pub const NAME: &str = "PrioritySort";

/// Orders the scheduling queue by descending priority; ties go to the
/// task that has been queued longer.
pub struct PrioritySort;

pub fn factory(_args: &serde_json::Value, _handle: &Handle) -> anyhow::Result<Arc<dyn Plugin>> {
    Ok(Arc::new(PrioritySort))
}

impl Plugin for PrioritySort {
    fn name(&self) -> &str {
        NAME
    }

    fn queue_sort(&self) -> Option<&dyn QueueSortPlugin> {
        Some(self)
    }
}

impl QueueSortPlugin for PrioritySort {
    fn less(&self, a: &QueuedTaskInfo, b: &QueuedTaskInfo) -> bool {
        if a.task.priority != b.task.priority {
            return a.task.priority > b.task.priority;
        }
        a.enqueue_time < b.enqueue_time
    }
}
