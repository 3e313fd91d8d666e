//! Tasks parked at the Permit gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use berth_core::{Task, TaskId};

use crate::status::Status;

/// One task waiting on Permit approval.
pub struct WaitingTask {
    task: Arc<Task>,
    /// Plugins that asked to wait and have not allowed yet.
    pending: Mutex<Vec<String>>,
    deadline: Instant,
    sender: Mutex<Option<oneshot::Sender<Status>>>,
    receiver: Mutex<Option<oneshot::Receiver<Status>>>,
}

impl WaitingTask {
    fn new(task: Arc<Task>, pending: Vec<String>, deadline: Instant) -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            task,
            pending: Mutex::new(pending),
            deadline,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn pending_plugins(&self) -> Vec<String> {
        self.pending.lock().clone()
    }

    /// A permit plugin approves. The waiter resolves Success once every
    /// pending plugin allowed.
    pub fn allow(&self, plugin: &str) {
        let mut pending = self.pending.lock();
        pending.retain(|p| p != plugin);
        if pending.is_empty() {
            self.resolve(Status::success());
        }
    }

    /// A permit plugin rejects; resolves immediately.
    pub fn reject(&self, plugin: &str, reason: &str) {
        self.resolve(Status::unschedulable(reason).with_plugin(plugin));
    }

    fn resolve(&self, status: Status) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(status);
        }
    }

    pub(crate) fn take_receiver(&self) -> Option<oneshot::Receiver<Status>> {
        self.receiver.lock().take()
    }
}

/// Registry of tasks parked at Permit, keyed by task uid.
#[derive(Default)]
pub struct WaitingTasks {
    inner: Mutex<HashMap<TaskId, Arc<WaitingTask>>>,
}

impl WaitingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(
        &self,
        task: Arc<Task>,
        pending: Vec<String>,
        deadline: Instant,
    ) -> Arc<WaitingTask> {
        let waiting = Arc::new(WaitingTask::new(Arc::clone(&task), pending, deadline));
        self.inner
            .lock()
            .insert(task.uid.clone(), Arc::clone(&waiting));
        waiting
    }

    pub fn get(&self, uid: &str) -> Option<Arc<WaitingTask>> {
        self.inner.lock().get(uid).cloned()
    }

    pub fn remove(&self, uid: &str) {
        self.inner.lock().remove(uid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Uids of all currently waiting tasks.
    pub fn uids(&self) -> Vec<TaskId> {
        self.inner.lock().keys().cloned().collect()
    }
}
