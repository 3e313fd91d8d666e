//! The handle plugins receive at construction.
//!
//! A thin value carrying references to the cache, the current cycle
//! snapshot, listers, the binding sink, and the nominator. Deliberately
//! not a back-reference to the framework itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use berth_cache::{Cache, Snapshot};
use berth_core::Task;

/// Read-only view of cluster objects plugins may consult.
pub trait Listers: Send + Sync {
    /// Labels of a namespace; `None` when the namespace is unknown.
    fn namespace_labels(&self, name: &str) -> Option<HashMap<String, String>>;
}

/// Fixed in-memory listers; enough for single-process deployments and
/// tests.
#[derive(Default)]
pub struct StaticListers {
    namespaces: HashMap<String, HashMap<String, String>>,
}

impl StaticListers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, name: &str, labels: &[(&str, &str)]) -> Self {
        self.namespaces.insert(
            name.to_string(),
            labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
        self
    }
}

impl Listers for StaticListers {
    fn namespace_labels(&self, name: &str) -> Option<HashMap<String, String>> {
        self.namespaces.get(name).cloned()
    }
}

/// Event sink. Implementations must never block.
pub trait Recorder: Send + Sync {
    fn eventf(&self, task: &Task, reason: &str, message: &str);
}

/// Recorder that writes events to the log.
pub struct LogRecorder;

impl Recorder for LogRecorder {
    fn eventf(&self, task: &Task, reason: &str, message: &str) {
        info!(task = %task.uid, reason, message, "event");
    }
}

/// The binding RPC, owned by an external collaborator.
pub trait Binder: Send + Sync {
    fn bind(&self, task: &Task, node: &str) -> anyhow::Result<()>;
}

/// Binder that records nothing; for tests and dry runs.
pub struct NoopBinder;

impl Binder for NoopBinder {
    fn bind(&self, _task: &Task, _node: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Nominated-task registry, owned by the scheduling queue.
pub trait TaskNominator: Send + Sync {
    /// Tasks nominated onto the given node by earlier cycles.
    fn nominated_tasks_for_node(&self, node: &str) -> Vec<Arc<Task>>;
    fn add_nominated_task(&self, task: Arc<Task>, node: &str);
    fn delete_nominated_task(&self, task: &Task);
}

/// Nominator with no memory; for tests and profiles without preemption.
pub struct EmptyNominator;

impl TaskNominator for EmptyNominator {
    fn nominated_tasks_for_node(&self, _node: &str) -> Vec<Arc<Task>> {
        Vec::new()
    }
    fn add_nominated_task(&self, _task: Arc<Task>, _node: &str) {}
    fn delete_nominated_task(&self, _task: &Task) {}
}

/// Shared slot holding the snapshot of the cycle in flight. The scheduler
/// refreshes it at cycle start; plugins read it through their handle.
#[derive(Default)]
pub struct SnapshotRef {
    inner: RwLock<Arc<Snapshot>>,
}

impl SnapshotRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.read())
    }

    pub fn set(&self, snapshot: Arc<Snapshot>) {
        *self.inner.write() = snapshot;
    }
}

/// What a plugin factory receives. Cheap to clone.
#[derive(Clone)]
pub struct Handle {
    pub cache: Arc<Cache>,
    pub snapshot: Arc<SnapshotRef>,
    pub listers: Arc<dyn Listers>,
    pub recorder: Arc<dyn Recorder>,
    pub binder: Arc<dyn Binder>,
    pub nominator: Arc<dyn TaskNominator>,
}

impl Handle {
    /// Handle with no-op collaborators around a cache; tests and simple
    /// deployments start here and override what they need.
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            snapshot: Arc::new(SnapshotRef::new()),
            listers: Arc::new(StaticListers::new()),
            recorder: Arc::new(LogRecorder),
            binder: Arc::new(NoopBinder),
            nominator: Arc::new(EmptyNominator),
        }
    }

    pub fn with_listers(mut self, listers: Arc<dyn Listers>) -> Self {
        self.listers = listers;
        self
    }

    pub fn with_binder(mut self, binder: Arc<dyn Binder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_nominator(mut self, nominator: Arc<dyn TaskNominator>) -> Self {
        self.nominator = nominator;
        self
    }
}
