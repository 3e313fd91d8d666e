//! The scheduling queue.
//!
//! Three sub-queues:
//!
//! - **active**: tasks ready to schedule, ordered by the queue-sort
//!   plugin's less-than relation
//! - **backoff**: tasks that failed with a retryable error, parked until
//!   their backoff expires
//! - **unschedulable**: tasks no node could host, woken by cluster
//!   events relevant to the plugins that rejected them
//!
//! The queue also keeps the nominated-task records the preemption path
//! writes and the filter's nominated re-check reads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use berth_core::{Task, TaskId};
use berth_framework::{QueuedTaskInfo, TaskNominator};

/// Ordering relation: "a schedules before b".
pub type LessFn = Box<dyn Fn(&QueuedTaskInfo, &QueuedTaskInfo) -> bool + Send + Sync>;

#[derive(Default)]
struct QueueInner {
    active: Vec<QueuedTaskInfo>,
    backoff: Vec<(Instant, QueuedTaskInfo)>,
    unschedulable: HashMap<TaskId, QueuedTaskInfo>,
}

#[derive(Default)]
struct NominatedTasks {
    /// Node name → tasks nominated onto it.
    by_node: HashMap<String, Vec<Arc<Task>>>,
    /// Task uid → nominated node, for deletion.
    by_task: HashMap<TaskId, String>,
}

pub struct SchedulingQueue {
    inner: Mutex<QueueInner>,
    nominated: Mutex<NominatedTasks>,
    notify: Notify,
    less: LessFn,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl SchedulingQueue {
    pub fn new(less: LessFn, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            nominated: Mutex::new(NominatedTasks::default()),
            notify: Notify::new(),
            less,
            initial_backoff,
            max_backoff,
        }
    }

    // ── Intake ─────────────────────────────────────────────────────

    /// Add a newly pending task.
    pub fn add(&self, task: Arc<Task>) {
        let info = QueuedTaskInfo::new(task, Instant::now());
        self.inner.lock().active.push(info);
        self.notify.notify_waiters();
    }

    /// Re-queue after a retryable failure; the task sits out its backoff.
    pub fn add_backoff(&self, mut info: QueuedTaskInfo) {
        info.attempts += 1;
        let until = Instant::now() + self.backoff_duration(info.attempts);
        self.inner.lock().backoff.push((until, info));
    }

    /// Park a task no node could host. It wakes when a cluster event
    /// relevant to one of `plugins` arrives.
    pub fn add_unschedulable(&self, mut info: QueuedTaskInfo, plugins: HashSet<String>) {
        info.attempts += 1;
        info.unschedulable_plugins = plugins;
        let uid = info.task.uid.clone();
        self.inner.lock().unschedulable.insert(uid, info);
    }

    /// Apply a task update wherever the task currently sits.
    pub fn update(&self, old: &Task, new: Arc<Task>) {
        let mut inner = self.inner.lock();
        if let Some(info) = inner.active.iter_mut().find(|i| i.task.uid == old.uid) {
            info.task = new;
            return;
        }
        if let Some((_, info)) = inner
            .backoff
            .iter_mut()
            .find(|(_, i)| i.task.uid == old.uid)
        {
            info.task = new;
            return;
        }
        if let Some(mut info) = inner.unschedulable.remove(&old.uid) {
            // An updated task may have become schedulable; retry it.
            info.task = new;
            inner.active.push(info);
            drop(inner);
            self.notify.notify_waiters();
            return;
        }
        // Unknown to the queue: treat as a fresh add.
        drop(inner);
        self.add(new);
    }

    /// Drop a task from every sub-queue.
    pub fn delete(&self, task: &Task) {
        let mut inner = self.inner.lock();
        inner.active.retain(|i| i.task.uid != task.uid);
        inner.backoff.retain(|(_, i)| i.task.uid != task.uid);
        inner.unschedulable.remove(&task.uid);
    }

    // ── Consumption ────────────────────────────────────────────────

    /// Best queued task right now, if any.
    pub fn try_pop(&self) -> Option<QueuedTaskInfo> {
        let mut inner = self.inner.lock();
        if inner.active.is_empty() {
            return None;
        }
        let mut best = 0;
        for index in 1..inner.active.len() {
            if (self.less)(&inner.active[index], &inner.active[best]) {
                best = index;
            }
        }
        Some(inner.active.swap_remove(best))
    }

    /// Wait until a task is ready and return it. Flushes due backoff
    /// entries while waiting.
    pub async fn pop(&self) -> QueuedTaskInfo {
        loop {
            self.flush_backoff(Instant::now());
            if let Some(info) = self.try_pop() {
                return info;
            }
            let _ = tokio::time::timeout(Duration::from_millis(20), self.notify.notified()).await;
        }
    }

    /// Move backoff entries whose deadline passed into the active queue.
    pub fn flush_backoff(&self, now: Instant) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut moved = false;
        let mut remaining = Vec::with_capacity(inner.backoff.len());
        for (until, info) in inner.backoff.drain(..) {
            if until <= now {
                inner.active.push(info);
                moved = true;
            } else {
                remaining.push((until, info));
            }
        }
        inner.backoff = remaining;
        drop(guard);
        if moved {
            self.notify.notify_waiters();
        }
    }

    /// Wake unschedulable tasks for which `should_wake` approves; they
    /// rejoin the active queue. Returns how many moved.
    pub fn move_on_event(&self, should_wake: impl Fn(&QueuedTaskInfo) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let woken: Vec<TaskId> = inner
            .unschedulable
            .values()
            .filter(|info| should_wake(info))
            .map(|info| info.task.uid.clone())
            .collect();
        for uid in &woken {
            if let Some(info) = inner.unschedulable.remove(uid) {
                debug!(task = %uid, "unschedulable task woken by cluster event");
                inner.active.push(info);
            }
        }
        let count = woken.len();
        drop(inner);
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    fn backoff_duration(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.saturating_sub(1).min(16);
        (self.initial_backoff * factor).min(self.max_backoff)
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn active_len(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn backoff_len(&self) -> usize {
        self.inner.lock().backoff.len()
    }

    pub fn unschedulable_len(&self) -> usize {
        self.inner.lock().unschedulable.len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.active.is_empty() && inner.backoff.is_empty() && inner.unschedulable.is_empty()
    }
}

impl TaskNominator for SchedulingQueue {
    fn nominated_tasks_for_node(&self, node: &str) -> Vec<Arc<Task>> {
        self.nominated
            .lock()
            .by_node
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    fn add_nominated_task(&self, task: Arc<Task>, node: &str) {
        let mut nominated = self.nominated.lock();
        // A task nominates at most one node; drop any older record.
        if let Some(previous) = nominated.by_task.remove(&task.uid) {
            if let Some(list) = nominated.by_node.get_mut(&previous) {
                list.retain(|t| t.uid != task.uid);
            }
        }
        nominated
            .by_node
            .entry(node.to_string())
            .or_default()
            .push(Arc::clone(&task));
        nominated.by_task.insert(task.uid.clone(), node.to_string());
    }

    fn delete_nominated_task(&self, task: &Task) {
        let mut nominated = self.nominated.lock();
        if let Some(node) = nominated.by_task.remove(&task.uid) {
            if let Some(list) = nominated.by_node.get_mut(&node) {
                list.retain(|t| t.uid != task.uid);
                if list.is_empty() {
                    nominated.by_node.remove(&node);
                }
            }
        }
    }
}
