//! The scheduling cache.
//!
//! Authoritative in-memory store of nodes and placed tasks. The scheduling
//! loop assumes tasks here optimistically while binding is in flight; event
//! handlers apply the cluster's own view as it arrives. An assumed task
//! counts toward node aggregates exactly like a bound one.
//!
//! All mutations serialize under one coarse lock. Snapshot refresh holds
//! the lock only long enough to copy NodeInfos whose generation advanced
//! past the snapshot's.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use berth_core::{Node, NodeName, Task, TaskId};

use crate::error::{CacheError, CacheResult};
use crate::node_info::NodeInfo;
use crate::snapshot::Snapshot;

/// Book-keeping for one task known to the cache.
#[derive(Debug, Clone)]
struct TaskEntry {
    task: Arc<Task>,
    /// Set once `finish_binding` confirmed the bind RPC succeeded.
    binding_finished: bool,
    /// Eviction deadline for assumed-but-unconfirmed tasks.
    deadline: Option<Instant>,
}

#[derive(Default)]
struct CacheInner {
    nodes: HashMap<NodeName, NodeInfo>,
    /// Insertion order of nodes; keeps snapshot listing stable so the
    /// scheduler's round-robin cursor is meaningful across cycles.
    node_order: Vec<NodeName>,
    tasks: HashMap<TaskId, TaskEntry>,
    assumed: HashSet<TaskId>,
    /// Monotonic mutation counter; stamped onto NodeInfos.
    generation: u64,
}

impl CacheInner {
    fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// NodeInfo for `name`, creating a placeholder when tasks arrive
    /// before their node.
    fn node_info_mut(&mut self, name: &str) -> &mut NodeInfo {
        if !self.nodes.contains_key(name) {
            self.node_order.push(name.to_string());
        }
        self.nodes.entry(name.to_string()).or_default()
    }

    fn place_task(&mut self, task: Arc<Task>) {
        let Some(node_name) = task.node_name.clone() else {
            return;
        };
        let generation = self.bump();
        let info = self.node_info_mut(&node_name);
        info.add_task(task);
        info.generation = generation;
    }

    fn unplace_task(&mut self, task: &Task) {
        let Some(node_name) = task.node_name.clone() else {
            return;
        };
        let generation = self.bump();
        if let Some(info) = self.nodes.get_mut(&node_name) {
            info.remove_task(&task.uid);
            info.generation = generation;
            // Drop placeholders once their last task is gone.
            if info.node.is_none() && info.tasks.is_empty() {
                self.nodes.remove(&node_name);
                self.node_order.retain(|n| n != &node_name);
            }
        }
    }
}

/// The scheduling cache. See the module docs for the model.
pub struct Cache {
    inner: Mutex<CacheInner>,
    /// How long an assumed task may wait for binding confirmation.
    assume_ttl: Duration,
}

impl Cache {
    /// Create a cache. `assume_ttl` bounds how long an assumed task may
    /// sit without `finish_binding` before the sweep evicts it; every
    /// caller passes it explicitly.
    pub fn new(assume_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            assume_ttl,
        }
    }

    // ── Node mutations ─────────────────────────────────────────────

    pub fn add_node(&self, node: Node) {
        let mut inner = self.inner.lock();
        let generation = inner.bump();
        let info = inner.node_info_mut(&node.name);
        info.set_node(Arc::new(node));
        info.generation = generation;
    }

    pub fn update_node(&self, node: Node) {
        // Same shape as add: the newest object wins.
        self.add_node(node);
    }

    pub fn remove_node(&self, name: &str) {
        let mut inner = self.inner.lock();
        let generation = inner.bump();
        let drop_entirely = match inner.nodes.get_mut(name) {
            Some(info) if info.tasks.is_empty() => true,
            Some(info) => {
                // Tasks still reference the node; keep the placeholder
                // until their removal events drain.
                info.node = None;
                info.generation = generation;
                false
            }
            None => {
                warn!(node = %name, "remove of unknown node ignored");
                false
            }
        };
        if drop_entirely {
            inner.nodes.remove(name);
            inner.node_order.retain(|n| n != name);
        }
    }

    // ── Task mutations (event handlers) ────────────────────────────

    /// Record a task the cluster reports as placed.
    ///
    /// Confirms a matching assumed task; if the assumed placement
    /// disagrees with the reported one, the cache follows the cluster.
    pub fn add_task(&self, task: Arc<Task>) -> CacheResult<()> {
        let uid = task.uid.clone();
        let mut inner = self.inner.lock();

        if inner.assumed.contains(&uid) {
            let assumed_node = inner
                .tasks
                .get(&uid)
                .and_then(|e| e.task.node_name.clone());
            if assumed_node != task.node_name {
                warn!(
                    task = %uid,
                    assumed = ?assumed_node,
                    actual = ?task.node_name,
                    "assumed task appeared on a different node"
                );
                let stale = inner.tasks.get(&uid).map(|e| Arc::clone(&e.task));
                if let Some(stale) = stale {
                    inner.unplace_task(&stale);
                }
                inner.place_task(Arc::clone(&task));
            }
            inner.assumed.remove(&uid);
            inner.tasks.insert(
                uid,
                TaskEntry {
                    task,
                    binding_finished: true,
                    deadline: None,
                },
            );
            return Ok(());
        }

        if inner.tasks.contains_key(&uid) {
            return Err(CacheError::AlreadyAdded(uid));
        }

        if task.node_name.is_some() {
            inner.place_task(Arc::clone(&task));
        }
        inner.tasks.insert(
            uid,
            TaskEntry {
                task,
                binding_finished: true,
                deadline: None,
            },
        );
        Ok(())
    }

    /// Apply a task update. Identity is preserved across re-creates: the
    /// old record (by its uid) is removed and the new copy stored, so a
    /// later `get_task` sees the newest object even when the uid changed.
    pub fn update_task(&self, old: &Task, new: Arc<Task>) -> CacheResult<()> {
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.tasks.remove(&old.uid) {
                inner.assumed.remove(&old.uid);
                let stored = Arc::clone(&entry.task);
                inner.unplace_task(&stored);
            } else {
                warn!(task = %old.uid, "update for unknown task treated as add");
            }
        }
        self.add_task(new)
    }

    /// Remove a task. A removal whose add was never observed is a no-op;
    /// this absorbs out-of-order event delivery.
    pub fn remove_task(&self, task: &Task) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.tasks.remove(&task.uid) else {
            debug!(task = %task.uid, "remove of unknown task ignored");
            return;
        };
        inner.assumed.remove(&task.uid);
        let stored = Arc::clone(&entry.task);
        inner.unplace_task(&stored);
    }

    pub fn get_task(&self, uid: &str) -> Option<Arc<Task>> {
        self.inner.lock().tasks.get(uid).map(|e| Arc::clone(&e.task))
    }

    // ── Assume / forget / confirm ──────────────────────────────────

    /// Optimistically place a task before its binding completes. The task
    /// must carry the chosen node in `node_name`. The TTL clock starts
    /// now and is cancelled by `finish_binding`.
    pub fn assume(&self, task: Arc<Task>) -> CacheResult<()> {
        let uid = task.uid.clone();
        let mut inner = self.inner.lock();
        if inner.tasks.contains_key(&uid) {
            return Err(CacheError::AlreadyAssumed(uid));
        }

        inner.place_task(Arc::clone(&task));
        inner.assumed.insert(uid.clone());
        let deadline = Instant::now() + self.assume_ttl;
        inner.tasks.insert(
            uid,
            TaskEntry {
                task,
                binding_finished: false,
                deadline: Some(deadline),
            },
        );
        Ok(())
    }

    /// Confirm an assumed task's binding; the eviction TTL is cancelled.
    pub fn finish_binding(&self, uid: &str) -> CacheResult<()> {
        let mut inner = self.inner.lock();
        if !inner.assumed.contains(uid) {
            return Err(CacheError::NotFound(uid.to_string()));
        }
        let Some(entry) = inner.tasks.get_mut(uid) else {
            return Err(CacheError::NotFound(uid.to_string()));
        };
        entry.binding_finished = true;
        entry.deadline = None;
        debug!(task = %uid, "binding confirmed");
        Ok(())
    }

    /// Roll back an assumed, not-yet-confirmed task.
    pub fn forget(&self, task: &Task) -> CacheResult<()> {
        let mut inner = self.inner.lock();
        if !inner.assumed.contains(&task.uid) {
            return Err(CacheError::NotFound(task.uid.clone()));
        }
        let Some(entry) = inner.tasks.get(&task.uid) else {
            return Err(CacheError::NotFound(task.uid.clone()));
        };
        if entry.binding_finished {
            return Err(CacheError::BindInProgress(task.uid.clone()));
        }
        let stored = Arc::clone(&entry.task);
        inner.tasks.remove(&task.uid);
        inner.assumed.remove(&task.uid);
        inner.unplace_task(&stored);
        Ok(())
    }

    pub fn is_assumed(&self, uid: &str) -> bool {
        self.inner.lock().assumed.contains(uid)
    }

    // ── TTL sweep ──────────────────────────────────────────────────

    /// Evict assumed tasks whose TTL passed without binding confirmation.
    /// Returns the evicted uids.
    pub fn cleanup_expired(&self, now: Instant) -> Vec<TaskId> {
        let mut inner = self.inner.lock();
        let expired: Vec<TaskId> = inner
            .assumed
            .iter()
            .filter(|uid| {
                inner
                    .tasks
                    .get(*uid)
                    .is_some_and(|e| !e.binding_finished && e.deadline.is_some_and(|d| d <= now))
            })
            .cloned()
            .collect();

        for uid in &expired {
            warn!(task = %uid, "assumed task expired without binding confirmation");
            if let Some(entry) = inner.tasks.remove(uid) {
                let stored = Arc::clone(&entry.task);
                inner.unplace_task(&stored);
            }
            inner.assumed.remove(uid);
        }
        expired
    }

    /// Run the TTL sweep on a background ticker until the returned handle
    /// is aborted.
    pub fn spawn_ttl_sweep(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                cache.cleanup_expired(Instant::now());
            }
        })
    }

    // ── Snapshot ───────────────────────────────────────────────────

    /// Refresh `snapshot` to reflect every mutation applied so far.
    ///
    /// Only NodeInfos whose generation advanced past the snapshot's are
    /// copied; unchanged nodes keep their existing frozen `Arc`s.
    pub fn update_snapshot(&self, snapshot: &mut Snapshot) {
        let inner = self.inner.lock();

        let since = snapshot.generation();
        for (name, info) in &inner.nodes {
            if info.node.is_none() {
                // Placeholder: tasks outlived their node. Not schedulable.
                snapshot.remove(name);
                continue;
            }
            if info.generation > since {
                snapshot.insert(name.clone(), Arc::new(info.clone()));
            }
        }
        snapshot.retain_nodes(|name| {
            inner
                .nodes
                .get(name)
                .is_some_and(|info| info.node.is_some())
        });
        snapshot.rebuild_lists(&inner.node_order);
        snapshot.set_generation(inner.generation);
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn assumed_count(&self) -> usize {
        self.inner.lock().assumed.len()
    }
}
