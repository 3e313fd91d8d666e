//! Per-node scheduling state.
//!
//! A `NodeInfo` pairs a node with the tasks placed on it and the
//! aggregates the filter and score plugins read: requested resources,
//! claimed host ports, and the sublists of tasks whose own
//! affinity/anti-affinity rules matter for symmetric checks.

use std::collections::HashSet;
use std::sync::Arc;

use berth_core::{Node, NodeName, ResourceList, Task, TaskId};

/// A node plus the tasks placed on it and derived aggregates.
///
/// Owned by the cache; snapshots expose frozen clones. The generation
/// stamp is bumped by the cache on every mutation so snapshot refresh
/// can copy only what changed.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    /// The node object. Absent when task events arrived before the node
    /// itself (the cache keeps the placeholder until the node shows up).
    pub node: Option<Arc<Node>>,
    /// Tasks placed (or assumed) on this node.
    pub tasks: Vec<Arc<Task>>,
    /// Tasks declaring any affinity term; input to symmetric checks.
    pub tasks_with_affinity: Vec<Arc<Task>>,
    /// Tasks declaring any required anti-affinity term.
    pub tasks_with_required_anti_affinity: Vec<Arc<Task>>,
    /// Sum of resource requests of all tasks on the node.
    pub requested: ResourceList,
    /// Host ports claimed by tasks on the node.
    pub used_ports: HashSet<u16>,
    /// Mutation stamp assigned by the cache.
    pub generation: u64,
}

impl NodeInfo {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node: Some(node),
            ..Self::default()
        }
    }

    /// The node's name. Placeholders without a node have no name; callers
    /// reach them only through the cache's keyed map.
    pub fn node_name(&self) -> Option<&NodeName> {
        self.node.as_ref().map(|n| &n.name)
    }

    pub fn set_node(&mut self, node: Arc<Node>) {
        self.node = Some(node);
    }

    /// Place a task on this node, updating aggregates.
    pub fn add_task(&mut self, task: Arc<Task>) {
        self.requested.add(&task.total_requests());
        self.used_ports.extend(task.host_ports());
        if !task.affinity_terms().is_empty() || !task.anti_affinity_terms().is_empty() {
            self.tasks_with_affinity.push(Arc::clone(&task));
        }
        if !task.anti_affinity_terms().is_empty() {
            self.tasks_with_required_anti_affinity.push(Arc::clone(&task));
        }
        self.tasks.push(task);
    }

    /// Remove a task by uid, restoring aggregates. Returns false when the
    /// task was not on this node.
    pub fn remove_task(&mut self, uid: &TaskId) -> bool {
        let Some(index) = self.tasks.iter().position(|t| &t.uid == uid) else {
            return false;
        };
        let removed = self.tasks.swap_remove(index);

        self.tasks_with_affinity.retain(|t| &t.uid != uid);
        self.tasks_with_required_anti_affinity.retain(|t| &t.uid != uid);
        self.requested.sub(&removed.total_requests());

        // Rebuild the port set: another task may claim the same port.
        self.used_ports.clear();
        for task in &self.tasks {
            self.used_ports.extend(task.host_ports());
        }
        true
    }

    pub fn has_task(&self, uid: &TaskId) -> bool {
        self.tasks.iter().any(|t| &t.uid == uid)
    }

    /// Whether any hosted task declares affinity or anti-affinity.
    pub fn has_tasks_with_affinity(&self) -> bool {
        !self.tasks_with_affinity.is_empty()
    }

    pub fn has_tasks_with_required_anti_affinity(&self) -> bool {
        !self.tasks_with_required_anti_affinity.is_empty()
    }
}
