//! Cycle-local immutable view of the cache.

use std::collections::HashMap;
use std::sync::Arc;

use berth_core::NodeName;

use crate::node_info::NodeInfo;

/// A frozen view of the cache for one scheduling cycle.
///
/// The `Arc<NodeInfo>`s are never mutated after the refresh that created
/// them; cache mutations after a refresh produce new copies on the next
/// refresh instead.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    node_infos: HashMap<NodeName, Arc<NodeInfo>>,
    /// All nodes, in cache iteration order at refresh time.
    node_list: Vec<Arc<NodeInfo>>,
    /// Only nodes hosting at least one task with any affinity term.
    have_tasks_with_affinity: Vec<Arc<NodeInfo>>,
    /// Only nodes hosting at least one task with required anti-affinity.
    have_tasks_with_required_anti_affinity: Vec<Arc<NodeInfo>>,
    /// Cache generation this snapshot reflects.
    generation: u64,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// All nodes in the snapshot.
    pub fn list(&self) -> &[Arc<NodeInfo>] {
        &self.node_list
    }

    /// Fast path for symmetric affinity checks: nodes whose hosted tasks
    /// declare affinity/anti-affinity rules of their own.
    pub fn have_tasks_with_affinity(&self) -> &[Arc<NodeInfo>] {
        &self.have_tasks_with_affinity
    }

    pub fn have_tasks_with_required_anti_affinity(&self) -> &[Arc<NodeInfo>] {
        &self.have_tasks_with_required_anti_affinity
    }

    pub fn get(&self, name: &str) -> Option<&Arc<NodeInfo>> {
        self.node_infos.get(name)
    }

    pub fn num_nodes(&self) -> usize {
        self.node_list.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    // Cache-internal: the refresh path replaces contents wholesale.

    pub(crate) fn insert(&mut self, name: NodeName, info: Arc<NodeInfo>) {
        self.node_infos.insert(name, info);
    }

    pub(crate) fn remove(&mut self, name: &str) {
        self.node_infos.remove(name);
    }

    pub(crate) fn retain_nodes(&mut self, keep: impl Fn(&str) -> bool) {
        self.node_infos.retain(|name, _| keep(name));
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub(crate) fn rebuild_lists(&mut self, order: &[NodeName]) {
        self.node_list.clear();
        self.have_tasks_with_affinity.clear();
        self.have_tasks_with_required_anti_affinity.clear();

        for name in order {
            let Some(info) = self.node_infos.get(name) else {
                continue;
            };
            self.node_list.push(Arc::clone(info));
            if info.has_tasks_with_affinity() {
                self.have_tasks_with_affinity.push(Arc::clone(info));
            }
            if info.has_tasks_with_required_anti_affinity() {
                self.have_tasks_with_required_anti_affinity.push(Arc::clone(info));
            }
        }
    }
}
