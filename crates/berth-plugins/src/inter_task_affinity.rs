//! Required inter-task affinity and anti-affinity.
//!
//! PreFilter walks the snapshot once and builds three topology count
//! maps in the cycle state:
//!
//! - per required affinity term of the incoming task: matching existing
//!   tasks per `(topology key, topology value)`
//! - merged counts for the incoming task's anti-affinity terms
//! - the symmetric map: existing tasks whose own anti-affinity terms
//!   match the incoming task, counted at their host's topology value
//!
//! Filter then decides each node from the maps alone. The add/remove
//! extensions keep the maps consistent under the preemption path's
//! what-if placements.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use berth_cache::NodeInfo;
use berth_core::{AffinityTerm, Node, Task};
use berth_framework::{
    CancelToken, CycleState, FilterPlugin, Handle, Plugin, PreFilterExtensions, PreFilterPlugin,
    StateData, Status,
};

pub const NAME: &str = "InterTaskAffinity";

pub const ERR_REASON_AFFINITY_RULES_NOT_MATCH: &str =
    "node didn't match the task's affinity rules";
pub const ERR_REASON_ANTI_AFFINITY_RULES_NOT_MATCH: &str =
    "node didn't satisfy the task's anti-affinity rules";
pub const ERR_REASON_EXISTING_ANTI_AFFINITY_RULES_NOT_MATCH: &str =
    "node didn't satisfy existing tasks' anti-affinity rules";

const PRE_FILTER_STATE_KEY: &str = "PreFilterInterTaskAffinity";

/// `(topology key, topology value)` → matching task count.
type TopologyCounts = HashMap<(String, String), i64>;

#[derive(Debug, Default, Clone)]
struct PreFilterState {
    /// One map per required affinity term of the incoming task. An empty
    /// map means no task anywhere matches that term.
    affinity_counts: Vec<TopologyCounts>,
    /// Merged counts for the incoming task's anti-affinity terms.
    anti_affinity_counts: TopologyCounts,
    /// Symmetric check: existing tasks whose anti-affinity matches the
    /// incoming task, counted at their host node's topology values.
    existing_anti_affinity_counts: TopologyCounts,
}

/// Cycle-state wrapper. The interior lock allows the add/remove
/// extensions to adjust the maps after PreFilter while parallel filter
/// readers stay safe.
pub struct AffinityState {
    inner: RwLock<PreFilterState>,
}

impl StateData for AffinityState {
    fn clone_data(&self) -> Arc<dyn StateData> {
        Arc::new(AffinityState {
            inner: RwLock::new(self.inner.read().clone()),
        })
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

pub struct InterTaskAffinity {
    handle: Handle,
}

pub fn factory(_args: &serde_json::Value, handle: &Handle) -> anyhow::Result<Arc<dyn Plugin>> {
    Ok(Arc::new(InterTaskAffinity {
        handle: handle.clone(),
    }))
}

impl InterTaskAffinity {
    /// Whether `candidate` matches `term` declared by `owner`: labels
    /// satisfy the selector and the candidate's namespace is in scope.
    /// The term's namespace list and namespace selector are unioned; both
    /// empty scopes the term to the owner's own namespace.
    fn term_matches(&self, term: &AffinityTerm, owner: &Task, candidate: &Task) -> bool {
        let in_listed = if term.namespaces.is_empty() && term.namespace_selector.is_none() {
            candidate.namespace == owner.namespace
        } else {
            term.namespaces.contains(&candidate.namespace)
        };
        let in_selected = !in_listed
            && term.namespace_selector.as_ref().is_some_and(|selector| {
                self.handle
                    .listers
                    .namespace_labels(&candidate.namespace)
                    .is_some_and(|labels| selector.matches(&labels))
            });
        if !(in_listed || in_selected) {
            return false;
        }
        term.selector.matches(&candidate.labels)
    }

    /// Adjust all three maps for one task appearing (+1) or disappearing
    /// (-1) on `node`.
    fn apply_delta(
        &self,
        counts: &mut PreFilterState,
        incoming: &Task,
        other: &Task,
        node: &Node,
        delta: i64,
    ) {
        for (index, term) in incoming.affinity_terms().iter().enumerate() {
            if self.term_matches(term, incoming, other) {
                if let Some(value) = node.labels.get(&term.topology_key) {
                    bump(
                        &mut counts.affinity_counts[index],
                        &term.topology_key,
                        value,
                        delta,
                    );
                }
            }
        }
        for term in incoming.anti_affinity_terms() {
            if self.term_matches(term, incoming, other) {
                if let Some(value) = node.labels.get(&term.topology_key) {
                    bump(
                        &mut counts.anti_affinity_counts,
                        &term.topology_key,
                        value,
                        delta,
                    );
                }
            }
        }
        for term in other.anti_affinity_terms() {
            if self.term_matches(term, other, incoming) {
                if let Some(value) = node.labels.get(&term.topology_key) {
                    bump(
                        &mut counts.existing_anti_affinity_counts,
                        &term.topology_key,
                        value,
                        delta,
                    );
                }
            }
        }
    }

    fn state_of(&self, state: &CycleState) -> Result<Arc<AffinityState>, Status> {
        state
            .read::<AffinityState>(PRE_FILTER_STATE_KEY)
            .ok_or_else(|| Status::error("inter-task affinity prefilter state missing"))
    }
}

fn bump(counts: &mut TopologyCounts, key: &str, value: &str, delta: i64) {
    let entry = counts
        .entry((key.to_string(), value.to_string()))
        .or_insert(0);
    *entry += delta;
    if *entry <= 0 {
        counts.remove(&(key.to_string(), value.to_string()));
    }
}

impl Plugin for InterTaskAffinity {
    fn name(&self) -> &str {
        NAME
    }

    fn pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        Some(self)
    }

    fn filter(&self) -> Option<&dyn FilterPlugin> {
        Some(self)
    }

    fn events_to_register(&self) -> Vec<berth_core::ClusterEvent> {
        use berth_core::{ActionType, ClusterEvent, EventResource};
        // Placements changing or nodes appearing can flip any verdict.
        vec![
            ClusterEvent::new(EventResource::Task, ActionType::All),
            ClusterEvent::new(EventResource::Node, ActionType::Add),
        ]
    }
}

impl PreFilterPlugin for InterTaskAffinity {
    fn pre_filter(&self, _ctx: &CancelToken, state: &CycleState, task: &Task) -> Status {
        let snapshot = self.handle.snapshot.get();

        let mut counts = PreFilterState {
            affinity_counts: vec![TopologyCounts::new(); task.affinity_terms().len()],
            ..PreFilterState::default()
        };

        // Symmetric pass: only nodes hosting tasks with required
        // anti-affinity can contribute.
        for info in snapshot.have_tasks_with_required_anti_affinity() {
            let Some(node) = info.node.as_ref() else {
                continue;
            };
            for existing in &info.tasks_with_required_anti_affinity {
                for term in existing.anti_affinity_terms() {
                    if self.term_matches(term, existing, task) {
                        if let Some(value) = node.labels.get(&term.topology_key) {
                            bump(
                                &mut counts.existing_anti_affinity_counts,
                                &term.topology_key,
                                value,
                                1,
                            );
                        }
                    }
                }
            }
        }

        // Incoming task's own terms against every placed task.
        if !task.affinity_terms().is_empty() || !task.anti_affinity_terms().is_empty() {
            for info in snapshot.list() {
                let Some(node) = info.node.as_ref() else {
                    continue;
                };
                for existing in &info.tasks {
                    for (index, term) in task.affinity_terms().iter().enumerate() {
                        if self.term_matches(term, task, existing) {
                            if let Some(value) = node.labels.get(&term.topology_key) {
                                bump(
                                    &mut counts.affinity_counts[index],
                                    &term.topology_key,
                                    value,
                                    1,
                                );
                            }
                        }
                    }
                    for term in task.anti_affinity_terms() {
                        if self.term_matches(term, task, existing) {
                            if let Some(value) = node.labels.get(&term.topology_key) {
                                bump(
                                    &mut counts.anti_affinity_counts,
                                    &term.topology_key,
                                    value,
                                    1,
                                );
                            }
                        }
                    }
                }
            }
        }

        state.write(
            PRE_FILTER_STATE_KEY,
            Arc::new(AffinityState {
                inner: RwLock::new(counts),
            }),
        );
        Status::success()
    }

    fn pre_filter_extensions(&self) -> Option<&dyn PreFilterExtensions> {
        Some(self)
    }
}

impl PreFilterExtensions for InterTaskAffinity {
    fn add_task(
        &self,
        _ctx: &CancelToken,
        state: &CycleState,
        task_to_schedule: &Task,
        task_to_add: &Task,
        node_info: &NodeInfo,
    ) -> Status {
        let affinity_state = match self.state_of(state) {
            Ok(s) => s,
            Err(status) => return status,
        };
        let Some(node) = node_info.node.as_ref() else {
            return Status::error("node info carries no node");
        };
        self.apply_delta(
            &mut affinity_state.inner.write(),
            task_to_schedule,
            task_to_add,
            node,
            1,
        );
        Status::success()
    }

    fn remove_task(
        &self,
        _ctx: &CancelToken,
        state: &CycleState,
        task_to_schedule: &Task,
        task_to_remove: &Task,
        node_info: &NodeInfo,
    ) -> Status {
        let affinity_state = match self.state_of(state) {
            Ok(s) => s,
            Err(status) => return status,
        };
        let Some(node) = node_info.node.as_ref() else {
            return Status::error("node info carries no node");
        };
        self.apply_delta(
            &mut affinity_state.inner.write(),
            task_to_schedule,
            task_to_remove,
            node,
            -1,
        );
        Status::success()
    }
}

impl FilterPlugin for InterTaskAffinity {
    fn filter(
        &self,
        _ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node_info: &NodeInfo,
    ) -> Status {
        let Some(node) = node_info.node.as_ref() else {
            return Status::error("node info carries no node");
        };
        let affinity_state = match self.state_of(state) {
            Ok(s) => s,
            Err(status) => return status,
        };
        let counts = affinity_state.inner.read();

        // Affinity: every term needs the topology key on the node and a
        // positive count at the node's topology value. A term nothing in
        // the cluster matches is satisfied by any node carrying the key.
        for (index, term) in task.affinity_terms().iter().enumerate() {
            let Some(value) = node.labels.get(&term.topology_key) else {
                return Status::unschedulable_and_unresolvable(ERR_REASON_AFFINITY_RULES_NOT_MATCH);
            };
            let term_counts = &counts.affinity_counts[index];
            let matched = term_counts
                .get(&(term.topology_key.clone(), value.clone()))
                .copied()
                .unwrap_or(0)
                > 0;
            if !matched && !term_counts.is_empty() {
                return Status::unschedulable_and_unresolvable(ERR_REASON_AFFINITY_RULES_NOT_MATCH);
            }
        }

        // Anti-affinity of the incoming task: zero matches required.
        for term in task.anti_affinity_terms() {
            if let Some(value) = node.labels.get(&term.topology_key) {
                let count = counts
                    .anti_affinity_counts
                    .get(&(term.topology_key.clone(), value.clone()))
                    .copied()
                    .unwrap_or(0);
                if count > 0 {
                    return Status::unschedulable(ERR_REASON_ANTI_AFFINITY_RULES_NOT_MATCH);
                }
            }
        }

        // Symmetric: no existing task's anti-affinity may hit this node's
        // topology values.
        let violates_existing = counts
            .existing_anti_affinity_counts
            .iter()
            .any(|((key, value), count)| {
                *count > 0 && node.labels.get(key) == Some(value)
            });
        if violates_existing {
            return Status::unschedulable(ERR_REASON_EXISTING_ANTI_AFFINITY_RULES_NOT_MATCH);
        }

        Status::success()
    }
}
