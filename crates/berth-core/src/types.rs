//! Domain types for tasks, nodes, and their resources.
//!
//! These mirror the cluster API objects the scheduler consumes. They are
//! plain serializable data; derived scheduling state (aggregates, counts)
//! lives in `berth-cache`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::selector::LabelSelector;

/// Unique identifier for a task. Opaque; assigned by the cluster API.
pub type TaskId = String;

/// Unique name of a node in the cluster.
pub type NodeName = String;

// ── Resources ──────────────────────────────────────────────────────

/// Resource quantities by name.
///
/// CPU is tracked in millicores, memory in bytes. Extended resources
/// (accelerators, licenses, ...) are tracked as opaque integer counts
/// keyed by their resource name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    pub milli_cpu: i64,
    pub memory_bytes: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended: BTreeMap<String, i64>,
}

impl ResourceList {
    pub fn new(milli_cpu: i64, memory_bytes: i64) -> Self {
        Self {
            milli_cpu,
            memory_bytes,
            extended: BTreeMap::new(),
        }
    }

    /// Set an extended resource quantity.
    pub fn with_extended(mut self, name: &str, quantity: i64) -> Self {
        self.extended.insert(name.to_string(), quantity);
        self
    }

    /// Quantity of a resource by name. `cpu` and `memory` address the
    /// dedicated fields; anything else is looked up in `extended`.
    pub fn get(&self, name: &str) -> Option<i64> {
        match name {
            "cpu" => Some(self.milli_cpu),
            "memory" => Some(self.memory_bytes),
            other => self.extended.get(other).copied(),
        }
    }

    /// Add another resource list into this one.
    pub fn add(&mut self, other: &ResourceList) {
        self.milli_cpu += other.milli_cpu;
        self.memory_bytes += other.memory_bytes;
        for (name, quantity) in &other.extended {
            *self.extended.entry(name.clone()).or_insert(0) += quantity;
        }
    }

    /// Subtract another resource list from this one, saturating at zero.
    pub fn sub(&mut self, other: &ResourceList) {
        self.milli_cpu = (self.milli_cpu - other.milli_cpu).max(0);
        self.memory_bytes = (self.memory_bytes - other.memory_bytes).max(0);
        for (name, quantity) in &other.extended {
            let entry = self.extended.entry(name.clone()).or_insert(0);
            *entry = (*entry - quantity).max(0);
        }
    }

    pub fn is_zero(&self) -> bool {
        self.milli_cpu == 0 && self.memory_bytes == 0 && self.extended.values().all(|q| *q == 0)
    }
}

// ── Task ───────────────────────────────────────────────────────────

/// A unit of work awaiting placement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier; survives for the lifetime of the object but a
    /// delete + re-create of the "same" task yields a new one.
    pub uid: TaskId,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Which scheduler profile handles this task.
    pub scheduler_name: String,
    /// Node this task is bound to (or pre-assigned to), if any.
    pub node_name: Option<NodeName>,
    /// Node a prior scheduling attempt nominated for this task.
    pub nominated_node_name: Option<NodeName>,
    pub priority: i32,
    /// Per-container resource requests; the task's total request is the sum.
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub affinity: Option<TaskAffinity>,
    #[serde(default)]
    pub topology_spread: Vec<TopologySpreadTerm>,
    /// Names of volume claims the task mounts.
    #[serde(default)]
    pub volume_claims: Vec<String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// Hard node label requirements.
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    /// Set when the task has been marked for deletion (epoch seconds).
    pub deletion_timestamp: Option<u64>,
}

impl Task {
    /// Total resources requested across all containers.
    pub fn total_requests(&self) -> ResourceList {
        let mut total = ResourceList::default();
        for container in &self.containers {
            total.add(&container.requests);
        }
        total
    }

    /// All host ports the task claims.
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.containers.iter().flat_map(|c| c.host_ports.iter().copied())
    }

    /// Required affinity terms, empty when none are declared.
    pub fn affinity_terms(&self) -> &[AffinityTerm] {
        self.affinity.as_ref().map_or(&[], |a| a.affinity.as_slice())
    }

    /// Required anti-affinity terms, empty when none are declared.
    pub fn anti_affinity_terms(&self) -> &[AffinityTerm] {
        self.affinity
            .as_ref()
            .map_or(&[], |a| a.anti_affinity.as_slice())
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A sub-container of a task with its resource requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub host_ports: Vec<u16>,
}

// ── Affinity ───────────────────────────────────────────────────────

/// Required inter-task affinity and anti-affinity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskAffinity {
    #[serde(default)]
    pub affinity: Vec<AffinityTerm>,
    #[serde(default)]
    pub anti_affinity: Vec<AffinityTerm>,
}

/// One affinity/anti-affinity term.
///
/// A peer task matches the term when its labels satisfy `selector` and
/// its namespace is in scope. An empty `namespaces` list with no
/// `namespace_selector` scopes the term to the owning task's own
/// namespace; otherwise the two sources are unioned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AffinityTerm {
    pub selector: LabelSelector,
    #[serde(default)]
    pub namespaces: Vec<String>,
    pub namespace_selector: Option<LabelSelector>,
    /// Node label name that groups nodes into topology domains.
    pub topology_key: String,
}

/// Topology spreading constraint. Carried on the task; consumed by
/// spread-aware plugins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySpreadTerm {
    pub topology_key: String,
    pub max_skew: i32,
    pub selector: LabelSelector,
}

// ── Node ───────────────────────────────────────────────────────────

/// A machine that can host tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Raw machine capacity.
    pub capacity: ResourceList,
    /// Capacity minus system reservations; what the scheduler hands out.
    pub allocatable: ResourceList,
    /// Whether the node is reporting ready.
    #[serde(default)]
    pub ready: bool,
    /// Administratively cordoned off from new placements.
    #[serde(default)]
    pub unschedulable: bool,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ready: true,
            ..Self::default()
        }
    }

    pub fn with_labels(mut self, labels: &[(&str, &str)]) -> Self {
        for (k, v) in labels {
            self.labels.insert((*k).to_string(), (*v).to_string());
        }
        self
    }

    pub fn with_allocatable(mut self, resources: ResourceList) -> Self {
        self.capacity = resources.clone();
        self.allocatable = resources;
        self
    }
}

/// A taint repels tasks that do not tolerate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A toleration lets a task be placed despite a matching taint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    /// `None` tolerates the key under every effect.
    pub effect: Option<TaintEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TolerationOperator {
    Equal,
    Exists,
}

impl Toleration {
    /// Whether this toleration covers the given taint.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        // Empty key with Exists tolerates everything.
        if self.key.is_empty() {
            return self.operator == TolerationOperator::Exists;
        }
        if self.key != taint.key {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => self.value == taint.value,
        }
    }
}
