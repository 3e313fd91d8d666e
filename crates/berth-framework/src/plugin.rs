//! Extension-point plugin traits.
//!
//! A plugin is one object implementing any subset of the extension
//! points. The base `Plugin` trait exposes which points a concrete
//! plugin implements through capability accessors returning trait-object
//! references; the framework builds its per-point ordered lists from
//! those and never needs runtime downcasting.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use berth_cache::NodeInfo;
use berth_core::{ClusterEvent, Task};

use crate::cancel::CancelToken;
use crate::cycle_state::CycleState;
use crate::status::Status;

/// Lowest valid normalized node score.
pub const MIN_NODE_SCORE: i64 = 0;
/// Highest valid normalized node score.
pub const MAX_NODE_SCORE: i64 = 100;

/// Score of one node under one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeScore {
    pub name: String,
    pub score: i64,
}

pub type NodeScoreList = Vec<NodeScore>;

/// Per-plugin node scores, keyed by plugin name.
pub type PluginToNodeScores = HashMap<String, NodeScoreList>;

/// Filter outcomes per node name.
pub type NodeToStatusMap = HashMap<String, Status>;

/// Outcome of a PostFilter pass; opaque to the framework beyond the
/// nominated node it may carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostFilterResult {
    pub nominated_node_name: Option<String>,
}

/// A task queued for scheduling, with queue book-keeping.
#[derive(Debug, Clone)]
pub struct QueuedTaskInfo {
    pub task: Arc<Task>,
    /// When the task entered the queue (initially).
    pub enqueue_time: Instant,
    /// Scheduling attempts so far; drives backoff.
    pub attempts: u32,
    /// Plugins that reported the task unschedulable on the last attempt.
    pub unschedulable_plugins: HashSet<String>,
}

impl QueuedTaskInfo {
    pub fn new(task: Arc<Task>, now: Instant) -> Self {
        Self {
            task,
            enqueue_time: now,
            attempts: 0,
            unschedulable_plugins: HashSet::new(),
        }
    }
}

// ── Base trait ─────────────────────────────────────────────────────

/// Every plugin: a name plus capability accessors, one per extension
/// point, returning `Some` for the points the plugin implements.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn queue_sort(&self) -> Option<&dyn QueueSortPlugin> {
        None
    }
    fn pre_filter(&self) -> Option<&dyn PreFilterPlugin> {
        None
    }
    fn filter(&self) -> Option<&dyn FilterPlugin> {
        None
    }
    fn post_filter(&self) -> Option<&dyn PostFilterPlugin> {
        None
    }
    fn pre_score(&self) -> Option<&dyn PreScorePlugin> {
        None
    }
    fn score(&self) -> Option<&dyn ScorePlugin> {
        None
    }
    fn reserve(&self) -> Option<&dyn ReservePlugin> {
        None
    }
    fn permit(&self) -> Option<&dyn PermitPlugin> {
        None
    }
    fn pre_bind(&self) -> Option<&dyn PreBindPlugin> {
        None
    }
    fn bind(&self) -> Option<&dyn BindPlugin> {
        None
    }
    fn post_bind(&self) -> Option<&dyn PostBindPlugin> {
        None
    }

    /// Cluster events that may make a task this plugin rejected feasible
    /// again. An empty list subscribes the plugin to every event.
    fn events_to_register(&self) -> Vec<ClusterEvent> {
        Vec::new()
    }
}

// ── Extension points ───────────────────────────────────────────────

/// Orders the scheduling queue.
pub trait QueueSortPlugin: Send + Sync {
    /// Strict-weak "schedules before" relation.
    fn less(&self, a: &QueuedTaskInfo, b: &QueuedTaskInfo) -> bool;
}

/// Runs once per cycle before per-node filtering; may precompute state
/// into the cycle bag or veto the whole cycle.
pub trait PreFilterPlugin: Send + Sync {
    fn pre_filter(&self, ctx: &CancelToken, state: &CycleState, task: &Task) -> Status;

    /// Incremental what-if updates for the preemption path.
    fn pre_filter_extensions(&self) -> Option<&dyn PreFilterExtensions> {
        None
    }
}

/// Adjusts PreFilter-computed state for a hypothetical task addition or
/// removal on one node.
pub trait PreFilterExtensions: Send + Sync {
    fn add_task(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task_to_schedule: &Task,
        task_to_add: &Task,
        node_info: &NodeInfo,
    ) -> Status;

    fn remove_task(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task_to_schedule: &Task,
        task_to_remove: &Task,
        node_info: &NodeInfo,
    ) -> Status;
}

/// Decides whether a task can run on one node.
pub trait FilterPlugin: Send + Sync {
    fn filter(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node_info: &NodeInfo,
    ) -> Status;
}

/// Runs when no node passed filtering; may nominate a node for a future
/// cycle (preemption lives behind this interface).
pub trait PostFilterPlugin: Send + Sync {
    fn post_filter(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        filtered_statuses: &NodeToStatusMap,
    ) -> (Option<PostFilterResult>, Status);
}

/// Runs once per cycle before scoring.
pub trait PreScorePlugin: Send + Sync {
    fn pre_score(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        nodes: &[Arc<NodeInfo>],
    ) -> Status;
}

/// Ranks one feasible node.
pub trait ScorePlugin: Send + Sync {
    /// Raw score for the node; normalized afterwards when
    /// `score_extensions` is provided.
    fn score(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node_name: &str,
    ) -> (i64, Status);

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        None
    }
}

/// Rewrites a plugin's raw scores into `[MIN_NODE_SCORE, MAX_NODE_SCORE]`.
pub trait ScoreExtensions: Send + Sync {
    fn normalize_score(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        scores: &mut NodeScoreList,
    ) -> Status;
}

/// Reserves plugin-local resources for the chosen placement.
pub trait ReservePlugin: Send + Sync {
    fn reserve(&self, ctx: &CancelToken, state: &CycleState, task: &Task, node: &str) -> Status;

    /// Rolls back a reservation. Must be idempotent.
    fn unreserve(&self, ctx: &CancelToken, state: &CycleState, task: &Task, node: &str);
}

/// Last gate before binding; may delay the task.
pub trait PermitPlugin: Send + Sync {
    /// A `Wait` status must be accompanied by the maximum duration the
    /// plugin is willing to wait.
    fn permit(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node: &str,
    ) -> (Status, Duration);
}

pub trait PreBindPlugin: Send + Sync {
    fn pre_bind(&self, ctx: &CancelToken, state: &CycleState, task: &Task, node: &str) -> Status;
}

/// Performs the binding. `Skip` defers to the next bind plugin (or the
/// framework's default binder).
pub trait BindPlugin: Send + Sync {
    fn bind(&self, ctx: &CancelToken, state: &CycleState, task: &Task, node: &str) -> Status;
}

/// Informational hook after a successful bind; cannot fail the task.
pub trait PostBindPlugin: Send + Sync {
    fn post_bind(&self, ctx: &CancelToken, state: &CycleState, task: &Task, node: &str);
}
