//! The framework runtime: one instance per scheduling profile.
//!
//! Construction expands the profile's plugin selections (including the
//! synthetic MultiPoint set) into ordered per-point lists of plugin
//! instances, then enforces the per-point invocation policies at run
//! time: serial short-circuiting phases, bounded parallel fan-out for
//! Score, reverse-order Unreserve unwinding, Permit waiting, and the
//! default-binder fallback when every bind plugin skips.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use berth_cache::NodeInfo;
use berth_core::{ClusterEvent, Task};

use crate::cancel::CancelToken;
use crate::config::{ExtensionPoint, PluginSpec, Plugins, SchedulerProfile};
use crate::cycle_state::CycleState;
use crate::error::{FrameworkError, FrameworkResult};
use crate::handle::Handle;
use crate::parallelize::{parallelize, DEFAULT_PARALLELISM};
use crate::plugin::{
    NodeScore, NodeToStatusMap, Plugin, PluginToNodeScores, PostFilterResult, QueuedTaskInfo,
    MAX_NODE_SCORE, MIN_NODE_SCORE,
};
use crate::registry::Registry;
use crate::status::{Code, Status};
use crate::waiting::WaitingTasks;

/// Largest accepted score-plugin weight.
pub const MAX_PLUGIN_WEIGHT: i32 = 100;

/// Knobs fixed at framework construction.
#[derive(Debug, Clone)]
pub struct FrameworkOptions {
    /// Keep running a node's remaining filter plugins after the first
    /// failure and merge every reason into the node's status.
    pub run_all_filters: bool,
    /// Fan-out width for parallel phases.
    pub parallelism: usize,
}

impl Default for FrameworkOptions {
    fn default() -> Self {
        Self {
            run_all_filters: false,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

struct ScoredPlugin {
    plugin: Arc<dyn Plugin>,
    weight: i32,
}

/// The per-profile plugin host.
pub struct Framework {
    profile_name: String,
    percentage_of_nodes_to_score: i32,
    handle: Handle,
    run_all_filters: bool,
    parallelism: usize,

    queue_sort: Arc<dyn Plugin>,
    pre_filter: Vec<Arc<dyn Plugin>>,
    filter: Vec<Arc<dyn Plugin>>,
    post_filter: Vec<Arc<dyn Plugin>>,
    pre_score: Vec<Arc<dyn Plugin>>,
    score: Vec<ScoredPlugin>,
    reserve: Vec<Arc<dyn Plugin>>,
    permit: Vec<Arc<dyn Plugin>>,
    pre_bind: Vec<Arc<dyn Plugin>>,
    bind: Vec<Arc<dyn Plugin>>,
    post_bind: Vec<Arc<dyn Plugin>>,

    waiting_tasks: Arc<WaitingTasks>,
    /// Registered wake-up event → plugin names.
    event_map: BTreeMap<ClusterEvent, BTreeSet<String>>,
    /// The effective enabled configuration after MultiPoint expansion.
    enabled_config: Plugins,
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("profile_name", &self.profile_name)
            .finish_non_exhaustive()
    }
}

impl Framework {
    pub fn new(
        registry: &Registry,
        profile: &SchedulerProfile,
        handle: Handle,
        options: FrameworkOptions,
    ) -> FrameworkResult<Self> {
        if !(0..=100).contains(&profile.percentage_of_nodes_to_score) {
            return Err(FrameworkError::InvalidPercentage(
                profile.percentage_of_nodes_to_score,
            ));
        }

        // Per-plugin args; a name appearing twice is a construction error.
        let mut args_by_name: HashMap<String, serde_json::Value> = HashMap::new();
        for config in &profile.plugin_config {
            if args_by_name
                .insert(config.name.clone(), config.args.clone())
                .is_some()
            {
                return Err(FrameworkError::DuplicatePluginConfig(config.name.clone()));
            }
        }

        // Instantiate every plugin the profile references, once.
        let mut instances: HashMap<String, Arc<dyn Plugin>> = HashMap::new();
        let mut instantiate = |name: &str| -> FrameworkResult<()> {
            if instances.contains_key(name) {
                return Ok(());
            }
            let factory = registry
                .factory(name)
                .ok_or_else(|| FrameworkError::UnknownPlugin(name.to_string()))?;
            let args = args_by_name
                .get(name)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let plugin =
                factory(&args, &handle).map_err(|source| FrameworkError::FactoryFailed {
                    plugin: name.to_string(),
                    source,
                })?;
            instances.insert(name.to_string(), plugin);
            Ok(())
        };
        for point in ExtensionPoint::ALL {
            for spec in &profile.plugins.for_point(point).enabled {
                instantiate(&spec.name)?;
            }
        }
        for spec in &profile.plugins.multi_point.enabled {
            instantiate(&spec.name)?;
        }

        // Explicit per-point enablements come first and are validated.
        let mut enabled: HashMap<ExtensionPoint, Vec<PluginSpec>> = HashMap::new();
        for point in ExtensionPoint::ALL {
            let mut list: Vec<PluginSpec> = Vec::new();
            for spec in &profile.plugins.for_point(point).enabled {
                if list.iter().any(|s| s.name == spec.name) {
                    return Err(FrameworkError::AlreadyRegistered(spec.name.clone()));
                }
                let plugin = &instances[&spec.name];
                if !implements(plugin.as_ref(), point) {
                    return Err(FrameworkError::DoesNotImplement {
                        plugin: spec.name.clone(),
                        point: point.name(),
                    });
                }
                list.push(spec.clone());
            }
            enabled.insert(point, list);
        }

        // MultiPoint expansion: enable at every implemented point, unless
        // that point disables the plugin or enables it explicitly (the
        // explicit entry keeps its position and weight).
        let mut multi_point_seen: HashSet<String> = HashSet::new();
        for spec in &profile.plugins.multi_point.enabled {
            if !multi_point_seen.insert(spec.name.clone()) {
                return Err(FrameworkError::AlreadyRegistered(spec.name.clone()));
            }
            let plugin = &instances[&spec.name];
            for point in ExtensionPoint::ALL {
                if !implements(plugin.as_ref(), point) {
                    continue;
                }
                if profile.plugins.for_point(point).disables(&spec.name) {
                    continue;
                }
                let list = enabled.entry(point).or_default();
                if list.iter().any(|s| s.name == spec.name) {
                    continue;
                }
                let weight = if point == ExtensionPoint::Score {
                    spec.weight
                } else {
                    0
                };
                list.push(PluginSpec {
                    name: spec.name.clone(),
                    weight,
                });
            }
        }

        // Score weights: validate range, default unset to 1.
        for spec in enabled.entry(ExtensionPoint::Score).or_default() {
            if spec.weight < 0 || spec.weight > MAX_PLUGIN_WEIGHT {
                return Err(FrameworkError::InvalidWeight {
                    plugin: spec.name.clone(),
                    weight: spec.weight,
                    max: MAX_PLUGIN_WEIGHT,
                });
            }
            if spec.weight == 0 {
                spec.weight = 1;
            }
        }

        let list_for = |point: ExtensionPoint| -> Vec<Arc<dyn Plugin>> {
            enabled[&point]
                .iter()
                .map(|spec| Arc::clone(&instances[&spec.name]))
                .collect()
        };

        let queue_sort_list = list_for(ExtensionPoint::QueueSort);
        if queue_sort_list.len() != 1 {
            return Err(FrameworkError::QueueSortCount(queue_sort_list.len()));
        }
        let bind_list = list_for(ExtensionPoint::Bind);
        if bind_list.is_empty() {
            return Err(FrameworkError::NoBindPlugin);
        }

        let score = enabled[&ExtensionPoint::Score]
            .iter()
            .map(|spec| ScoredPlugin {
                plugin: Arc::clone(&instances[&spec.name]),
                weight: spec.weight,
            })
            .collect();

        // Wake-up map: a plugin registering no events (the queue-sort and
        // bind plugins among them) re-enqueues on every event.
        let mut event_map: BTreeMap<ClusterEvent, BTreeSet<String>> = BTreeMap::new();
        let mut names: Vec<&String> = instances.keys().collect();
        names.sort();
        for name in names {
            let plugin = &instances[name];
            let mut events = plugin.events_to_register();
            if events.is_empty() {
                events.push(ClusterEvent::wildcard());
            }
            for event in events {
                event_map.entry(event).or_default().insert(name.clone());
            }
        }

        let mut enabled_config = Plugins::default();
        for point in ExtensionPoint::ALL {
            enabled_config.for_point_mut(point).enabled = enabled[&point].clone();
        }

        Ok(Self {
            profile_name: profile.scheduler_name.clone(),
            percentage_of_nodes_to_score: profile.percentage_of_nodes_to_score,
            handle,
            run_all_filters: options.run_all_filters,
            parallelism: options.parallelism.max(1),
            queue_sort: Arc::clone(&queue_sort_list[0]),
            pre_filter: list_for(ExtensionPoint::PreFilter),
            filter: list_for(ExtensionPoint::Filter),
            post_filter: list_for(ExtensionPoint::PostFilter),
            pre_score: list_for(ExtensionPoint::PreScore),
            score,
            reserve: list_for(ExtensionPoint::Reserve),
            permit: list_for(ExtensionPoint::Permit),
            pre_bind: list_for(ExtensionPoint::PreBind),
            bind: bind_list,
            post_bind: list_for(ExtensionPoint::PostBind),
            waiting_tasks: Arc::new(WaitingTasks::new()),
            event_map,
            enabled_config,
        })
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    pub fn percentage_of_nodes_to_score(&self) -> i32 {
        self.percentage_of_nodes_to_score
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn waiting_tasks(&self) -> &Arc<WaitingTasks> {
        &self.waiting_tasks
    }

    pub fn has_filter_plugins(&self) -> bool {
        !self.filter.is_empty()
    }

    pub fn has_post_filter_plugins(&self) -> bool {
        !self.post_filter.is_empty()
    }

    pub fn has_score_plugins(&self) -> bool {
        !self.score.is_empty()
    }

    /// The effective enabled plugin configuration after MultiPoint
    /// expansion; weights are shown for Score entries.
    pub fn list_plugins(&self) -> Plugins {
        self.enabled_config.clone()
    }

    /// Plugins whose unschedulable verdicts the given event may overturn.
    pub fn plugins_for_event(&self, event: &ClusterEvent) -> BTreeSet<String> {
        let mut plugins = BTreeSet::new();
        for (registered, names) in &self.event_map {
            if registered.covers(event) {
                plugins.extend(names.iter().cloned());
            }
        }
        plugins
    }

    /// The queue-sort plugin's ordering relation.
    pub fn queue_sort_less(&self, a: &QueuedTaskInfo, b: &QueuedTaskInfo) -> bool {
        self.queue_sort
            .queue_sort()
            .map(|qs| qs.less(a, b))
            .unwrap_or(false)
    }

    // ── PreFilter ──────────────────────────────────────────────────

    /// Serial; the first non-Success aborts the cycle.
    pub fn run_pre_filter_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
    ) -> Status {
        for plugin in &self.pre_filter {
            if ctx.is_cancelled() {
                return Status::error("scheduling cycle canceled");
            }
            let Some(pre_filter) = plugin.pre_filter() else {
                continue;
            };
            let status = pre_filter.pre_filter(ctx, state, task);
            if !status.is_success() {
                if status.is_unschedulable() {
                    return status.with_plugin(plugin.name());
                }
                return Status::error(format!(
                    "running PreFilter plugin {}: {}",
                    plugin.name(),
                    status.message()
                ))
                .with_plugin(plugin.name());
            }
        }
        Status::success()
    }

    // ── Filter ─────────────────────────────────────────────────────

    /// Filter chain for one node. In run-all-filters mode every plugin
    /// runs and all failure reasons are merged; otherwise the first
    /// failure wins.
    pub fn run_filter_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node_info: &NodeInfo,
    ) -> Status {
        let mut merged: Option<Status> = None;
        for plugin in &self.filter {
            if ctx.is_cancelled() {
                return Status::error("scheduling cycle canceled");
            }
            let Some(filter) = plugin.filter() else {
                continue;
            };
            let mut status = filter.filter(ctx, state, task, node_info);
            if status.is_success() {
                continue;
            }
            if !status.is_unschedulable() {
                return Status::error(format!(
                    "running Filter plugin {}: {}",
                    plugin.name(),
                    status.message()
                ))
                .with_plugin(plugin.name());
            }
            status.set_plugin(plugin.name());
            if !self.run_all_filters {
                return status;
            }
            match merged.as_mut() {
                None => merged = Some(status),
                Some(existing) => existing.merge(status),
            }
        }
        merged.unwrap_or_else(Status::success)
    }

    /// Filter chain honoring nominated tasks: when higher-priority tasks
    /// are nominated onto the node, filters must pass both with those
    /// tasks hypothetically placed and without them.
    pub fn run_filter_plugins_with_nominated_tasks(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node_info: &NodeInfo,
    ) -> Status {
        let Some(node_name) = node_info.node_name() else {
            return Status::error("node info carries no node");
        };
        let nominated: Vec<Arc<Task>> = self
            .handle
            .nominator
            .nominated_tasks_for_node(node_name)
            .into_iter()
            .filter(|n| n.uid != task.uid && n.priority >= task.priority)
            .collect();

        if nominated.is_empty() {
            return self.run_filter_plugins(ctx, state, task, node_info);
        }

        // Pass 1: with the nominated tasks added to the node and to any
        // prefilter-computed state.
        let state_with = state.clone_state();
        let mut info_with = node_info.clone();
        for nominee in &nominated {
            for plugin in &self.pre_filter {
                let Some(pre_filter) = plugin.pre_filter() else {
                    continue;
                };
                if let Some(extensions) = pre_filter.pre_filter_extensions() {
                    let status =
                        extensions.add_task(ctx, &state_with, task, nominee, &info_with);
                    if !status.is_success() {
                        return Status::error(format!(
                            "adding nominated task in {}: {}",
                            plugin.name(),
                            status.message()
                        ));
                    }
                }
            }
            info_with.add_task(Arc::clone(nominee));
        }
        let status = self.run_filter_plugins(ctx, &state_with, task, &info_with);
        if !status.is_success() {
            return status;
        }

        // Pass 2: without them; both placements must be feasible.
        self.run_filter_plugins(ctx, state, task, node_info)
    }

    // ── PostFilter ─────────────────────────────────────────────────

    /// Serial; the first Success is the outcome, otherwise the last
    /// status is returned.
    pub fn run_post_filter_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        filtered_statuses: &NodeToStatusMap,
    ) -> (Option<PostFilterResult>, Status) {
        let mut last = Status::unschedulable("no post-filter plugin made progress");
        for plugin in &self.post_filter {
            let Some(post_filter) = plugin.post_filter() else {
                continue;
            };
            let (result, status) = post_filter.post_filter(ctx, state, task, filtered_statuses);
            if status.is_success() {
                return (result, status);
            }
            if !status.is_unschedulable() {
                return (
                    None,
                    Status::error(format!(
                        "running PostFilter plugin {}: {}",
                        plugin.name(),
                        status.message()
                    ))
                    .with_plugin(plugin.name()),
                );
            }
            last = status.with_plugin(plugin.name());
        }
        (None, last)
    }

    // ── Scoring ────────────────────────────────────────────────────

    /// Serial; the first non-Success aborts.
    pub fn run_pre_score_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        nodes: &[Arc<NodeInfo>],
    ) -> Status {
        for plugin in &self.pre_score {
            if ctx.is_cancelled() {
                return Status::error("scheduling cycle canceled");
            }
            let Some(pre_score) = plugin.pre_score() else {
                continue;
            };
            let status = pre_score.pre_score(ctx, state, task, nodes);
            if !status.is_success() {
                return Status::error(format!(
                    "running PreScore plugin {}: {}",
                    plugin.name(),
                    status.message()
                ))
                .with_plugin(plugin.name());
            }
        }
        Status::success()
    }

    /// Score all nodes under every score plugin (nodes in parallel,
    /// plugins serial per node), then normalize serially per plugin,
    /// validate the normalized range, and apply configured weights.
    pub fn run_score_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        nodes: &[Arc<NodeInfo>],
    ) -> Result<PluginToNodeScores, Status> {
        if self.score.is_empty() {
            return Ok(PluginToNodeScores::new());
        }
        let node_names: Vec<String> = nodes
            .iter()
            .filter_map(|info| info.node_name().cloned())
            .collect();

        let scores: Mutex<PluginToNodeScores> = Mutex::new(
            self.score
                .iter()
                .map(|scored| {
                    (
                        scored.plugin.name().to_string(),
                        node_names
                            .iter()
                            .map(|name| NodeScore {
                                name: name.clone(),
                                score: 0,
                            })
                            .collect(),
                    )
                })
                .collect(),
        );
        let first_error: Mutex<Option<Status>> = Mutex::new(None);
        let stop = AtomicBool::new(false);

        parallelize(node_names.len(), self.parallelism, |index| {
            if stop.load(Ordering::Relaxed) || ctx.is_cancelled() {
                return;
            }
            for scored in &self.score {
                let Some(scorer) = scored.plugin.score() else {
                    continue;
                };
                let (value, status) = scorer.score(ctx, state, task, &node_names[index]);
                if !status.is_success() {
                    stop.store(true, Ordering::Relaxed);
                    *first_error.lock() = Some(
                        Status::error(format!(
                            "running Score plugin {}: {}",
                            scored.plugin.name(),
                            status.message()
                        ))
                        .with_plugin(scored.plugin.name()),
                    );
                    return;
                }
                if let Some(list) = scores.lock().get_mut(scored.plugin.name()) {
                    list[index].score = value;
                }
            }
        });

        if let Some(status) = first_error.into_inner() {
            return Err(status);
        }
        let mut scores = scores.into_inner();

        for scored in &self.score {
            let name = scored.plugin.name();
            let Some(scorer) = scored.plugin.score() else {
                continue;
            };
            let Some(list) = scores.get_mut(name) else {
                continue;
            };

            if let Some(extensions) = scorer.score_extensions() {
                let status = extensions.normalize_score(ctx, state, task, list);
                if !status.is_success() {
                    return Err(Status::error(format!(
                        "normalizing scores of plugin {name}: {}",
                        status.message()
                    ))
                    .with_plugin(name));
                }
            }

            for node_score in list.iter_mut() {
                if node_score.score < MIN_NODE_SCORE || node_score.score > MAX_NODE_SCORE {
                    return Err(Status::error(format!(
                        "plugin {name} returned score {} for node {} outside [{MIN_NODE_SCORE}, {MAX_NODE_SCORE}]",
                        node_score.score, node_score.name
                    ))
                    .with_plugin(name));
                }
                node_score.score *= i64::from(scored.weight);
            }
        }
        Ok(scores)
    }

    // ── Reserve ────────────────────────────────────────────────────

    /// Serial. On the first failure, every previously successful plugin
    /// is unreserved in reverse order before the error is returned.
    pub fn run_reserve_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node: &str,
    ) -> Status {
        let mut reserved: Vec<&Arc<dyn Plugin>> = Vec::new();
        for plugin in &self.reserve {
            let Some(reserve) = plugin.reserve() else {
                continue;
            };
            let status = reserve.reserve(ctx, state, task, node);
            if !status.is_success() {
                warn!(
                    task = %task.uid,
                    plugin = plugin.name(),
                    "reserve failed, unwinding prior reservations"
                );
                for done in reserved.iter().rev() {
                    if let Some(r) = done.reserve() {
                        r.unreserve(ctx, state, task, node);
                    }
                }
                return Status::error(format!(
                    "running Reserve plugin {}: {}",
                    plugin.name(),
                    status.message()
                ))
                .with_plugin(plugin.name());
            }
            reserved.push(plugin);
        }
        Status::success()
    }

    /// Unreserve every reserve plugin, in reverse registration order.
    pub fn run_unreserve_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node: &str,
    ) {
        for plugin in self.reserve.iter().rev() {
            if let Some(reserve) = plugin.reserve() {
                reserve.unreserve(ctx, state, task, node);
            }
        }
    }

    // ── Permit ─────────────────────────────────────────────────────

    /// Serial. `Wait` outcomes accumulate the maximum timeout and park
    /// the task in the waiting registry; rejections surface immediately.
    pub fn run_permit_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Arc<Task>,
        node: &str,
    ) -> Status {
        let mut pending: Vec<String> = Vec::new();
        let mut max_timeout = Duration::ZERO;
        for plugin in &self.permit {
            let Some(permit) = plugin.permit() else {
                continue;
            };
            let (status, timeout) = permit.permit(ctx, state, task, node);
            match status.code() {
                Code::Success => {}
                Code::Wait => {
                    pending.push(plugin.name().to_string());
                    max_timeout = max_timeout.max(timeout);
                }
                Code::Unschedulable | Code::UnschedulableAndUnresolvable => {
                    return status.with_plugin(plugin.name());
                }
                _ => {
                    return Status::error(format!(
                        "running Permit plugin {}: {}",
                        plugin.name(),
                        status.message()
                    ))
                    .with_plugin(plugin.name());
                }
            }
        }
        if pending.is_empty() {
            return Status::success();
        }
        let deadline = Instant::now() + max_timeout;
        debug!(task = %task.uid, plugins = ?pending, ?max_timeout, "task waiting on permit");
        self.waiting_tasks.insert(Arc::clone(task), pending, deadline);
        Status::wait("waiting on permit")
    }

    /// Block until the parked task is allowed, rejected, timed out, or
    /// the cycle is canceled. Success when the task was never parked.
    pub async fn wait_on_permit(&self, ctx: &CancelToken, task: &Task) -> Status {
        let Some(waiting) = self.waiting_tasks.get(&task.uid) else {
            return Status::success();
        };
        let Some(receiver) = waiting.take_receiver() else {
            self.waiting_tasks.remove(&task.uid);
            return Status::error("permit already awaited for task");
        };
        let remaining = waiting.deadline().saturating_duration_since(Instant::now());
        let outcome = tokio::select! {
            _ = ctx.cancelled() => Status::unschedulable("canceled"),
            resolved = tokio::time::timeout(remaining, receiver) => match resolved {
                Ok(Ok(status)) => status,
                Ok(Err(_)) => Status::error("permit waiter dropped"),
                Err(_) => Status::unschedulable("canceled"),
            },
        };
        self.waiting_tasks.remove(&task.uid);
        outcome
    }

    // ── Binding ────────────────────────────────────────────────────

    /// Serial; the first error aborts.
    pub fn run_pre_bind_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node: &str,
    ) -> Status {
        for plugin in &self.pre_bind {
            let Some(pre_bind) = plugin.pre_bind() else {
                continue;
            };
            let status = pre_bind.pre_bind(ctx, state, task, node);
            if !status.is_success() {
                return Status::error(format!(
                    "running PreBind plugin {}: {}",
                    plugin.name(),
                    status.message()
                ))
                .with_plugin(plugin.name());
            }
        }
        Status::success()
    }

    /// Serial; the first non-Skip outcome wins. When every bind plugin
    /// skips, the handle's binder performs the default binding.
    pub fn run_bind_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node: &str,
    ) -> Status {
        for plugin in &self.bind {
            let Some(bind) = plugin.bind() else {
                continue;
            };
            let status = bind.bind(ctx, state, task, node);
            if status.is_skip() {
                continue;
            }
            if !status.is_success() {
                return Status::error(format!(
                    "running Bind plugin {}: {}",
                    plugin.name(),
                    status.message()
                ))
                .with_plugin(plugin.name());
            }
            return status;
        }
        match self.handle.binder.bind(task, node) {
            Ok(()) => Status::success(),
            Err(source) => Status::error(format!("default binder: {source}")),
        }
    }

    /// Serial; outcomes are informational and never abort.
    pub fn run_post_bind_plugins(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        task: &Task,
        node: &str,
    ) {
        for plugin in &self.post_bind {
            if let Some(post_bind) = plugin.post_bind() {
                post_bind.post_bind(ctx, state, task, node);
            }
        }
    }
}

fn implements(plugin: &dyn Plugin, point: ExtensionPoint) -> bool {
    match point {
        ExtensionPoint::QueueSort => plugin.queue_sort().is_some(),
        ExtensionPoint::PreFilter => plugin.pre_filter().is_some(),
        ExtensionPoint::Filter => plugin.filter().is_some(),
        ExtensionPoint::PostFilter => plugin.post_filter().is_some(),
        ExtensionPoint::PreScore => plugin.pre_score().is_some(),
        ExtensionPoint::Score => plugin.score().is_some(),
        ExtensionPoint::Reserve => plugin.reserve().is_some(),
        ExtensionPoint::Permit => plugin.permit().is_some(),
        ExtensionPoint::PreBind => plugin.pre_bind().is_some(),
        ExtensionPoint::Bind => plugin.bind().is_some(),
        ExtensionPoint::PostBind => plugin.post_bind().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginConfig, PluginSet};
    use crate::plugin::{
        BindPlugin, FilterPlugin, NodeScoreList, PermitPlugin, PreScorePlugin, QueueSortPlugin,
        ReservePlugin, ScoreExtensions, ScorePlugin,
    };
    use berth_cache::Cache;
    use berth_core::Node;
    use std::time::Duration;

    const QUEUE_SORT: &str = "TestQueueSort";
    const BIND: &str = "TestBind";

    // ── Test plugins ───────────────────────────────────────────────

    struct TestQueueSort;
    impl Plugin for TestQueueSort {
        fn name(&self) -> &str {
            QUEUE_SORT
        }
        fn queue_sort(&self) -> Option<&dyn QueueSortPlugin> {
            Some(self)
        }
    }
    impl QueueSortPlugin for TestQueueSort {
        fn less(&self, a: &QueuedTaskInfo, b: &QueuedTaskInfo) -> bool {
            a.task.priority > b.task.priority
        }
    }

    struct TestBind;
    impl Plugin for TestBind {
        fn name(&self) -> &str {
            BIND
        }
        fn bind(&self) -> Option<&dyn BindPlugin> {
            Some(self)
        }
    }
    impl BindPlugin for TestBind {
        fn bind(&self, _: &CancelToken, _: &CycleState, _: &Task, _: &str) -> Status {
            Status::success()
        }
    }

    struct SkippingBind;
    impl Plugin for SkippingBind {
        fn name(&self) -> &str {
            "SkippingBind"
        }
        fn bind(&self) -> Option<&dyn BindPlugin> {
            Some(self)
        }
    }
    impl BindPlugin for SkippingBind {
        fn bind(&self, _: &CancelToken, _: &CycleState, _: &Task, _: &str) -> Status {
            Status::skip()
        }
    }

    struct FixedFilter {
        name: String,
        code: Code,
    }
    impl Plugin for FixedFilter {
        fn name(&self) -> &str {
            &self.name
        }
        fn filter(&self) -> Option<&dyn FilterPlugin> {
            Some(self)
        }
    }
    impl FilterPlugin for FixedFilter {
        fn filter(&self, _: &CancelToken, _: &CycleState, _: &Task, _: &NodeInfo) -> Status {
            match self.code {
                Code::Success => Status::success(),
                code => Status::new(code, format!("{} rejects", self.name)),
            }
        }
    }

    struct FixedScore {
        name: String,
        value: i64,
        reverse: bool,
    }
    impl Plugin for FixedScore {
        fn name(&self) -> &str {
            &self.name
        }
        fn score(&self) -> Option<&dyn ScorePlugin> {
            Some(self)
        }
        fn pre_score(&self) -> Option<&dyn PreScorePlugin> {
            Some(self)
        }
    }
    impl PreScorePlugin for FixedScore {
        fn pre_score(
            &self,
            _: &CancelToken,
            _: &CycleState,
            _: &Task,
            _: &[Arc<NodeInfo>],
        ) -> Status {
            Status::success()
        }
    }
    impl ScorePlugin for FixedScore {
        fn score(&self, _: &CancelToken, _: &CycleState, _: &Task, _: &str) -> (i64, Status) {
            (self.value, Status::success())
        }
        fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
            if self.reverse {
                Some(self)
            } else {
                None
            }
        }
    }
    impl ScoreExtensions for FixedScore {
        fn normalize_score(
            &self,
            _: &CancelToken,
            _: &CycleState,
            _: &Task,
            scores: &mut NodeScoreList,
        ) -> Status {
            for entry in scores.iter_mut() {
                entry.score = MAX_NODE_SCORE - entry.score;
            }
            Status::success()
        }
    }

    struct RecordingReserve {
        name: String,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }
    impl Plugin for RecordingReserve {
        fn name(&self) -> &str {
            &self.name
        }
        fn reserve(&self) -> Option<&dyn ReservePlugin> {
            Some(self)
        }
    }
    impl ReservePlugin for RecordingReserve {
        fn reserve(&self, _: &CancelToken, _: &CycleState, _: &Task, _: &str) -> Status {
            self.log.lock().push(format!("reserve:{}", self.name));
            if self.fail {
                Status::error("reserve refused")
            } else {
                Status::success()
            }
        }
        fn unreserve(&self, _: &CancelToken, _: &CycleState, _: &Task, _: &str) {
            self.log.lock().push(format!("unreserve:{}", self.name));
        }
    }

    struct WaitingPermit {
        timeout: Duration,
    }
    impl Plugin for WaitingPermit {
        fn name(&self) -> &str {
            "WaitingPermit"
        }
        fn permit(&self) -> Option<&dyn PermitPlugin> {
            Some(self)
        }
    }
    impl PermitPlugin for WaitingPermit {
        fn permit(
            &self,
            _: &CancelToken,
            _: &CycleState,
            _: &Task,
            _: &str,
        ) -> (Status, Duration) {
            (Status::wait("external approval required"), self.timeout)
        }
    }

    // A plugin spanning many points, for MultiPoint expansion tests.
    struct WidePlugin {
        name: String,
    }
    impl Plugin for WidePlugin {
        fn name(&self) -> &str {
            &self.name
        }
        fn filter(&self) -> Option<&dyn FilterPlugin> {
            Some(self)
        }
        fn pre_score(&self) -> Option<&dyn PreScorePlugin> {
            Some(self)
        }
        fn score(&self) -> Option<&dyn ScorePlugin> {
            Some(self)
        }
    }
    impl FilterPlugin for WidePlugin {
        fn filter(&self, _: &CancelToken, _: &CycleState, _: &Task, _: &NodeInfo) -> Status {
            Status::success()
        }
    }
    impl PreScorePlugin for WidePlugin {
        fn pre_score(
            &self,
            _: &CancelToken,
            _: &CycleState,
            _: &Task,
            _: &[Arc<NodeInfo>],
        ) -> Status {
            Status::success()
        }
    }
    impl ScorePlugin for WidePlugin {
        fn score(&self, _: &CancelToken, _: &CycleState, _: &Task, _: &str) -> (i64, Status) {
            (1, Status::success())
        }
    }

    // ── Harness ────────────────────────────────────────────────────

    fn base_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(QUEUE_SORT, |_, _| Ok(Arc::new(TestQueueSort)))
            .unwrap();
        registry
            .register(BIND, |_, _| Ok(Arc::new(TestBind)))
            .unwrap();
        registry
            .register("SkippingBind", |_, _| Ok(Arc::new(SkippingBind)))
            .unwrap();
        registry
            .register("TrueFilter", |_, _| {
                Ok(Arc::new(FixedFilter {
                    name: "TrueFilter".to_string(),
                    code: Code::Success,
                }))
            })
            .unwrap();
        registry
            .register("FalseFilter", |_, _| {
                Ok(Arc::new(FixedFilter {
                    name: "FalseFilter".to_string(),
                    code: Code::Unschedulable,
                }))
            })
            .unwrap();
        registry
            .register("UnresolvableFilter", |_, _| {
                Ok(Arc::new(FixedFilter {
                    name: "UnresolvableFilter".to_string(),
                    code: Code::UnschedulableAndUnresolvable,
                }))
            })
            .unwrap();
        registry
            .register("Score5", |_, _| {
                Ok(Arc::new(FixedScore {
                    name: "Score5".to_string(),
                    value: 5,
                    reverse: false,
                }))
            })
            .unwrap();
        registry
            .register("Reverse30", |_, _| {
                Ok(Arc::new(FixedScore {
                    name: "Reverse30".to_string(),
                    value: 30,
                    reverse: true,
                }))
            })
            .unwrap();
        registry
            .register("Score200", |_, _| {
                Ok(Arc::new(FixedScore {
                    name: "Score200".to_string(),
                    value: 200,
                    reverse: false,
                }))
            })
            .unwrap();
        registry
            .register("Wide", |_, _| {
                Ok(Arc::new(WidePlugin {
                    name: "Wide".to_string(),
                }))
            })
            .unwrap();
        registry
    }

    fn base_profile() -> SchedulerProfile {
        let mut profile = SchedulerProfile::new("default");
        profile.plugins.queue_sort = PluginSet::enable(&[QUEUE_SORT]);
        profile.plugins.bind = PluginSet::enable(&[BIND]);
        profile
    }

    fn build(profile: &SchedulerProfile) -> FrameworkResult<Framework> {
        build_with(profile, FrameworkOptions::default())
    }

    fn build_with(
        profile: &SchedulerProfile,
        options: FrameworkOptions,
    ) -> FrameworkResult<Framework> {
        let cache = Arc::new(Cache::new(Duration::from_secs(30)));
        Framework::new(&base_registry(), profile, Handle::new(cache), options)
    }

    fn node_info(name: &str) -> NodeInfo {
        NodeInfo::new(Arc::new(Node::new(name)))
    }

    fn node_infos(names: &[&str]) -> Vec<Arc<NodeInfo>> {
        names
            .iter()
            .map(|n| Arc::new(node_info(n)))
            .collect()
    }

    fn task() -> Task {
        Task {
            uid: "t1".to_string(),
            name: "t1".to_string(),
            ..Task::default()
        }
    }

    // ── Construction ───────────────────────────────────────────────

    #[test]
    fn requires_exactly_one_queue_sort() {
        let mut profile = base_profile();
        profile.plugins.queue_sort = PluginSet::default();
        assert!(matches!(
            build(&profile),
            Err(FrameworkError::QueueSortCount(0))
        ));
    }

    #[test]
    fn requires_a_bind_plugin() {
        let mut profile = base_profile();
        profile.plugins.bind = PluginSet::default();
        assert!(matches!(build(&profile), Err(FrameworkError::NoBindPlugin)));
    }

    #[test]
    fn duplicate_plugin_at_one_point_is_already_registered() {
        let mut profile = base_profile();
        profile.plugins.filter = PluginSet::enable(&["TrueFilter", "TrueFilter"]);
        let err = build(&profile).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn duplicate_plugin_config_is_rejected() {
        let mut profile = base_profile();
        profile.plugin_config.push(PluginConfig {
            name: "TrueFilter".to_string(),
            args: serde_json::Value::Null,
        });
        profile.plugin_config.push(PluginConfig {
            name: "TrueFilter".to_string(),
            args: serde_json::Value::Null,
        });
        let err = build(&profile).unwrap_err();
        assert!(err.to_string().contains("repeated config"));
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let mut profile = base_profile();
        profile.plugins.filter = PluginSet::enable(&["NoSuchPlugin"]);
        assert!(matches!(
            build(&profile),
            Err(FrameworkError::UnknownPlugin(_))
        ));
    }

    #[test]
    fn plugin_must_implement_the_point_it_is_enabled_at() {
        let mut profile = base_profile();
        profile.plugins.score = PluginSet::enable(&["TrueFilter"]);
        assert!(matches!(
            build(&profile),
            Err(FrameworkError::DoesNotImplement { .. })
        ));
    }

    #[test]
    fn invalid_weight_is_rejected() {
        let mut profile = base_profile();
        profile.plugins.score = PluginSet {
            enabled: vec![PluginSpec::weighted("Score5", -1)],
            disabled: vec![],
        };
        assert!(matches!(
            build(&profile),
            Err(FrameworkError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn percentage_out_of_range_is_rejected() {
        let mut profile = base_profile();
        profile.percentage_of_nodes_to_score = 101;
        assert!(matches!(
            build(&profile),
            Err(FrameworkError::InvalidPercentage(101))
        ));
    }

    // ── MultiPoint expansion ───────────────────────────────────────

    #[test]
    fn multi_point_expands_to_implemented_points() {
        let mut profile = base_profile();
        profile.plugins.multi_point = PluginSet {
            enabled: vec![PluginSpec::weighted("Wide", 5)],
            disabled: vec![],
        };
        let framework = build(&profile).unwrap();
        let plugins = framework.list_plugins();

        assert_eq!(plugins.filter.enabled, vec![PluginSpec::new("Wide")]);
        assert_eq!(plugins.pre_score.enabled, vec![PluginSpec::new("Wide")]);
        assert_eq!(
            plugins.score.enabled,
            vec![PluginSpec::weighted("Wide", 5)]
        );
        // Not expanded to points the plugin does not implement.
        assert!(plugins.permit.enabled.is_empty());
        assert!(plugins.post_filter.enabled.is_empty());
    }

    #[test]
    fn multi_point_disable_at_a_point_prunes_expansion() {
        let mut profile = base_profile();
        profile.plugins.multi_point = PluginSet {
            enabled: vec![PluginSpec::new("Wide")],
            disabled: vec![],
        };
        profile.plugins.pre_score = PluginSet {
            enabled: vec![],
            disabled: vec![PluginSpec::new("Wide")],
        };
        let framework = build(&profile).unwrap();
        let plugins = framework.list_plugins();

        assert!(plugins.pre_score.enabled.is_empty());
        assert_eq!(plugins.filter.enabled, vec![PluginSpec::new("Wide")]);
        // Unset weight defaults to 1 at Score.
        assert_eq!(plugins.score.enabled, vec![PluginSpec::weighted("Wide", 1)]);
    }

    #[test]
    fn explicit_enablement_overrides_multi_point_weight_and_order() {
        let mut profile = base_profile();
        profile.plugins.multi_point = PluginSet {
            enabled: vec![PluginSpec::new("Wide"), PluginSpec::new("Score5")],
            disabled: vec![],
        };
        profile.plugins.score = PluginSet {
            enabled: vec![
                PluginSpec::weighted("Score5", 7),
                PluginSpec::weighted("Wide", 3),
            ],
            disabled: vec![],
        };
        let framework = build(&profile).unwrap();
        let plugins = framework.list_plugins();

        assert_eq!(
            plugins.score.enabled,
            vec![
                PluginSpec::weighted("Score5", 7),
                PluginSpec::weighted("Wide", 3),
            ]
        );
        // PreScore keeps MultiPoint order.
        assert_eq!(
            plugins.pre_score.enabled,
            vec![PluginSpec::new("Wide"), PluginSpec::new("Score5")]
        );
    }

    #[test]
    fn duplicate_multi_point_enablement_is_already_registered() {
        let mut profile = base_profile();
        profile.plugins.multi_point = PluginSet {
            enabled: vec![PluginSpec::new("Wide"), PluginSpec::new("Wide")],
            disabled: vec![],
        };
        let err = build(&profile).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    // ── Filter policies ────────────────────────────────────────────

    #[test]
    fn first_filter_failure_short_circuits_by_default() {
        let mut profile = base_profile();
        profile.plugins.filter =
            PluginSet::enable(&["FalseFilter", "UnresolvableFilter", "TrueFilter"]);
        let framework = build(&profile).unwrap();

        let status = framework.run_filter_plugins(
            &CancelToken::new(),
            &CycleState::new(),
            &task(),
            &node_info("m1"),
        );
        assert_eq!(status.code(), Code::Unschedulable);
        assert_eq!(status.plugin(), Some("FalseFilter"));
        assert_eq!(status.reasons().len(), 1);
    }

    #[test]
    fn run_all_filters_merges_reasons_and_upgrades_code() {
        let mut profile = base_profile();
        profile.plugins.filter =
            PluginSet::enable(&["FalseFilter", "UnresolvableFilter", "TrueFilter"]);
        let framework = build_with(
            &profile,
            FrameworkOptions {
                run_all_filters: true,
                ..FrameworkOptions::default()
            },
        )
        .unwrap();

        let status = framework.run_filter_plugins(
            &CancelToken::new(),
            &CycleState::new(),
            &task(),
            &node_info("m1"),
        );
        assert_eq!(status.code(), Code::UnschedulableAndUnresolvable);
        assert_eq!(status.reasons().len(), 2);
    }

    // ── Scoring ────────────────────────────────────────────────────

    #[test]
    fn scores_are_weighted_after_normalization() {
        let mut profile = base_profile();
        profile.plugins.score = PluginSet {
            enabled: vec![
                PluginSpec::weighted("Score5", 2),
                PluginSpec::weighted("Reverse30", 1),
            ],
            disabled: vec![],
        };
        let framework = build(&profile).unwrap();

        let scores = framework
            .run_score_plugins(
                &CancelToken::new(),
                &CycleState::new(),
                &task(),
                &node_infos(&["m1", "m2"]),
            )
            .unwrap();

        // Score5: raw 5, weight 2 → 10. Reverse30: 100-30=70, weight 1.
        assert!(scores["Score5"].iter().all(|s| s.score == 10));
        assert!(scores["Reverse30"].iter().all(|s| s.score == 70));
    }

    #[test]
    fn out_of_range_score_is_fatal() {
        let mut profile = base_profile();
        profile.plugins.score = PluginSet::enable(&["Score200"]);
        let framework = build(&profile).unwrap();

        let err = framework
            .run_score_plugins(
                &CancelToken::new(),
                &CycleState::new(),
                &task(),
                &node_infos(&["m1"]),
            )
            .unwrap_err();
        assert_eq!(err.code(), Code::Error);
        assert!(err.message().contains("outside"));
    }

    // ── Reserve ────────────────────────────────────────────────────

    #[test]
    fn reserve_failure_unwinds_prior_reservations_in_reverse() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = base_registry();
        for (name, fail) in [("R1", false), ("R2", false), ("R3", true)] {
            let log = Arc::clone(&log);
            registry
                .register(name, move |_, _| {
                    Ok(Arc::new(RecordingReserve {
                        name: name.to_string(),
                        fail,
                        log: Arc::clone(&log),
                    }))
                })
                .unwrap();
        }

        let mut profile = base_profile();
        profile.plugins.reserve = PluginSet::enable(&["R1", "R2", "R3"]);
        let cache = Arc::new(Cache::new(Duration::from_secs(30)));
        let framework = Framework::new(
            &registry,
            &profile,
            Handle::new(cache),
            FrameworkOptions::default(),
        )
        .unwrap();

        let status = framework.run_reserve_plugins(
            &CancelToken::new(),
            &CycleState::new(),
            &task(),
            "m1",
        );
        assert_eq!(status.code(), Code::Error);
        assert_eq!(
            *log.lock(),
            vec![
                "reserve:R1",
                "reserve:R2",
                "reserve:R3",
                "unreserve:R2",
                "unreserve:R1",
            ]
        );
    }

    // ── Permit ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn permit_wait_resolves_on_allow() {
        let mut registry = base_registry();
        registry
            .register("WaitingPermit", |_, _| {
                Ok(Arc::new(WaitingPermit {
                    timeout: Duration::from_secs(5),
                }))
            })
            .unwrap();
        let mut profile = base_profile();
        profile.plugins.permit = PluginSet::enable(&["WaitingPermit"]);
        let cache = Arc::new(Cache::new(Duration::from_secs(30)));
        let framework = Arc::new(
            Framework::new(
                &registry,
                &profile,
                Handle::new(cache),
                FrameworkOptions::default(),
            )
            .unwrap(),
        );

        let the_task = Arc::new(task());
        let status = framework.run_permit_plugins(
            &CancelToken::new(),
            &CycleState::new(),
            &the_task,
            "m1",
        );
        assert!(status.is_wait());

        let waiter = framework.waiting_tasks().get("t1").unwrap();
        waiter.allow("WaitingPermit");

        let outcome = framework
            .wait_on_permit(&CancelToken::new(), &the_task)
            .await;
        assert!(outcome.is_success());
        assert!(framework.waiting_tasks().is_empty());
    }

    #[tokio::test]
    async fn permit_wait_times_out_as_unschedulable_canceled() {
        let mut registry = base_registry();
        registry
            .register("WaitingPermit", |_, _| {
                Ok(Arc::new(WaitingPermit {
                    timeout: Duration::from_millis(10),
                }))
            })
            .unwrap();
        let mut profile = base_profile();
        profile.plugins.permit = PluginSet::enable(&["WaitingPermit"]);
        let cache = Arc::new(Cache::new(Duration::from_secs(30)));
        let framework = Framework::new(
            &registry,
            &profile,
            Handle::new(cache),
            FrameworkOptions::default(),
        )
        .unwrap();

        let the_task = Arc::new(task());
        let status = framework.run_permit_plugins(
            &CancelToken::new(),
            &CycleState::new(),
            &the_task,
            "m1",
        );
        assert!(status.is_wait());

        let outcome = framework
            .wait_on_permit(&CancelToken::new(), &the_task)
            .await;
        assert_eq!(outcome.code(), Code::Unschedulable);
        assert_eq!(outcome.message(), "canceled");
    }

    // ── Bind ───────────────────────────────────────────────────────

    #[test]
    fn all_bind_plugins_skipping_falls_back_to_default_binder() {
        let mut profile = base_profile();
        profile.plugins.bind = PluginSet::enable(&["SkippingBind"]);
        let framework = build(&profile).unwrap();

        let status = framework.run_bind_plugins(
            &CancelToken::new(),
            &CycleState::new(),
            &task(),
            "m1",
        );
        assert!(status.is_success());
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn plugins_without_registrations_wake_on_every_event() {
        use berth_core::{ActionType, EventResource};

        let framework = build(&base_profile()).unwrap();
        let woken = framework.plugins_for_event(&ClusterEvent::new(
            EventResource::Node,
            ActionType::Add,
        ));
        assert!(woken.contains(QUEUE_SORT));
        assert!(woken.contains(BIND));
    }
}
